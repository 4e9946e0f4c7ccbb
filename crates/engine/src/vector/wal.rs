//! Per-transaction WAL segments for staged vector mutations.
//!
//! A write transaction journals its staged updates into one segment file in
//! the domain's pending directory. The file is named after the transaction
//! token and moves through a two-state lifecycle:
//!
//! - `<token>.ulog` — OPEN, the transaction is still writing;
//! - `<token>.ulog.sealed` — SEALED, durable and replayable;
//! - deleted once its content has been propagated.
//!
//! Header (60 bytes, big-endian): magic `CAIRNLOG`, version, state,
//! header_len, snapshot_seq_base, log_seq_hint, token, frame_count, crc32
//! over the preceding bytes. Frames are `ordinal u32 | len u32 | crc32 u32 |
//! payload`.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use cairn_core::{Error, Result};
use uuid::Uuid;

const SEGMENT_MAGIC: &[u8; 8] = b"CAIRNLOG";
const SEGMENT_VERSION: u32 = 1;
pub(crate) const HEADER_LEN: u32 = 60;

pub(crate) const OPEN_EXT: &str = "ulog";
pub(crate) const SEALED_EXT: &str = "ulog.sealed";

/// Segment lifecycle state as stored in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Open = 1,
    Sealed = 2,
}

impl SegmentState {
    fn from_byte(b: u8) -> Result<SegmentState> {
        match b {
            1 => Ok(SegmentState::Open),
            2 => Ok(SegmentState::Sealed),
            other => Err(Error::corruption(format!("segment state {other} unknown"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SegmentHeader {
    pub state: SegmentState,
    pub snapshot_seq_base: u64,
    pub log_seq_hint: u64,
    pub token: Uuid,
    pub frame_count: u32,
}

impl SegmentHeader {
    fn encode(&self) -> [u8; HEADER_LEN as usize] {
        let mut buf = [0u8; HEADER_LEN as usize];
        buf[0..8].copy_from_slice(SEGMENT_MAGIC);
        BigEndian::write_u32(&mut buf[8..12], SEGMENT_VERSION);
        buf[12] = self.state as u8;
        BigEndian::write_u32(&mut buf[16..20], HEADER_LEN);
        BigEndian::write_u64(&mut buf[20..28], self.snapshot_seq_base);
        BigEndian::write_u64(&mut buf[28..36], self.log_seq_hint);
        buf[36..52].copy_from_slice(self.token.as_bytes());
        BigEndian::write_u32(&mut buf[52..56], self.frame_count);
        let crc = crc32fast::hash(&buf[0..56]);
        BigEndian::write_u32(&mut buf[56..60], crc);
        buf
    }

    fn decode(buf: &[u8]) -> Result<SegmentHeader> {
        if buf.len() < HEADER_LEN as usize {
            return Err(Error::corruption("segment header is truncated"));
        }
        if &buf[0..8] != SEGMENT_MAGIC {
            return Err(Error::corruption("segment has wrong magic"));
        }
        let version = BigEndian::read_u32(&buf[8..12]);
        if version != SEGMENT_VERSION {
            return Err(Error::corruption(format!(
                "segment version {version} unsupported"
            )));
        }
        let expected_crc = BigEndian::read_u32(&buf[56..60]);
        if crc32fast::hash(&buf[0..56]) != expected_crc {
            return Err(Error::corruption("segment header checksum mismatch"));
        }
        let header_len = BigEndian::read_u32(&buf[16..20]);
        if header_len != HEADER_LEN {
            return Err(Error::corruption(format!(
                "segment header length {header_len} unexpected"
            )));
        }
        let token = Uuid::from_slice(&buf[36..52])
            .map_err(|e| Error::corruption(format!("segment token: {e}")))?;
        Ok(SegmentHeader {
            state: SegmentState::from_byte(buf[12])?,
            snapshot_seq_base: BigEndian::read_u64(&buf[20..28]),
            log_seq_hint: BigEndian::read_u64(&buf[28..36]),
            token,
            frame_count: BigEndian::read_u32(&buf[52..56]),
        })
    }
}

pub(crate) fn open_path(dir: &Path, token: Uuid) -> PathBuf {
    dir.join(format!("{}.{OPEN_EXT}", token.simple()))
}

pub(crate) fn sealed_path(dir: &Path, token: Uuid) -> PathBuf {
    dir.join(format!("{}.{SEALED_EXT}", token.simple()))
}

/// Token encoded in a segment file name, if the name parses.
pub(crate) fn token_from_path(path: &Path) -> Option<Uuid> {
    let name = path.file_name()?.to_str()?;
    let stem = name.split('.').next()?;
    Uuid::parse_str(stem).ok()
}

/// Appender for one OPEN segment.
pub(crate) struct SegmentWriter {
    file: File,
    path: PathBuf,
    header: SegmentHeader,
}

impl SegmentWriter {
    pub(crate) fn create(
        dir: &Path,
        token: Uuid,
        snapshot_seq_base: u64,
        log_seq_hint: u64,
    ) -> Result<SegmentWriter> {
        fs::create_dir_all(dir)?;
        let path = open_path(dir, token);
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let header = SegmentHeader {
            state: SegmentState::Open,
            snapshot_seq_base,
            log_seq_hint,
            token,
            frame_count: 0,
        };
        file.write_all(&header.encode())?;
        Ok(SegmentWriter { file, path, header })
    }

    pub(crate) fn append_frame(&mut self, ordinal: u32, payload: &[u8]) -> Result<()> {
        let mut head = [0u8; 12];
        BigEndian::write_u32(&mut head[0..4], ordinal);
        BigEndian::write_u32(&mut head[4..8], payload.len() as u32);
        BigEndian::write_u32(&mut head[8..12], crc32fast::hash(payload));
        self.file.write_all(&head)?;
        self.file.write_all(payload)?;
        self.header.frame_count += 1;
        Ok(())
    }

    /// Flush frames to disk. Called before the base transaction commits so
    /// a committed transaction's segment is always replayable.
    pub(crate) fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Rewrite the header as SEALED and rename to `.ulog.sealed`.
    pub(crate) fn seal(mut self, fsync: bool) -> Result<PathBuf> {
        self.header.state = SegmentState::Sealed;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.encode())?;
        if fsync {
            self.file.sync_all()?;
        }
        let sealed = sealed_path(self.path.parent().unwrap_or(Path::new(".")), self.header.token);
        fs::rename(&self.path, &sealed)?;
        if fsync {
            sync_dir(&sealed)?;
        }
        Ok(sealed)
    }

    /// Remove the file; the transaction is not going to publish.
    pub(crate) fn abort(self) -> Result<()> {
        fs::remove_file(&self.path)?;
        Ok(())
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

fn sync_dir(child: &Path) -> Result<()> {
    if let Some(parent) = child.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

/// Read and verify a whole segment: header plus every frame.
pub(crate) fn read_segment(path: &Path) -> Result<(SegmentHeader, Vec<(u32, Vec<u8>)>)> {
    let mut file = File::open(path)?;
    let mut header_buf = [0u8; HEADER_LEN as usize];
    file.read_exact(&mut header_buf)?;
    let header = SegmentHeader::decode(&header_buf)?;
    let file_len = file.metadata()?.len();
    let mut offset = HEADER_LEN as u64;
    let mut frames = Vec::new();
    let mut head = [0u8; 12];
    while offset < file_len {
        if offset + 12 > file_len {
            return Err(Error::corruption("segment frame header is truncated"));
        }
        file.read_exact(&mut head)?;
        let ordinal = BigEndian::read_u32(&head[0..4]);
        let len = BigEndian::read_u32(&head[4..8]) as u64;
        let expected_crc = BigEndian::read_u32(&head[8..12]);
        if offset + 12 + len > file_len {
            return Err(Error::corruption("segment frame payload is truncated"));
        }
        let mut payload = vec![0u8; len as usize];
        file.read_exact(&mut payload)?;
        if crc32fast::hash(&payload) != expected_crc {
            return Err(Error::corruption(format!(
                "segment frame {ordinal} checksum mismatch"
            )));
        }
        frames.push((ordinal, payload));
        offset += 12 + len;
    }
    Ok((header, frames))
}

/// Promote a crashed transaction's OPEN segment to SEALED in place.
///
/// Used during recovery when the base store committed the transaction but
/// the process died before `publish_log`. Frames are fully verified first.
pub(crate) fn seal_in_place(path: &Path) -> Result<PathBuf> {
    let (mut header, frames) = read_segment(path)?;
    header.state = SegmentState::Sealed;
    header.frame_count = frames.len() as u32;
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.write_all(&header.encode())?;
    file.sync_all()?;
    let sealed = sealed_path(path.parent().unwrap_or(Path::new(".")), header.token);
    fs::rename(path, &sealed)?;
    sync_dir(&sealed)?;
    Ok(sealed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_seal_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let token = Uuid::new_v4();
        let mut writer = SegmentWriter::create(dir.path(), token, 5, 11).unwrap();
        writer.append_frame(0, b"first").unwrap();
        writer.append_frame(1, b"second").unwrap();
        writer.sync().unwrap();
        let sealed = writer.seal(true).unwrap();
        assert!(sealed.to_string_lossy().ends_with(SEALED_EXT));

        let (header, frames) = read_segment(&sealed).unwrap();
        assert_eq!(header.state, SegmentState::Sealed);
        assert_eq!(header.token, token);
        assert_eq!(header.snapshot_seq_base, 5);
        assert_eq!(header.log_seq_hint, 11);
        assert_eq!(header.frame_count, 2);
        assert_eq!(frames[0], (0, b"first".to_vec()));
        assert_eq!(frames[1], (1, b"second".to_vec()));
    }

    #[test]
    fn seal_in_place_promotes_open_segment() {
        let dir = tempfile::tempdir().unwrap();
        let token = Uuid::new_v4();
        let mut writer = SegmentWriter::create(dir.path(), token, 0, 1).unwrap();
        writer.append_frame(0, b"payload").unwrap();
        writer.sync().unwrap();
        let open = writer.path().to_path_buf();
        std::mem::forget(writer);

        let sealed = seal_in_place(&open).unwrap();
        assert!(!open.exists());
        let (header, frames) = read_segment(&sealed).unwrap();
        assert_eq!(header.state, SegmentState::Sealed);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn damaged_frame_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let token = Uuid::new_v4();
        let mut writer = SegmentWriter::create(dir.path(), token, 0, 1).unwrap();
        writer.append_frame(0, b"payload").unwrap();
        let path = writer.path().to_path_buf();
        writer.sync().unwrap();
        std::mem::forget(writer);

        let len = fs::metadata(&path).unwrap().len();
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(len - 1)).unwrap();
        file.write_all(&[0xff]).unwrap();
        drop(file);
        assert!(matches!(read_segment(&path), Err(Error::Corruption(_))));
    }

    #[test]
    fn token_parses_from_file_name() {
        let token = Uuid::new_v4();
        let path = open_path(Path::new("/tmp"), token);
        assert_eq!(token_from_path(&path), Some(token));
        assert_eq!(token_from_path(Path::new("/tmp/garbage.txt")), None);
    }

    #[test]
    fn abort_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SegmentWriter::create(dir.path(), Uuid::new_v4(), 0, 1).unwrap();
        let path = writer.path().to_path_buf();
        writer.abort().unwrap();
        assert!(!path.exists());
    }
}
