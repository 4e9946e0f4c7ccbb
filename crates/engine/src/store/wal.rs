//! Base store write-ahead log.
//!
//! Every committed write transaction appends one frame holding its full
//! writeset. Reopening an environment replays the log in order to rebuild
//! the committed state. A torn tail frame (short read or checksum mismatch)
//! marks the end of the durable history; replay stops there and the next
//! append truncates the tail.
//!
//! Frame layout: `len u32 | crc32 u32 | payload`, big-endian, checksum over
//! the payload. The payload is a MessagePack-encoded [`CommitFrame`].

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use cairn_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

const WAL_MAGIC: &[u8; 8] = b"CAIRNWAL";
const WAL_VERSION: u32 = 1;
const WAL_HEADER_LEN: u64 = 12;
const FRAME_HEADER_LEN: usize = 8;

/// Fsync policy for committed transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// fsync the log on every commit
    #[default]
    Sync,
    /// Leave flushing to the OS; a crash may lose recent commits but never
    /// corrupts the replayable prefix
    NoSync,
}

/// One mutation in a transaction's writeset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WriteOp {
    CreateDb {
        name: String,
        dup_sort: bool,
        counted: bool,
        prefix_compression: bool,
    },
    Put {
        db: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Del {
        db: String,
        key: Vec<u8>,
        value: Option<Vec<u8>>,
    },
    Clear {
        db: String,
    },
}

/// The writeset of one committed transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitFrame {
    pub ops: Vec<WriteOp>,
}

/// Appender over the environment's log file.
pub struct WalWriter {
    file: File,
    path: PathBuf,
    durability: Durability,
}

impl WalWriter {
    /// Open (or create) the log at `dir/base.wlog`, positioned after the
    /// last intact frame.
    pub fn open(dir: &Path, durability: Durability) -> Result<WalWriter> {
        fs::create_dir_all(dir)?;
        let path = dir.join("base.wlog");
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            file.write_all(WAL_MAGIC)?;
            let mut ver = [0u8; 4];
            BigEndian::write_u32(&mut ver, WAL_VERSION);
            file.write_all(&ver)?;
            file.sync_all()?;
        } else {
            let end = scan_frames(&mut file, |_| {})?;
            if end < len {
                warn!(
                    path = %path.display(),
                    torn_bytes = len - end,
                    "truncating torn tail of base log"
                );
                file.set_len(end)?;
            }
        }
        file.seek(SeekFrom::End(0))?;
        Ok(WalWriter {
            file,
            path,
            durability,
        })
    }

    /// Append one commit frame, fsyncing per the durability mode.
    pub fn append(&mut self, frame: &CommitFrame) -> Result<()> {
        let payload = rmp_serde::to_vec(frame)
            .map_err(|e| Error::corruption(format!("encoding commit frame: {e}")))?;
        let mut header = [0u8; FRAME_HEADER_LEN];
        BigEndian::write_u32(&mut header[0..4], payload.len() as u32);
        BigEndian::write_u32(&mut header[4..8], crc32fast::hash(&payload));
        self.file.write_all(&header)?;
        self.file.write_all(&payload)?;
        if self.durability == Durability::Sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Force an fsync regardless of the durability mode.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Replay every intact frame of `dir/base.wlog`, oldest first.
///
/// Missing file means an empty history. Frames after the first damaged one
/// are ignored; a bad file header is corruption.
pub fn replay(dir: &Path, mut on_frame: impl FnMut(CommitFrame)) -> Result<()> {
    let path = dir.join("base.wlog");
    let mut file = match File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    scan_frames(&mut file, |payload| {
        match rmp_serde::from_slice::<CommitFrame>(payload) {
            Ok(frame) => on_frame(frame),
            Err(e) => warn!(error = %e, "skipping undecodable commit frame"),
        }
    })?;
    Ok(())
}

/// Walk the log from the start, invoking `on_payload` for each frame whose
/// length and checksum verify. Returns the byte offset just past the last
/// intact frame.
fn scan_frames(file: &mut File, mut on_payload: impl FnMut(&[u8])) -> Result<u64> {
    file.seek(SeekFrom::Start(0))?;
    let mut magic = [0u8; 8];
    file.read_exact(&mut magic)?;
    if &magic != WAL_MAGIC {
        return Err(Error::corruption("base log has wrong magic"));
    }
    let mut ver = [0u8; 4];
    file.read_exact(&mut ver)?;
    let version = BigEndian::read_u32(&ver);
    if version != WAL_VERSION {
        return Err(Error::corruption(format!(
            "base log version {version} unsupported"
        )));
    }
    let file_len = file.metadata()?.len();
    let mut offset = WAL_HEADER_LEN;
    let mut header = [0u8; FRAME_HEADER_LEN];
    loop {
        if offset + FRAME_HEADER_LEN as u64 > file_len {
            return Ok(offset);
        }
        file.read_exact(&mut header)?;
        let len = BigEndian::read_u32(&header[0..4]) as u64;
        let expected_crc = BigEndian::read_u32(&header[4..8]);
        if offset + FRAME_HEADER_LEN as u64 + len > file_len {
            return Ok(offset);
        }
        let mut payload = vec![0u8; len as usize];
        file.read_exact(&mut payload)?;
        if crc32fast::hash(&payload) != expected_crc {
            return Ok(offset);
        }
        on_payload(&payload);
        offset += FRAME_HEADER_LEN as u64 + len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ops: Vec<WriteOp>) -> CommitFrame {
        CommitFrame { ops }
    }

    #[test]
    fn append_then_replay() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut wal = WalWriter::open(dir.path(), Durability::Sync).unwrap();
            wal.append(&frame(vec![WriteOp::Put {
                db: "d".into(),
                key: b"k".to_vec(),
                value: b"v".to_vec(),
            }]))
            .unwrap();
            wal.append(&frame(vec![WriteOp::Clear { db: "d".into() }]))
                .unwrap();
        }
        let mut frames = Vec::new();
        replay(dir.path(), |f| frames.push(f)).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0].ops[0], WriteOp::Put { .. }));
        assert!(matches!(frames[1].ops[0], WriteOp::Clear { .. }));
    }

    #[test]
    fn torn_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut wal = WalWriter::open(dir.path(), Durability::Sync).unwrap();
            wal.append(&frame(vec![WriteOp::Clear { db: "a".into() }]))
                .unwrap();
        }
        // Simulate a crash mid-append.
        let path = dir.path().join("base.wlog");
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[0x00, 0x00, 0x40, 0x00, 0x12, 0x34, 0x56, 0x78, 0xaa])
            .unwrap();
        drop(f);

        let mut frames = Vec::new();
        replay(dir.path(), |f| frames.push(f)).unwrap();
        assert_eq!(frames.len(), 1);

        // Reopening truncates the torn bytes and stays appendable.
        let mut wal = WalWriter::open(dir.path(), Durability::Sync).unwrap();
        wal.append(&frame(vec![WriteOp::Clear { db: "b".into() }]))
            .unwrap();
        drop(wal);
        let mut frames = Vec::new();
        replay(dir.path(), |f| frames.push(f)).unwrap();
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn missing_log_is_empty_history() {
        let dir = tempfile::tempdir().unwrap();
        let mut count = 0;
        replay(dir.path(), |_| count += 1).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn bad_magic_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("base.wlog"), b"NOTAMAGICFILE").unwrap();
        assert!(matches!(
            replay(dir.path(), |_| {}),
            Err(Error::Corruption(_))
        ));
    }
}
