//! Atomic ANN snapshots.
//!
//! A checkpoint is a directory named after its sequence number holding
//! immutable numbered chunk files and one MessagePack manifest. It is
//! written under `<seq>.tmp` and published with a single rename, so a
//! crash can only ever leave a `.tmp` orphan or an intact snapshot, never
//! a partially-visible one.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use cairn_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

pub(crate) const DEFAULT_CHUNK_SIZE: usize = 1 << 20;
pub(crate) const DEFAULT_RETENTION: usize = 2;

const MANIFEST_FILE: &str = "manifest";
const TMP_SUFFIX: &str = ".tmp";

/// Snapshot metadata, one per checkpoint directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub seq: u64,
    pub writer: Uuid,
    pub chunk_size: u64,
    pub chunk_count: u32,
    pub total_bytes: u64,
    pub chunk_crcs: Vec<u32>,
}

fn tmp_dir(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{seq}{TMP_SUFFIX}"))
}

fn final_dir(dir: &Path, seq: u64) -> PathBuf {
    dir.join(seq.to_string())
}

fn chunk_path(dir: &Path, idx: u32) -> PathBuf {
    dir.join(format!("chunk-{idx:06}"))
}

fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Write chunks and manifest under `<seq>.tmp`, fully fsynced. Returns the
/// chunk count. A stale tmp from an earlier crash is discarded first.
pub(crate) fn write_tmp(
    dir: &Path,
    seq: u64,
    writer: Uuid,
    buffer: &[u8],
    chunk_size: usize,
) -> Result<u32> {
    let tmp = tmp_dir(dir, seq);
    if tmp.exists() {
        fs::remove_dir_all(&tmp)?;
    }
    fs::create_dir_all(&tmp)?;
    let chunk_size = chunk_size.max(1);
    let mut chunk_crcs = Vec::new();
    for (idx, chunk) in buffer.chunks(chunk_size).enumerate() {
        let path = chunk_path(&tmp, idx as u32);
        let mut file = File::create(&path)?;
        file.write_all(chunk)?;
        file.sync_all()?;
        chunk_crcs.push(crc32fast::hash(chunk));
    }
    let manifest = Manifest {
        seq,
        writer,
        chunk_size: chunk_size as u64,
        chunk_count: chunk_crcs.len() as u32,
        total_bytes: buffer.len() as u64,
        chunk_crcs,
    };
    let raw = rmp_serde::to_vec(&manifest)
        .map_err(|e| Error::corruption(format!("encoding checkpoint manifest: {e}")))?;
    let mut file = File::create(tmp.join(MANIFEST_FILE))?;
    file.write_all(&raw)?;
    file.sync_all()?;
    sync_dir(&tmp)?;
    Ok(manifest.chunk_count)
}

/// Atomically publish `<seq>.tmp` as `<seq>`.
pub(crate) fn publish(dir: &Path, seq: u64) -> Result<()> {
    let tmp = tmp_dir(dir, seq);
    let target = final_dir(dir, seq);
    if target.exists() {
        // A snapshot at this position is already published (either the
        // rename happened before a crash, or nothing advanced since).
        if tmp.exists() {
            fs::remove_dir_all(&tmp)?;
        }
        return Ok(());
    }
    fs::rename(&tmp, &target)?;
    sync_dir(dir)?;
    Ok(())
}

fn read_manifest(snapshot: &Path) -> Result<Manifest> {
    let raw = fs::read(snapshot.join(MANIFEST_FILE))?;
    rmp_serde::from_slice(&raw)
        .map_err(|e| Error::corruption(format!("decoding checkpoint manifest: {e}")))
}

/// Verify a snapshot directory end to end and return its manifest.
pub(crate) fn validate(snapshot: &Path) -> Result<Manifest> {
    let manifest = read_manifest(snapshot)?;
    let mut total = 0u64;
    for (idx, expected_crc) in manifest.chunk_crcs.iter().enumerate() {
        let chunk = fs::read(chunk_path(snapshot, idx as u32))?;
        if crc32fast::hash(&chunk) != *expected_crc {
            return Err(Error::corruption(format!(
                "checkpoint chunk {idx} checksum mismatch"
            )));
        }
        total += chunk.len() as u64;
    }
    if total != manifest.total_bytes {
        return Err(Error::corruption("checkpoint byte count mismatch"));
    }
    Ok(manifest)
}

/// Load one snapshot's full buffer.
pub(crate) fn load(dir: &Path, seq: u64) -> Result<Vec<u8>> {
    let snapshot = final_dir(dir, seq);
    let manifest = validate(&snapshot)?;
    let mut buffer = Vec::with_capacity(manifest.total_bytes as usize);
    for idx in 0..manifest.chunk_count {
        buffer.extend_from_slice(&fs::read(chunk_path(&snapshot, idx))?);
    }
    Ok(buffer)
}

/// Published snapshot sequences, ascending.
pub(crate) fn list_seqs(dir: &Path) -> Result<Vec<u64>> {
    let mut seqs = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(seqs),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(seq) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
            seqs.push(seq);
        }
    }
    seqs.sort_unstable();
    Ok(seqs)
}

/// The newest intact snapshot, if any. Damaged ones are skipped with a
/// warning; `recover` removes them.
pub(crate) fn load_latest(dir: &Path) -> Result<Option<(u64, Vec<u8>)>> {
    for seq in list_seqs(dir)?.into_iter().rev() {
        match load(dir, seq) {
            Ok(buffer) => return Ok(Some((seq, buffer))),
            Err(e) => warn!(seq, error = %e, "skipping damaged checkpoint"),
        }
    }
    Ok(None)
}

/// Remove tmp orphans and snapshot directories that fail validation.
pub(crate) fn recover(dir: &Path) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(TMP_SUFFIX) {
            info!(path = %path.display(), "removing orphaned checkpoint build");
            fs::remove_dir_all(&path)?;
        } else if name.parse::<u64>().is_ok() {
            if let Err(e) = validate(&path) {
                warn!(path = %path.display(), error = %e, "removing damaged checkpoint");
                fs::remove_dir_all(&path)?;
            }
        }
    }
    Ok(())
}

/// Keep only the newest `keep` snapshots.
pub(crate) fn prune(dir: &Path, keep: usize) -> Result<()> {
    let seqs = list_seqs(dir)?;
    if seqs.len() <= keep {
        return Ok(());
    }
    for seq in &seqs[..seqs.len() - keep] {
        fs::remove_dir_all(final_dir(dir, *seq))?;
    }
    Ok(())
}
