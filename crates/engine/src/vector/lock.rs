//! Cross-process writer serialization.
//!
//! Vector writers coordinate through an advisory lock on `writer.lock` in
//! the environment directory, since the pending and checkpoint files are
//! not covered by the base store's own locking. Readers never take it.

use std::fs::{File, OpenOptions};
use std::path::Path;

use cairn_core::{Error, Result};
use fs2::FileExt;
use tracing::debug;
use uuid::Uuid;

pub(crate) const WRITER_LOCK_FILE: &str = "writer.lock";

/// Exclusive write session over an environment's vector domains.
///
/// Held for the duration of staging, publishing and checkpoint writing;
/// released on drop. The session's uuid disambiguates racing writers in
/// checkpoint manifests.
pub struct WriterSession {
    _file: File,
    uuid: Uuid,
}

impl WriterSession {
    /// Take the lock, failing with `Busy` when another process holds it.
    pub fn acquire(env_dir: &Path) -> Result<WriterSession> {
        let path = env_dir.join(WRITER_LOCK_FILE);
        let file = OpenOptions::new().create(true).write(true).open(&path)?;
        file.try_lock_exclusive().map_err(|_| {
            Error::busy(format!(
                "vector writer lock {} is held by another process",
                path.display()
            ))
        })?;
        let uuid = Uuid::new_v4();
        debug!(writer = %uuid, "acquired vector writer lock");
        Ok(WriterSession { _file: file, uuid })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}
