//! Reader pins: durable watermarks that hold back catalog pruning.
//!
//! A reader in another process replays the delta catalog from its applied
//! position; pruning past that position would strand it. A pin records the
//! reader's snapshot and log positions in the `"<name>/usearch-pins"`
//! sub-database, keyed by the reader's uuid, and `compact` and checkpoint
//! finalize never prune past the lowest live pin. Pins carry an expiry so a
//! reader that dies without releasing cannot hold the catalog forever.
//!
//! Record (version 1, 25 bytes, big-endian):
//!
//! ```text
//! ver u8 | snapshot_seq u64 | log_seq u64 | expires_at_ms u64
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use cairn_core::bytes::read_u64_be;
use cairn_core::{Error, Result};
use uuid::Uuid;

use crate::store::{Database, ReadView, RwTxn};

const PIN_VERSION: u8 = 1;
const PIN_RECORD_LEN: usize = 25;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PinRecord {
    pub(crate) snapshot_seq: u64,
    pub(crate) log_seq: u64,
    pub(crate) expires_at_ms: u64,
}

impl PinRecord {
    fn encode(&self) -> [u8; PIN_RECORD_LEN] {
        let mut raw = [0u8; PIN_RECORD_LEN];
        raw[0] = PIN_VERSION;
        raw[1..9].copy_from_slice(&self.snapshot_seq.to_be_bytes());
        raw[9..17].copy_from_slice(&self.log_seq.to_be_bytes());
        raw[17..25].copy_from_slice(&self.expires_at_ms.to_be_bytes());
        raw
    }

    fn decode(raw: &[u8]) -> Result<PinRecord> {
        if raw.len() != PIN_RECORD_LEN {
            return Err(Error::corruption("reader pin record has wrong width"));
        }
        if raw[0] != PIN_VERSION {
            return Err(Error::corruption(format!(
                "reader pin version {} unsupported",
                raw[0]
            )));
        }
        Ok(PinRecord {
            snapshot_seq: read_u64_be(&raw[1..9])?,
            log_seq: read_u64_be(&raw[9..17])?,
            expires_at_ms: read_u64_be(&raw[17..25])?,
        })
    }
}

/// The domain's pin sub-database handle.
#[derive(Debug, Clone)]
pub(crate) struct PinDb {
    db: Database,
}

impl PinDb {
    pub(crate) fn new(db: Database) -> PinDb {
        PinDb { db }
    }

    pub(crate) fn set(&self, txn: &RwTxn<'_>, reader: Uuid, record: PinRecord) -> Result<()> {
        txn.put(&self.db, reader.as_bytes(), &record.encode())
    }

    pub(crate) fn get(&self, view: &impl ReadView, reader: Uuid) -> Result<Option<PinRecord>> {
        match view.get(&self.db, reader.as_bytes())? {
            Some(raw) => Ok(Some(PinRecord::decode(&raw)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn remove(&self, txn: &RwTxn<'_>, reader: Uuid) -> Result<()> {
        txn.del(&self.db, reader.as_bytes(), None)?;
        Ok(())
    }

    /// Lowest log position any unexpired pin still needs. Expired pins are
    /// ignored, not deleted; the owner may yet touch them back to life.
    pub(crate) fn floor(&self, view: &impl ReadView, now_ms: u64) -> Result<Option<u64>> {
        let tree = view.tree(&self.db)?;
        let mut walker = tree.walk_entries_from(0);
        let mut floor = None;
        while let Some((_, value)) = walker.next() {
            let record = PinRecord::decode(&value)?;
            if record.expires_at_ms <= now_ms {
                continue;
            }
            floor = Some(match floor {
                None => record.log_seq,
                Some(seen) => record.log_seq.min(seen),
            });
        }
        Ok(floor)
    }
}
