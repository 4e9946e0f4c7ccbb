//! Typed accessors over a domain's metadata sub-database.
//!
//! String keys, fixed-width big-endian values (options and composite
//! records aside). Every durable cursor the protocol relies on lives here:
//! sequence watermarks, the sealed-segment record, the published tail and
//! the checkpoint-in-progress marker.

use cairn_core::bytes::{read_u64_be, u64_be};
use cairn_core::{Error, Result};
use uuid::Uuid;

use crate::store::{Database, ReadView, RwTxn};

use super::ann::AnnInitOptions;

pub(crate) const KEY_SCHEMA_VERSION: &str = "schema_version";
pub(crate) const KEY_SNAPSHOT_SEQ: &str = "snapshot_seq";
pub(crate) const KEY_LOG_SEQ: &str = "log_seq";
pub(crate) const KEY_LOG_TAIL_SEQ: &str = "log_tail_seq";
pub(crate) const KEY_SEALED_SEGMENT: &str = "sealed_segment";
pub(crate) const KEY_PUBLISHED_TAIL: &str = "published_tail";
pub(crate) const KEY_INIT_OPTIONS: &str = "init_options";
pub(crate) const KEY_CHECKPOINT_PENDING: &str = "checkpoint_pending";

pub(crate) const SCHEMA_VERSION: u64 = 1;

/// Phase of an in-flight checkpoint, durable so recovery can resume or
/// discard it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStage {
    /// Chunks and manifest are being written under the `.tmp` directory.
    Writing = 1,
    /// The manifest is complete; only the rename and the meta finalize
    /// remain.
    Finalizing = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointPending {
    pub stage: PendingStage,
    pub seq: u64,
    pub writer: Uuid,
}

/// The domain's meta database handle.
#[derive(Debug, Clone)]
pub(crate) struct MetaDb {
    db: Database,
}

impl MetaDb {
    pub(crate) fn new(db: Database) -> MetaDb {
        MetaDb { db }
    }

    fn get_u64(&self, view: &impl ReadView, key: &str) -> Result<Option<u64>> {
        match view.get(&self.db, key.as_bytes())? {
            Some(raw) => Ok(Some(read_u64_be(&raw)?)),
            None => Ok(None),
        }
    }

    fn put_u64(&self, txn: &RwTxn<'_>, key: &str, value: u64) -> Result<()> {
        txn.put(&self.db, key.as_bytes(), &u64_be(value))
    }

    pub(crate) fn schema_version(&self, view: &impl ReadView) -> Result<Option<u64>> {
        self.get_u64(view, KEY_SCHEMA_VERSION)
    }

    pub(crate) fn set_schema_version(&self, txn: &RwTxn<'_>) -> Result<()> {
        self.put_u64(txn, KEY_SCHEMA_VERSION, SCHEMA_VERSION)
    }

    pub(crate) fn log_seq(&self, view: &impl ReadView) -> Result<u64> {
        Ok(self.get_u64(view, KEY_LOG_SEQ)?.unwrap_or(0))
    }

    pub(crate) fn set_log_seq(&self, txn: &RwTxn<'_>, seq: u64) -> Result<()> {
        self.put_u64(txn, KEY_LOG_SEQ, seq)
    }

    /// `None` until the first checkpoint ever finalizes.
    pub(crate) fn snapshot_seq(&self, view: &impl ReadView) -> Result<Option<u64>> {
        self.get_u64(view, KEY_SNAPSHOT_SEQ)
    }

    pub(crate) fn set_snapshot_seq(&self, txn: &RwTxn<'_>, seq: u64) -> Result<()> {
        self.put_u64(txn, KEY_SNAPSHOT_SEQ, seq)
    }

    pub(crate) fn log_tail_seq(&self, view: &impl ReadView) -> Result<u64> {
        Ok(self.get_u64(view, KEY_LOG_TAIL_SEQ)?.unwrap_or(0))
    }

    pub(crate) fn set_log_tail_seq(&self, txn: &RwTxn<'_>, seq: u64) -> Result<()> {
        self.put_u64(txn, KEY_LOG_TAIL_SEQ, seq)
    }

    /// The last committed transaction's segment token and final log_seq.
    pub(crate) fn sealed_segment(&self, view: &impl ReadView) -> Result<Option<(Uuid, u64)>> {
        match view.get(&self.db, KEY_SEALED_SEGMENT.as_bytes())? {
            None => Ok(None),
            Some(raw) => {
                if raw.len() != 24 {
                    return Err(Error::corruption("sealed_segment record has wrong width"));
                }
                let token = Uuid::from_slice(&raw[0..16])
                    .map_err(|e| Error::corruption(format!("sealed_segment token: {e}")))?;
                Ok(Some((token, read_u64_be(&raw[16..24])?)))
            }
        }
    }

    pub(crate) fn set_sealed_segment(&self, txn: &RwTxn<'_>, token: Uuid, seq: u64) -> Result<()> {
        let mut raw = [0u8; 24];
        raw[0..16].copy_from_slice(token.as_bytes());
        raw[16..24].copy_from_slice(&u64_be(seq));
        txn.put(&self.db, KEY_SEALED_SEGMENT.as_bytes(), &raw)
    }

    /// Token and last frame ordinal of the most recently propagated
    /// segment; its file is safe to delete.
    pub(crate) fn published_tail(&self, view: &impl ReadView) -> Result<Option<(Uuid, u32)>> {
        match view.get(&self.db, KEY_PUBLISHED_TAIL.as_bytes())? {
            None => Ok(None),
            Some(raw) => {
                if raw.len() != 20 {
                    return Err(Error::corruption("published_tail record has wrong width"));
                }
                let token = Uuid::from_slice(&raw[0..16])
                    .map_err(|e| Error::corruption(format!("published_tail token: {e}")))?;
                let ordinal = u32::from_be_bytes([raw[16], raw[17], raw[18], raw[19]]);
                Ok(Some((token, ordinal)))
            }
        }
    }

    pub(crate) fn set_published_tail(
        &self,
        txn: &RwTxn<'_>,
        token: Uuid,
        ordinal: u32,
    ) -> Result<()> {
        let mut raw = [0u8; 20];
        raw[0..16].copy_from_slice(token.as_bytes());
        raw[16..20].copy_from_slice(&ordinal.to_be_bytes());
        txn.put(&self.db, KEY_PUBLISHED_TAIL.as_bytes(), &raw)
    }

    pub(crate) fn init_options(&self, view: &impl ReadView) -> Result<Option<AnnInitOptions>> {
        match view.get(&self.db, KEY_INIT_OPTIONS.as_bytes())? {
            None => Ok(None),
            Some(raw) => rmp_serde::from_slice(&raw)
                .map(Some)
                .map_err(|e| Error::corruption(format!("decoding init options: {e}"))),
        }
    }

    pub(crate) fn set_init_options(&self, txn: &RwTxn<'_>, options: &AnnInitOptions) -> Result<()> {
        let raw = rmp_serde::to_vec(options)
            .map_err(|e| Error::corruption(format!("encoding init options: {e}")))?;
        txn.put(&self.db, KEY_INIT_OPTIONS.as_bytes(), &raw)
    }

    pub(crate) fn checkpoint_pending(
        &self,
        view: &impl ReadView,
    ) -> Result<Option<CheckpointPending>> {
        match view.get(&self.db, KEY_CHECKPOINT_PENDING.as_bytes())? {
            None => Ok(None),
            Some(raw) => {
                if raw.len() != 25 {
                    return Err(Error::corruption(
                        "checkpoint_pending record has wrong width",
                    ));
                }
                let stage = match raw[0] {
                    1 => PendingStage::Writing,
                    2 => PendingStage::Finalizing,
                    other => {
                        return Err(Error::corruption(format!(
                            "checkpoint stage {other} unknown"
                        )))
                    }
                };
                let seq = read_u64_be(&raw[1..9])?;
                let writer = Uuid::from_slice(&raw[9..25])
                    .map_err(|e| Error::corruption(format!("checkpoint writer: {e}")))?;
                Ok(Some(CheckpointPending { stage, seq, writer }))
            }
        }
    }

    pub(crate) fn set_checkpoint_pending(
        &self,
        txn: &RwTxn<'_>,
        pending: CheckpointPending,
    ) -> Result<()> {
        let mut raw = [0u8; 25];
        raw[0] = pending.stage as u8;
        raw[1..9].copy_from_slice(&u64_be(pending.seq));
        raw[9..25].copy_from_slice(pending.writer.as_bytes());
        txn.put(&self.db, KEY_CHECKPOINT_PENDING.as_bytes(), &raw)
    }

    pub(crate) fn clear_checkpoint_pending(&self, txn: &RwTxn<'_>) -> Result<()> {
        txn.del(&self.db, KEY_CHECKPOINT_PENDING.as_bytes(), None)?;
        Ok(())
    }
}
