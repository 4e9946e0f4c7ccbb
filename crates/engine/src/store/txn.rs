//! Read-only and read-write transactions.
//!
//! Readers capture an `Arc` snapshot of the committed state and never block.
//! At most one read-write transaction exists per environment; it holds the
//! writer mutex for its whole lifetime and works on a private copy of the
//! state (cheap: trees share nodes with the committed version).
//!
//! Mutations take `&self`. A write transaction keeps its working state
//! behind an internal mutex so long-lived borrows (sampling iterators hold
//! `&RwTxn`) can observe interleaved writes made through the same handle.

use std::sync::Arc;

use cairn_core::{Error, Result};
use parking_lot::{Mutex, MutexGuard};

use super::tree::{CountedTree, KeyLocation};
use super::wal::{CommitFrame, WriteOp};
use super::{Database, EngineState, EnvInner, WriterState};

/// Read access shared by both transaction kinds and by sampling iterators.
pub trait ReadView {
    /// Snapshot of a database's tree as of this view.
    fn tree(&self, db: &Database) -> Result<CountedTree>;

    fn get(&self, db: &Database, key: &[u8]) -> Result<Option<Arc<[u8]>>> {
        let tree = self.tree(db)?;
        Ok(tree.get(key).map(|vs| Arc::from(vs.first())))
    }

    /// Rank information for `key` in the database's current tree.
    fn locate_key(&self, db: &Database, key: &[u8]) -> Result<KeyLocation> {
        Ok(self.tree(db)?.locate_key(key))
    }

    /// Total size: distinct keys, or entries when `dup_counted`.
    fn count_all(&self, db: &Database, dup_counted: bool) -> Result<u64> {
        let tree = self.tree(db)?;
        Ok(if dup_counted {
            tree.entry_total()
        } else {
            tree.key_total()
        })
    }

    /// Distinct keys inside the bounded range, computed from rank
    /// differences. Empty and inverted ranges count zero.
    fn range_count_keys(
        &self,
        db: &Database,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        incl_lower: bool,
        incl_upper: bool,
    ) -> Result<u64> {
        let tree = self.tree(db)?;
        let start = match lower {
            None => 0,
            Some(key) => {
                let loc = tree.locate_key(key);
                if incl_lower {
                    loc.keys_before
                } else {
                    loc.keys_before + loc.found as u64
                }
            }
        };
        let end = match upper {
            None => tree.key_total(),
            Some(key) => {
                let loc = tree.locate_key(key);
                if incl_upper {
                    loc.keys_before + loc.found as u64
                } else {
                    loc.keys_before
                }
            }
        };
        Ok(end.saturating_sub(start))
    }
}

/// A read-only transaction: a frozen snapshot of the committed state.
pub struct RoTxn {
    pub(crate) state: Arc<EngineState>,
}

impl ReadView for RoTxn {
    fn tree(&self, db: &Database) -> Result<CountedTree> {
        self.state
            .databases
            .get(db.name())
            .map(|d| d.tree.clone())
            .ok_or_else(|| Error::not_found(format!("database '{}'", db.name())))
    }
}

pub(crate) struct TxnWork {
    pub(crate) state: EngineState,
    pub(crate) ops: Vec<WriteOp>,
}

/// The environment's single read-write transaction.
pub struct RwTxn<'env> {
    pub(crate) env: &'env EnvInner,
    pub(crate) writer: MutexGuard<'env, WriterState>,
    pub(crate) work: Mutex<TxnWork>,
}

impl ReadView for RwTxn<'_> {
    fn tree(&self, db: &Database) -> Result<CountedTree> {
        self.work
            .lock()
            .state
            .databases
            .get(db.name())
            .map(|d| d.tree.clone())
            .ok_or_else(|| Error::not_found(format!("database '{}'", db.name())))
    }
}

impl RwTxn<'_> {
    /// Insert or replace. In a DUPSORT database this adds one value to the
    /// key's sorted list (no-op when the pair already exists).
    pub fn put(&self, db: &Database, key: &[u8], value: &[u8]) -> Result<()> {
        let mut work = self.work.lock();
        let state = work
            .state
            .databases
            .get_mut(db.name())
            .ok_or_else(|| Error::not_found(format!("database '{}'", db.name())))?;
        let (tree, changed) = state.tree.put(key, value);
        if changed {
            state.tree = tree;
            work.ops.push(WriteOp::Put {
                db: db.name().to_string(),
                key: key.to_vec(),
                value: value.to_vec(),
            });
        }
        Ok(())
    }

    /// Delete a key, or one duplicate value when `value` is given. Returns
    /// whether anything was removed.
    pub fn del(&self, db: &Database, key: &[u8], value: Option<&[u8]>) -> Result<bool> {
        let mut work = self.work.lock();
        let state = work
            .state
            .databases
            .get_mut(db.name())
            .ok_or_else(|| Error::not_found(format!("database '{}'", db.name())))?;
        let (tree, removed) = state.tree.del(key, value);
        if removed {
            state.tree = tree;
            work.ops.push(WriteOp::Del {
                db: db.name().to_string(),
                key: key.to_vec(),
                value: value.map(|v| v.to_vec()),
            });
        }
        Ok(removed)
    }

    /// Remove every entry of the database.
    pub fn clear(&self, db: &Database) -> Result<()> {
        let mut work = self.work.lock();
        let state = work
            .state
            .databases
            .get_mut(db.name())
            .ok_or_else(|| Error::not_found(format!("database '{}'", db.name())))?;
        if !state.tree.is_empty() {
            state.tree = state.tree.clear();
            work.ops.push(WriteOp::Clear {
                db: db.name().to_string(),
            });
        }
        Ok(())
    }

    /// Make the writeset durable and publish it to readers.
    ///
    /// The frame is appended (and fsynced per the durability mode) before
    /// the committed state is swapped; a log failure leaves the previous
    /// snapshot untouched.
    pub fn commit(mut self) -> Result<()> {
        let work = self.work.get_mut();
        if !work.ops.is_empty() {
            let frame = CommitFrame {
                ops: std::mem::take(&mut work.ops),
            };
            self.writer.wal.append(&frame)?;
            let next = Arc::new(std::mem::take(&mut work.state));
            *self.env.committed.write() = next;
        }
        Ok(())
    }

    /// Discard the writeset.
    pub fn abort(self) {}
}
