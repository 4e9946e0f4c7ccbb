//! Process-local activated binding of a domain to one ANN instance.

use std::sync::Arc;

use cairn_core::Result;
use parking_lot::Mutex;

use super::ann::AnnIndex;
use super::delta::{DeltaOp, PendingUpdate};

pub(crate) struct HandleState {
    pub(crate) index: Box<dyn AnnIndex>,
    /// Last domain log_seq applied to the index.
    pub(crate) applied_seq: u64,
}

impl HandleState {
    pub(crate) fn apply(&mut self, update: &PendingUpdate) -> Result<()> {
        match &update.op {
            DeltaOp::Add(vector) => self.index.add(update.key, vector),
            DeltaOp::Replace(vector) => self.index.replace(update.key, vector),
            DeltaOp::Remove => self.index.remove(update.key).map(|_| ()),
        }
    }
}

pub(crate) struct HandleShared {
    pub(crate) state: Mutex<HandleState>,
}

/// Read surface over an activated domain. Clones share the instance.
#[derive(Clone)]
pub struct Handle {
    pub(crate) shared: Arc<HandleShared>,
}

impl Handle {
    pub fn contains(&self, key: u64) -> bool {
        self.shared.state.lock().index.contains(key)
    }

    pub fn get(&self, key: u64) -> Option<Vec<f32>> {
        self.shared.state.lock().index.get(key)
    }

    /// Top-`k` nearest keys with distances, nearest first.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(u64, f32)>> {
        self.shared.state.lock().index.search(query, k)
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dimensions(&self) -> usize {
        self.shared.state.lock().index.dimensions()
    }

    /// The domain log position this handle has applied up to.
    pub fn applied_seq(&self) -> u64 {
        self.shared.state.lock().applied_seq
    }
}
