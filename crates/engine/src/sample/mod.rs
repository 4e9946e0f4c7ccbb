//! Lazy sampling iterators over counted databases.
//!
//! Four iterator kinds share one shape: each `has_next` call resolves the
//! next requested position against the database's *current* tree and either
//! loads it into the iterator's holders (returning `Ok(true)`) or reports
//! exhaustion (`Ok(false)`). A rank that fell outside `[0, count)` because
//! the data shrank under a concurrent writer is exhaustion, never an error.
//!
//! Rank samplers come in two strategies behind one trait. They must emit
//! identical sequences for identical inputs; [`RankSeek`] jumps straight to
//! each rank through the counted tree, [`BudgetedScan`] walks forward from
//! the previous position while the distance fits its budget and falls back
//! to a counted seek when it does not.

mod list;
mod rank;

pub use list::{FullListIter, ListValueIter};
pub use rank::{EntrySampler, KeySampler, Sampler};

use std::sync::Arc;

use cairn_core::{Error, Result};

use crate::store::tree::CountedTree;

/// Optional key bounds with independent inclusivity.
#[derive(Debug, Clone, Default)]
pub struct SampleRange {
    pub lower: Option<Vec<u8>>,
    pub upper: Option<Vec<u8>>,
    pub incl_lower: bool,
    pub incl_upper: bool,
}

impl SampleRange {
    /// The unbounded range.
    pub fn all() -> SampleRange {
        SampleRange::default()
    }

    /// `[lower, upper]`, both inclusive.
    pub fn closed(lower: &[u8], upper: &[u8]) -> SampleRange {
        SampleRange {
            lower: Some(lower.to_vec()),
            upper: Some(upper.to_vec()),
            incl_lower: true,
            incl_upper: true,
        }
    }

    /// Base rank and width of this range in distinct-key rank space.
    pub(crate) fn key_span(&self, tree: &CountedTree) -> (u64, u64) {
        let start = match &self.lower {
            None => 0,
            Some(key) => {
                let loc = tree.locate_key(key);
                if self.incl_lower {
                    loc.keys_before
                } else {
                    loc.keys_before + loc.found as u64
                }
            }
        };
        let end = match &self.upper {
            None => tree.key_total(),
            Some(key) => {
                let loc = tree.locate_key(key);
                if self.incl_upper {
                    loc.keys_before + loc.found as u64
                } else {
                    loc.keys_before
                }
            }
        };
        (start, end.saturating_sub(start))
    }

    /// Base rank and width in duplicate-counted entry rank space.
    pub(crate) fn entry_span(&self, tree: &CountedTree) -> (u64, u64) {
        let start = match &self.lower {
            None => 0,
            Some(key) => {
                let loc = tree.locate_key(key);
                if self.incl_lower {
                    loc.entries_before
                } else {
                    loc.entries_before + loc.dup_count
                }
            }
        };
        let end = match &self.upper {
            None => tree.entry_total(),
            Some(key) => {
                let loc = tree.locate_key(key);
                if self.incl_upper {
                    loc.entries_before + loc.dup_count
                } else {
                    loc.entries_before
                }
            }
        };
        (start, end.saturating_sub(start))
    }
}

/// The positions a sampler visits, range-relative and 0-based.
#[derive(Debug, Clone)]
pub enum RankSpec {
    /// Every rank in order until the range is exhausted.
    Full,
    /// An explicit ascending rank array.
    List(Vec<u64>),
}

impl RankSpec {
    /// Validate an explicit rank array (must be strictly ascending).
    pub fn list(ranks: Vec<u64>) -> Result<RankSpec> {
        if ranks.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::invalid("rank array must be strictly ascending"));
        }
        Ok(RankSpec::List(ranks))
    }

    fn rank(&self, idx: usize) -> Option<u64> {
        match self {
            RankSpec::Full => Some(idx as u64),
            RankSpec::List(ranks) => ranks.get(idx).copied(),
        }
    }
}

/// How a rank sampler moves to its next absolute position.
pub trait RankStrategy {
    fn key_at(&self, tree: &CountedTree, prev: Option<u64>, target: u64) -> Option<Vec<u8>>;

    fn entry_at(
        &self,
        tree: &CountedTree,
        prev: Option<u64>,
        target: u64,
    ) -> Option<(Vec<u8>, Arc<[u8]>)>;
}

/// Jump directly to each requested rank through the counted tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct RankSeek;

impl RankStrategy for RankSeek {
    fn key_at(&self, tree: &CountedTree, _prev: Option<u64>, target: u64) -> Option<Vec<u8>> {
        tree.key_at(target)
    }

    fn entry_at(
        &self,
        tree: &CountedTree,
        _prev: Option<u64>,
        target: u64,
    ) -> Option<(Vec<u8>, Arc<[u8]>)> {
        tree.entry_at(target)
    }
}

/// Walk forward from the previous position, at most `budget` positions per
/// call consumed in `step`-sized installments; longer moves (and the first
/// one) fall back to a counted seek so the emitted sequence never diverges
/// from [`RankSeek`].
#[derive(Debug, Clone, Copy)]
pub struct BudgetedScan {
    pub budget: u64,
    pub step: u64,
}

impl Default for BudgetedScan {
    fn default() -> Self {
        BudgetedScan {
            budget: 1024,
            step: 64,
        }
    }
}

impl BudgetedScan {
    /// Distance the scan may cover this call, or `None` to seek instead.
    fn scan_distance(&self, prev: Option<u64>, target: u64) -> Option<u64> {
        let prev = prev?;
        let distance = target.checked_sub(prev)?;
        let step = self.step.max(1);
        let mut granted = 0u64;
        while granted < distance {
            if granted >= self.budget {
                return None;
            }
            granted = (granted + step).min(self.budget);
        }
        Some(distance)
    }
}

impl RankStrategy for BudgetedScan {
    fn key_at(&self, tree: &CountedTree, prev: Option<u64>, target: u64) -> Option<Vec<u8>> {
        match self.scan_distance(prev, target) {
            Some(distance) => {
                let mut walker = tree.walk_keys_from(target - distance);
                let mut key = None;
                for _ in 0..=distance {
                    key = walker.next();
                }
                key
            }
            None => tree.key_at(target),
        }
    }

    fn entry_at(
        &self,
        tree: &CountedTree,
        prev: Option<u64>,
        target: u64,
    ) -> Option<(Vec<u8>, Arc<[u8]>)> {
        match self.scan_distance(prev, target) {
            Some(distance) => {
                let mut walker = tree.walk_entries_from(target - distance);
                let mut entry = None;
                for _ in 0..=distance {
                    entry = walker.next();
                }
                entry
            }
            None => tree.entry_at(target),
        }
    }
}
