//! Iterators over one key's duplicate-value list.

use std::sync::Arc;

use cairn_core::Result;

use crate::store::tree::ValueSet;
use crate::store::{Database, ReadView};

use super::Sampler;

/// Values of one fixed key bounded to `[lower, upper]`, both inclusive.
///
/// Like the rank samplers, position is re-derived from the current tree on
/// every call: the iterator remembers the last value it yielded and resumes
/// at the first value greater than it.
pub struct ListValueIter<'v, V> {
    view: &'v V,
    db: Database,
    key: Vec<u8>,
    lower: Option<Vec<u8>>,
    upper: Option<Vec<u8>>,
    last: Option<Vec<u8>>,
    current: Option<Arc<[u8]>>,
    done: bool,
}

impl<'v, V: ReadView> ListValueIter<'v, V> {
    pub fn new(
        view: &'v V,
        db: Database,
        key: &[u8],
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
    ) -> ListValueIter<'v, V> {
        ListValueIter {
            view,
            db,
            key: key.to_vec(),
            lower: lower.map(|b| b.to_vec()),
            upper: upper.map(|b| b.to_vec()),
            last: None,
            current: None,
            done: false,
        }
    }

    /// The value loaded by the last successful `has_next` or `seek`.
    pub fn value(&self) -> Option<&[u8]> {
        self.current.as_deref()
    }

    /// Position on the first in-bounds value `>= probe` under the fixed
    /// key, reporting whether one exists. Iteration continues after it.
    pub fn seek(&mut self, probe: &[u8]) -> Result<bool> {
        self.done = false;
        let from = match &self.lower {
            Some(lo) if lo.as_slice() > probe => lo.clone(),
            _ => probe.to_vec(),
        };
        self.load_from(&from, false)
    }

    fn values(&self) -> Result<Option<ValueSet>> {
        Ok(self.view.tree(&self.db)?.get(&self.key))
    }

    fn load_from(&mut self, probe: &[u8], exclusive: bool) -> Result<bool> {
        let values = match self.values()? {
            Some(v) => v,
            None => {
                self.done = true;
                self.current = None;
                return Ok(false);
            }
        };
        let idx = values.seek(probe, exclusive);
        match values.arc_at(idx) {
            Some(value) if self.in_upper_bound(&value) => {
                self.last = Some(value.to_vec());
                self.current = Some(value);
                Ok(true)
            }
            _ => {
                self.done = true;
                self.current = None;
                Ok(false)
            }
        }
    }

    fn in_upper_bound(&self, value: &[u8]) -> bool {
        match &self.upper {
            Some(up) => value <= up.as_slice(),
            None => true,
        }
    }
}

impl<V: ReadView> Sampler for ListValueIter<'_, V> {
    fn has_next(&mut self) -> Result<bool> {
        if self.done {
            return Ok(false);
        }
        match self.last.clone() {
            Some(last) => self.load_from(&last, true),
            None => match self.lower.clone() {
                Some(lower) => self.load_from(&lower, false),
                None => self.load_from(&[], false),
            },
        }
    }
}

/// All duplicate values of one fixed key, in sorted order.
pub struct FullListIter<'v, V> {
    inner: ListValueIter<'v, V>,
}

impl<'v, V: ReadView> FullListIter<'v, V> {
    pub fn new(view: &'v V, db: Database, key: &[u8]) -> FullListIter<'v, V> {
        FullListIter {
            inner: ListValueIter::new(view, db, key, None, None),
        }
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.inner.value()
    }

    /// Position on the first value `>= probe`, reporting presence.
    pub fn seek(&mut self, probe: &[u8]) -> Result<bool> {
        self.inner.seek(probe)
    }
}

impl<V: ReadView> Sampler for FullListIter<'_, V> {
    fn has_next(&mut self) -> Result<bool> {
        self.inner.has_next()
    }
}
