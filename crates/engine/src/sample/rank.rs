//! Rank samplers over counted databases.
//!
//! Both samplers re-derive their position from the database's current tree
//! on every call, so a writer mutating the database between calls (through
//! the same transaction handle) is observed immediately: ranks that no
//! longer exist terminate the iteration.

use std::sync::Arc;

use cairn_core::Result;

use crate::store::{Database, ReadView};

use super::{RankSpec, RankStrategy, SampleRange};

/// The shape every sampling iterator shares.
pub trait Sampler {
    /// Load the next sample into the holders. `Ok(false)` means exhausted,
    /// including ranks invalidated by concurrent shrinkage.
    fn has_next(&mut self) -> Result<bool>;
}

/// Samples distinct keys at requested ranks within an optional key range.
pub struct KeySampler<'v, V, S> {
    view: &'v V,
    db: Database,
    range: SampleRange,
    ranks: RankSpec,
    strategy: S,
    idx: usize,
    prev_abs: Option<u64>,
    current: Option<Vec<u8>>,
    done: bool,
}

impl<'v, V: ReadView, S: RankStrategy> KeySampler<'v, V, S> {
    pub fn new(
        view: &'v V,
        db: Database,
        range: SampleRange,
        ranks: RankSpec,
        strategy: S,
    ) -> KeySampler<'v, V, S> {
        KeySampler {
            view,
            db,
            range,
            ranks,
            strategy,
            idx: 0,
            prev_abs: None,
            current: None,
            done: false,
        }
    }

    /// The key loaded by the last successful `has_next`.
    pub fn key(&self) -> Option<&[u8]> {
        self.current.as_deref()
    }
}

impl<V: ReadView, S: RankStrategy> Sampler for KeySampler<'_, V, S> {
    fn has_next(&mut self) -> Result<bool> {
        if self.done {
            return Ok(false);
        }
        let rank = match self.ranks.rank(self.idx) {
            Some(r) => r,
            None => {
                self.done = true;
                self.current = None;
                return Ok(false);
            }
        };
        let tree = self.view.tree(&self.db)?;
        let (base, count) = self.range.key_span(&tree);
        if rank >= count {
            self.done = true;
            self.current = None;
            return Ok(false);
        }
        let abs = base + rank;
        match self.strategy.key_at(&tree, self.prev_abs, abs) {
            Some(key) => {
                self.current = Some(key);
                self.prev_abs = Some(abs);
                self.idx += 1;
                Ok(true)
            }
            None => {
                self.done = true;
                self.current = None;
                Ok(false)
            }
        }
    }
}

/// Samples entries (duplicate values counted individually) at requested
/// ranks within an optional key range.
pub struct EntrySampler<'v, V, S> {
    view: &'v V,
    db: Database,
    range: SampleRange,
    ranks: RankSpec,
    strategy: S,
    idx: usize,
    prev_abs: Option<u64>,
    current: Option<(Vec<u8>, Arc<[u8]>)>,
    done: bool,
}

impl<'v, V: ReadView, S: RankStrategy> EntrySampler<'v, V, S> {
    pub fn new(
        view: &'v V,
        db: Database,
        range: SampleRange,
        ranks: RankSpec,
        strategy: S,
    ) -> EntrySampler<'v, V, S> {
        EntrySampler {
            view,
            db,
            range,
            ranks,
            strategy,
            idx: 0,
            prev_abs: None,
            current: None,
            done: false,
        }
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(k, _)| k.as_slice())
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(_, v)| v.as_ref())
    }
}

impl<V: ReadView, S: RankStrategy> Sampler for EntrySampler<'_, V, S> {
    fn has_next(&mut self) -> Result<bool> {
        if self.done {
            return Ok(false);
        }
        let rank = match self.ranks.rank(self.idx) {
            Some(r) => r,
            None => {
                self.done = true;
                self.current = None;
                return Ok(false);
            }
        };
        let tree = self.view.tree(&self.db)?;
        let (base, count) = self.range.entry_span(&tree);
        if rank >= count {
            self.done = true;
            self.current = None;
            return Ok(false);
        }
        let abs = base + rank;
        match self.strategy.entry_at(&tree, self.prev_abs, abs) {
            Some(entry) => {
                self.current = Some(entry);
                self.prev_abs = Some(abs);
                self.idx += 1;
                Ok(true)
            }
            None => {
                self.done = true;
                self.current = None;
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{BudgetedScan, RankSeek};
    use crate::store::{Env, EnvOptions};
    use cairn_core::DatabaseFlags;

    fn dup_env() -> (tempfile::TempDir, Env, Database) {
        let dir = tempfile::tempdir().unwrap();
        let env = Env::open(dir.path(), EnvOptions::default()).unwrap();
        let db = env
            .open_database(
                "samples",
                DatabaseFlags::CREATE
                    .with_dup_sort()
                    .with_counted()
                    .with_prefix_compression(),
            )
            .unwrap();
        (dir, env, db)
    }

    fn load_worked_example(env: &Env, db: &Database) {
        let txn = env.write_txn().unwrap();
        for (k, v) in [
            ("alpha", "aa"),
            ("alpha", "ab"),
            ("alpha", "ac"),
            ("bravo", "aa"),
            ("bravo", "ab"),
            ("charlie", "aa"),
        ] {
            txn.put(db, k.as_bytes(), v.as_bytes()).unwrap();
        }
        txn.commit().unwrap();
    }

    #[test]
    fn worked_example_unbounded_entry_ranks() {
        let (_dir, env, db) = dup_env();
        load_worked_example(&env, &db);
        let ro = env.read_txn();
        let mut it = EntrySampler::new(
            &ro,
            db.clone(),
            SampleRange::all(),
            RankSpec::list(vec![0, 3, 5]).unwrap(),
            RankSeek,
        );
        let mut out = Vec::new();
        while it.has_next().unwrap() {
            out.push((
                String::from_utf8(it.key().unwrap().to_vec()).unwrap(),
                String::from_utf8(it.value().unwrap().to_vec()).unwrap(),
            ));
        }
        assert_eq!(
            out,
            vec![
                ("alpha".into(), "aa".into()),
                ("bravo".into(), "aa".into()),
                ("charlie".into(), "aa".into()),
            ]
        );
    }

    #[test]
    fn worked_example_bounded_entry_ranks() {
        let (_dir, env, db) = dup_env();
        load_worked_example(&env, &db);
        let ro = env.read_txn();
        let mut it = EntrySampler::new(
            &ro,
            db.clone(),
            SampleRange::closed(b"bravo", b"bravo"),
            RankSpec::list(vec![0, 1]).unwrap(),
            RankSeek,
        );
        let mut out = Vec::new();
        while it.has_next().unwrap() {
            out.push((it.key().unwrap().to_vec(), it.value().unwrap().to_vec()));
        }
        assert_eq!(
            out,
            vec![
                (b"bravo".to_vec(), b"aa".to_vec()),
                (b"bravo".to_vec(), b"ab".to_vec()),
            ]
        );
    }

    #[test]
    fn key_sampler_ranks_distinct_keys() {
        let (_dir, env, db) = dup_env();
        load_worked_example(&env, &db);
        let ro = env.read_txn();
        let mut it = KeySampler::new(
            &ro,
            db.clone(),
            SampleRange::all(),
            RankSpec::list(vec![0, 2]).unwrap(),
            BudgetedScan::default(),
        );
        assert!(it.has_next().unwrap());
        assert_eq!(it.key().unwrap(), b"alpha");
        assert!(it.has_next().unwrap());
        assert_eq!(it.key().unwrap(), b"charlie");
        assert!(!it.has_next().unwrap());
    }

    #[test]
    fn out_of_range_rank_is_exhaustion() {
        let (_dir, env, db) = dup_env();
        load_worked_example(&env, &db);
        let ro = env.read_txn();
        let mut it = EntrySampler::new(
            &ro,
            db.clone(),
            SampleRange::all(),
            RankSpec::list(vec![0, 99]).unwrap(),
            RankSeek,
        );
        assert!(it.has_next().unwrap());
        assert!(!it.has_next().unwrap());
        assert!(it.key().is_none());
        // Stays exhausted.
        assert!(!it.has_next().unwrap());
    }

    #[test]
    fn delete_all_mid_iteration_exhausts() {
        let (_dir, env, db) = dup_env();
        load_worked_example(&env, &db);
        let txn = env.write_txn().unwrap();
        let mut it = EntrySampler::new(
            &txn,
            db.clone(),
            SampleRange::all(),
            RankSpec::Full,
            RankSeek,
        );
        assert!(it.has_next().unwrap());
        txn.clear(&db).unwrap();
        assert_eq!(txn.count_all(&db, true).unwrap(), 0);
        assert!(!it.has_next().unwrap());
        txn.abort();
    }

    #[test]
    fn full_scan_visits_everything_in_order() {
        let (_dir, env, db) = dup_env();
        load_worked_example(&env, &db);
        let ro = env.read_txn();
        let mut it = EntrySampler::new(
            &ro,
            db.clone(),
            SampleRange::all(),
            RankSpec::Full,
            BudgetedScan { budget: 2, step: 1 },
        );
        let mut n = 0;
        let mut last: Option<(Vec<u8>, Vec<u8>)> = None;
        while it.has_next().unwrap() {
            let cur = (it.key().unwrap().to_vec(), it.value().unwrap().to_vec());
            if let Some(prev) = &last {
                assert!(prev <= &cur);
            }
            last = Some(cur);
            n += 1;
        }
        assert_eq!(n, 6);
    }
}
