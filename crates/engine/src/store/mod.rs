//! The base store: a single-writer, many-readers transactional key-value
//! engine with counted ordered databases.
//!
//! Committed state lives in memory as persistent trees behind an `Arc`;
//! durability comes from the writeset log in `<env>/base-wal`, replayed on
//! open. This keeps reads lock-free (snapshot = one `Arc` clone) while the
//! writer serializes on a mutex.

pub mod tree;
pub mod txn;
pub mod wal;

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cairn_core::{DatabaseFlags, Error, Result};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use tree::CountedTree;
use txn::TxnWork;
use wal::{CommitFrame, WalWriter, WriteOp};

pub use txn::{ReadView, RoTxn, RwTxn};
pub use wal::Durability;

const WAL_DIR: &str = "base-wal";
const ENV_LOCK_FILE: &str = "env.lock";

/// Environment open options.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvOptions {
    pub durability: Durability,
    /// Skip the environment's own advisory process lock. Used when a layer
    /// above coordinates writers with its own lock file.
    pub external_locking: bool,
}

/// Handle to a named database. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Database {
    name: Arc<str>,
}

impl Database {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone)]
pub(crate) struct DatabaseState {
    pub(crate) flags: DatabaseFlags,
    pub(crate) tree: CountedTree,
}

/// The committed state of every database in the environment.
#[derive(Debug, Clone, Default)]
pub(crate) struct EngineState {
    pub(crate) databases: HashMap<String, DatabaseState>,
}

impl EngineState {
    fn apply(&mut self, frame: CommitFrame) {
        for op in frame.ops {
            match op {
                WriteOp::CreateDb {
                    name,
                    dup_sort,
                    counted,
                    prefix_compression,
                } => {
                    self.databases.entry(name).or_insert_with(|| DatabaseState {
                        flags: DatabaseFlags {
                            create: true,
                            dup_sort,
                            counted,
                            prefix_compression,
                        },
                        tree: CountedTree::new(dup_sort, prefix_compression),
                    });
                }
                WriteOp::Put { db, key, value } => {
                    if let Some(state) = self.databases.get_mut(&db) {
                        state.tree = state.tree.put(&key, &value).0;
                    }
                }
                WriteOp::Del { db, key, value } => {
                    if let Some(state) = self.databases.get_mut(&db) {
                        state.tree = state.tree.del(&key, value.as_deref()).0;
                    }
                }
                WriteOp::Clear { db } => {
                    if let Some(state) = self.databases.get_mut(&db) {
                        state.tree = state.tree.clear();
                    }
                }
            }
        }
    }
}

pub(crate) struct WriterState {
    pub(crate) wal: WalWriter,
}

pub(crate) struct EnvInner {
    path: PathBuf,
    pub(crate) committed: RwLock<Arc<EngineState>>,
    pub(crate) writer: Mutex<WriterState>,
    /// Held for the environment's lifetime unless external locking is on.
    _env_lock: Option<File>,
}

/// An open environment. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Env {
    inner: Arc<EnvInner>,
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}

impl Env {
    /// Open or create an environment rooted at `path`, replaying the
    /// writeset log to rebuild committed state.
    pub fn open(path: &Path, options: EnvOptions) -> Result<Env> {
        fs::create_dir_all(path)?;
        let env_lock = if options.external_locking {
            None
        } else {
            let lock = OpenOptions::new()
                .create(true)
                .write(true)
                .open(path.join(ENV_LOCK_FILE))?;
            lock.try_lock_exclusive().map_err(|_| {
                Error::busy(format!(
                    "environment {} is locked by another process",
                    path.display()
                ))
            })?;
            Some(lock)
        };

        let wal_dir = path.join(WAL_DIR);
        let mut state = EngineState::default();
        let mut replayed = 0u64;
        wal::replay(&wal_dir, |frame| {
            state.apply(frame);
            replayed += 1;
        })?;
        let wal = WalWriter::open(&wal_dir, options.durability)?;
        info!(
            path = %path.display(),
            commits_replayed = replayed,
            databases = state.databases.len(),
            "opened environment"
        );
        Ok(Env {
            inner: Arc::new(EnvInner {
                path: path.to_path_buf(),
                committed: RwLock::new(Arc::new(state)),
                writer: Mutex::new(WriterState { wal }),
                _env_lock: env_lock,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Open a named database, creating it when `flags.create` is set.
    ///
    /// Reopening an existing database with different structural flags
    /// (dup_sort, prefix compression) is a configuration error.
    pub fn open_database(&self, name: &str, flags: DatabaseFlags) -> Result<Database> {
        let existing = self
            .inner
            .committed
            .read()
            .databases
            .get(name)
            .map(|d| d.flags);
        if let Some(have) = existing {
            if have.dup_sort != flags.dup_sort
                || have.prefix_compression != flags.prefix_compression
            {
                return Err(Error::config(format!(
                    "database '{name}' already exists with different flags"
                )));
            }
            return Ok(Database {
                name: Arc::from(name),
            });
        }
        if !flags.create {
            return Err(Error::not_found(format!("database '{name}'")));
        }
        // Creation is its own one-op commit so it survives reopen.
        let mut writer = self.inner.writer.lock();
        let mut state = (**self.inner.committed.read()).clone();
        if !state.databases.contains_key(name) {
            let frame = CommitFrame {
                ops: vec![WriteOp::CreateDb {
                    name: name.to_string(),
                    dup_sort: flags.dup_sort,
                    counted: flags.counted,
                    prefix_compression: flags.prefix_compression,
                }],
            };
            writer.wal.append(&frame)?;
            state.apply(frame);
            *self.inner.committed.write() = Arc::new(state);
            debug!(database = name, "created database");
        }
        Ok(Database {
            name: Arc::from(name),
        })
    }

    /// Begin a read-only transaction (a frozen snapshot).
    pub fn read_txn(&self) -> RoTxn {
        RoTxn {
            state: self.inner.committed.read().clone(),
        }
    }

    /// Flush the writeset log to disk regardless of the durability mode.
    pub fn sync(&self) -> Result<()> {
        self.inner.writer.lock().wal.sync()
    }

    /// Begin the read-write transaction, blocking while another is live.
    pub fn write_txn(&self) -> Result<RwTxn<'_>> {
        let writer = self.inner.writer.lock();
        let state = (**self.inner.committed.read()).clone();
        Ok(RwTxn {
            env: &self.inner,
            writer,
            work: Mutex::new(TxnWork {
                state,
                ops: Vec::new(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let env = Env::open(dir.path(), EnvOptions::default()).unwrap();
            let db = env
                .open_database("kv", DatabaseFlags::CREATE.with_dup_sort())
                .unwrap();
            let txn = env.write_txn().unwrap();
            txn.put(&db, b"k", b"a").unwrap();
            txn.put(&db, b"k", b"b").unwrap();
            txn.put(&db, b"other", b"x").unwrap();
            txn.del(&db, b"other", None).unwrap();
            txn.commit().unwrap();
        }
        let env = Env::open(dir.path(), EnvOptions::default()).unwrap();
        let db = env
            .open_database("kv", DatabaseFlags::default().with_dup_sort())
            .unwrap();
        let ro = env.read_txn();
        assert_eq!(ro.count_all(&db, true).unwrap(), 2);
        assert_eq!(ro.count_all(&db, false).unwrap(), 1);
        assert!(ro.get(&db, b"other").unwrap().is_none());
    }

    #[test]
    fn aborted_txn_leaves_no_trace_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let env = Env::open(dir.path(), EnvOptions::default()).unwrap();
            let db = env.open_database("kv", DatabaseFlags::CREATE).unwrap();
            let txn = env.write_txn().unwrap();
            txn.put(&db, b"ghost", b"v").unwrap();
            txn.abort();
        }
        let env = Env::open(dir.path(), EnvOptions::default()).unwrap();
        let db = env.open_database("kv", DatabaseFlags::default()).unwrap();
        assert!(env.read_txn().get(&db, b"ghost").unwrap().is_none());
    }

    #[test]
    fn second_process_lock_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let _env = Env::open(dir.path(), EnvOptions::default()).unwrap();
        let err = Env::open(dir.path(), EnvOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Busy(_)));
    }

    #[test]
    fn external_locking_skips_env_lock() {
        let dir = tempfile::tempdir().unwrap();
        let opts = EnvOptions {
            external_locking: true,
            ..EnvOptions::default()
        };
        let _a = Env::open(dir.path(), opts).unwrap();
        // Second open of the same directory is allowed; callers coordinate.
        let _b = Env::open(dir.path(), opts).unwrap();
    }

    #[test]
    fn flag_mismatch_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let env = Env::open(dir.path(), EnvOptions::default()).unwrap();
        env.open_database("d", DatabaseFlags::CREATE.with_dup_sort())
            .unwrap();
        let err = env.open_database("d", DatabaseFlags::CREATE).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn missing_database_without_create() {
        let dir = tempfile::tempdir().unwrap();
        let env = Env::open(dir.path(), EnvOptions::default()).unwrap();
        let err = env
            .open_database("absent", DatabaseFlags::default())
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
