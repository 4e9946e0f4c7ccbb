//! Cairn: an embedded transactional storage core.
//!
//! Rank-aware counted ordered databases with prefix compression and lazy
//! sampling iterators, plus a crash-consistent, multi-process-safe ANN
//! vector domain journaled through a private write-ahead log and
//! checkpointed independently of the base store's own log.
//!
//! ```no_run
//! use cairn::store::{Env, EnvOptions};
//! use cairn::vector::{AnnInitOptions, Domain, WriterSession};
//!
//! # fn main() -> cairn::Result<()> {
//! let env = Env::open(std::path::Path::new("/tmp/cairn-demo"), EnvOptions::default())?;
//! let domain = Domain::open(&env, "embeddings")?;
//!
//! let txn = env.write_txn()?;
//! domain.store_init_options(&txn, &AnnInitOptions::new(4))?;
//! txn.commit()?;
//!
//! let handle = domain.activate()?;
//! let session = WriterSession::acquire(env.path())?;
//! let mut ctx = domain.txn_ctx(&session, &handle);
//! let txn = env.write_txn()?;
//! ctx.stage_add(&txn, 1, &[0.1, 0.2, 0.3, 0.4])?;
//! ctx.apply_pending(&txn)?;
//! txn.commit()?;
//! domain.publish_log(ctx, true)?;
//!
//! assert!(handle.contains(1));
//! # Ok(())
//! # }
//! ```

pub use cairn_core::{bytes, DatabaseFlags, Error, Result};

pub use cairn_engine::{sample, store, vector};
