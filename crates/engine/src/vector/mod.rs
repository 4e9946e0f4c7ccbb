//! Crash-consistent ANN vector domains layered on the base store.
//!
//! Mutations are journaled twice: into the domain's delta catalog (made
//! durable by the base store commit) and into a per-transaction WAL
//! segment in the pending directory (the crash artifact recovery judges
//! by). Full snapshots are checkpointed independently of the base store's
//! own log.

mod ann;
mod checkpoint;
mod delta;
mod domain;
mod handle;
mod lock;
mod meta;
mod pins;
mod wal;

pub use ann::{
    AnnFactory, AnnIndex, AnnInitOptions, BruteForceFactory, BruteForceIndex, Metric, ScalarKind,
};
pub use delta::{DeltaOp, PendingUpdate};
pub use domain::{CheckpointInfo, Domain, DomainInfo, TxnCtx};
pub use handle::Handle;
pub use lock::WriterSession;
