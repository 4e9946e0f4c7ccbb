//! The cairn storage engine.
//!
//! Three layers:
//!
//! - [`store`] — the base store: single-writer MVCC environments with
//!   counted, optionally prefix-compressed, optionally DUPSORT databases
//!   and a writeset log for durability;
//! - [`sample`] — lazy sampling iterators translating ranks to entries
//!   through the counted trees;
//! - [`vector`] — crash-consistent ANN vector domains with a private WAL
//!   and independent checkpointing.

pub mod sample;
pub mod store;
pub mod vector;
