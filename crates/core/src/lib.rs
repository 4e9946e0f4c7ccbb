//! Shared types for the cairn storage core.
//!
//! This crate holds the pieces every layer needs: the error taxonomy,
//! database flags, and the fixed-width big-endian encoding helpers used by
//! metadata records and log frames.

pub mod bytes;
pub mod error;
pub mod flags;

pub use error::{Error, Result};
pub use flags::DatabaseFlags;
