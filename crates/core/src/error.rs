//! Error types for the storage core.
//!
//! We use `thiserror` for automatic `Display` and `Error` trait
//! implementations. Transient content misses (a rank or key that vanished
//! under a concurrent writer) are deliberately NOT errors; operations report
//! them as `Ok(false)` / `Ok(None)`.

use std::io;
use thiserror::Error;

/// Result type alias for cairn operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the cairn storage core
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file operations, fsync, rename)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Data corruption detected (bad magic, checksum mismatch, truncated
    /// frame). Fatal: recovery must not apply the damaged artifact.
    #[error("data corruption: {0}")]
    Corruption(String),

    /// Configuration error: dimension/scalar mismatch, or re-initializing a
    /// domain with options that differ from its stored ones.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid operation or state
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Resource is held by another writer or a pending checkpoint
    #[error("busy: {0}")]
    Busy(String),

    /// A required durable artifact is missing (e.g. init options never stored)
    #[error("not found: {0}")]
    NotFound(String),
}

impl Error {
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidOperation(msg.into())
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        Error::Busy(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_detail() {
        let err = Error::corruption("frame 3 crc mismatch");
        assert!(err.to_string().contains("frame 3 crc mismatch"));

        let err = Error::config("dimensions 4 != 8");
        assert!(err.to_string().contains("configuration error"));
    }

    #[test]
    fn from_io() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
