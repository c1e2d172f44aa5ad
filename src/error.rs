//! Filepath: src/error.rs
//!
//! Error types for the pool and tree.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using [`PmError`].
pub type Result<T> = std::result::Result<T, PmError>;

/// Errors that can occur opening or allocating from a persistent pool.
///
/// Internal races (a tombstoned node reached mid-insert, a switch-counter
/// mismatch during a scan) are recovered by retry and never surface here.
/// A lookup miss is `None`, not an error.
#[derive(Debug, Error)]
pub enum PmError {
    /// Pool file could not be created, opened, or mapped.
    #[error("pool I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An existing pool file does not carry the expected layout.
    #[error("incompatible pool at {path}: {reason}")]
    IncompatiblePool {
        /// Path of the offending pool file.
        path: PathBuf,
        /// What failed to validate (magic, version, or size).
        reason: String,
    },

    /// The configured pool size cannot hold the pool header and root object.
    #[error("pool size {size} too small, need at least {minimum} bytes")]
    PoolTooSmall {
        /// Configured size.
        size: u64,
        /// Minimum usable size.
        minimum: u64,
    },

    /// The pool has no room left for an allocation.
    #[error("pool exhausted: requested {requested} bytes, {available} available")]
    PoolExhausted {
        /// Bytes requested.
        requested: usize,
        /// Bytes remaining in the pool.
        available: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "no such pool");
        let err: PmError = io_err.into();
        assert!(matches!(err, PmError::Io(_)));
    }

    #[test]
    fn test_exhausted_display() {
        let err = PmError::PoolExhausted {
            requested: 512,
            available: 64,
        };
        assert_eq!(
            err.to_string(),
            "pool exhausted: requested 512 bytes, 64 available"
        );
    }

    #[test]
    fn test_incompatible_display() {
        let err = PmError::IncompatiblePool {
            path: PathBuf::from("/tmp/x.pool"),
            reason: "bad magic".to_string(),
        };
        assert!(err.to_string().contains("bad magic"));
    }
}
