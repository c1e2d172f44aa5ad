//! Filepath: src/config.rs
//!
//! Configuration for the persistent pool and the tree.

use std::path::PathBuf;

/// Default pool size: 1 GiB.
pub const DEFAULT_POOL_SIZE: u64 = 1024 * 1024 * 1024;

/// Configuration for a persistent memory pool.
///
/// The path and size are fixed for the lifetime of a pool file; changing
/// either requires recreating the pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Path of the pool file.
    pub path: PathBuf,

    /// Total pool size in bytes.
    pub size: u64,
}

impl PoolConfig {
    /// Config for a pool at `path` with the default size.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            size: DEFAULT_POOL_SIZE,
        }
    }

    /// Override the pool size.
    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }
}

/// Configuration for tree behavior.
#[derive(Debug, Clone, Copy)]
pub struct TreeConfig {
    /// Run the full merge/redistribute rebalance on deletes that underflow
    /// a node.
    ///
    /// Disabled by default: deletes then remove the key locally and rely on
    /// underflow tolerance, which wins on PM write cost for most workloads.
    pub rebalance_on_delete: bool,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            rebalance_on_delete: false,
        }
    }
}
