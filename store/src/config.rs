//! Store configuration.
//!
//! Construction parameters for a store instance: where the files live, the
//! block size used for B-tree nodes, and whether mutations are forced to
//! disk eagerly. The core treats these as opaque inputs; interpreting or
//! sourcing them (CLI flags, environment, repository config) is the job of
//! the layer above.
//!
//! # Invariants
//!
//! - `block_size` is always large enough to hold at least three records of
//!   any record length the store uses, plus node bookkeeping
//! - `data_dir` is a valid path (it may not exist yet; it is created on open)

use std::path::{Path, PathBuf};

/// Default block size for B-tree nodes, matching a common filesystem block.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Smallest accepted block size.
///
/// A node must be able to hold the file header (in block 0) and at least
/// three of the largest records the store uses (term encodings are bounded
/// by the hash-index record plus slack, but the 8-byte hash-index record is
/// the only fixed-length consumer; 128 leaves generous room and rejects
/// obviously broken configurations).
pub const MIN_BLOCK_SIZE: usize = 128;

/// Configuration for a store instance.
///
/// The defaults are suitable for most deployments; `block_size` is the main
/// tuning knob and should ideally match the filesystem block size.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory where the store's files are created.
    pub data_dir: PathBuf,
    /// Size in bytes of one on-disk B-tree node.
    pub block_size: usize,
    /// When set, every mutating operation is followed by an fsync.
    pub force_sync: bool,
}

impl StoreConfig {
    /// Create a configuration with default block size and no forced syncing.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            block_size: DEFAULT_BLOCK_SIZE,
            force_sync: false,
        }
    }

    /// Set the B-tree node block size.
    #[must_use]
    pub const fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Enable or disable fsync-per-mutation.
    #[must_use]
    pub const fn with_force_sync(mut self, force_sync: bool) -> Self {
        self.force_sync = force_sync;
        self
    }

    /// Validate the configuration.
    ///
    /// Returns an error if the block size is too small to be usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size < MIN_BLOCK_SIZE {
            return Err(ConfigError::BlockSizeTooSmall {
                block_size: self.block_size,
                minimum: MIN_BLOCK_SIZE,
            });
        }
        Ok(())
    }
}

/// Error returned when a configuration is invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The configured block size cannot hold a usable node.
    BlockSizeTooSmall { block_size: usize, minimum: usize },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BlockSizeTooSmall {
                block_size,
                minimum,
            } => {
                write!(
                    f,
                    "block size {block_size} is too small (minimum {minimum} bytes)"
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {}
