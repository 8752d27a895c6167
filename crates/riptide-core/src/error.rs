//! Error types for the core state crate.

use thiserror::Error;

/// Errors from snapshot persistence and LSN handling.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Snapshot file I/O failed.
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot binary encoding or decoding failed.
    #[error("snapshot codec error: {0}")]
    Codec(#[from] postcard::Error),

    /// Snapshot compression or decompression failed.
    #[error("snapshot compression error: {0}")]
    Compression(String),

    /// A log position string was not in the `X/X` form.
    #[error("invalid lsn: {0}")]
    InvalidLsn(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
