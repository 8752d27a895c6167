//! Error types for the replication pipeline.

use thiserror::Error;

use crate::protocol::DecodeError;

/// Errors from the replication client, driver, and decoder.
#[derive(Debug, Error)]
pub enum CdcError {
    /// Transport failure on the replication connection.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame decoded, but violated the protocol state machine.
    #[error("replication protocol error: {0}")]
    Protocol(String),

    /// A frame or logical message could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The server rejected authentication.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Invalid driver configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The server sent an ErrorResponse.
    #[error("server error: {0}")]
    Server(String),
}

impl CdcError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Result type for replication operations.
pub type Result<T> = std::result::Result<T, CdcError>;
