//! Error types for the Trellis runtime

use thiserror::Error;

use crate::client::ClientError;

/// Main error type for Trellis operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Cluster API error surfaced through the transport seam
    #[error("cluster client error: {0}")]
    Client(#[from] ClientError),

    /// Error raised by user controller or finalizer logic
    #[error("controller error: {0}")]
    Controller(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error (webhook server bind/serve)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a controller error with the given message
    pub fn controller(msg: impl Into<String>) -> Self {
        Self::Controller(msg.into())
    }
}
