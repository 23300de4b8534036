//! Client error types.

use std::io;

use btmesh_core::{ModelError, TransportError};
use thiserror::Error;

/// Errors surfaced by [`crate::MeshClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// The network model rejected the operation.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// The transaction failed or could not be started.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The bearer failed outside a transaction.
    #[error("bearer error: {0}")]
    Bearer(#[from] io::Error),

    /// The client stopped before the operation finished.
    #[error("client is not running")]
    Disconnected,
}

impl ClientError {
    /// True if trying again later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_retryable(),
            Self::Bearer(_) | Self::Disconnected => true,
            Self::Model(_) => false,
        }
    }
}
