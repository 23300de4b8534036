//! CLI error types.

use std::{io, path::PathBuf};

use btmesh_core::ModelError;
use thiserror::Error;

/// Process exit codes.
pub mod exit_code {
    /// Any failure without a more specific code
    pub const GENERAL: i32 = 1;
    /// The document breaks a model invariant
    pub const INVALID_DOCUMENT: i32 = 3;
}

/// Errors of a CLI command.
#[derive(Debug, Error)]
pub enum CliError {
    /// The model rejected the change.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// The document could not be loaded.
    #[error("{path}: {source}")]
    Document {
        /// Document path
        path: PathBuf,
        /// Why it failed
        source: ModelError,
    },

    /// Reading or writing a file failed.
    #[error("{path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// Writing command output failed.
    #[error("output: {0}")]
    Output(#[from] io::Error),

    /// `init` would overwrite a document.
    #[error("{0} already exists (use --force to overwrite)")]
    Exists(PathBuf),

    /// A device key argument is not 16 bytes of hex.
    #[error("invalid device key: {0}")]
    InvalidDeviceKey(String),
}

impl CliError {
    /// Exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Document { source: ModelError::MalformedDocument(_), .. } => exit_code::GENERAL,
            Self::Document { .. } => exit_code::INVALID_DOCUMENT,
            _ => exit_code::GENERAL,
        }
    }
}
