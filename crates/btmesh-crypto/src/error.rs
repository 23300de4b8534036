//! Error types for mesh cryptography.

use btmesh_proto::ProtocolError;
use thiserror::Error;

/// Failures while encrypting, decrypting or deobfuscating.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// The MIC did not verify. Wrong key, wrong nonce or tampered data.
    #[error("message integrity check failed")]
    AuthenticationFailed,

    /// Input shorter than the smallest valid PDU.
    #[error("input too short: need at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// The PDU's NID belongs to a different network key.
    #[error("NID {actual:#04x} does not match key NID {expected:#04x}")]
    NidMismatch {
        /// NID of the key tried
        expected: u8,
        /// NID carried by the PDU
        actual: u8,
    },

    /// Decrypted header could not be parsed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, CryptoError>;
