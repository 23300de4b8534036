//! Error types for wire parsing.

use thiserror::Error;

/// Result alias for wire operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding or decoding mesh wire data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Input ended before a complete structure could be read.
    #[error("truncated input: expected at least {expected} bytes, got {actual}")]
    Truncated {
        /// Minimum number of bytes required
        expected: usize,
        /// Number of bytes available
        actual: usize,
    },

    /// Input is longer than the structure allows.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Actual size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Opcode bytes do not form a valid 1, 2 or 3 octet opcode.
    #[error("invalid opcode: 0x{0:06x}")]
    InvalidOpcode(u32),

    /// Opcode 0x7F is reserved for future use.
    #[error("reserved opcode 0x7f")]
    ReservedOpcode,

    /// A 16-bit address is not of the expected kind.
    #[error("invalid {kind} address: 0x{address:04x}")]
    InvalidAddress {
        /// Expected address kind
        kind: &'static str,
        /// Offending address
        address: u16,
    },

    /// An address string is not exactly four hex digits.
    #[error("invalid address string: {0:?}")]
    InvalidAddressString(String),

    /// Segment header fields are inconsistent (SegO > SegN).
    #[error("invalid segment: seg_o {seg_o} > seg_n {seg_n}")]
    InvalidSegment {
        /// Segment offset
        seg_o: u8,
        /// Last segment number
        seg_n: u8,
    },

    /// Unknown proxy configuration opcode.
    #[error("unknown proxy configuration opcode: 0x{0:02x}")]
    UnknownProxyOpcode(u8),

    /// Unknown proxy filter type.
    #[error("unknown proxy filter type: 0x{0:02x}")]
    UnknownFilterType(u8),

    /// Hex string could not be decoded.
    #[error("invalid hex: {0}")]
    InvalidHex(String),
}

impl From<hex::FromHexError> for ProtocolError {
    fn from(err: hex::FromHexError) -> Self {
        Self::InvalidHex(err.to_string())
    }
}
