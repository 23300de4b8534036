//! Access layer opcodes.
//!
//! Opcodes are 1, 2 or 3 octets. The top bits of the first octet select the
//! size:
//!
//! - `0xxxxxxx`: one octet (0x7F is reserved)
//! - `10xxxxxx xxxxxxxx`: two octets, big endian
//! - `11xxxxxx cccccccc cccccccc`: three octets, vendor specific, followed by
//!   the 16-bit company identifier in little endian

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};

/// An access layer opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    /// One-octet SIG opcode
    Single(u8),
    /// Two-octet SIG opcode (first octet has the `10` prefix)
    Double(u16),
    /// Three-octet vendor opcode
    Vendor {
        /// Lower six bits of the first octet
        opcode: u8,
        /// Bluetooth SIG company identifier
        company_id: u16,
    },
}

impl Opcode {
    /// Build a vendor opcode. Only the lower six bits of `opcode` are usable.
    pub fn vendor(opcode: u8, company_id: u16) -> Result<Self> {
        if opcode > 0x3F {
            return Err(ProtocolError::InvalidOpcode(u32::from(opcode)));
        }
        Ok(Self::Vendor { opcode, company_id })
    }

    /// Interpret an opcode written as an integer, e.g. `0x8201` or
    /// `0xC15900` (vendor opcode 0x01 for company 0x0059).
    pub fn from_u32(raw: u32) -> Result<Self> {
        match raw {
            0x7F => Err(ProtocolError::ReservedOpcode),
            0x00..=0x7E => Ok(Self::Single(raw as u8)),
            0x8000..=0xBFFF => Ok(Self::Double(raw as u16)),
            0x00C0_0000..=0x00FF_FFFF => {
                let first = (raw >> 16) as u8;
                let company_id = u16::from_le_bytes([(raw >> 8) as u8, raw as u8]);
                Ok(Self::Vendor { opcode: first & 0x3F, company_id })
            },
            _ => Err(ProtocolError::InvalidOpcode(raw)),
        }
    }

    /// Integer form, inverse of [`Opcode::from_u32`].
    pub fn to_u32(self) -> u32 {
        match self {
            Self::Single(op) => u32::from(op),
            Self::Double(op) => u32::from(op),
            Self::Vendor { opcode, company_id } => {
                let [lo, hi] = company_id.to_le_bytes();
                (u32::from(0xC0 | opcode) << 16) | (u32::from(lo) << 8) | u32::from(hi)
            },
        }
    }

    /// Number of octets on the wire.
    pub fn len(self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Double(_) => 2,
            Self::Vendor { .. } => 3,
        }
    }

    /// Opcodes are never empty; provided for clippy's `len_without_is_empty`.
    pub fn is_empty(self) -> bool {
        false
    }

    /// True for three-octet vendor opcodes.
    pub fn is_vendor(self) -> bool {
        matches!(self, Self::Vendor { .. })
    }

    /// Append the wire encoding to `out`.
    pub fn encode(self, out: &mut Vec<u8>) {
        match self {
            Self::Single(op) => out.push(op),
            Self::Double(op) => out.extend_from_slice(&op.to_be_bytes()),
            Self::Vendor { opcode, company_id } => {
                out.push(0xC0 | opcode);
                out.extend_from_slice(&company_id.to_le_bytes());
            },
        }
    }

    /// Decode an opcode from the start of an access payload.
    ///
    /// Returns the opcode and the remaining parameter bytes.
    pub fn decode(bytes: &[u8]) -> Result<(Self, &[u8])> {
        let first = *bytes.first().ok_or(ProtocolError::Truncated { expected: 1, actual: 0 })?;
        match first >> 6 {
            0b00 | 0b01 => {
                if first == 0x7F {
                    return Err(ProtocolError::ReservedOpcode);
                }
                Ok((Self::Single(first), &bytes[1..]))
            },
            0b10 => {
                let Some(second) = bytes.get(1) else {
                    return Err(ProtocolError::Truncated { expected: 2, actual: bytes.len() });
                };
                Ok((Self::Double(u16::from_be_bytes([first, *second])), &bytes[2..]))
            },
            _ => {
                if bytes.len() < 3 {
                    return Err(ProtocolError::Truncated { expected: 3, actual: bytes.len() });
                }
                let company_id = u16::from_le_bytes([bytes[1], bytes[2]]);
                Ok((Self::Vendor { opcode: first & 0x3F, company_id }, &bytes[3..]))
            },
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(op) => write!(f, "0x{op:02X}"),
            Self::Double(op) => write!(f, "0x{op:04X}"),
            Self::Vendor { opcode, company_id } => {
                write!(f, "0x{:02X}/company 0x{company_id:04X}", 0xC0 | opcode)
            },
        }
    }
}

/// Configuration Server opcodes (device key).
pub mod config {
    use super::Opcode;

    /// Config AppKey Add
    pub const APPKEY_ADD: Opcode = Opcode::Single(0x00);
    /// Config AppKey Update
    pub const APPKEY_UPDATE: Opcode = Opcode::Single(0x01);
    /// Config Composition Data Status
    pub const COMPOSITION_DATA_STATUS: Opcode = Opcode::Single(0x02);
    /// Config AppKey Delete
    pub const APPKEY_DELETE: Opcode = Opcode::Double(0x8000);
    /// Config AppKey Status
    pub const APPKEY_STATUS: Opcode = Opcode::Double(0x8003);
    /// Config Composition Data Get
    pub const COMPOSITION_DATA_GET: Opcode = Opcode::Double(0x8008);
    /// Config Default TTL Get
    pub const DEFAULT_TTL_GET: Opcode = Opcode::Double(0x800C);
    /// Config Default TTL Set
    pub const DEFAULT_TTL_SET: Opcode = Opcode::Double(0x800D);
    /// Config Default TTL Status
    pub const DEFAULT_TTL_STATUS: Opcode = Opcode::Double(0x800E);
    /// Config Model App Bind
    pub const MODEL_APP_BIND: Opcode = Opcode::Double(0x803D);
    /// Config Model App Status
    pub const MODEL_APP_STATUS: Opcode = Opcode::Double(0x803E);
    /// Config NetKey Add
    pub const NETKEY_ADD: Opcode = Opcode::Double(0x8040);
    /// Config NetKey Delete
    pub const NETKEY_DELETE: Opcode = Opcode::Double(0x8041);
    /// Config NetKey Status
    pub const NETKEY_STATUS: Opcode = Opcode::Double(0x8044);
    /// Config Node Reset
    pub const NODE_RESET: Opcode = Opcode::Double(0x8049);
    /// Config Node Reset Status
    pub const NODE_RESET_STATUS: Opcode = Opcode::Double(0x804A);
}

/// Generic OnOff opcodes (application key).
pub mod generic {
    use super::Opcode;

    /// Generic OnOff Get
    pub const ONOFF_GET: Opcode = Opcode::Double(0x8201);
    /// Generic OnOff Set
    pub const ONOFF_SET: Opcode = Opcode::Double(0x8202);
    /// Generic OnOff Set Unacknowledged
    pub const ONOFF_SET_UNACKNOWLEDGED: Opcode = Opcode::Double(0x8203);
    /// Generic OnOff Status
    pub const ONOFF_STATUS: Opcode = Opcode::Double(0x8204);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_sizes() {
        let mut out = Vec::new();
        Opcode::Single(0x02).encode(&mut out);
        generic::ONOFF_GET.encode(&mut out);
        Opcode::vendor(0x01, 0x0059).unwrap().encode(&mut out);
        assert_eq!(out, vec![0x02, 0x82, 0x01, 0xC1, 0x59, 0x00]);
    }

    #[test]
    fn decode_splits_parameters() {
        let (op, rest) = Opcode::decode(&[0x82, 0x02, 0x01, 0x07]).unwrap();
        assert_eq!(op, generic::ONOFF_SET);
        assert_eq!(rest, &[0x01, 0x07]);

        let (op, rest) = Opcode::decode(&[0xC1, 0x59, 0x00, 0xAA]).unwrap();
        assert_eq!(op, Opcode::Vendor { opcode: 0x01, company_id: 0x0059 });
        assert_eq!(rest, &[0xAA]);
    }

    #[test]
    fn decode_rejects_bad_input() {
        assert!(matches!(Opcode::decode(&[]), Err(ProtocolError::Truncated { .. })));
        assert_eq!(Opcode::decode(&[0x7F]), Err(ProtocolError::ReservedOpcode));
        assert!(matches!(Opcode::decode(&[0x82]), Err(ProtocolError::Truncated { .. })));
        assert!(matches!(Opcode::decode(&[0xC1, 0x59]), Err(ProtocolError::Truncated { .. })));
    }

    #[test]
    fn integer_form_matches_wire_form() {
        let vendor = Opcode::from_u32(0x00C1_5900).unwrap();
        assert_eq!(vendor, Opcode::Vendor { opcode: 0x01, company_id: 0x0059 });
        assert_eq!(vendor.to_u32(), 0x00C1_5900);
        assert_eq!(Opcode::from_u32(0x8204).unwrap(), generic::ONOFF_STATUS);
        assert!(Opcode::from_u32(0x7F).is_err());
        assert!(Opcode::vendor(0x40, 0x0059).is_err());
    }
}
