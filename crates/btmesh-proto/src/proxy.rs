//! Proxy configuration messages.
//!
//! These travel as control PDUs between a client and the proxy node it is
//! connected to (DST = unassigned, TTL = 0) and manage the proxy's address
//! filter.

use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::errors::{ProtocolError, Result};

/// Kind of proxy filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum FilterType {
    /// Only addresses on the list are forwarded (white list).
    #[default]
    Inclusion = 0x00,
    /// Addresses on the list are dropped (black list).
    Exclusion = 0x01,
}

impl TryFrom<u8> for FilterType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Self::Inclusion),
            0x01 => Ok(Self::Exclusion),
            other => Err(ProtocolError::UnknownFilterType(other)),
        }
    }
}

/// A proxy configuration message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyConfigMessage {
    /// Change the filter type; also clears the list.
    SetFilterType(FilterType),
    /// Add addresses to the filter list.
    AddAddresses(Vec<u16>),
    /// Remove addresses from the filter list.
    RemoveAddresses(Vec<u16>),
    /// Status reported by the proxy after every change.
    FilterStatus {
        /// Current filter type
        filter_type: FilterType,
        /// Number of addresses on the list
        list_size: u16,
    },
}

impl ProxyConfigMessage {
    /// Set Filter Type
    pub const SET_FILTER_TYPE: u8 = 0x00;
    /// Add Addresses To Filter
    pub const ADD_ADDRESSES: u8 = 0x01;
    /// Remove Addresses From Filter
    pub const REMOVE_ADDRESSES: u8 = 0x02;
    /// Filter Status
    pub const FILTER_STATUS: u8 = 0x03;

    /// Control opcode.
    pub fn opcode(&self) -> u8 {
        match self {
            Self::SetFilterType(_) => Self::SET_FILTER_TYPE,
            Self::AddAddresses(_) => Self::ADD_ADDRESSES,
            Self::RemoveAddresses(_) => Self::REMOVE_ADDRESSES,
            Self::FilterStatus { .. } => Self::FILTER_STATUS,
        }
    }

    /// Encode opcode followed by parameters.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.opcode()];
        match self {
            Self::SetFilterType(filter_type) => out.push(*filter_type as u8),
            Self::AddAddresses(addresses) | Self::RemoveAddresses(addresses) => {
                for address in addresses {
                    out.extend_from_slice(&address.to_be_bytes());
                }
            },
            Self::FilterStatus { filter_type, list_size } => {
                out.push(*filter_type as u8);
                out.extend_from_slice(&list_size.to_be_bytes());
            },
        }
        out
    }

    /// Decode opcode and parameters.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (&opcode, params) =
            bytes.split_first().ok_or(ProtocolError::Truncated { expected: 1, actual: 0 })?;
        match opcode {
            Self::SET_FILTER_TYPE => {
                let value = *params
                    .first()
                    .ok_or(ProtocolError::Truncated { expected: 2, actual: bytes.len() })?;
                Ok(Self::SetFilterType(FilterType::try_from(value)?))
            },
            Self::ADD_ADDRESSES | Self::REMOVE_ADDRESSES => {
                let addresses = params
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect();
                if opcode == Self::ADD_ADDRESSES {
                    Ok(Self::AddAddresses(addresses))
                } else {
                    Ok(Self::RemoveAddresses(addresses))
                }
            },
            Self::FILTER_STATUS => {
                if params.len() < 3 {
                    return Err(ProtocolError::Truncated { expected: 4, actual: bytes.len() });
                }
                Ok(Self::FilterStatus {
                    filter_type: FilterType::try_from(params[0])?,
                    list_size: u16::from_be_bytes([params[1], params[2]]),
                })
            },
            other => Err(ProtocolError::UnknownProxyOpcode(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_addresses_encoding() {
        let msg = ProxyConfigMessage::AddAddresses(vec![0x0001, 0xC000]);
        assert_eq!(msg.encode(), vec![0x01, 0x00, 0x01, 0xC0, 0x00]);
        assert_eq!(ProxyConfigMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn filter_status_decoding() {
        let msg = ProxyConfigMessage::decode(&[0x03, 0x01, 0x00, 0x02]).unwrap();
        assert_eq!(
            msg,
            ProxyConfigMessage::FilterStatus { filter_type: FilterType::Exclusion, list_size: 2 }
        );
    }

    #[test]
    fn rejects_unknown() {
        assert_eq!(ProxyConfigMessage::decode(&[0x09]), Err(ProtocolError::UnknownProxyOpcode(9)));
        assert_eq!(
            ProxyConfigMessage::decode(&[0x00, 0x05]),
            Err(ProtocolError::UnknownFilterType(5))
        );
        assert!(ProxyConfigMessage::decode(&[0x03, 0x00]).is_err());
    }
}
