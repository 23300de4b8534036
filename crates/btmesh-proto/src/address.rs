//! Mesh address space.
//!
//! The 16-bit address space is partitioned by its top bits:
//!
//! ```text
//! 0x0000            unassigned
//! 0x0001 - 0x7FFF   unicast (one per element)
//! 0x8000 - 0xBFFF   virtual (hash of a 128-bit label UUID)
//! 0xC000 - 0xFEFF   group
//! 0xFF00 - 0xFFFF   fixed group (all-proxies, all-friends, all-relays, all-nodes)
//! ```

use std::fmt;

use crate::errors::{ProtocolError, Result};

/// The unassigned address.
pub const UNASSIGNED_ADDRESS: u16 = 0x0000;
/// Lowest unicast address.
pub const MIN_UNICAST_ADDRESS: u16 = 0x0001;
/// Highest unicast address.
pub const MAX_UNICAST_ADDRESS: u16 = 0x7FFF;
/// Lowest virtual address.
pub const MIN_VIRTUAL_ADDRESS: u16 = 0x8000;
/// Highest virtual address.
pub const MAX_VIRTUAL_ADDRESS: u16 = 0xBFFF;
/// Lowest group address available for allocation.
pub const MIN_GROUP_ADDRESS: u16 = 0xC000;
/// Highest group address available for allocation.
pub const MAX_GROUP_ADDRESS: u16 = 0xFEFF;
/// All-proxies fixed group address.
pub const ALL_PROXIES_ADDRESS: u16 = 0xFFFC;
/// All-friends fixed group address.
pub const ALL_FRIENDS_ADDRESS: u16 = 0xFFFD;
/// All-relays fixed group address.
pub const ALL_RELAYS_ADDRESS: u16 = 0xFFFE;
/// All-nodes fixed group address.
pub const ALL_NODES_ADDRESS: u16 = 0xFFFF;

/// A classified 16-bit mesh address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MeshAddress {
    /// 0x0000
    Unassigned,
    /// Element address
    Unicast(u16),
    /// Virtual address derived from a label UUID
    Virtual(u16),
    /// Dynamically allocated group address
    Group(u16),
    /// One of the fixed group addresses (0xFF00 and above)
    Fixed(u16),
}

impl MeshAddress {
    /// Classify a raw address.
    pub fn new(raw: u16) -> Self {
        match raw {
            UNASSIGNED_ADDRESS => Self::Unassigned,
            MIN_UNICAST_ADDRESS..=MAX_UNICAST_ADDRESS => Self::Unicast(raw),
            MIN_VIRTUAL_ADDRESS..=MAX_VIRTUAL_ADDRESS => Self::Virtual(raw),
            MIN_GROUP_ADDRESS..=MAX_GROUP_ADDRESS => Self::Group(raw),
            _ => Self::Fixed(raw),
        }
    }

    /// Parse a unicast address, rejecting every other kind.
    pub fn unicast(raw: u16) -> Result<Self> {
        match Self::new(raw) {
            addr @ Self::Unicast(_) => Ok(addr),
            _ => Err(ProtocolError::InvalidAddress { kind: "unicast", address: raw }),
        }
    }

    /// Raw 16-bit value.
    pub fn raw(self) -> u16 {
        match self {
            Self::Unassigned => UNASSIGNED_ADDRESS,
            Self::Unicast(a) | Self::Virtual(a) | Self::Group(a) | Self::Fixed(a) => a,
        }
    }

    /// True for unicast addresses.
    pub fn is_unicast(self) -> bool {
        matches!(self, Self::Unicast(_))
    }

    /// True for group, fixed group and virtual addresses.
    pub fn is_multicast(self) -> bool {
        matches!(self, Self::Virtual(_) | Self::Group(_) | Self::Fixed(_))
    }
}

impl From<u16> for MeshAddress {
    fn from(raw: u16) -> Self {
        Self::new(raw)
    }
}

impl fmt::Display for MeshAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.raw())
    }
}

/// True if `address` is a unicast address.
pub fn is_unicast(address: u16) -> bool {
    (MIN_UNICAST_ADDRESS..=MAX_UNICAST_ADDRESS).contains(&address)
}

/// True if `address` is in the allocatable group range.
pub fn is_group(address: u16) -> bool {
    (MIN_GROUP_ADDRESS..=MAX_GROUP_ADDRESS).contains(&address)
}

/// True if `address` is a virtual address.
pub fn is_virtual(address: u16) -> bool {
    (MIN_VIRTUAL_ADDRESS..=MAX_VIRTUAL_ADDRESS).contains(&address)
}

/// Format an address as four upper-case hex digits, as used by the mesh
/// configuration database.
pub fn format_address(address: u16) -> String {
    format!("{address:04X}")
}

/// Parse a four hex digit address string (case-insensitive).
pub fn parse_address(text: &str) -> Result<u16> {
    if text.len() != 4 {
        return Err(ProtocolError::InvalidAddressString(text.to_string()));
    }
    u16::from_str_radix(text, 16).map_err(|_| ProtocolError::InvalidAddressString(text.to_string()))
}
