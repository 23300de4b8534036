//! Network PDU header.
//!
//! ```text
//! IVI (1) | NID (7) | CTL (1) | TTL (7) | SEQ (24) | SRC (16) | DST (16)
//! ```
//!
//! On the wire the CTL/TTL, SEQ and SRC fields are obfuscated and DST is
//! encrypted together with the transport PDU. [`NetworkHeader`] is the clear
//! form, reconstructed by `btmesh-crypto` before it is parsed here.

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, byteorder::big_endian::U16,
};

use crate::errors::{ProtocolError, Result};

/// Largest network PDU (advertising bearer limit).
pub const MAX_NETWORK_PDU: usize = 29;
/// NetMIC length for access messages.
pub const ACCESS_NET_MIC: usize = 4;
/// NetMIC length for control messages.
pub const CONTROL_NET_MIC: usize = 8;
/// Largest sequence number (24 bits).
pub const MAX_SEQUENCE_NUMBER: u32 = 0x00FF_FFFF;
/// Largest TTL value.
pub const MAX_TTL: u8 = 0x7F;

/// Clear network header. Field layout matches the wire exactly.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C)]
pub struct NetworkHeader {
    ivi_nid: u8,
    ctl_ttl: u8,
    seq: [u8; 3],
    src: U16,
    dst: U16,
}

impl NetworkHeader {
    /// Encoded size.
    pub const SIZE: usize = 9;

    /// Build a header. `ivi` is the least significant bit of the IV index.
    pub fn new(ivi: bool, nid: u8, ctl: bool, ttl: u8, seq: u32, src: u16, dst: u16) -> Self {
        let [_, s0, s1, s2] = (seq & MAX_SEQUENCE_NUMBER).to_be_bytes();
        Self {
            ivi_nid: (u8::from(ivi) << 7) | (nid & 0x7F),
            ctl_ttl: (u8::from(ctl) << 7) | (ttl & MAX_TTL),
            seq: [s0, s1, s2],
            src: U16::new(src),
            dst: U16::new(dst),
        }
    }

    /// Parse from exactly [`NetworkHeader::SIZE`] leading bytes of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let head = bytes
            .get(..Self::SIZE)
            .ok_or(ProtocolError::Truncated { expected: Self::SIZE, actual: bytes.len() })?;
        Self::read_from_bytes(head)
            .map_err(|_| ProtocolError::Truncated { expected: Self::SIZE, actual: bytes.len() })
    }

    /// Encode to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(self.as_bytes());
        out
    }

    /// Least significant bit of the IV index used by the sender.
    pub fn ivi(&self) -> bool {
        self.ivi_nid & 0x80 != 0
    }

    /// 7-bit network key identifier.
    pub fn nid(&self) -> u8 {
        self.ivi_nid & 0x7F
    }

    /// Control message flag.
    pub fn ctl(&self) -> bool {
        self.ctl_ttl & 0x80 != 0
    }

    /// Time to live.
    pub fn ttl(&self) -> u8 {
        self.ctl_ttl & MAX_TTL
    }

    /// 24-bit sequence number.
    pub fn seq(&self) -> u32 {
        u32::from_be_bytes([0, self.seq[0], self.seq[1], self.seq[2]])
    }

    /// Source (always a unicast address).
    pub fn src(&self) -> u16 {
        self.src.get()
    }

    /// Destination.
    pub fn dst(&self) -> u16 {
        self.dst.get()
    }

    /// NetMIC length implied by the CTL bit.
    pub fn net_mic_len(&self) -> usize {
        if self.ctl() { CONTROL_NET_MIC } else { ACCESS_NET_MIC }
    }
}

/// TTL values 0 and 2..=127 may be used when sending; 1 is prohibited.
pub fn is_valid_ttl(ttl: u8) -> bool {
    ttl != 1 && ttl <= MAX_TTL
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    #[test]
    fn header_layout() {
        let header = NetworkHeader::new(false, 0x68, false, 4, 0x0000_0003, 0x1201, 0xFFFD);
        assert_eq!(header.to_bytes(), hex!("680400000312 01FFFD"));
        assert_eq!(NetworkHeader::from_bytes(&header.to_bytes()).unwrap(), header);
    }

    #[test]
    fn accessors() {
        let header = NetworkHeader::new(true, 0x7F, true, 0, 0x00AB_CDEF, 0x0001, 0x0002);
        assert!(header.ivi());
        assert!(header.ctl());
        assert_eq!(header.nid(), 0x7F);
        assert_eq!(header.ttl(), 0);
        assert_eq!(header.seq(), 0x00AB_CDEF);
        assert_eq!(header.src(), 0x0001);
        assert_eq!(header.dst(), 0x0002);
        assert_eq!(header.net_mic_len(), CONTROL_NET_MIC);
    }

    #[test]
    fn from_bytes_rejects_short_input() {
        assert!(matches!(
            NetworkHeader::from_bytes(&[0u8; 8]),
            Err(ProtocolError::Truncated { expected: 9, actual: 8 })
        ));
    }

    #[test]
    fn ttl_rules() {
        assert!(is_valid_ttl(0));
        assert!(!is_valid_ttl(1));
        assert!(is_valid_ttl(5));
        assert!(!is_valid_ttl(0x80));
    }
}
