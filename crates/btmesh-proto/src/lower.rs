//! Lower transport PDU headers.
//!
//! The first octet of every lower transport PDU carries the SEG bit. For
//! access messages (CTL = 0) the remaining bits are AKF and the 6-bit AID;
//! for control messages (CTL = 1) they are the 7-bit control opcode.
//! Segmented PDUs follow that octet with a 3-octet segment header:
//!
//! ```text
//! SZMIC/RFU (1) | SeqZero (13) | SegO (5) | SegN (5)
//! ```

use crate::errors::{ProtocolError, Result};

/// Largest upper transport PDU that fits an unsegmented access message.
pub const MAX_UNSEGMENTED_ACCESS_PDU: usize = 15;
/// Upper transport bytes carried by one access segment.
pub const SEGMENT_ACCESS_PAYLOAD: usize = 12;
/// Upper transport bytes carried by one control segment.
pub const SEGMENT_CONTROL_PAYLOAD: usize = 8;
/// A segmented message has at most 32 segments.
pub const MAX_SEGMENTS: usize = 32;
/// Control opcode of the Segment Acknowledgment message.
pub const SEGMENT_ACK_OPCODE: u8 = 0x00;

const SEQ_ZERO_MASK: u16 = 0x1FFF;

/// The 3-octet header that follows the first octet of a segmented PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Size of the TransMIC: `false` = 32 bit, `true` = 64 bit (RFU for control)
    pub szmic: bool,
    /// Low 13 bits of the SeqAuth
    pub seq_zero: u16,
    /// Zero based index of this segment
    pub seg_o: u8,
    /// Index of the last segment
    pub seg_n: u8,
}

impl SegmentHeader {
    /// Encoded size.
    pub const SIZE: usize = 3;

    /// Encode into three octets.
    pub fn encode(&self) -> [u8; 3] {
        let value = (u32::from(self.szmic) << 23)
            | (u32::from(self.seq_zero & SEQ_ZERO_MASK) << 10)
            | (u32::from(self.seg_o & 0x1F) << 5)
            | u32::from(self.seg_n & 0x1F);
        let [_, a, b, c] = value.to_be_bytes();
        [a, b, c]
    }

    /// Decode from the first three octets of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(ProtocolError::Truncated { expected: Self::SIZE, actual: bytes.len() });
        }
        let value = u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]);
        let header = Self {
            szmic: value & (1 << 23) != 0,
            seq_zero: ((value >> 10) as u16) & SEQ_ZERO_MASK,
            seg_o: ((value >> 5) & 0x1F) as u8,
            seg_n: (value & 0x1F) as u8,
        };
        if header.seg_o > header.seg_n {
            return Err(ProtocolError::InvalidSegment { seg_o: header.seg_o, seg_n: header.seg_n });
        }
        Ok(header)
    }

    /// Number of segments in the message.
    pub fn segment_count(&self) -> usize {
        usize::from(self.seg_n) + 1
    }
}

/// Decoded first octet (and segment header, if any) of a lower transport PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerHeader {
    /// Unsegmented access message
    UnsegmentedAccess {
        /// Application key flag
        akf: bool,
        /// Application key identifier (6 bits)
        aid: u8,
    },
    /// One segment of a segmented access message
    SegmentedAccess {
        /// Application key flag
        akf: bool,
        /// Application key identifier (6 bits)
        aid: u8,
        /// Segment header
        segment: SegmentHeader,
    },
    /// Unsegmented control message
    UnsegmentedControl {
        /// 7-bit control opcode
        opcode: u8,
    },
    /// One segment of a segmented control message
    SegmentedControl {
        /// 7-bit control opcode
        opcode: u8,
        /// Segment header
        segment: SegmentHeader,
    },
}

impl LowerHeader {
    /// Split a lower transport PDU into its header and payload.
    pub fn decode(ctl: bool, pdu: &[u8]) -> Result<(Self, &[u8])> {
        let first = *pdu.first().ok_or(ProtocolError::Truncated { expected: 1, actual: 0 })?;
        let seg = first & 0x80 != 0;
        let rest = &pdu[1..];
        let header = match (ctl, seg) {
            (false, false) => {
                return Ok((
                    Self::UnsegmentedAccess { akf: first & 0x40 != 0, aid: first & 0x3F },
                    rest,
                ));
            },
            (true, false) => return Ok((Self::UnsegmentedControl { opcode: first & 0x7F }, rest)),
            (false, true) => Self::SegmentedAccess {
                akf: first & 0x40 != 0,
                aid: first & 0x3F,
                segment: SegmentHeader::decode(rest)?,
            },
            (true, true) => Self::SegmentedControl {
                opcode: first & 0x7F,
                segment: SegmentHeader::decode(rest)?,
            },
        };
        Ok((header, &rest[SegmentHeader::SIZE..]))
    }

    /// Append the encoded header to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match *self {
            Self::UnsegmentedAccess { akf, aid } => out.push((u8::from(akf) << 6) | (aid & 0x3F)),
            Self::SegmentedAccess { akf, aid, segment } => {
                out.push(0x80 | (u8::from(akf) << 6) | (aid & 0x3F));
                out.extend_from_slice(&segment.encode());
            },
            Self::UnsegmentedControl { opcode } => out.push(opcode & 0x7F),
            Self::SegmentedControl { opcode, segment } => {
                out.push(0x80 | (opcode & 0x7F));
                out.extend_from_slice(&segment.encode());
            },
        }
    }

    /// Segment header, for segmented PDUs.
    pub fn segment(&self) -> Option<SegmentHeader> {
        match self {
            Self::SegmentedAccess { segment, .. } | Self::SegmentedControl { segment, .. } => {
                Some(*segment)
            },
            _ => None,
        }
    }
}

/// Segment Acknowledgment control message parameters.
///
/// ```text
/// OBO (1) | SeqZero (13) | RFU (2) | BlockAck (32)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentAck {
    /// Set when a friend node acknowledges on behalf of a low power node
    pub obo: bool,
    /// SeqZero of the message being acknowledged
    pub seq_zero: u16,
    /// Bit `n` set means segment `n` was received
    pub block_ack: u32,
}

impl SegmentAck {
    /// Encoded parameter size.
    pub const SIZE: usize = 6;

    /// Encode the parameters (without the control opcode octet).
    pub fn encode(&self) -> [u8; 6] {
        let head = (u16::from(self.obo) << 15) | ((self.seq_zero & SEQ_ZERO_MASK) << 2);
        let [h0, h1] = head.to_be_bytes();
        let [b0, b1, b2, b3] = self.block_ack.to_be_bytes();
        [h0, h1, b0, b1, b2, b3]
    }

    /// Decode the parameters (without the control opcode octet).
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(ProtocolError::Truncated { expected: Self::SIZE, actual: bytes.len() });
        }
        let head = u16::from_be_bytes([bytes[0], bytes[1]]);
        Ok(Self {
            obo: head & 0x8000 != 0,
            seq_zero: (head >> 2) & SEQ_ZERO_MASK,
            block_ack: u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
        })
    }

    /// True if segment `seg_o` is acknowledged.
    pub fn is_acked(&self, seg_o: u8) -> bool {
        seg_o < 32 && self.block_ack & (1 << seg_o) != 0
    }
}

/// Bit mask with the lowest `count` bits set, i.e. the BlockAck of a fully
/// received message with `count` segments.
pub fn full_block_mask(count: usize) -> u32 {
    if count >= 32 { u32::MAX } else { (1u32 << count) - 1 }
}
