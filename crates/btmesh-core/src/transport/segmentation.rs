//! Lower transport segmentation and reassembly.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use btmesh_proto::{
    LowerHeader, SegmentHeader, full_block_mask,
    lower::{MAX_SEGMENTS, MAX_UNSEGMENTED_ACCESS_PDU, SEGMENT_ACCESS_PAYLOAD},
};
use tracing::{debug, trace};

use crate::error::TransportError;

const SEQ_ZERO_MASK: u32 = 0x1FFF;

/// Largest upper transport PDU (access payload plus TransMIC).
pub const MAX_UPPER_PDU: usize = MAX_SEGMENTS * SEGMENT_ACCESS_PAYLOAD;

/// How an access payload of a given size is framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Framing {
    /// Number of lower PDUs; 1 and `segmented == false` for unsegmented
    pub count: usize,
    /// Segmented framing
    pub segmented: bool,
    /// 64-bit TransMIC
    pub szmic: bool,
}

impl Framing {
    /// Pick the framing for `access_len` bytes of access payload.
    ///
    /// Short messages go unsegmented with a 32-bit TransMIC. Segmented
    /// messages use the 64-bit TransMIC whenever it costs no extra segment.
    pub(crate) fn for_access(access_len: usize) -> Result<Self, TransportError> {
        if access_len + 4 <= MAX_UNSEGMENTED_ACCESS_PDU {
            return Ok(Self { count: 1, segmented: false, szmic: false });
        }
        let short = (access_len + 4).div_ceil(SEGMENT_ACCESS_PAYLOAD);
        let long = (access_len + 8).div_ceil(SEGMENT_ACCESS_PAYLOAD);
        if short > MAX_SEGMENTS {
            return Err(TransportError::MessageTooLong {
                size: access_len,
                max: MAX_UPPER_PDU - 4,
            });
        }
        let szmic = long == short;
        Ok(Self { count: short, segmented: true, szmic })
    }
}

/// Low 13 bits of a SeqAuth.
pub(crate) fn seq_zero(seq_auth: u32) -> u16 {
    (seq_auth & SEQ_ZERO_MASK) as u16
}

/// Recover the SeqAuth of a segment from its own SEQ and its SeqZero.
pub(crate) fn seq_auth(seq: u32, seq_zero: u16) -> u32 {
    let delta = (seq & SEQ_ZERO_MASK).wrapping_sub(u32::from(seq_zero)) & SEQ_ZERO_MASK;
    seq.wrapping_sub(delta)
}

/// Split an upper transport PDU into lower transport PDUs.
pub(crate) fn lower_pdus(
    akf: bool,
    aid: u8,
    framing: Framing,
    seq_zero: u16,
    upper: &[u8],
) -> Vec<Vec<u8>> {
    if !framing.segmented {
        let mut pdu = Vec::with_capacity(1 + upper.len());
        LowerHeader::UnsegmentedAccess { akf, aid }.encode(&mut pdu);
        pdu.extend_from_slice(upper);
        return vec![pdu];
    }

    let seg_n = (framing.count - 1) as u8;
    upper
        .chunks(SEGMENT_ACCESS_PAYLOAD)
        .enumerate()
        .map(|(offset, chunk)| {
            let segment =
                SegmentHeader { szmic: framing.szmic, seq_zero, seg_o: offset as u8, seg_n };
            let mut pdu = Vec::with_capacity(4 + chunk.len());
            LowerHeader::SegmentedAccess { akf, aid, segment }.encode(&mut pdu);
            pdu.extend_from_slice(chunk);
            pdu
        })
        .collect()
}

/// Key of an incoming segmented message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MessageKey {
    src: u16,
    seq_zero: u16,
}

/// A segmented message being received.
#[derive(Debug)]
struct Incoming {
    seq_auth: u32,
    dst: u16,
    akf: bool,
    aid: u8,
    szmic: bool,
    segments: Vec<Option<Vec<u8>>>,
    received: u32,
    net_key: u16,
    iv_index: u32,
    expires_at: Instant,
    ack_at: Option<Instant>,
}

impl Incoming {
    fn new(context: SegmentContext, segment: SegmentHeader, seq_auth: u32, expires_at: Instant) -> Self {
        Self {
            seq_auth,
            dst: context.dst,
            akf: context.akf,
            aid: context.aid,
            szmic: segment.szmic,
            segments: vec![None; segment.segment_count()],
            received: 0,
            net_key: context.net_key,
            iv_index: context.iv_index,
            expires_at,
            ack_at: None,
        }
    }
}

/// An upper transport PDU with the context needed to decrypt it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UpperPdu {
    pub src: u16,
    pub dst: u16,
    pub seq_auth: u32,
    pub akf: bool,
    pub aid: u8,
    pub szmic: bool,
    pub net_key: u16,
    pub iv_index: u32,
    pub upper: Vec<u8>,
}

/// A Segment Acknowledgment the receiver owes a sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingAck {
    pub src: u16,
    pub dst: u16,
    pub seq_zero: u16,
    pub block_ack: u32,
    pub net_key: u16,
}

/// Outcome of feeding one segment to the reassembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SegmentOutcome {
    /// More segments needed
    Incomplete,
    /// All segments arrived; acknowledge with a full BlockAck
    Complete(UpperPdu, Option<PendingAck>),
    /// Segment of a message that was already delivered; acknowledge again
    Duplicate(Option<PendingAck>),
}

/// Context of one received segment.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SegmentContext {
    pub src: u16,
    pub dst: u16,
    pub seq: u32,
    pub akf: bool,
    pub aid: u8,
    pub net_key: u16,
    pub iv_index: u32,
    /// Acknowledge this message (unicast destination)
    pub acknowledge: bool,
}

/// Reassembles incoming segmented access messages.
///
/// Keeps one partial message per `(SRC, SeqZero)` and, per source, the last
/// completed SeqAuth so that late retransmissions are acknowledged again
/// instead of delivered twice. A completed record is dropped once a partial
/// message would have expired.
#[derive(Debug, Default)]
pub(crate) struct Reassembler {
    incoming: HashMap<MessageKey, Incoming>,
    completed: HashMap<u16, Completed>,
}

#[derive(Debug, Clone, Copy)]
struct Completed {
    seq_auth: u32,
    block_ack: u32,
    expires_at: Instant,
}

impl Reassembler {
    pub(crate) fn push(
        &mut self,
        context: SegmentContext,
        segment: SegmentHeader,
        payload: &[u8],
        now: Instant,
        incomplete_timeout: Duration,
        ack_delay: Duration,
    ) -> SegmentOutcome {
        let seq_auth = seq_auth(context.seq, segment.seq_zero);
        let ack = |block_ack| {
            context.acknowledge.then_some(PendingAck {
                src: context.dst,
                dst: context.src,
                seq_zero: segment.seq_zero,
                block_ack,
                net_key: context.net_key,
            })
        };

        if let Some(done) = self.completed.get(&context.src) {
            if seq_auth == done.seq_auth {
                trace!(src = context.src, seq_auth, "segment of completed message");
                return SegmentOutcome::Duplicate(ack(done.block_ack));
            }
            if seq_auth < done.seq_auth {
                return SegmentOutcome::Duplicate(None);
            }
        }

        let key = MessageKey { src: context.src, seq_zero: segment.seq_zero };
        let fresh = || Incoming::new(context, segment, seq_auth, now + incomplete_timeout);
        let entry = self.incoming.entry(key).or_insert_with(fresh);
        if entry.seq_auth != seq_auth || entry.segments.len() != segment.segment_count() {
            // Same SeqZero from a newer message: start over.
            *entry = fresh();
        }

        let offset = usize::from(segment.seg_o);
        if entry.segments[offset].is_none() {
            entry.segments[offset] = Some(payload.to_vec());
            entry.received |= 1 << segment.seg_o;
        }
        entry.expires_at = now + incomplete_timeout;
        if context.acknowledge && entry.ack_at.is_none() {
            entry.ack_at = Some(now + ack_delay);
        }

        let full = full_block_mask(entry.segments.len());
        if entry.received != full {
            return SegmentOutcome::Incomplete;
        }

        let Some(entry) = self.incoming.remove(&key) else {
            return SegmentOutcome::Incomplete;
        };
        self.completed.insert(
            context.src,
            Completed { seq_auth, block_ack: full, expires_at: now + incomplete_timeout },
        );
        let upper: Vec<u8> = entry.segments.into_iter().flatten().flatten().collect();
        debug!(src = context.src, seq_auth, len = upper.len(), "segmented message reassembled");
        SegmentOutcome::Complete(
            UpperPdu {
                src: context.src,
                dst: entry.dst,
                seq_auth,
                akf: entry.akf,
                aid: entry.aid,
                szmic: entry.szmic,
                net_key: entry.net_key,
                iv_index: entry.iv_index,
                upper,
            },
            ack(full),
        )
    }

    /// Drop expired partial messages and completed records, and collect
    /// acknowledgments that are due.
    pub(crate) fn poll(&mut self, now: Instant) -> Vec<PendingAck> {
        self.completed.retain(|_, done| done.expires_at > now);
        self.incoming.retain(|key, entry| {
            let keep = entry.expires_at > now;
            if !keep {
                debug!(src = key.src, seq_auth = entry.seq_auth, "incomplete message dropped");
            }
            keep
        });

        let mut acks = Vec::new();
        for (key, entry) in &mut self.incoming {
            if entry.ack_at.is_some_and(|at| at <= now) {
                entry.ack_at = None;
                acks.push(PendingAck {
                    src: entry.dst,
                    dst: key.src,
                    seq_zero: key.seq_zero,
                    block_ack: entry.received,
                    net_key: entry.net_key,
                });
            }
        }
        acks
    }

    /// Earliest timer of any partial message.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.incoming
            .values()
            .flat_map(|entry| [Some(entry.expires_at), entry.ack_at])
            .flatten()
            .min()
    }

    /// Number of partial messages.
    pub(crate) fn pending(&self) -> usize {
        self.incoming.len()
    }
}
