//! Per-message transaction records.

use std::{fmt, time::Instant};

use btmesh_crypto::{Key, NetworkKeyMaterial};
use uuid::Uuid;

use super::{
    AccessMessage,
    message::{MeshMessage, MessageState},
};
use crate::{error::TransportError, model::KeyIndex};

/// Identifies one transaction of a [`super::MeshTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub(crate) u64);

impl TransactionId {
    /// Raw value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a transaction.
///
/// ```text
/// Sending ──> AwaitingSegmentAck ──> AwaitingResponse ──> Complete
///    │               │                     │
///    └───────────────┴─────────────────────┴──────────> Failed
/// ```
///
/// Unacknowledged messages complete once sent (or, when segmented to a
/// unicast address, once every segment is acknowledged). `Complete` and
/// `Failed` are terminal: a terminal transaction has no deadline and never
/// changes again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionPhase {
    /// PDUs handed to the bearer, completion not yet reported. Fails after
    /// [`TransportConfig::send_timeout`](super::TransportConfig::send_timeout)
    /// if the bearer never reports.
    Sending,
    /// Segments sent, waiting for the receiver's Segment Acknowledgment
    AwaitingSegmentAck,
    /// Message delivered, waiting for the response
    AwaitingResponse,
    /// Done
    Complete,
    /// Gave up
    Failed(TransportError),
}

impl TransactionPhase {
    /// True for `Complete` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed(_))
    }
}

/// Key protecting the access payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AccessKey {
    Application { index: KeyIndex, key: Key, aid: u8 },
    Device { key: Key },
}

impl AccessKey {
    pub(crate) fn key(&self) -> &Key {
        match self {
            Self::Application { key, .. } | Self::Device { key } => key,
        }
    }

    /// AKF and AID of the lower transport header.
    pub(crate) fn akf_aid(&self) -> (bool, u8) {
        match self {
            Self::Application { aid, .. } => (true, *aid),
            Self::Device { .. } => (false, 0),
        }
    }
}

/// Keys resolved from the model when the message was sent.
///
/// Retransmissions reuse these, so a key edited or removed in the model
/// after sending does not change an in-flight message.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedKeys {
    pub net_key: KeyIndex,
    pub network: NetworkKeyMaterial,
    pub access: AccessKey,
    pub label: Option<Uuid>,
    pub ttl: u8,
}

/// Segments of the current attempt.
#[derive(Debug, Clone)]
pub(crate) struct OutgoingSegments {
    pub seq_zero: u16,
    pub lower: Vec<Vec<u8>>,
    pub acked: u32,
    pub retries_left: u32,
}

/// One message in flight.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub(crate) id: TransactionId,
    pub(crate) message: MeshMessage,
    pub(crate) src: u16,
    pub(crate) dst: u16,
    pub(crate) phase: TransactionPhase,
    pub(crate) keys: ResolvedKeys,
    pub(crate) attempts: u32,
    pub(crate) seq_auth: u32,
    pub(crate) segments: Option<OutgoingSegments>,
    pub(crate) deadline: Option<Instant>,
    pub(crate) started_at: Instant,
    pub(crate) response: Option<AccessMessage>,
}

impl Transaction {
    /// Transaction id.
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Kind marker of the message.
    pub fn state(&self) -> MessageState {
        self.message.state()
    }

    /// Current phase.
    pub fn phase(&self) -> &TransactionPhase {
        &self.phase
    }

    /// The message.
    pub fn message(&self) -> &MeshMessage {
        &self.message
    }

    /// Source element address.
    pub fn src(&self) -> u16 {
        self.src
    }

    /// Destination address.
    pub fn dst(&self) -> u16 {
        self.dst
    }

    /// Network key protecting the message.
    pub fn net_key(&self) -> KeyIndex {
        self.keys.net_key
    }

    /// Transmissions of the whole message so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// SeqAuth of the latest attempt.
    pub fn seq_auth(&self) -> u32 {
        self.seq_auth
    }

    /// Pending timer, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// When the transaction was created.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// The response that completed the transaction.
    pub fn response(&self) -> Option<&AccessMessage> {
        self.response.as_ref()
    }

    pub(crate) fn is_segmented(&self) -> bool {
        self.segments.is_some()
    }

    pub(crate) fn fail(&mut self, error: TransportError) {
        self.phase = TransactionPhase::Failed(error);
        self.deadline = None;
    }

    pub(crate) fn complete(&mut self, response: Option<AccessMessage>) {
        self.phase = TransactionPhase::Complete;
        self.deadline = None;
        self.response = response;
    }
}
