//! Error types for the network model and the transport state machine.

use btmesh_crypto::CryptoError;
use btmesh_proto::{Opcode, ProtocolError};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    model::{KeyIndex, RangeKind},
    transport::TransactionId,
};

/// Validation failures of network model operations.
///
/// Every model operation either commits completely or returns one of these
/// with the model unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    /// A key with the same key material already exists.
    #[error("key material already used by key index {index}")]
    DuplicateKey {
        /// Index of the existing key
        index: KeyIndex,
    },

    /// A key with this index already exists.
    #[error("key index {0} already exists")]
    DuplicateKeyIndex(KeyIndex),

    /// The key is listed by a node other than the selected provisioner's.
    #[error("key index {0} is in use by a node")]
    KeyInUse(KeyIndex),

    /// The network key still has application keys bound to it.
    #[error("network key {net_key} is bound to application key {app_key}")]
    KeyBound {
        /// Network key index
        net_key: KeyIndex,
        /// First application key bound to it
        app_key: KeyIndex,
    },

    /// No key with this index.
    #[error("key index {0} not found")]
    KeyNotFound(KeyIndex),

    /// Key indexes are 12 bits.
    #[error("key index {0} out of range (max 4095)")]
    KeyIndexOutOfRange(u16),

    /// The operation needs another entity to exist first.
    #[error("missing prerequisite: {0}")]
    MissingPrerequisite(&'static str),

    /// Ranges overlap another provisioner's ranges of the same kind.
    #[error("{kind} range overlaps provisioner {other}")]
    RangeOverlap {
        /// Range kind that overlaps
        kind: RangeKind,
        /// Provisioner owning the overlapping range
        other: Uuid,
    },

    /// Range bounds are reversed or outside the legal domain.
    #[error("invalid {kind} range {low:04X}-{high:04X}")]
    InvalidRange {
        /// Range kind
        kind: RangeKind,
        /// Low bound
        low: u16,
        /// High bound
        high: u16,
    },

    /// Address is not valid where it is used.
    #[error("{kind} address {address:04X} out of range")]
    AddressOutOfRange {
        /// What the address was used as
        kind: &'static str,
        /// Offending address
        address: u16,
    },

    /// Address collides with a node element or a provisioner address.
    #[error("address {0:04X} already in use")]
    AddressInUse(u16),

    /// No free address (or scene number) left.
    #[error("no free {0} address left")]
    AddressSpaceExhausted(RangeKind),

    /// No provisioner with this UUID.
    #[error("provisioner {0} not found")]
    ProvisionerNotFound(Uuid),

    /// A provisioner with this UUID already exists.
    #[error("provisioner {0} already exists")]
    ProvisionerExists(Uuid),

    /// The node is a provisioner's own node; manage it through the provisioner.
    #[error("node {0} belongs to a provisioner")]
    ProvisionerNode(Uuid),

    /// The operation needs a selected provisioner.
    #[error("no provisioner selected")]
    NoProvisionerSelected,

    /// No node with this UUID.
    #[error("node {0} not found")]
    NodeNotFound(Uuid),

    /// No node element has this address.
    #[error("no node at address {0:04X}")]
    UnknownAddress(u16),

    /// A node with this UUID already exists.
    #[error("node {0} already exists")]
    NodeExists(Uuid),

    /// No group with this address.
    #[error("group {0:04X} not found")]
    GroupNotFound(u16),

    /// A group with this address already exists.
    #[error("group {0:04X} already exists")]
    GroupExists(u16),

    /// No scene with this number.
    #[error("scene {0:04X} not found")]
    SceneNotFound(u16),

    /// A scene with this number already exists.
    #[error("scene {0:04X} already exists")]
    SceneExists(u16),

    /// TTL 1 and values above 127 cannot be used.
    #[error("invalid TTL {0}")]
    InvalidTtl(u8),

    /// The IV index never decreases.
    #[error("IV index {requested} is below current {current}")]
    InvalidIvIndex {
        /// Current IV index
        current: u32,
        /// Requested IV index
        requested: u32,
    },

    /// The source ran out of 24-bit sequence numbers for this IV index.
    #[error("sequence numbers exhausted for {0:04X}")]
    SequenceExhausted(u16),

    /// JSON document is missing mandatory fields or is inconsistent.
    #[error("malformed document: {0}")]
    MalformedDocument(String),

    /// Binary snapshot could not be written or read.
    #[error("snapshot: {0}")]
    Snapshot(String),
}

/// Per-transaction failures and transport call errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No response after every retry.
    #[error("transaction timed out after {attempts} attempts")]
    TransactionTimeout {
        /// Transmissions made
        attempts: u32,
    },

    /// Cancelled locally (explicitly or on disconnect).
    #[error("transaction cancelled")]
    TransactionCancelled,

    /// The receiver answered a segmented message with an empty BlockAck.
    #[error("receiver rejected segmented message")]
    SegmentsRejected,

    /// The response carried a failure status.
    #[error("incompatible response {opcode}: status 0x{status:02x}")]
    IncompatibleResponse {
        /// Response opcode
        opcode: Opcode,
        /// Status code
        status: u8,
    },

    /// No transaction with this id.
    #[error("unknown transaction {0}")]
    UnknownTransaction(TransactionId),

    /// Operation not allowed in the transaction's current phase.
    #[error("invalid state for {operation} on transaction {transaction}")]
    InvalidState {
        /// Transaction
        transaction: TransactionId,
        /// Operation attempted
        operation: String,
    },

    /// Access payload does not fit 32 segments.
    #[error("message too long: {size} bytes (max {max})")]
    MessageTooLong {
        /// Upper transport PDU size
        size: usize,
        /// Maximum size
        max: usize,
    },

    /// Destination cannot be used with this message kind.
    #[error("invalid destination {0:04X}")]
    InvalidDestination(u16),

    /// No group with a label UUID for this virtual address.
    #[error("unknown virtual address {0:04X}")]
    UnknownVirtualAddress(u16),

    /// Configuration message for a node without a known device key.
    #[error("no device key for {0:04X}")]
    MissingDeviceKey(u16),

    /// Model lookup or sequence allocation failed.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Wire encoding failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Encryption failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// The bearer reported a send failure.
    #[error("bearer: {0}")]
    Bearer(String),
}

impl TransportError {
    /// True if sending a fresh transaction may succeed.
    ///
    /// Timeouts, cancellations and bearer failures are transient; everything
    /// else is a property of the message or the model and will fail again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransactionTimeout { .. }
                | Self::TransactionCancelled
                | Self::SegmentsRejected
                | Self::Bearer(_)
        )
    }
}
