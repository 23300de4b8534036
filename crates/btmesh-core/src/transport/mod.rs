//! Message transport state machine.
//!
//! [`MeshTransport`] turns [`MeshMessage`]s into encrypted network PDUs and
//! follows each one as a [`Transaction`] until it completes or fails.
//!
//! # Architecture: Action-Based State Machine
//!
//! Like the network model, the transport performs no I/O and reads no clock:
//!
//! - every method that depends on time takes `now`
//! - every method returns [`TransportAction`]s for the runtime to execute
//! - the runtime reports bearer completions with
//!   [`MeshTransport::handle_send_complete`], hands inbound PDUs to
//!   [`MeshTransport::handle_pdu`] and calls [`MeshTransport::tick`] at
//!   [`MeshTransport::next_deadline`]
//!
//! Timers are deadlines stored on the transactions themselves. Cancelling or
//! finishing a transaction clears its deadline in the same call, so a timer
//! can never fire for a transaction that already ended.
//!
//! # Sending
//!
//! ```text
//! access   opcode || parameters
//! upper    AES-CCM(app key or device key, application/device nonce)
//! lower    unsegmented (upper <= 15 bytes) or 12-byte segments
//! network  AES-CCM(encryption key, network nonce), header obfuscated
//! ```
//!
//! Every lower PDU gets its own sequence number from the model. Segmented
//! messages to a unicast address wait for the receiver's Segment
//! Acknowledgment; missing segments are resent with new sequence numbers.
//! A message-level retry re-encrypts the whole message under a new SeqAuth.

mod message;
mod pdu;
mod segmentation;
mod transaction;

use std::{
    collections::{BTreeMap, HashMap},
    time::{Duration, Instant},
};

use btmesh_crypto::{NetworkKeyMaterial, NetworkNonceKind, aid, decrypt_network_pdu};
use btmesh_proto::{
    LowerHeader, NetworkHeader, Opcode, ProxyConfigMessage, SegmentAck, UNASSIGNED_ADDRESS,
    address::{is_unicast, is_virtual},
    full_block_mask,
    lower::SEGMENT_ACK_OPCODE,
};
use bytes::Bytes;
pub use message::{
    ExpectedResponse, MeshMessage, MessageKind, MessageState, pack_key_indexes,
    unpack_key_indexes,
};
use segmentation::{
    Framing, PendingAck, Reassembler, SegmentContext, SegmentOutcome, UpperPdu, lower_pdus,
    seq_zero,
};
pub use segmentation::MAX_UPPER_PDU;
use tracing::{debug, trace, warn};
pub use transaction::{Transaction, TransactionId, TransactionPhase};
use transaction::{AccessKey, OutgoingSegments, ResolvedKeys};

use crate::{
    error::{ModelError, TransportError},
    model::{KeyIndex, KeyRefreshPhase, MeshNetwork},
};

/// How the pause before a message-level retry grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Every retry waits `initial_timeout`
    Fixed,
    /// Each retry waits `multiplier` times longer than the previous one, up
    /// to `max`
    Exponential {
        /// Growth factor
        multiplier: u32,
        /// Upper bound
        max: Duration,
    },
}

/// Retry policy for acknowledged messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retransmissions after the first attempt
    pub max_retries: u32,
    /// Response timeout of the first attempt
    pub initial_timeout: Duration,
    /// Growth of later timeouts
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Response timeout of attempt number `attempt` (starting at 1).
    pub fn timeout(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.initial_timeout,
            Backoff::Exponential { multiplier, max } => {
                let factor = multiplier.saturating_pow(attempt.saturating_sub(1));
                self.initial_timeout.saturating_mul(factor).min(max)
            },
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_timeout: Duration::from_secs(4),
            backoff: Backoff::Exponential { multiplier: 2, max: Duration::from_secs(16) },
        }
    }
}

/// Transport configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// TTL for outgoing messages when no provisioner TTL applies
    pub default_ttl: u8,
    /// Message-level retries of acknowledged messages
    pub retry: RetryPolicy,
    /// Retransmissions of missing segments before the attempt counts as lost
    pub segment_retries: u32,
    /// Wait for a Segment Acknowledgment
    pub segment_ack_timeout: Duration,
    /// Delay before acknowledging a partially received message
    pub ack_delay: Duration,
    /// Partial incoming messages are dropped after this much silence
    pub incomplete_timeout: Duration,
    /// A transmission the bearer never reports on fails after this long
    pub send_timeout: Duration,
    /// Sources tracked for replay protection; PDUs from further sources are
    /// dropped
    pub replay_capacity: usize,
    /// Terminal transactions not forgotten by the caller are dropped this
    /// long after they started
    pub terminal_retention: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            default_ttl: 5,
            retry: RetryPolicy::default(),
            segment_retries: 2,
            segment_ack_timeout: Duration::from_millis(500),
            ack_delay: Duration::from_millis(150),
            incomplete_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(10),
            replay_capacity: 1024,
            terminal_retention: Duration::from_secs(300),
        }
    }
}

/// A decrypted access message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessMessage {
    /// Source element
    pub src: u16,
    /// Destination address
    pub dst: u16,
    /// Opcode
    pub opcode: Opcode,
    /// Parameters
    pub parameters: Bytes,
    /// Application key that decrypted it; `None` for device key messages
    pub app_key: Option<KeyIndex>,
    /// Network key it arrived on
    pub net_key: KeyIndex,
}

/// Work for the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportAction {
    /// Hand these network PDUs to the bearer, in order. For transaction PDUs
    /// the runtime reports exactly one
    /// [`MeshTransport::handle_send_complete`] per `Transmit`.
    Transmit {
        /// Owning transaction; `None` for Segment Acknowledgments
        transaction: Option<TransactionId>,
        /// Network PDUs
        pdus: Vec<Bytes>,
        /// Mesh destination
        destination: u16,
    },
    /// The transaction finished.
    Completed {
        /// Transaction
        transaction: TransactionId,
        /// Response of an acknowledged message
        response: Option<AccessMessage>,
    },
    /// The transaction failed. Reported once per transaction.
    Failed {
        /// Transaction
        transaction: TransactionId,
        /// Reason
        error: TransportError,
    },
    /// An inbound message no transaction was waiting for.
    Received(AccessMessage),
}

/// The transport state machine of one local node.
#[derive(Debug)]
pub struct MeshTransport {
    config: TransportConfig,
    primary_address: u16,
    element_count: u8,
    next_id: u64,
    transactions: BTreeMap<TransactionId, Transaction>,
    /// Last (IV index, SEQ) seen per source
    replay: HashMap<u16, (u32, u32)>,
    reassembler: Reassembler,
}

impl MeshTransport {
    /// Transport for the local node whose elements start at
    /// `primary_address`.
    pub fn new(config: TransportConfig, primary_address: u16, element_count: u8) -> Self {
        Self {
            config,
            primary_address,
            element_count: element_count.max(1),
            next_id: 0,
            transactions: BTreeMap::new(),
            replay: HashMap::new(),
            reassembler: Reassembler::default(),
        }
    }

    /// Configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Address of the local primary element.
    pub fn primary_address(&self) -> u16 {
        self.primary_address
    }

    /// True if `address` is one of the local elements.
    pub fn is_local(&self, address: u16) -> bool {
        address >= self.primary_address
            && u32::from(address) < u32::from(self.primary_address) + u32::from(self.element_count)
    }

    /// Look up a transaction.
    pub fn transaction(&self, id: TransactionId) -> Option<&Transaction> {
        self.transactions.get(&id)
    }

    /// Every transaction not yet forgotten, oldest first.
    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.values()
    }

    /// Number of transactions still in progress.
    pub fn active(&self) -> usize {
        self.transactions.values().filter(|tx| !tx.phase.is_terminal()).count()
    }

    /// Number of partially received segmented messages.
    pub fn incomplete_messages(&self) -> usize {
        self.reassembler.pending()
    }

    /// Drop the record of a transaction. Terminal transactions are kept until
    /// forgotten, or until [`TransportConfig::terminal_retention`] has passed,
    /// so callers can inspect the outcome.
    pub fn forget(&mut self, id: TransactionId) -> Option<Transaction> {
        self.transactions.remove(&id)
    }

    /// Start a transaction for `message` from local element `src` to `dst`.
    ///
    /// Keys are resolved and sequence numbers allocated here, so validation
    /// errors (unknown key, missing device key, oversized message) are
    /// returned directly and no transaction is created.
    pub fn send(
        &mut self,
        network: &mut MeshNetwork,
        src: u16,
        dst: u16,
        message: MeshMessage,
        now: Instant,
    ) -> Result<(TransactionId, Vec<TransportAction>), TransportError> {
        if !self.is_local(src) {
            return Err(ModelError::AddressOutOfRange { kind: "source", address: src }.into());
        }
        if dst == UNASSIGNED_ADDRESS {
            return Err(TransportError::InvalidDestination(dst));
        }
        if matches!(message.kind(), MessageKind::Configuration { .. }) && !is_unicast(dst) {
            return Err(TransportError::InvalidDestination(dst));
        }
        Framing::for_access(message.access_pdu().len())?;

        let keys = self.resolve_keys(network, src, dst, &message)?;
        let id = TransactionId(self.next_id);
        let mut tx = Transaction {
            id,
            message,
            src,
            dst,
            phase: TransactionPhase::Sending,
            keys,
            attempts: 0,
            seq_auth: 0,
            segments: None,
            deadline: None,
            started_at: now,
            response: None,
        };
        let pdus = encode_attempt(network, &mut tx, self.config.segment_retries)?;
        tx.deadline = Some(now + self.config.send_timeout);
        self.next_id += 1;

        debug!(
            transaction = %id,
            src,
            dst,
            opcode = %tx.message.opcode(),
            state = ?tx.state(),
            pdus = pdus.len(),
            "transaction started"
        );
        self.transactions.insert(id, tx);
        Ok((id, vec![TransportAction::Transmit { transaction: Some(id), pdus, destination: dst }]))
    }

    /// Send the message of a failed transaction again as a new transaction.
    /// The failed transaction is left as it is.
    pub fn resend(
        &mut self,
        network: &mut MeshNetwork,
        id: TransactionId,
        now: Instant,
    ) -> Result<(TransactionId, Vec<TransportAction>), TransportError> {
        let tx = self.transactions.get(&id).ok_or(TransportError::UnknownTransaction(id))?;
        if !matches!(tx.phase, TransactionPhase::Failed(_)) {
            return Err(TransportError::InvalidState {
                transaction: id,
                operation: "resend".to_owned(),
            });
        }
        let (src, dst, message) = (tx.src, tx.dst, tx.message.clone());
        self.send(network, src, dst, message, now)
    }

    /// The bearer finished (or failed) one `Transmit` of transaction `id`.
    pub fn handle_send_complete(
        &mut self,
        id: TransactionId,
        result: Result<(), String>,
        now: Instant,
    ) -> Result<Vec<TransportAction>, TransportError> {
        let tx = self.transactions.get_mut(&id).ok_or(TransportError::UnknownTransaction(id))?;
        if tx.phase.is_terminal() {
            return Ok(Vec::new());
        }
        if let Err(reason) = result {
            warn!(transaction = %id, %reason, "bearer send failed");
            let error = TransportError::Bearer(reason);
            tx.fail(error.clone());
            return Ok(vec![TransportAction::Failed { transaction: id, error }]);
        }
        if tx.phase != TransactionPhase::Sending {
            return Ok(Vec::new());
        }

        if tx.is_segmented() && is_unicast(tx.dst) {
            tx.phase = TransactionPhase::AwaitingSegmentAck;
            tx.deadline = Some(now + self.config.segment_ack_timeout);
        } else if tx.message.is_acknowledged() {
            tx.phase = TransactionPhase::AwaitingResponse;
            tx.deadline = Some(now + self.config.retry.timeout(tx.attempts));
        } else {
            tx.complete(None);
            debug!(transaction = %id, "transaction complete");
            return Ok(vec![TransportAction::Completed { transaction: id, response: None }]);
        }
        trace!(transaction = %id, phase = ?tx.phase, "transaction sent");
        Ok(Vec::new())
    }

    /// Process one inbound network PDU.
    ///
    /// PDUs that do not decrypt, are not addressed to this node, or are
    /// replayed are dropped without error.
    pub fn handle_pdu(
        &mut self,
        network: &mut MeshNetwork,
        pdu: &[u8],
        now: Instant,
    ) -> Result<Vec<TransportAction>, TransportError> {
        let Some((net_key, header, lower, iv_index)) = open_network(network, pdu) else {
            trace!(len = pdu.len(), "network PDU dropped: no matching key");
            return Ok(Vec::new());
        };
        let (src, dst, seq) = (header.src(), header.dst(), header.seq());
        if self.is_local(src) || !self.accepts(dst) {
            trace!(src, dst, "network PDU not for this node");
            return Ok(Vec::new());
        }
        if !self.replay.contains_key(&src) && self.replay.len() >= self.config.replay_capacity {
            let capacity = self.config.replay_capacity;
            warn!(src, capacity, "replay list full, network PDU dropped");
            return Ok(Vec::new());
        }
        if !self.check_replay(src, iv_index, seq) {
            warn!(src, seq, iv_index, "replayed network PDU dropped");
            return Ok(Vec::new());
        }

        let (lower_header, payload) = match LowerHeader::decode(header.ctl(), &lower) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(src, %err, "malformed lower transport PDU dropped");
                return Ok(Vec::new());
            },
        };
        trace!(src, dst, seq, header = ?lower_header, "network PDU received");

        match lower_header {
            LowerHeader::UnsegmentedControl { opcode: SEGMENT_ACK_OPCODE } => {
                self.handle_segment_ack(network, src, payload, now)
            },
            LowerHeader::UnsegmentedControl { opcode }
            | LowerHeader::SegmentedControl { opcode, .. } => {
                trace!(src, opcode, "control message ignored");
                Ok(Vec::new())
            },
            LowerHeader::UnsegmentedAccess { akf, aid } => {
                let upper = UpperPdu {
                    src,
                    dst,
                    seq_auth: seq,
                    akf,
                    aid,
                    szmic: false,
                    net_key,
                    iv_index,
                    upper: payload.to_vec(),
                };
                Ok(self.deliver(network, &upper))
            },
            LowerHeader::SegmentedAccess { akf, aid, segment } => {
                let context = SegmentContext {
                    src,
                    dst,
                    seq,
                    akf,
                    aid,
                    net_key,
                    iv_index,
                    acknowledge: is_unicast(dst),
                };
                let outcome = self.reassembler.push(
                    context,
                    segment,
                    payload,
                    now,
                    self.config.incomplete_timeout,
                    self.config.ack_delay,
                );
                let mut actions = Vec::new();
                match outcome {
                    SegmentOutcome::Incomplete => {},
                    SegmentOutcome::Duplicate(ack) => {
                        if let Some(ack) = ack {
                            actions.push(encode_segment_ack(network, &self.config, ack)?);
                        }
                    },
                    SegmentOutcome::Complete(upper, ack) => {
                        if let Some(ack) = ack {
                            actions.push(encode_segment_ack(network, &self.config, ack)?);
                        }
                        actions.extend(self.deliver(network, &upper));
                    },
                }
                Ok(actions)
            },
        }
    }

    /// Fire every timer due at `now`: segment retransmissions, message-level
    /// retries, timeouts and owed Segment Acknowledgments.
    pub fn tick(&mut self, network: &mut MeshNetwork, now: Instant) -> Vec<TransportAction> {
        // PDUs from an IV index before the previous one are never accepted.
        let oldest_iv = network.iv_index().index.saturating_sub(1);
        self.replay.retain(|_, &mut (iv_index, _)| iv_index >= oldest_iv);
        let retention = self.config.terminal_retention;
        self.transactions
            .retain(|_, tx| !tx.phase.is_terminal() || tx.started_at + retention > now);

        let mut actions = Vec::new();
        for ack in self.reassembler.poll(now) {
            match encode_segment_ack(network, &self.config, ack) {
                Ok(action) => actions.push(action),
                Err(err) => warn!(%err, dst = ack.dst, "segment acknowledgment not sent"),
            }
        }

        for tx in self.transactions.values_mut() {
            if tx.phase.is_terminal() || tx.deadline.is_none_or(|deadline| deadline > now) {
                continue;
            }
            if tx.phase == TransactionPhase::Sending {
                let error = TransportError::TransactionTimeout { attempts: tx.attempts };
                warn!(transaction = %tx.id, "bearer never reported the transmission");
                tx.fail(error.clone());
                actions.push(TransportAction::Failed { transaction: tx.id, error });
                continue;
            }
            let segment_retry = tx.phase == TransactionPhase::AwaitingSegmentAck
                && tx.segments.as_ref().is_some_and(|s| s.retries_left > 0);
            if segment_retry {
                if let Some(segments) = tx.segments.as_mut() {
                    segments.retries_left -= 1;
                }
                match retransmit_segments(network, tx) {
                    Ok(pdus) => {
                        debug!(transaction = %tx.id, segments = pdus.len(), "resending segments");
                        tx.deadline = Some(now + self.config.segment_ack_timeout);
                        actions.push(TransportAction::Transmit {
                            transaction: Some(tx.id),
                            pdus,
                            destination: tx.dst,
                        });
                    },
                    Err(error) => {
                        tx.fail(error.clone());
                        actions.push(TransportAction::Failed { transaction: tx.id, error });
                    },
                }
            } else {
                actions.extend(retry_or_fail(network, tx, &self.config, now));
            }
        }
        actions
    }

    /// Earliest time [`MeshTransport::tick`] has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.transactions
            .values()
            .filter_map(|tx| tx.deadline)
            .chain(self.reassembler.next_deadline())
            .min()
    }

    /// Cancel a transaction. It fails with
    /// [`TransportError::TransactionCancelled`] and its timer is cleared; a
    /// transaction that already ended is left alone.
    pub fn cancel(&mut self, id: TransactionId) -> Result<Vec<TransportAction>, TransportError> {
        let tx = self.transactions.get_mut(&id).ok_or(TransportError::UnknownTransaction(id))?;
        if tx.phase.is_terminal() {
            return Ok(Vec::new());
        }
        tx.fail(TransportError::TransactionCancelled);
        debug!(transaction = %id, "transaction cancelled");
        Ok(vec![TransportAction::Failed {
            transaction: id,
            error: TransportError::TransactionCancelled,
        }])
    }

    /// Cancel every transaction in progress, e.g. when the bearer
    /// disconnects.
    pub fn cancel_all(&mut self) -> Vec<TransportAction> {
        let mut actions = Vec::new();
        for tx in self.transactions.values_mut().filter(|tx| !tx.phase.is_terminal()) {
            tx.fail(TransportError::TransactionCancelled);
            actions.push(TransportAction::Failed {
                transaction: tx.id,
                error: TransportError::TransactionCancelled,
            });
        }
        if !actions.is_empty() {
            debug!(count = actions.len(), "transactions cancelled");
        }
        actions
    }

    /// Encrypt a proxy configuration message for the connected proxy.
    ///
    /// Uses the primary network key, the proxy nonce, CTL = 1, TTL = 0 and
    /// the unassigned destination.
    pub fn encode_proxy_configuration(
        &self,
        network: &mut MeshNetwork,
        message: &ProxyConfigMessage,
    ) -> Result<Bytes, TransportError> {
        let key = network
            .net_keys()
            .first()
            .ok_or(ModelError::MissingPrerequisite("a network key must exist first"))?;
        let material = key.transmit_material();
        let iv_index = network.iv_index().transmit_index();
        let seq = network.allocate_sequence(self.primary_address, 1)?;
        let header = NetworkHeader::new(
            iv_index & 1 == 1,
            material.nid,
            true,
            0,
            seq,
            self.primary_address,
            UNASSIGNED_ADDRESS,
        );
        let pdu = btmesh_crypto::encrypt_network_pdu(
            &material,
            iv_index,
            &header,
            &message.encode(),
            NetworkNonceKind::Proxy,
        )?;
        trace!(?message, seq, "proxy configuration encoded");
        Ok(Bytes::from(pdu))
    }

    /// Decrypt a proxy configuration PDU. Returns its source and message.
    pub fn decode_proxy_configuration(
        &self,
        network: &MeshNetwork,
        pdu: &[u8],
    ) -> Result<(u16, ProxyConfigMessage), TransportError> {
        let current = network.iv_index().index;
        let mut last_error = btmesh_crypto::CryptoError::AuthenticationFailed;
        for key in network.net_keys() {
            for raw in key.receive_keys() {
                let material = NetworkKeyMaterial::derive(raw);
                match decrypt_network_pdu(&material, current, pdu, NetworkNonceKind::Proxy) {
                    Ok((header, payload)) => {
                        return Ok((header.src(), ProxyConfigMessage::decode(&payload)?));
                    },
                    Err(err) => last_error = err,
                }
            }
        }
        Err(last_error.into())
    }

    fn accepts(&self, dst: u16) -> bool {
        self.is_local(dst) || (dst != UNASSIGNED_ADDRESS && !is_unicast(dst))
    }

    fn check_replay(&mut self, src: u16, iv_index: u32, seq: u32) -> bool {
        match self.replay.get(&src) {
            Some(&(last_iv, last_seq)) if (iv_index, seq) <= (last_iv, last_seq) => false,
            _ => {
                self.replay.insert(src, (iv_index, seq));
                true
            },
        }
    }

    fn resolve_keys(
        &self,
        network: &MeshNetwork,
        src: u16,
        dst: u16,
        message: &MeshMessage,
    ) -> Result<ResolvedKeys, TransportError> {
        let label = if is_virtual(dst) {
            let label = network
                .groups()
                .iter()
                .find(|group| group.address.address() == dst)
                .and_then(|group| group.address.label())
                .ok_or(TransportError::UnknownVirtualAddress(dst))?;
            Some(label)
        } else {
            None
        };

        let (net_key, access) = match message.app_key() {
            Some(index) => {
                let app_key = network.app_key(index).ok_or(ModelError::KeyNotFound(index))?;
                let net_key = network
                    .net_key(app_key.bound_net_key)
                    .ok_or(ModelError::KeyNotFound(app_key.bound_net_key))?;
                let key = match (net_key.phase, app_key.old_key) {
                    (KeyRefreshPhase::KeyDistribution, Some(old)) => old,
                    _ => app_key.key,
                };
                (net_key.index, AccessKey::Application { index, key, aid: aid(&key) })
            },
            None => {
                // A configuration server answers with its own device key.
                let server = network
                    .node_by_address(src)
                    .filter(|node| network.provisioner(node.uuid).is_none());
                let node = match server {
                    Some(node) => node,
                    None => network
                        .node_by_address(dst)
                        .ok_or(TransportError::MissingDeviceKey(dst))?,
                };
                let key =
                    node.device_key.ok_or(TransportError::MissingDeviceKey(node.unicast_address))?;
                let net_key = node
                    .net_keys
                    .iter()
                    .copied()
                    .find(|&index| network.net_key(index).is_some())
                    .or_else(|| network.net_keys().first().map(|key| key.index))
                    .ok_or(ModelError::MissingPrerequisite("a network key must exist first"))?;
                (net_key, AccessKey::Device { key })
            },
        };

        let key = network.net_key(net_key).ok_or(ModelError::KeyNotFound(net_key))?;
        let ttl = network
            .selected_provisioner()
            .filter(|provisioner| provisioner.address == Some(self.primary_address))
            .map_or(self.config.default_ttl, |provisioner| provisioner.global_ttl);
        Ok(ResolvedKeys {
            net_key,
            network: key.transmit_material(),
            access,
            label,
            ttl,
        })
    }

    fn handle_segment_ack(
        &mut self,
        network: &mut MeshNetwork,
        src: u16,
        payload: &[u8],
        now: Instant,
    ) -> Result<Vec<TransportAction>, TransportError> {
        let ack = match SegmentAck::decode(payload) {
            Ok(ack) => ack,
            Err(err) => {
                warn!(src, %err, "malformed segment acknowledgment dropped");
                return Ok(Vec::new());
            },
        };
        let Some(tx) = self.transactions.values_mut().find(|tx| {
            !tx.phase.is_terminal()
                && tx.dst == src
                && tx.segments.as_ref().is_some_and(|s| s.seq_zero == ack.seq_zero)
        }) else {
            trace!(src, seq_zero = ack.seq_zero, "segment acknowledgment for no transaction");
            return Ok(Vec::new());
        };

        if ack.block_ack == 0 {
            debug!(transaction = %tx.id, "segments rejected by receiver");
            tx.fail(TransportError::SegmentsRejected);
            return Ok(vec![TransportAction::Failed {
                transaction: tx.id,
                error: TransportError::SegmentsRejected,
            }]);
        }

        let Some(segments) = tx.segments.as_mut() else {
            return Ok(Vec::new());
        };
        let full = full_block_mask(segments.lower.len());
        segments.acked |= ack.block_ack & full;
        if segments.acked == full {
            trace!(transaction = %tx.id, "all segments acknowledged");
            if tx.message.is_acknowledged() {
                tx.phase = TransactionPhase::AwaitingResponse;
                tx.deadline = Some(now + self.config.retry.timeout(tx.attempts));
                return Ok(Vec::new());
            }
            tx.complete(None);
            debug!(transaction = %tx.id, "transaction complete");
            return Ok(vec![TransportAction::Completed { transaction: tx.id, response: None }]);
        }

        let pdus = retransmit_segments(network, tx)?;
        tx.phase = TransactionPhase::AwaitingSegmentAck;
        tx.deadline = Some(now + self.config.segment_ack_timeout);
        debug!(transaction = %tx.id, missing = pdus.len(), "resending missing segments");
        Ok(vec![TransportAction::Transmit { transaction: Some(tx.id), pdus, destination: tx.dst }])
    }

    /// Decrypt a complete upper transport PDU and route it.
    fn deliver(&mut self, network: &MeshNetwork, upper: &UpperPdu) -> Vec<TransportAction> {
        let Some((access, app_key)) = open_upper(network, upper) else {
            warn!(src = upper.src, dst = upper.dst, "upper transport PDU did not decrypt");
            return Vec::new();
        };
        let (opcode, parameters) = match Opcode::decode(&access) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(src = upper.src, %err, "malformed access message dropped");
                return Vec::new();
            },
        };
        let message = AccessMessage {
            src: upper.src,
            dst: upper.dst,
            opcode,
            parameters: Bytes::copy_from_slice(parameters),
            app_key,
            net_key: upper.net_key,
        };
        self.route(message)
    }

    /// Complete the oldest transaction waiting for this response, or
    /// surface the message.
    ///
    /// A request to a group or virtual address completes on the first reply
    /// addressed to its source; later replies are surfaced as `Received`.
    fn route(&mut self, message: AccessMessage) -> Vec<TransportAction> {
        let waiting = self.transactions.values_mut().find(|tx| {
            let answers = if is_unicast(tx.dst) {
                tx.dst == message.src
            } else {
                tx.src == message.dst && is_unicast(message.src)
            };
            !tx.phase.is_terminal()
                && answers
                && tx.message.expected_response().is_some_and(|r| r.opcode == message.opcode)
        });
        let Some(tx) = waiting else {
            trace!(src = message.src, opcode = %message.opcode, "unsolicited message");
            return vec![TransportAction::Received(message)];
        };

        let status = tx
            .message
            .expected_response()
            .and_then(|response| response.status_offset)
            .and_then(|offset| message.parameters.get(offset).copied())
            .filter(|&status| status != 0);
        if let Some(status) = status {
            let error = TransportError::IncompatibleResponse { opcode: message.opcode, status };
            debug!(transaction = %tx.id, status, "response reports failure");
            tx.fail(error.clone());
            tx.response = Some(message);
            return vec![TransportAction::Failed { transaction: tx.id, error }];
        }

        debug!(transaction = %tx.id, opcode = %message.opcode, "transaction complete");
        tx.complete(Some(message.clone()));
        vec![TransportAction::Completed { transaction: tx.id, response: Some(message) }]
    }
}

/// Encrypt the whole message under fresh sequence numbers.
fn encode_attempt(
    network: &mut MeshNetwork,
    tx: &mut Transaction,
    segment_retries: u32,
) -> Result<Vec<Bytes>, TransportError> {
    let access = tx.message.access_pdu();
    let framing = Framing::for_access(access.len())?;
    let iv_index = network.iv_index().transmit_index();
    let seq_auth = network.allocate_sequence(tx.src, framing.count as u32)?;

    let upper =
        pdu::encrypt_upper(&tx.keys, &access, framing.szmic, seq_auth, tx.src, tx.dst, iv_index)?;
    let (akf, aid) = tx.keys.access.akf_aid();
    let lower = lower_pdus(akf, aid, framing, seq_zero(seq_auth), &upper);
    let pdus = lower
        .iter()
        .zip(seq_auth..)
        .map(|(pdu, seq)| {
            pdu::seal(&tx.keys.network, iv_index, false, tx.keys.ttl, seq, tx.src, tx.dst, pdu)
        })
        .collect::<Result<Vec<_>, _>>()?;

    tx.attempts += 1;
    tx.seq_auth = seq_auth;
    tx.segments = framing.segmented.then(|| OutgoingSegments {
        seq_zero: seq_zero(seq_auth),
        lower,
        acked: 0,
        retries_left: segment_retries,
    });
    tx.phase = TransactionPhase::Sending;
    tx.deadline = None;
    trace!(transaction = %tx.id, seq_auth, attempt = tx.attempts, "message encrypted");
    Ok(pdus)
}

/// Network-encrypt the segments not yet acknowledged, with new sequence
/// numbers.
fn retransmit_segments(
    network: &mut MeshNetwork,
    tx: &Transaction,
) -> Result<Vec<Bytes>, TransportError> {
    let Some(segments) = &tx.segments else {
        return Ok(Vec::new());
    };
    let missing: Vec<&Vec<u8>> = segments
        .lower
        .iter()
        .enumerate()
        .filter(|(offset, _)| segments.acked & (1u32 << offset) == 0)
        .map(|(_, pdu)| pdu)
        .collect();
    if missing.is_empty() {
        return Ok(Vec::new());
    }
    let iv_index = network.iv_index().transmit_index();
    let first = network.allocate_sequence(tx.src, missing.len() as u32)?;
    missing
        .into_iter()
        .zip(first..)
        .map(|(pdu, seq)| {
            pdu::seal(&tx.keys.network, iv_index, false, tx.keys.ttl, seq, tx.src, tx.dst, pdu)
        })
        .collect()
}

/// Retry the whole message if the policy allows, otherwise fail it.
fn retry_or_fail(
    network: &mut MeshNetwork,
    tx: &mut Transaction,
    config: &TransportConfig,
    now: Instant,
) -> Option<TransportAction> {
    if tx.attempts > config.retry.max_retries {
        let error = TransportError::TransactionTimeout { attempts: tx.attempts };
        debug!(transaction = %tx.id, attempts = tx.attempts, "transaction timed out");
        tx.fail(error.clone());
        return Some(TransportAction::Failed { transaction: tx.id, error });
    }
    match encode_attempt(network, tx, config.segment_retries) {
        Ok(pdus) => {
            debug!(transaction = %tx.id, attempt = tx.attempts, "retrying transaction");
            tx.deadline = Some(now + config.send_timeout);
            Some(TransportAction::Transmit { transaction: Some(tx.id), pdus, destination: tx.dst })
        },
        Err(error) => {
            warn!(transaction = %tx.id, %error, "retry failed");
            tx.fail(error.clone());
            Some(TransportAction::Failed { transaction: tx.id, error })
        },
    }
}

fn encode_segment_ack(
    network: &mut MeshNetwork,
    config: &TransportConfig,
    ack: PendingAck,
) -> Result<TransportAction, TransportError> {
    let key = network.net_key(ack.net_key).ok_or(ModelError::KeyNotFound(ack.net_key))?;
    let material = key.transmit_material();
    let iv_index = network.iv_index().transmit_index();
    let seq = network.allocate_sequence(ack.src, 1)?;

    let mut lower = Vec::with_capacity(1 + SegmentAck::SIZE);
    LowerHeader::UnsegmentedControl { opcode: SEGMENT_ACK_OPCODE }.encode(&mut lower);
    lower.extend_from_slice(
        &SegmentAck { obo: false, seq_zero: ack.seq_zero, block_ack: ack.block_ack }.encode(),
    );
    let pdu = pdu::seal(&material, iv_index, true, config.default_ttl, seq, ack.src, ack.dst, &lower)?;
    trace!(dst = ack.dst, seq_zero = ack.seq_zero, block_ack = ack.block_ack, "segment ack");
    Ok(TransportAction::Transmit { transaction: None, pdus: vec![pdu], destination: ack.dst })
}

/// Find the network key that opens `pdu`.
fn open_network(
    network: &MeshNetwork,
    pdu: &[u8],
) -> Option<(KeyIndex, NetworkHeader, Vec<u8>, u32)> {
    let nid = pdu.first()? & 0x7F;
    let current = network.iv_index().index;
    for key in network.net_keys() {
        for raw in key.receive_keys() {
            let material = NetworkKeyMaterial::derive(raw);
            if material.nid != nid {
                continue;
            }
            if let Ok((header, lower)) =
                decrypt_network_pdu(&material, current, pdu, NetworkNonceKind::Network)
            {
                let iv_index = pdu::receive_iv_index(current, header.ivi());
                return Some((key.index, header, lower, iv_index));
            }
        }
    }
    None
}

/// Decrypt an upper transport PDU with the device key of either end, or
/// with the application keys whose AID matches.
fn open_upper(network: &MeshNetwork, upper: &UpperPdu) -> Option<(Vec<u8>, Option<KeyIndex>)> {
    if !upper.akf {
        let nonce = pdu::access_nonce(
            true,
            upper.szmic,
            upper.seq_auth,
            upper.src,
            upper.dst,
            upper.iv_index,
        );
        return [upper.src, upper.dst]
            .into_iter()
            .filter_map(|address| network.node_by_address(address))
            .filter_map(|node| node.device_key)
            .find_map(|key| pdu::decrypt_upper(&key, &nonce, &upper.upper, None, upper.szmic))
            .map(|access| (access, None));
    }

    let labels: Vec<_> = if is_virtual(upper.dst) {
        network
            .groups()
            .iter()
            .filter(|group| group.address.address() == upper.dst)
            .filter_map(|group| group.address.label())
            .collect()
    } else {
        Vec::new()
    };
    let nonce =
        pdu::access_nonce(false, upper.szmic, upper.seq_auth, upper.src, upper.dst, upper.iv_index);
    for app_key in network.app_keys() {
        for key in std::iter::once(&app_key.key).chain(app_key.old_key.as_ref()) {
            if aid(key) != upper.aid {
                continue;
            }
            let opened = if labels.is_empty() {
                pdu::decrypt_upper(key, &nonce, &upper.upper, None, upper.szmic)
            } else {
                labels.iter().find_map(|label| {
                    pdu::decrypt_upper(key, &nonce, &upper.upper, Some(label), upper.szmic)
                })
            };
            if let Some(access) = opened {
                return Some((access, Some(app_key.index)));
            }
        }
    }
    None
}
