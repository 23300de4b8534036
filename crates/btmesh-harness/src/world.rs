//! Whole-mesh simulation.
//!
//! A [`World`] owns a gateway (the provisioner's network model and
//! transport, as a client application would hold them), a set of
//! [`SimNode`]s and the medium between them. It runs entirely on the
//! virtual clock of its [`SimEnv`]: queued PDUs are delivered first, and
//! when nothing is in flight time jumps to the next transport deadline.

use std::{collections::VecDeque, time::Instant};

use btmesh_core::{
    Environment, MeshMessage, MeshNetwork, MeshTransport, ModelError, TransportAction,
    TransportConfig, TransportError,
    env::{random_key, random_uuid},
    model::{Node, Provisioner},
    transport::{AccessMessage, TransactionId},
};
use bytes::Bytes;
use chrono::DateTime;
use tracing::{debug, trace};

use crate::{SimEnv, SimNode};

/// Steps [`World::run_until_idle`] takes before giving up.
pub const MAX_STEPS: usize = 100_000;

/// What happened to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A transaction completed
    Completed {
        /// Transaction
        transaction: TransactionId,
        /// Response, for acknowledged messages
        response: Option<AccessMessage>,
    },
    /// A transaction failed
    Failed {
        /// Transaction
        transaction: TransactionId,
        /// Reason
        error: TransportError,
    },
    /// An unsolicited message arrived
    Received(AccessMessage),
}

impl Outcome {
    /// Transaction the outcome belongs to.
    pub fn transaction(&self) -> Option<TransactionId> {
        match self {
            Self::Completed { transaction, .. } | Self::Failed { transaction, .. } => {
                Some(*transaction)
            },
            Self::Received(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sender {
    Gateway,
    Node(usize),
}

/// A simulated mesh with one gateway.
#[derive(Debug)]
pub struct World {
    env: SimEnv,
    network: MeshNetwork,
    transport: MeshTransport,
    nodes: Vec<SimNode>,
    in_flight: VecDeque<(Sender, Bytes)>,
    outcomes: Vec<Outcome>,
    loss_rate: f64,
    pdus_sent: u64,
    pdus_dropped: u64,
}

impl World {
    /// A network with one provisioner (the gateway), network key 0 and
    /// application key 0, seeded with `seed`.
    pub fn new(seed: u64) -> Result<Self, ModelError> {
        let env = SimEnv::with_seed(seed);
        let timestamp = DateTime::parse_from_rfc3339("2026-01-01T00:00:00+00:00")
            .map_err(|err| ModelError::MalformedDocument(err.to_string()))?;
        let mut network = MeshNetwork::new("simulation", timestamp, &env);
        let gateway = network.create_provisioner("gateway", &env)?;
        network.create_network_key(&env)?;
        network.create_app_key(0, &env)?;
        Self::with_network(env, network, &gateway)
    }

    fn with_network(
        env: SimEnv,
        network: MeshNetwork,
        gateway: &Provisioner,
    ) -> Result<Self, ModelError> {
        let address = gateway.address.ok_or(ModelError::NoProvisionerSelected)?;
        Ok(Self {
            env,
            network,
            transport: MeshTransport::new(TransportConfig::default(), address, 1),
            nodes: Vec::new(),
            in_flight: VecDeque::new(),
            outcomes: Vec::new(),
            loss_rate: 0.0,
            pdus_sent: 0,
            pdus_dropped: 0,
        })
    }

    /// Provision a device with `elements` elements holding network key 0 and
    /// application key 0. Returns its primary address.
    pub fn add_node(&mut self, elements: u8) -> Result<u16, ModelError> {
        let address = self.network.next_available_unicast(elements)?;
        let uuid = random_uuid(&self.env);
        let mut node = Node::new(uuid, format!("node-{:04X}", address), address, elements);
        node.device_key = Some(random_key(&self.env));
        node.net_keys.insert(0);
        node.app_keys.insert(0);
        node.config_complete = true;
        self.network.add_node(node)?;
        self.nodes.push(SimNode::new(self.network.state().clone(), uuid)?);
        debug!(address, elements, "simulated node added");
        Ok(address)
    }

    /// Probability that one delivery is lost.
    pub fn set_loss_rate(&mut self, loss_rate: f64) {
        self.loss_rate = loss_rate;
    }

    /// The environment (clock and randomness).
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// Current virtual time.
    pub fn now(&self) -> Instant {
        self.env.now()
    }

    /// The gateway's network model.
    pub fn network(&self) -> &MeshNetwork {
        &self.network
    }

    /// Mutable gateway network model.
    pub fn network_mut(&mut self) -> &mut MeshNetwork {
        &mut self.network
    }

    /// The gateway's transport.
    pub fn transport(&self) -> &MeshTransport {
        &self.transport
    }

    /// Simulated device with primary address `address`.
    pub fn node(&self, address: u16) -> Option<&SimNode> {
        self.nodes.iter().find(|node| node.address() == address)
    }

    /// Mutable simulated device.
    pub fn node_mut(&mut self, address: u16) -> Option<&mut SimNode> {
        self.nodes.iter_mut().find(|node| node.address() == address)
    }

    /// Everything that happened at the gateway so far.
    pub fn outcomes(&self) -> &[Outcome] {
        &self.outcomes
    }

    /// Outcomes of transaction `id`.
    pub fn outcomes_of(&self, id: TransactionId) -> Vec<&Outcome> {
        self.outcomes.iter().filter(|outcome| outcome.transaction() == Some(id)).collect()
    }

    /// Deliveries attempted.
    pub fn pdus_sent(&self) -> u64 {
        self.pdus_sent
    }

    /// Deliveries lost.
    pub fn pdus_dropped(&self) -> u64 {
        self.pdus_dropped
    }

    /// Send `message` from the gateway's primary element to `dst`.
    pub fn send(&mut self, dst: u16, message: MeshMessage) -> Result<TransactionId, TransportError> {
        let now = self.now();
        let src = self.transport.primary_address();
        let (id, actions) = self.transport.send(&mut self.network, src, dst, message, now)?;
        self.gateway_actions(actions, now);
        Ok(id)
    }

    /// Cancel a gateway transaction.
    pub fn cancel(&mut self, id: TransactionId) -> Result<(), TransportError> {
        let now = self.now();
        let actions = self.transport.cancel(id)?;
        self.gateway_actions(actions, now);
        Ok(())
    }

    /// Deliver one queued PDU, or advance to the next deadline and fire it.
    /// Returns `false` when nothing is left to do.
    pub fn step(&mut self) -> bool {
        if let Some((from, pdu)) = self.in_flight.pop_front() {
            self.deliver(from, &pdu);
            return true;
        }

        let deadline = self
            .nodes
            .iter()
            .filter_map(SimNode::next_deadline)
            .chain(self.transport.next_deadline())
            .min();
        let Some(deadline) = deadline else {
            return false;
        };
        self.env.advance_to(deadline);
        let now = self.now();
        trace!(elapsed = ?self.env.elapsed(), "timers fired");

        let actions = self.transport.tick(&mut self.network, now);
        self.gateway_actions(actions, now);
        for index in 0..self.nodes.len() {
            let pdus = self.nodes[index].tick(now);
            self.in_flight.extend(pdus.into_iter().map(|pdu| (Sender::Node(index), pdu)));
        }
        true
    }

    /// Step until idle. Returns the number of steps taken.
    pub fn run_until_idle(&mut self) -> usize {
        let mut steps = 0;
        while steps < MAX_STEPS && self.step() {
            steps += 1;
        }
        steps
    }

    fn lost(&mut self) -> bool {
        self.pdus_sent += 1;
        let lost = self.env.chance(self.loss_rate);
        if lost {
            self.pdus_dropped += 1;
        }
        lost
    }

    fn deliver(&mut self, from: Sender, pdu: &Bytes) {
        let now = self.now();
        if from != Sender::Gateway && !self.lost() {
            match self.transport.handle_pdu(&mut self.network, pdu, now) {
                Ok(actions) => self.gateway_actions(actions, now),
                Err(err) => debug!(%err, "gateway dropped pdu"),
            }
        }
        for index in 0..self.nodes.len() {
            if from == Sender::Node(index) || self.lost() {
                continue;
            }
            let replies = self.nodes[index].handle_pdu(pdu, now);
            self.in_flight.extend(replies.into_iter().map(|reply| (Sender::Node(index), reply)));
        }
    }

    fn gateway_actions(&mut self, actions: Vec<TransportAction>, now: Instant) {
        for action in actions {
            match action {
                TransportAction::Transmit { transaction, pdus, .. } => {
                    self.in_flight.extend(pdus.into_iter().map(|pdu| (Sender::Gateway, pdu)));
                    if let Some(id) = transaction {
                        // The simulated bearer accepts everything immediately.
                        if let Ok(more) = self.transport.handle_send_complete(id, Ok(()), now) {
                            self.gateway_actions(more, now);
                        }
                    }
                },
                TransportAction::Completed { transaction, response } => {
                    self.outcomes.push(Outcome::Completed { transaction, response });
                },
                TransportAction::Failed { transaction, error } => {
                    self.outcomes.push(Outcome::Failed { transaction, error });
                },
                TransportAction::Received(message) => self.outcomes.push(Outcome::Received(message)),
            }
        }
    }
}
