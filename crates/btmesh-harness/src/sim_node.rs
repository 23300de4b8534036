//! Simulated mesh device.
//!
//! A [`SimNode`] runs its own copy of the network description and its own
//! [`MeshTransport`], so everything it receives has really been encrypted,
//! segmented and acknowledged by the code under test. It serves a
//! Configuration Server, a Generic OnOff Server and an echoing vendor model.

use std::time::Instant;

use btmesh_core::{
    MeshMessage, MeshNetwork, MeshTransport, ModelError, TransportAction, TransportConfig,
    model::{ApplicationKey, NetworkState},
    transport::{AccessMessage, unpack_key_indexes},
};
use btmesh_proto::{
    CompositionData, CompositionElement, Features, Opcode,
    opcode::{config, generic},
};
use bytes::Bytes;
use tracing::{debug, warn};
use uuid::Uuid;

/// Company identifier of the simulated vendor model.
pub const SIM_COMPANY_ID: u16 = 0x05F1;

/// Config status: success.
pub const STATUS_SUCCESS: u8 = 0x00;
/// Config status: invalid NetKey index.
pub const STATUS_INVALID_NETKEY: u8 = 0x04;
/// Config status: insufficient resources.
pub const STATUS_INSUFFICIENT_RESOURCES: u8 = 0x05;
/// Config status: key index already stored with a different key.
pub const STATUS_KEY_INDEX_ALREADY_STORED: u8 = 0x06;

/// A provisioned device on the simulated mesh.
#[derive(Debug)]
pub struct SimNode {
    uuid: Uuid,
    address: u16,
    network: MeshNetwork,
    transport: MeshTransport,
    composition: CompositionData,
    default_ttl: u8,
    on: bool,
    silent: bool,
    reset: bool,
    received: Vec<AccessMessage>,
}

impl SimNode {
    /// Device for node `uuid` of `state`. The node must exist in `state`.
    pub fn new(state: NetworkState, uuid: Uuid) -> Result<Self, ModelError> {
        let network = MeshNetwork::from_state(state)?;
        let node = network.node(uuid).ok_or(ModelError::NodeNotFound(uuid))?;
        let (address, elements) = (node.unicast_address, node.element_count);
        let default_ttl = node.ttl.unwrap_or(5);
        Ok(Self {
            uuid,
            address,
            transport: MeshTransport::new(TransportConfig::default(), address, elements),
            composition: default_composition(elements),
            network,
            default_ttl,
            on: false,
            silent: false,
            reset: false,
            received: Vec::new(),
        })
    }

    /// Device UUID.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Primary element address.
    pub fn address(&self) -> u16 {
        self.address
    }

    /// Generic OnOff state.
    pub fn is_on(&self) -> bool {
        self.on
    }

    /// True after a Config Node Reset.
    pub fn is_reset(&self) -> bool {
        self.reset
    }

    /// Composition Data page 0 the device reports.
    pub fn composition(&self) -> &CompositionData {
        &self.composition
    }

    /// The device's view of the network.
    pub fn network(&self) -> &MeshNetwork {
        &self.network
    }

    /// Every access message delivered to the device.
    pub fn received(&self) -> &[AccessMessage] {
        &self.received
    }

    /// A silent device still receives (and acknowledges segments) but never
    /// answers.
    pub fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }

    /// Earliest timer of the device's transport.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.transport.next_deadline()
    }

    /// Process one network PDU; returns the PDUs the device sends in reply.
    pub fn handle_pdu(&mut self, pdu: &[u8], now: Instant) -> Vec<Bytes> {
        if self.reset {
            return Vec::new();
        }
        match self.transport.handle_pdu(&mut self.network, pdu, now) {
            Ok(actions) => self.run(actions, now),
            Err(err) => {
                warn!(address = self.address, %err, "device dropped pdu");
                Vec::new()
            },
        }
    }

    /// Fire due timers (owed Segment Acknowledgments).
    pub fn tick(&mut self, now: Instant) -> Vec<Bytes> {
        let actions = self.transport.tick(&mut self.network, now);
        self.run(actions, now)
    }

    fn run(&mut self, actions: Vec<TransportAction>, now: Instant) -> Vec<Bytes> {
        let mut out = Vec::new();
        for action in actions {
            match action {
                TransportAction::Transmit { transaction, pdus, .. } => {
                    out.extend(pdus);
                    if let Some(id) = transaction {
                        // Replies are unacknowledged; they are done once sent.
                        let _ = self.transport.handle_send_complete(id, Ok(()), now);
                        self.transport.forget(id);
                    }
                },
                TransportAction::Received(message) => {
                    self.received.push(message.clone());
                    out.extend(self.answer(&message, now));
                },
                TransportAction::Completed { .. } | TransportAction::Failed { .. } => {},
            }
        }
        out
    }

    fn answer(&mut self, message: &AccessMessage, now: Instant) -> Vec<Bytes> {
        let Some(reply) = self.reply_to(message) else {
            return Vec::new();
        };
        if self.silent {
            return Vec::new();
        }
        match self.transport.send(&mut self.network, self.address, message.src, reply, now) {
            Ok((_, actions)) => self.run(actions, now),
            Err(err) => {
                warn!(address = self.address, %err, "device reply not sent");
                Vec::new()
            },
        }
    }

    /// Apply the message to the device state and build the reply, if the
    /// message has one.
    fn reply_to(&mut self, message: &AccessMessage) -> Option<MeshMessage> {
        let params = message.parameters.as_ref();
        match (message.opcode, message.app_key) {
            (generic::ONOFF_GET, Some(app_key)) => Some(self.onoff_status(app_key)),
            (generic::ONOFF_SET, Some(app_key)) => {
                self.on = params.first().is_some_and(|&state| state != 0);
                Some(self.onoff_status(app_key))
            },
            (generic::ONOFF_SET_UNACKNOWLEDGED, Some(_)) => {
                self.on = params.first().is_some_and(|&state| state != 0);
                None
            },
            (config::APPKEY_ADD, None) => Some(self.app_key_add(params)),
            (config::COMPOSITION_DATA_GET, None) => {
                let mut status = vec![0];
                status.extend(self.composition.encode());
                Some(MeshMessage::configuration(config::COMPOSITION_DATA_STATUS, status, None))
            },
            (config::DEFAULT_TTL_GET, None) => Some(MeshMessage::configuration(
                config::DEFAULT_TTL_STATUS,
                vec![self.default_ttl],
                None,
            )),
            (config::NODE_RESET, None) => {
                debug!(address = self.address, "device reset");
                self.reset = true;
                Some(MeshMessage::configuration(config::NODE_RESET_STATUS, Bytes::new(), None))
            },
            (Opcode::Vendor { opcode, company_id: SIM_COMPANY_ID }, Some(app_key)) => {
                MeshMessage::vendor(opcode + 1, SIM_COMPANY_ID, message.parameters.clone(), app_key)
                    .ok()
            },
            _ => None,
        }
    }

    fn onoff_status(&self, app_key: u16) -> MeshMessage {
        MeshMessage::generic(generic::ONOFF_STATUS, vec![u8::from(self.on)], app_key)
    }

    fn app_key_add(&mut self, params: &[u8]) -> MeshMessage {
        let status = match params {
            [a, b, c, key @ ..] if key.len() == 16 => {
                let (net_key, index) = unpack_key_indexes([*a, *b, *c]);
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(key);
                self.store_app_key(net_key, index, bytes)
            },
            _ => STATUS_INSUFFICIENT_RESOURCES,
        };
        let mut reply = vec![status];
        reply.extend_from_slice(params.get(..3).unwrap_or_default());
        MeshMessage::configuration(config::APPKEY_STATUS, reply, None)
    }

    fn store_app_key(&mut self, net_key: u16, index: u16, key: [u8; 16]) -> u8 {
        if self.network.net_key(net_key).is_none() {
            return STATUS_INVALID_NETKEY;
        }
        if let Some(existing) = self.network.app_key(index) {
            return if existing.key == key { STATUS_SUCCESS } else { STATUS_KEY_INDEX_ALREADY_STORED };
        }
        match self.network.add_app_key(ApplicationKey::new(index, key, net_key)) {
            Ok(()) => {
                debug!(address = self.address, index, "device stored application key");
                STATUS_SUCCESS
            },
            Err(ModelError::DuplicateKey { .. }) => STATUS_KEY_INDEX_ALREADY_STORED,
            Err(_) => STATUS_INSUFFICIENT_RESOURCES,
        }
    }
}

/// Composition of a simulated device: configuration server, OnOff server and
/// the vendor model on the primary element, an OnOff server on the others.
pub fn default_composition(elements: u8) -> CompositionData {
    let mut composition = CompositionData {
        cid: SIM_COMPANY_ID,
        pid: 0x0001,
        vid: 0x0001,
        crpl: 0x0020,
        features: Features::RELAY | Features::PROXY,
        elements: vec![CompositionElement {
            location: 0x0100,
            sig_models: vec![0x0000, 0x1000],
            vendor_models: vec![(SIM_COMPANY_ID, 0x0001)],
        }],
    };
    for _ in 1..elements {
        composition.elements.push(CompositionElement {
            location: 0x0000,
            sig_models: vec![0x1000],
            vendor_models: Vec::new(),
        });
    }
    composition
}
