//! Network model and key lifecycle.
//!
//! [`MeshNetwork`] is the single owner of a network's keys, provisioners,
//! nodes, groups and scenes. The data itself lives in [`NetworkState`], a
//! plain serializable value; `MeshNetwork` wraps it with the operations that
//! keep it consistent and with the observer registry.
//!
//! # Invariants
//!
//! Every committed state satisfies [`NetworkState::check_invariants`]:
//!
//! 1. key indexes are unique within their list and at most 4095
//! 2. keys in use by a node other than the selected provisioner's own node
//!    are neither removed nor given new key material
//! 3. application keys exist only alongside network keys, each bound to an
//!    existing one
//! 4. provisioner ranges of the same kind never overlap
//! 5. a provisioner's address lies in its own unicast ranges
//! 6. node element ranges never collide
//! 7. at most one provisioner is selected, and a lone provisioner always is
//! 8. a provisioner has a shadow node exactly when it has an address
//!
//! Operations build the prospective state on a copy, check it, and only then
//! swap it in and notify observers, so a failed call changes nothing.

mod allocator;
pub mod document;
mod group;
mod keys;
mod node;
mod observer;
mod provisioner;
pub mod range;
mod scene;

use std::collections::{BTreeSet, HashMap};

use btmesh_proto::{address::MIN_UNICAST_ADDRESS, network::MAX_SEQUENCE_NUMBER};
use chrono::{DateTime, FixedOffset};
pub use group::{Group, GroupAddress};
pub use keys::{ApplicationKey, KeyRefreshPhase, NetworkKey, Security};
pub use node::{DeviceState, Node, RemovedNode};
pub use observer::{NetworkEvent, NetworkObserver, ObserverId};
use observer::Observers;
pub use provisioner::{DEFAULT_GLOBAL_TTL, Provisioner};
pub use range::{AddressRange, RangeKind};
pub use scene::Scene;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::{
    env::{Environment, random_uuid},
    error::ModelError,
};

/// Global key index (12 bits).
pub type KeyIndex = u16;

/// Largest key index.
pub const MAX_KEY_INDEX: KeyIndex = 4095;

/// Sequence numbers reserved ahead of use. The reservation is what gets
/// persisted, so after a restart a source continues past it.
pub const SEQUENCE_RESERVATION: u32 = 256;

/// IV index state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IvIndex {
    /// Current IV index
    pub index: u32,
    /// IV update procedure in progress
    pub update_active: bool,
}

impl IvIndex {
    /// IV index used for outgoing messages. During an IV update nodes keep
    /// transmitting with the previous index.
    pub fn transmit_index(&self) -> u32 {
        if self.update_active { self.index.saturating_sub(1) } else { self.index }
    }
}

/// The complete, serializable content of a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    /// Network UUID
    pub mesh_uuid: Uuid,
    /// Network name
    pub mesh_name: String,
    /// Last modification
    pub timestamp: DateTime<FixedOffset>,
    /// IV index
    pub iv_index: IvIndex,
    /// Network keys
    pub net_keys: Vec<NetworkKey>,
    /// Application keys
    pub app_keys: Vec<ApplicationKey>,
    /// Provisioners
    pub provisioners: Vec<Provisioner>,
    /// The selected provisioner
    pub selected_provisioner: Option<Uuid>,
    /// Nodes, including provisioners' shadow nodes
    pub nodes: Vec<Node>,
    /// Groups
    pub groups: Vec<Group>,
    /// Scenes
    pub scenes: Vec<Scene>,
    /// Unicast allocation cursor
    pub next_unicast: u16,
}

impl NetworkState {
    /// An empty network.
    pub fn new(mesh_uuid: Uuid, mesh_name: impl Into<String>, timestamp: DateTime<FixedOffset>) -> Self {
        Self {
            mesh_uuid,
            mesh_name: mesh_name.into(),
            timestamp,
            iv_index: IvIndex::default(),
            net_keys: Vec::new(),
            app_keys: Vec::new(),
            provisioners: Vec::new(),
            selected_provisioner: None,
            nodes: Vec::new(),
            groups: Vec::new(),
            scenes: Vec::new(),
            next_unicast: MIN_UNICAST_ADDRESS,
        }
    }

    /// Check every model invariant.
    pub fn check_invariants(&self) -> Result<(), ModelError> {
        self.check_keys()?;
        self.check_provisioners()?;
        self.check_nodes()?;
        self.check_groups_and_scenes()
    }

    fn check_keys(&self) -> Result<(), ModelError> {
        let mut indexes = BTreeSet::new();
        for (position, key) in self.net_keys.iter().enumerate() {
            if key.index > MAX_KEY_INDEX {
                return Err(ModelError::KeyIndexOutOfRange(key.index));
            }
            if !indexes.insert(key.index) {
                return Err(ModelError::DuplicateKeyIndex(key.index));
            }
            if let Some(first) = self.net_keys[..position].iter().find(|k| k.key == key.key) {
                return Err(ModelError::DuplicateKey { index: first.index });
            }
        }

        if !self.app_keys.is_empty() && self.net_keys.is_empty() {
            return Err(ModelError::MissingPrerequisite("a network key must exist first"));
        }
        let mut indexes = BTreeSet::new();
        for (position, key) in self.app_keys.iter().enumerate() {
            if key.index > MAX_KEY_INDEX {
                return Err(ModelError::KeyIndexOutOfRange(key.index));
            }
            if !indexes.insert(key.index) {
                return Err(ModelError::DuplicateKeyIndex(key.index));
            }
            if let Some(first) = self.app_keys[..position].iter().find(|k| k.key == key.key) {
                return Err(ModelError::DuplicateKey { index: first.index });
            }
            if !self.net_keys.iter().any(|k| k.index == key.bound_net_key) {
                return Err(ModelError::KeyNotFound(key.bound_net_key));
            }
        }
        Ok(())
    }

    fn check_provisioners(&self) -> Result<(), ModelError> {
        for (position, provisioner) in self.provisioners.iter().enumerate() {
            let earlier = &self.provisioners[..position];
            if earlier.iter().any(|p| p.uuid == provisioner.uuid) {
                return Err(ModelError::ProvisionerExists(provisioner.uuid));
            }
            for kind in [RangeKind::Unicast, RangeKind::Group, RangeKind::Scene] {
                for range in provisioner.ranges(kind) {
                    kind.validate(range)?;
                }
            }
            if let Some((kind, other)) = earlier.iter().find_map(|other| {
                provisioner.overlapping_kind(other).map(|kind| (kind, other.uuid))
            }) {
                return Err(ModelError::RangeOverlap { kind, other });
            }

            let shadow = self.nodes.iter().find(|node| node.uuid == provisioner.uuid);
            match (provisioner.address, shadow) {
                (Some(address), Some(node)) if node.unicast_address == address => {
                    if !provisioner.owns_unicast(address) {
                        return Err(ModelError::AddressOutOfRange { kind: "provisioner", address });
                    }
                },
                (None, None) => {},
                _ => return Err(ModelError::ProvisionerNode(provisioner.uuid)),
            }
            if !btmesh_proto::network::is_valid_ttl(provisioner.global_ttl) {
                return Err(ModelError::InvalidTtl(provisioner.global_ttl));
            }
        }

        if let Some(selected) = self.selected_provisioner {
            if !self.provisioners.iter().any(|p| p.uuid == selected) {
                return Err(ModelError::ProvisionerNotFound(selected));
            }
        } else if self.provisioners.len() == 1 {
            return Err(ModelError::NoProvisionerSelected);
        }
        Ok(())
    }

    fn check_nodes(&self) -> Result<(), ModelError> {
        let mut uuids = BTreeSet::new();
        for node in &self.nodes {
            if !uuids.insert(node.uuid) {
                return Err(ModelError::NodeExists(node.uuid));
            }
            if !node.has_valid_elements() {
                return Err(ModelError::AddressOutOfRange {
                    kind: "node",
                    address: node.unicast_address,
                });
            }
            if let Some(&index) =
                node.net_keys.iter().find(|&&i| !self.net_keys.iter().any(|k| k.index == i))
            {
                return Err(ModelError::KeyNotFound(index));
            }
            if let Some(&index) =
                node.app_keys.iter().find(|&&i| !self.app_keys.iter().any(|k| k.index == i))
            {
                return Err(ModelError::KeyNotFound(index));
            }
        }

        let mut ranges: Vec<AddressRange> = self.nodes.iter().map(Node::element_range).collect();
        ranges.sort();
        if let Some(pair) = ranges.windows(2).find(|pair| pair[0].overlaps(&pair[1])) {
            return Err(ModelError::AddressInUse(pair[1].low));
        }
        Ok(())
    }

    fn check_groups_and_scenes(&self) -> Result<(), ModelError> {
        let mut addresses = BTreeSet::new();
        for group in &self.groups {
            let address = group.address.address();
            if !addresses.insert(address) {
                return Err(ModelError::GroupExists(address));
            }
            if !group.address.is_valid() {
                return Err(ModelError::AddressOutOfRange { kind: "group", address });
            }
        }
        for group in &self.groups {
            if let Some(parent) = group.parent {
                if !addresses.contains(&parent.address())
                    || parent.address() == group.address.address()
                {
                    return Err(ModelError::GroupNotFound(parent.address()));
                }
            }
        }

        let mut numbers = BTreeSet::new();
        for scene in &self.scenes {
            if scene.number == 0 {
                return Err(ModelError::AddressOutOfRange { kind: "scene", address: 0 });
            }
            if !numbers.insert(scene.number) {
                return Err(ModelError::SceneExists(scene.number));
            }
        }
        Ok(())
    }

    fn selected_provisioner_node_mut(&mut self) -> Option<&mut Node> {
        let uuid = self.selected_provisioner?;
        self.nodes.iter_mut().find(|node| node.uuid == uuid)
    }

    fn provisioners_updated(&self) -> NetworkEvent {
        NetworkEvent::ProvisionersUpdated {
            provisioners: self.provisioners.clone(),
            selected: self.selected_provisioner,
        }
    }
}

/// A mesh network: its state plus the operations that keep it consistent.
#[derive(Debug)]
pub struct MeshNetwork {
    state: NetworkState,
    observers: Observers,
    /// Next sequence number per source node. Not persisted; after a restart
    /// allocation resumes at the node's reserved high-water mark.
    sequence_cursor: HashMap<Uuid, u32>,
}

impl MeshNetwork {
    /// Create an empty network with a random UUID.
    pub fn new<E: Environment>(
        name: impl Into<String>,
        timestamp: DateTime<FixedOffset>,
        env: &E,
    ) -> Self {
        Self::from_parts(NetworkState::new(random_uuid(env), name, timestamp))
    }

    /// Wrap an existing state after checking every invariant. A lone
    /// provisioner is selected automatically.
    pub fn from_state(mut state: NetworkState) -> Result<Self, ModelError> {
        state.normalize_selection();
        state.check_invariants()?;
        Ok(Self::from_parts(state))
    }

    fn from_parts(state: NetworkState) -> Self {
        Self { state, observers: Observers::default(), sequence_cursor: HashMap::new() }
    }

    /// Read-only view of the whole state.
    pub fn state(&self) -> &NetworkState {
        &self.state
    }

    /// Network UUID.
    pub fn mesh_uuid(&self) -> Uuid {
        self.state.mesh_uuid
    }

    /// Network name.
    pub fn mesh_name(&self) -> &str {
        &self.state.mesh_name
    }

    /// Last modification time.
    pub fn timestamp(&self) -> DateTime<FixedOffset> {
        self.state.timestamp
    }

    /// Rename the network.
    pub fn set_mesh_name(&mut self, name: impl Into<String>) -> Result<(), ModelError> {
        let mut next = self.state.clone();
        next.mesh_name = name.into();
        self.commit(next, vec![NetworkEvent::NetworkUpdated])
    }

    /// Record a modification time.
    pub fn touch(&mut self, timestamp: DateTime<FixedOffset>) -> Result<(), ModelError> {
        let mut next = self.state.clone();
        next.timestamp = timestamp;
        self.commit(next, vec![NetworkEvent::NetworkUpdated])
    }

    /// Register an observer.
    pub fn subscribe(&mut self, observer: std::sync::Arc<dyn NetworkObserver>) -> ObserverId {
        self.observers.subscribe(observer)
    }

    /// Remove an observer. Returns false if it was not registered.
    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        self.observers.unsubscribe(id)
    }

    /// Current IV index.
    pub fn iv_index(&self) -> IvIndex {
        self.state.iv_index
    }

    /// Move to a new IV index.
    ///
    /// The index never decreases. When it increases, sequence numbers start
    /// over, since every nonce includes the IV index.
    pub fn set_iv_index(&mut self, index: u32, update_active: bool) -> Result<(), ModelError> {
        let current = self.state.iv_index.index;
        if index < current {
            return Err(ModelError::InvalidIvIndex { current, requested: index });
        }
        let mut next = self.state.clone();
        next.iv_index = IvIndex { index, update_active };
        if index > current {
            for node in &mut next.nodes {
                node.sequence_number = 0;
            }
            for provisioner in &mut next.provisioners {
                provisioner.sequence_number = 0;
            }
        }
        self.commit(next, vec![NetworkEvent::NetworkUpdated])?;
        if index > current {
            self.sequence_cursor.clear();
        }
        debug!(index, update_active, "IV index set");
        Ok(())
    }

    /// Allocate `count` consecutive sequence numbers for the node owning
    /// `src` and return the first.
    ///
    /// Numbers are strictly increasing per node and never handed out twice.
    /// The node's persisted `sequence_number` is a reservation ahead of the
    /// numbers in use, raised in blocks of [`SEQUENCE_RESERVATION`]; a model
    /// restored from a snapshot resumes after the reservation.
    pub fn allocate_sequence(&mut self, src: u16, count: u32) -> Result<u32, ModelError> {
        let node = self.node_by_address(src).ok_or(ModelError::UnknownAddress(src))?;
        let uuid = node.uuid;
        let reserved = node.sequence_number;
        let start = self.sequence_cursor.get(&uuid).copied().unwrap_or(reserved);
        let end = start + count.max(1);
        if end - 1 > MAX_SEQUENCE_NUMBER {
            return Err(ModelError::SequenceExhausted(src));
        }

        if end > reserved {
            let mark = (end + SEQUENCE_RESERVATION).min(MAX_SEQUENCE_NUMBER + 1);
            if let Some(node) = self.state.nodes.iter_mut().find(|n| n.uuid == uuid) {
                node.sequence_number = mark;
            }
            trace!(src, mark, "sequence reservation raised");
            self.observers.dispatch(&[NetworkEvent::NetworkUpdated]);
        }
        self.sequence_cursor.insert(uuid, end);
        Ok(start)
    }

    /// Encode the state as CBOR.
    pub fn to_snapshot_bytes(&self) -> Result<Vec<u8>, ModelError> {
        let mut out = Vec::new();
        ciborium::into_writer(&self.state, &mut out)
            .map_err(|err| ModelError::Snapshot(err.to_string()))?;
        Ok(out)
    }

    /// Restore a network from [`MeshNetwork::to_snapshot_bytes`] output.
    pub fn from_snapshot_bytes(bytes: &[u8]) -> Result<Self, ModelError> {
        let state: NetworkState =
            ciborium::from_reader(bytes).map_err(|err| ModelError::Snapshot(err.to_string()))?;
        Self::from_state(state)
    }

    /// Nodes whose keys count as "in use": all but the selected
    /// provisioner's own node.
    fn foreign_nodes(&self) -> impl Iterator<Item = &Node> {
        let own = self.state.selected_provisioner;
        self.state.nodes.iter().filter(move |node| Some(node.uuid) != own)
    }

    /// Check `next`, make it current and notify observers.
    fn commit(&mut self, next: NetworkState, events: Vec<NetworkEvent>) -> Result<(), ModelError> {
        next.check_invariants()?;
        self.state = next;
        trace!(events = events.len(), "model change committed");
        self.observers.dispatch(&events);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::sync::Arc;

    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

    use super::*;
    use crate::env::SystemEnv;

    pub(crate) fn timestamp() -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00+01:00").unwrap()
    }

    /// A network with one provisioner at 0x0001 and one network key.
    pub(crate) fn network() -> MeshNetwork {
        let mut network = MeshNetwork::new("fixture", timestamp(), &SystemEnv);
        network.create_provisioner("provisioner", &SystemEnv).unwrap();
        network.create_network_key(&SystemEnv).unwrap();
        network
    }

    pub(crate) fn node(id: u128, address: u16, elements: u8) -> Node {
        Node::new(Uuid::from_u128(id), format!("node {id}"), address, elements)
    }

    pub(crate) fn subscribe(network: &mut MeshNetwork) -> UnboundedReceiver<NetworkEvent> {
        let (tx, rx) = unbounded_channel();
        network.subscribe(Arc::new(tx));
        rx
    }

    pub(crate) fn drain(rx: &mut UnboundedReceiver<NetworkEvent>) -> Vec<NetworkEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{fixtures::*, *};

    #[test]
    fn sequence_numbers_increase_per_source() {
        let mut network = network();
        assert_eq!(network.allocate_sequence(0x0001, 1).unwrap(), 0);
        assert_eq!(network.allocate_sequence(0x0001, 3).unwrap(), 1);
        assert_eq!(network.allocate_sequence(0x0001, 1).unwrap(), 4);
        assert_eq!(
            network.allocate_sequence(0x0100, 1),
            Err(ModelError::UnknownAddress(0x0100))
        );
    }

    #[test]
    fn restored_network_continues_after_reservation() {
        let mut network = network();
        network.allocate_sequence(0x0001, 10).unwrap();
        let reserved = network.node_by_address(0x0001).unwrap().sequence_number;
        assert!(reserved >= 10);

        let mut restored = MeshNetwork::from_snapshot_bytes(&network.to_snapshot_bytes().unwrap()).unwrap();
        assert_eq!(restored.state(), network.state());
        assert_eq!(restored.allocate_sequence(0x0001, 1).unwrap(), reserved);
    }

    #[test]
    fn iv_index_increase_restarts_sequence_numbers() {
        let mut network = network();
        network.allocate_sequence(0x0001, 100).unwrap();
        network.set_iv_index(1, true).unwrap();
        assert_eq!(network.iv_index().transmit_index(), 0);
        assert_eq!(network.allocate_sequence(0x0001, 1).unwrap(), 0);

        assert_eq!(
            network.set_iv_index(0, false),
            Err(ModelError::InvalidIvIndex { current: 1, requested: 0 })
        );
    }

    #[test]
    fn from_state_rejects_broken_invariants() {
        let network = network();
        let mut state = network.state().clone();
        let index = state.net_keys[0].index;
        state.net_keys.push(NetworkKey::new(index, [0x42; 16], timestamp()));
        assert_eq!(MeshNetwork::from_state(state).unwrap_err(), ModelError::DuplicateKeyIndex(index));
    }

    #[test]
    fn lone_provisioner_is_selected_on_load() {
        let network = network();
        let mut state = network.state().clone();
        state.selected_provisioner = None;
        let loaded = MeshNetwork::from_state(state).unwrap();
        assert_eq!(loaded.selected_provisioner().map(|p| p.uuid), Some(network.provisioners()[0].uuid));
    }

    #[test]
    fn rename_notifies_observers() {
        let mut network = network();
        let mut events = subscribe(&mut network);
        network.set_mesh_name("renamed").unwrap();
        assert_eq!(network.mesh_name(), "renamed");
        assert_eq!(drain(&mut events), vec![NetworkEvent::NetworkUpdated]);
    }
}
