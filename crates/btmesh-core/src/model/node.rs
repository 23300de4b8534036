//! Provisioned nodes.

use std::collections::BTreeSet;

use btmesh_crypto::Key;
use btmesh_proto::{CompositionData, address::MAX_UNICAST_ADDRESS};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::{KeyIndex, MeshNetwork, NetworkEvent, range::AddressRange};
use crate::error::ModelError;

/// What happened to the physical device when its node record was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    /// The device was not touched and still holds its keys. It must be reset
    /// separately (or blacklisted through a key refresh).
    StillConfigured,
    /// The caller reset the device before the record was removed.
    Reset,
}

/// A removed node and the state its device was left in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedNode {
    /// The removed record
    pub node: Node,
    /// Device state
    pub device: DeviceState,
}

/// A provisioned node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Device UUID
    pub uuid: Uuid,
    /// Display name
    pub name: String,
    /// Address of the primary element
    pub unicast_address: u16,
    /// Device key; provisioner shadow nodes have none
    pub device_key: Option<Key>,
    /// Number of elements, each with its own consecutive address
    pub element_count: u8,
    /// Network keys known to have been added to the node
    pub net_keys: BTreeSet<KeyIndex>,
    /// Application keys known to have been added to the node
    pub app_keys: BTreeSet<KeyIndex>,
    /// Sequence number high-water mark reserved for this node as a source
    pub sequence_number: u32,
    /// Configuration finished
    pub config_complete: bool,
    /// Excluded from the network by a key refresh
    pub excluded: bool,
    /// Default TTL, if known
    pub ttl: Option<u8>,
    /// Composition Data page 0, if fetched
    pub composition: Option<CompositionData>,
}

impl Node {
    /// A node with no keys added yet.
    pub fn new(uuid: Uuid, name: impl Into<String>, unicast_address: u16, element_count: u8) -> Self {
        Self {
            uuid,
            name: name.into(),
            unicast_address,
            device_key: None,
            element_count,
            net_keys: BTreeSet::new(),
            app_keys: BTreeSet::new(),
            sequence_number: 0,
            config_complete: false,
            excluded: false,
            ttl: None,
            composition: None,
        }
    }

    /// Addresses occupied by the node's elements.
    pub fn element_range(&self) -> AddressRange {
        let last = u32::from(self.unicast_address) + u32::from(self.element_count.max(1)) - 1;
        AddressRange::new(self.unicast_address, last.min(u32::from(u16::MAX)) as u16)
    }

    /// Last element address, as a wider integer so it can exceed the unicast
    /// range without wrapping.
    pub(super) fn last_element(&self) -> u32 {
        u32::from(self.unicast_address) + u32::from(self.element_count) - 1
    }

    /// True if the element range lies entirely in the unicast domain.
    pub(super) fn has_valid_elements(&self) -> bool {
        self.element_count > 0
            && self.unicast_address != 0
            && self.last_element() <= u32::from(MAX_UNICAST_ADDRESS)
    }
}

impl MeshNetwork {
    /// All nodes, including provisioners' shadow nodes.
    pub fn nodes(&self) -> &[Node] {
        &self.state.nodes
    }

    /// Node by UUID.
    pub fn node(&self, uuid: Uuid) -> Option<&Node> {
        self.state.nodes.iter().find(|node| node.uuid == uuid)
    }

    /// Node owning the element with `address`.
    pub fn node_by_address(&self, address: u16) -> Option<&Node> {
        self.state.nodes.iter().find(|node| node.element_range().contains(address))
    }

    /// Add a node.
    ///
    /// Its elements must not collide with another node or a provisioner's
    /// address, and the keys it lists must exist. The unicast cursor moves
    /// past the node.
    pub fn add_node(&mut self, node: Node) -> Result<(), ModelError> {
        if self.node(node.uuid).is_some() {
            return Err(ModelError::NodeExists(node.uuid));
        }
        if self.provisioner(node.uuid).is_some() {
            return Err(ModelError::ProvisionerNode(node.uuid));
        }
        self.validate_node(&node)?;

        let uuid = node.uuid;
        let mut next = self.state.clone();
        let after = node.last_element() + 1;
        if after <= u32::from(u16::MAX) {
            next.next_unicast = next.next_unicast.max(after as u16);
        }
        next.nodes.push(node);
        self.commit(next, vec![NetworkEvent::NodeAdded(uuid)])?;
        debug!(%uuid, "node added");
        Ok(())
    }

    /// Replace a node record with the same UUID.
    ///
    /// The stored sequence reservation is kept if it is higher than the one
    /// in `node`, so writing back an older copy never lowers it.
    pub fn update_node(&mut self, mut node: Node) -> Result<(), ModelError> {
        let reserved = self
            .node(node.uuid)
            .map(|n| n.sequence_number)
            .ok_or(ModelError::NodeNotFound(node.uuid))?;
        node.sequence_number = node.sequence_number.max(reserved);
        if self.provisioner(node.uuid).is_some_and(|p| p.address != Some(node.unicast_address)) {
            return Err(ModelError::ProvisionerNode(node.uuid));
        }
        self.validate_node(&node)?;

        let uuid = node.uuid;
        let mut next = self.state.clone();
        if let Some(slot) = next.nodes.iter_mut().find(|n| n.uuid == uuid) {
            *slot = node;
        }
        self.commit(next, vec![NetworkEvent::NodeUpdated(uuid)])?;
        debug!(%uuid, "node updated");
        Ok(())
    }

    /// Remove a node record.
    ///
    /// The physical device is not contacted and keeps its configuration, so
    /// it can still talk on the network until it is reset or excluded. Use
    /// [`MeshNetwork::forget_reset_node`] after resetting the device.
    pub fn remove_node(&mut self, uuid: Uuid) -> Result<RemovedNode, ModelError> {
        self.remove_node_with(uuid, DeviceState::StillConfigured)
    }

    /// Remove the record of a node whose device the caller has already reset
    /// (for example after a Config Node Reset Status).
    pub fn forget_reset_node(&mut self, uuid: Uuid) -> Result<RemovedNode, ModelError> {
        self.remove_node_with(uuid, DeviceState::Reset)
    }

    fn remove_node_with(
        &mut self,
        uuid: Uuid,
        device: DeviceState,
    ) -> Result<RemovedNode, ModelError> {
        let node = self.node(uuid).cloned().ok_or(ModelError::NodeNotFound(uuid))?;
        if self.provisioner(uuid).is_some() {
            return Err(ModelError::ProvisionerNode(uuid));
        }

        let elements = node.element_range();
        let mut next = self.state.clone();
        let mut events = vec![NetworkEvent::NodeDeleted { node: uuid, device }];
        next.nodes.retain(|n| n.uuid != uuid);
        for scene in &mut next.scenes {
            let before = scene.addresses.len();
            scene.addresses.retain(|&address| !elements.contains(address));
            if scene.addresses.len() != before {
                events.push(NetworkEvent::SceneUpdated(scene.number));
            }
        }
        self.commit(next, events)?;
        self.sequence_cursor.remove(&uuid);
        debug!(%uuid, ?device, "node removed");
        Ok(RemovedNode { node, device })
    }

    fn validate_node(&self, node: &Node) -> Result<(), ModelError> {
        if !node.has_valid_elements() {
            return Err(ModelError::AddressOutOfRange { kind: "node", address: node.unicast_address });
        }
        let range = node.element_range();
        for other in self.state.nodes.iter().filter(|n| n.uuid != node.uuid) {
            let theirs = other.element_range();
            if range.overlaps(&theirs) {
                return Err(ModelError::AddressInUse(range.low.max(theirs.low)));
            }
        }
        for provisioner in self.state.provisioners.iter().filter(|p| p.uuid != node.uuid) {
            if let Some(address) = provisioner.address.filter(|&a| range.contains(a)) {
                return Err(ModelError::AddressInUse(address));
            }
        }
        if let Some(&index) = node.net_keys.iter().find(|&&i| self.net_key(i).is_none()) {
            return Err(ModelError::KeyNotFound(index));
        }
        if let Some(&index) = node.app_keys.iter().find(|&&i| self.app_key(i).is_none()) {
            return Err(ModelError::KeyNotFound(index));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Scene,
        fixtures::{drain, network, node, subscribe},
    };

    #[test]
    fn element_ranges_must_not_collide() {
        let mut network = network();
        network.add_node(node(1, 0x0010, 3)).unwrap();
        assert_eq!(network.add_node(node(2, 0x000E, 3)), Err(ModelError::AddressInUse(0x0010)));
        assert_eq!(network.add_node(node(3, 0x0001, 1)), Err(ModelError::AddressInUse(0x0001)));
        assert_eq!(
            network.add_node(node(4, 0x7FFF, 2)),
            Err(ModelError::AddressOutOfRange { kind: "node", address: 0x7FFF })
        );
        assert_eq!(network.add_node(node(1, 0x0100, 1)), Err(ModelError::NodeExists(Uuid::from_u128(1))));
        network.add_node(node(5, 0x0013, 1)).unwrap();
        assert_eq!(network.node_by_address(0x0012).map(|n| n.uuid), Some(Uuid::from_u128(1)));
    }

    #[test]
    fn node_keys_must_exist() {
        let mut network = network();
        let mut device = node(1, 0x0010, 1);
        device.app_keys.insert(3);
        assert_eq!(network.add_node(device), Err(ModelError::KeyNotFound(3)));
    }

    #[test]
    fn remove_leaves_device_configured() {
        let mut network = network();
        network.add_node(node(1, 0x0010, 2)).unwrap();
        let mut scene = Scene::new(1, "evening");
        scene.addresses = vec![0x0011, 0x0001];
        network.add_scene(scene).unwrap();

        let mut events = subscribe(&mut network);
        let removed = network.remove_node(Uuid::from_u128(1)).unwrap();
        assert_eq!(removed.device, DeviceState::StillConfigured);
        assert_eq!(network.scene(1).unwrap().addresses, vec![0x0001]);
        assert_eq!(
            drain(&mut events),
            vec![
                NetworkEvent::NodeDeleted {
                    node: Uuid::from_u128(1),
                    device: DeviceState::StillConfigured
                },
                NetworkEvent::SceneUpdated(1),
            ]
        );
    }

    #[test]
    fn forget_reset_node_reports_reset_device() {
        let mut network = network();
        network.add_node(node(1, 0x0010, 1)).unwrap();
        assert_eq!(network.forget_reset_node(Uuid::from_u128(1)).unwrap().device, DeviceState::Reset);
        assert_eq!(
            network.forget_reset_node(Uuid::from_u128(1)),
            Err(ModelError::NodeNotFound(Uuid::from_u128(1)))
        );
    }

    #[test]
    fn provisioner_node_is_managed_through_provisioner() {
        let mut network = network();
        let uuid = network.provisioners()[0].uuid;
        assert_eq!(network.remove_node(uuid), Err(ModelError::ProvisionerNode(uuid)));

        let mut moved = network.node(uuid).cloned().unwrap();
        moved.unicast_address = 0x0005;
        assert_eq!(network.update_node(moved), Err(ModelError::ProvisionerNode(uuid)));
    }

    #[test]
    fn update_node_revalidates() {
        let mut network = network();
        network.add_node(node(1, 0x0010, 1)).unwrap();
        network.add_node(node(2, 0x0020, 1)).unwrap();

        let mut device = network.node(Uuid::from_u128(1)).cloned().unwrap();
        device.name = "lamp".into();
        network.update_node(device.clone()).unwrap();
        assert_eq!(network.node(Uuid::from_u128(1)).unwrap().name, "lamp");

        device.unicast_address = 0x0020;
        assert_eq!(network.update_node(device), Err(ModelError::AddressInUse(0x0020)));
    }

    #[test]
    fn stale_copy_keeps_sequence_reservation() {
        let mut network = network();
        network.add_node(node(1, 0x0010, 1)).unwrap();
        let stale = network.node(Uuid::from_u128(1)).cloned().unwrap();
        let first = network.allocate_sequence(0x0010, 1).unwrap();

        let mut renamed = stale;
        renamed.name = "lamp".into();
        network.update_node(renamed).unwrap();
        assert!(network.node(Uuid::from_u128(1)).unwrap().sequence_number > first);

        let mut restored = MeshNetwork::from_json(&network.to_json().unwrap()).unwrap();
        assert!(restored.allocate_sequence(0x0010, 1).unwrap() > first);
    }
}
