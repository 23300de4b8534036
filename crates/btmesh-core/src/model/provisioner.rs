//! Provisioners and their allocated ranges.

use btmesh_proto::network::is_valid_ttl;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::{
    MeshNetwork, NetworkEvent, NetworkState, Node,
    range::{AddressRange, RangeKind, first_free_range, is_address_in_ranges, normalize},
};
use crate::{
    env::{Environment, random_uuid},
    error::ModelError,
};

/// Default TTL for messages a provisioner sends.
pub const DEFAULT_GLOBAL_TTL: u8 = 5;

/// A provisioner: an administrator of the network with its own address
/// ranges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provisioner {
    /// Provisioner UUID (also the UUID of its own node)
    pub uuid: Uuid,
    /// Display name
    pub name: String,
    /// Unicast ranges, normalized
    pub unicast_ranges: Vec<AddressRange>,
    /// Group ranges, normalized
    pub group_ranges: Vec<AddressRange>,
    /// Scene ranges, normalized
    pub scene_ranges: Vec<AddressRange>,
    /// Unicast address of the provisioner's own node, if it has one
    pub address: Option<u16>,
    /// TTL used for messages this provisioner sends
    pub global_ttl: u8,
    /// Sequence reservation held while there is no shadow node to carry it
    #[serde(default)]
    pub sequence_number: u32,
}

impl Provisioner {
    /// Build a provisioner without an address. Ranges are normalized.
    pub fn new(
        uuid: Uuid,
        name: impl Into<String>,
        unicast_ranges: Vec<AddressRange>,
        group_ranges: Vec<AddressRange>,
        scene_ranges: Vec<AddressRange>,
    ) -> Self {
        Self {
            uuid,
            name: name.into(),
            unicast_ranges: normalize(unicast_ranges),
            group_ranges: normalize(group_ranges),
            scene_ranges: normalize(scene_ranges),
            address: None,
            global_ttl: DEFAULT_GLOBAL_TTL,
            sequence_number: 0,
        }
    }

    /// Ranges of the given kind.
    pub fn ranges(&self, kind: RangeKind) -> &[AddressRange] {
        match kind {
            RangeKind::Unicast => &self.unicast_ranges,
            RangeKind::Group => &self.group_ranges,
            RangeKind::Scene => &self.scene_ranges,
        }
    }

    /// First range kind in which `self` overlaps `other`.
    pub fn overlapping_kind(&self, other: &Self) -> Option<RangeKind> {
        [RangeKind::Unicast, RangeKind::Group, RangeKind::Scene].into_iter().find(|&kind| {
            super::range::ranges_overlap(self.ranges(kind), other.ranges(kind))
        })
    }

    /// True if `address` is inside this provisioner's unicast ranges.
    pub fn owns_unicast(&self, address: u16) -> bool {
        is_address_in_ranges(address, &self.unicast_ranges)
    }

    fn normalized(mut self) -> Self {
        self.unicast_ranges = normalize(self.unicast_ranges);
        self.group_ranges = normalize(self.group_ranges);
        self.scene_ranges = normalize(self.scene_ranges);
        self
    }
}

impl NetworkState {
    /// Keep the shadow node of `provisioner` in line with its address, name
    /// and TTL.
    ///
    /// The sequence reservation moves between the provisioner and its shadow
    /// node, so a provisioner that loses and regains an address resumes
    /// where it left off.
    fn sync_shadow_node(&mut self, provisioner: &mut Provisioner, events: &mut Vec<NetworkEvent>) {
        let existing = self.nodes.iter().position(|node| node.uuid == provisioner.uuid);
        match (provisioner.address, existing) {
            (Some(address), Some(position)) => {
                let node = &mut self.nodes[position];
                node.sequence_number = node.sequence_number.max(provisioner.sequence_number);
                provisioner.sequence_number = 0;
                let ttl = Some(provisioner.global_ttl);
                if node.unicast_address != address || node.name != provisioner.name || node.ttl != ttl
                {
                    node.unicast_address = address;
                    node.name.clone_from(&provisioner.name);
                    node.ttl = ttl;
                    events.push(NetworkEvent::NodeUpdated(provisioner.uuid));
                }
            },
            (Some(address), None) => {
                let mut node = Node::new(provisioner.uuid, provisioner.name.clone(), address, 1);
                node.net_keys = self.net_keys.iter().map(|key| key.index).collect();
                node.app_keys = self.app_keys.iter().map(|key| key.index).collect();
                node.config_complete = true;
                node.ttl = Some(provisioner.global_ttl);
                node.sequence_number = std::mem::take(&mut provisioner.sequence_number);
                self.nodes.push(node);
                events.push(NetworkEvent::NodeAdded(provisioner.uuid));
            },
            (None, Some(position)) => {
                let node = self.nodes.remove(position);
                provisioner.sequence_number = provisioner.sequence_number.max(node.sequence_number);
                events.push(NetworkEvent::NodeDeleted {
                    node: node.uuid,
                    device: super::DeviceState::StillConfigured,
                });
            },
            (None, None) => {},
        }
    }

    /// Select the only provisioner, or clear a stale selection.
    ///
    /// Returns true if the selection changed.
    pub(super) fn normalize_selection(&mut self) -> bool {
        let before = self.selected_provisioner;
        let stale = self
            .selected_provisioner
            .is_some_and(|uuid| !self.provisioners.iter().any(|p| p.uuid == uuid));
        if stale {
            self.selected_provisioner = None;
        }
        if self.provisioners.len() == 1 {
            self.selected_provisioner = Some(self.provisioners[0].uuid);
        }
        before != self.selected_provisioner
    }
}

impl MeshNetwork {
    /// Provisioners in insertion order.
    pub fn provisioners(&self) -> &[Provisioner] {
        &self.state.provisioners
    }

    /// Provisioner by UUID.
    pub fn provisioner(&self, uuid: Uuid) -> Option<&Provisioner> {
        self.state.provisioners.iter().find(|p| p.uuid == uuid)
    }

    /// The selected provisioner, which drives configuration.
    pub fn selected_provisioner(&self) -> Option<&Provisioner> {
        self.state.selected_provisioner.and_then(|uuid| self.provisioner(uuid))
    }

    /// Build a provisioner with default-sized ranges placed in the first
    /// free space, and an address at the start of its unicast range.
    ///
    /// Ranges are 0x1000 unicast addresses, 0x100 group addresses and
    /// 0x1000 scene numbers; smaller when the address space is crowded.
    pub fn create_provisioner<E: Environment>(
        &mut self,
        name: impl Into<String>,
        env: &E,
    ) -> Result<Provisioner, ModelError> {
        let allocate = |kind: RangeKind| {
            let taken: Vec<AddressRange> = self
                .state
                .provisioners
                .iter()
                .flat_map(|p| p.ranges(kind).iter().copied())
                .collect();
            first_free_range(&taken, kind.domain(), kind.default_size())
                .ok_or(ModelError::AddressSpaceExhausted(kind))
        };
        let unicast = allocate(RangeKind::Unicast)?;
        let group = allocate(RangeKind::Group)?;
        let scene = allocate(RangeKind::Scene)?;

        let mut provisioner =
            Provisioner::new(random_uuid(env), name, vec![unicast], vec![group], vec![scene]);
        provisioner.address = (unicast.low..=unicast.high)
            .find(|&address| !self.is_address_in_use(address));
        self.add_provisioner(provisioner.clone())?;
        Ok(provisioner)
    }

    /// Add a provisioner.
    ///
    /// Its ranges must not overlap any other provisioner's, and its address
    /// (if any) must lie in its own unicast ranges and be unused. A
    /// provisioner with an address gets a shadow node holding every key.
    pub fn add_provisioner(&mut self, provisioner: Provisioner) -> Result<(), ModelError> {
        if self.provisioner(provisioner.uuid).is_some() {
            return Err(ModelError::ProvisionerExists(provisioner.uuid));
        }
        if self.node(provisioner.uuid).is_some() {
            return Err(ModelError::NodeExists(provisioner.uuid));
        }
        let mut provisioner = provisioner.normalized();
        self.validate_provisioner(&provisioner)?;

        let uuid = provisioner.uuid;
        let mut next = self.state.clone();
        let mut events = vec![NetworkEvent::ProvisionerAdded(uuid)];
        next.sync_shadow_node(&mut provisioner, &mut events);
        next.provisioners.push(provisioner);
        let selection_changed = next.normalize_selection();
        if selection_changed {
            events.push(next.provisioners_updated());
        }
        self.commit(next, events)?;
        debug!(%uuid, "provisioner added");
        Ok(())
    }

    /// Replace a provisioner, re-validating ranges and address against every
    /// other provisioner and every node. The shadow node follows the address.
    pub fn update_provisioner(&mut self, provisioner: Provisioner) -> Result<(), ModelError> {
        let reserved = self
            .provisioner(provisioner.uuid)
            .map(|p| p.sequence_number)
            .ok_or(ModelError::ProvisionerNotFound(provisioner.uuid))?;
        let mut provisioner = provisioner.normalized();
        provisioner.sequence_number = provisioner.sequence_number.max(reserved);
        self.validate_provisioner(&provisioner)?;

        let uuid = provisioner.uuid;
        let mut next = self.state.clone();
        let mut events = vec![NetworkEvent::ProvisionerUpdated(uuid)];
        next.sync_shadow_node(&mut provisioner, &mut events);
        if let Some(slot) = next.provisioners.iter_mut().find(|p| p.uuid == uuid) {
            *slot = provisioner;
        }
        self.commit(next, events)?;
        debug!(%uuid, "provisioner updated");
        Ok(())
    }

    /// Remove a provisioner together with its shadow node.
    pub fn remove_provisioner(&mut self, uuid: Uuid) -> Result<Provisioner, ModelError> {
        let provisioner =
            self.provisioner(uuid).cloned().ok_or(ModelError::ProvisionerNotFound(uuid))?;

        let mut next = self.state.clone();
        let mut events = vec![NetworkEvent::ProvisionerDeleted(uuid)];
        next.provisioners.retain(|p| p.uuid != uuid);
        let mut cleared = Provisioner { address: None, ..provisioner.clone() };
        next.sync_shadow_node(&mut cleared, &mut events);
        if next.normalize_selection() {
            events.push(next.provisioners_updated());
        }
        self.commit(next, events)?;
        debug!(%uuid, "provisioner removed");
        Ok(provisioner)
    }

    /// Make `uuid` the selected provisioner.
    ///
    /// Observers receive the full provisioner list when the selection
    /// changes. Selecting the already selected provisioner is a no-op.
    pub fn select_provisioner(&mut self, uuid: Uuid) -> Result<(), ModelError> {
        if self.provisioner(uuid).is_none() {
            return Err(ModelError::ProvisionerNotFound(uuid));
        }
        if self.state.selected_provisioner == Some(uuid) {
            return Ok(());
        }
        let mut next = self.state.clone();
        next.selected_provisioner = Some(uuid);
        let event = next.provisioners_updated();
        self.commit(next, vec![event])?;
        debug!(%uuid, "provisioner selected");
        Ok(())
    }

    /// Drop the provisioner's address and shadow node. It keeps its ranges
    /// but can no longer configure nodes.
    pub fn disable_configuration_capabilities(&mut self, uuid: Uuid) -> Result<(), ModelError> {
        let provisioner =
            self.provisioner(uuid).cloned().ok_or(ModelError::ProvisionerNotFound(uuid))?;
        self.update_provisioner(Provisioner { address: None, ..provisioner })
    }

    /// Set the TTL a provisioner uses. TTL 1 and values above 127 are invalid.
    pub fn set_global_ttl(&mut self, uuid: Uuid, ttl: u8) -> Result<(), ModelError> {
        if !is_valid_ttl(ttl) {
            return Err(ModelError::InvalidTtl(ttl));
        }
        let provisioner =
            self.provisioner(uuid).cloned().ok_or(ModelError::ProvisionerNotFound(uuid))?;
        self.update_provisioner(Provisioner { global_ttl: ttl, ..provisioner })
    }

    fn validate_provisioner(&self, candidate: &Provisioner) -> Result<(), ModelError> {
        for kind in [RangeKind::Unicast, RangeKind::Group, RangeKind::Scene] {
            for range in candidate.ranges(kind) {
                kind.validate(range)?;
            }
        }
        for other in self.state.provisioners.iter().filter(|p| p.uuid != candidate.uuid) {
            if let Some(kind) = candidate.overlapping_kind(other) {
                return Err(ModelError::RangeOverlap { kind, other: other.uuid });
            }
        }
        if let Some(address) = candidate.address {
            if !candidate.owns_unicast(address) {
                return Err(ModelError::AddressOutOfRange { kind: "provisioner", address });
            }
            let taken = self.state.nodes.iter().any(|node| {
                node.uuid != candidate.uuid && node.element_range().contains(address)
            });
            if taken {
                return Err(ModelError::AddressInUse(address));
            }
        }
        if !is_valid_ttl(candidate.global_ttl) {
            return Err(ModelError::InvalidTtl(candidate.global_ttl));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        env::SystemEnv,
        model::{
            DeviceState,
            fixtures::{drain, network, node, subscribe},
        },
    };

    fn provisioner(id: u128, unicast: AddressRange) -> Provisioner {
        Provisioner::new(
            Uuid::from_u128(id),
            format!("provisioner {id}"),
            vec![unicast],
            vec![AddressRange::new(0xD000 + id as u16 * 0x10, 0xD00F + id as u16 * 0x10)],
            vec![AddressRange::new(0x2000 + id as u16 * 0x10, 0x200F + id as u16 * 0x10)],
        )
    }

    #[test]
    fn single_address_overlap_is_rejected() {
        let mut network = network();
        let first_high = network.provisioners()[0].unicast_ranges[0].high;

        let overlapping = provisioner(1, AddressRange::new(first_high, first_high + 0x100));
        assert!(matches!(
            network.add_provisioner(overlapping),
            Err(ModelError::RangeOverlap { kind: RangeKind::Unicast, .. })
        ));

        let adjacent = provisioner(2, AddressRange::new(first_high + 1, first_high + 0x100));
        network.add_provisioner(adjacent).unwrap();
        assert_eq!(network.provisioners().len(), 2);
    }

    #[test]
    fn created_provisioners_get_disjoint_ranges() {
        let mut network = network();
        let second = network.create_provisioner("second", &SystemEnv).unwrap();
        let first = &network.provisioners()[0];
        assert_eq!(first.overlapping_kind(&second), None);
        assert_eq!(second.address, Some(second.unicast_ranges[0].low));
        assert!(network.node(second.uuid).is_some());
    }

    #[test]
    fn select_provisioner_is_idempotent() {
        let mut network = network();
        let first = network.provisioners()[0].uuid;
        let second = network.create_provisioner("second", &SystemEnv).unwrap().uuid;
        assert_eq!(network.selected_provisioner().map(|p| p.uuid), Some(first));

        let mut events = subscribe(&mut network);
        network.select_provisioner(first).unwrap();
        assert!(drain(&mut events).is_empty());

        network.select_provisioner(second).unwrap();
        assert_eq!(network.selected_provisioner().map(|p| p.uuid), Some(second));
        match drain(&mut events).as_slice() {
            [NetworkEvent::ProvisionersUpdated { provisioners, selected }] => {
                assert_eq!(provisioners.len(), 2);
                assert_eq!(*selected, Some(second));
            },
            other => panic!("unexpected events {other:?}"),
        }

        assert_eq!(
            network.select_provisioner(Uuid::from_u128(99)),
            Err(ModelError::ProvisionerNotFound(Uuid::from_u128(99)))
        );
    }

    #[test]
    fn removing_provisioner_removes_shadow_node() {
        let mut network = network();
        let second = network.create_provisioner("second", &SystemEnv).unwrap();
        let mut events = subscribe(&mut network);
        network.remove_provisioner(second.uuid).unwrap();

        assert!(network.node(second.uuid).is_none());
        assert_eq!(
            drain(&mut events),
            vec![
                NetworkEvent::ProvisionerDeleted(second.uuid),
                NetworkEvent::NodeDeleted {
                    node: second.uuid,
                    device: DeviceState::StillConfigured
                },
            ]
        );
    }

    #[test]
    fn address_must_be_owned_and_free() {
        let mut network = network();
        network.add_node(node(5, 0x3000, 2)).unwrap();
        let before = network.state().clone();

        let mut outside = provisioner(1, AddressRange::new(0x3000, 0x30FF));
        outside.address = Some(0x4000);
        assert_eq!(
            network.add_provisioner(outside.clone()),
            Err(ModelError::AddressOutOfRange { kind: "provisioner", address: 0x4000 })
        );

        outside.address = Some(0x3001);
        assert_eq!(network.add_provisioner(outside), Err(ModelError::AddressInUse(0x3001)));
        assert_eq!(network.state(), &before);
    }

    #[test]
    fn configuration_capabilities_can_be_dropped() {
        let mut network = network();
        let uuid = network.provisioners()[0].uuid;
        network.disable_configuration_capabilities(uuid).unwrap();
        assert_eq!(network.provisioner(uuid).unwrap().address, None);
        assert!(network.node(uuid).is_none());
    }

    #[test]
    fn global_ttl_is_validated() {
        let mut network = network();
        let uuid = network.provisioners()[0].uuid;
        assert_eq!(network.set_global_ttl(uuid, 1), Err(ModelError::InvalidTtl(1)));
        assert_eq!(network.set_global_ttl(uuid, 128), Err(ModelError::InvalidTtl(128)));
        network.set_global_ttl(uuid, 0).unwrap();
        network.set_global_ttl(uuid, 10).unwrap();
        assert_eq!(network.provisioner(uuid).unwrap().global_ttl, 10);
    }

    #[test]
    fn readdressed_provisioner_resumes_its_sequence() {
        let mut network = network();
        let provisioner = network.provisioners()[0].clone();
        let address = provisioner.address.unwrap();
        let first = network.allocate_sequence(address, 1).unwrap();

        network.disable_configuration_capabilities(provisioner.uuid).unwrap();
        assert!(network.provisioner(provisioner.uuid).unwrap().sequence_number > first);

        let mut restored = MeshNetwork::from_json(&network.to_json().unwrap()).unwrap();
        restored.update_provisioner(provisioner).unwrap();
        assert!(restored.allocate_sequence(address, 1).unwrap() > first);
    }
}
