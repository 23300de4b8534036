//! Address and scene number allocation.
//!
//! Unicast addresses are handed out from a monotonic cursor inside the
//! selected provisioner's unicast ranges. Removing a node does not move the
//! cursor back; a freed address is only reused when the caller asks for it
//! explicitly with [`MeshNetwork::assign_unicast_address`].

use btmesh_proto::address::is_unicast;
use tracing::debug;

use super::{
    MeshNetwork, NetworkEvent,
    range::{AddressRange, RangeKind},
};
use crate::error::ModelError;

impl MeshNetwork {
    /// True if `address` is an element of some node or a provisioner's
    /// address.
    pub fn is_address_in_use(&self, address: u16) -> bool {
        self.state.nodes.iter().any(|node| node.element_range().contains(address))
            || self.state.provisioners.iter().any(|p| p.address == Some(address))
    }

    /// The unicast allocation cursor.
    pub fn next_unicast_cursor(&self) -> u16 {
        self.state.next_unicast
    }

    /// First address at or after the cursor, inside the selected
    /// provisioner's unicast ranges, with room for `element_count`
    /// consecutive free addresses.
    pub fn next_available_unicast(&self, element_count: u8) -> Result<u16, ModelError> {
        let provisioner = self.selected_provisioner().ok_or(ModelError::NoProvisionerSelected)?;
        let count = u32::from(element_count.max(1));

        let mut occupied: Vec<AddressRange> =
            self.state.nodes.iter().map(|node| node.element_range()).collect();
        occupied.extend(
            self.state.provisioners.iter().filter_map(|p| p.address).map(|a| AddressRange::new(a, a)),
        );

        for range in &provisioner.unicast_ranges {
            let mut start = u32::from(range.low.max(self.state.next_unicast));
            while start + count - 1 <= u32::from(range.high) {
                let candidate = AddressRange::new(start as u16, (start + count - 1) as u16);
                match occupied.iter().filter(|o| o.overlaps(&candidate)).map(|o| o.high).max() {
                    Some(high) => start = u32::from(high) + 1,
                    None => return Ok(candidate.low),
                }
            }
        }
        Err(ModelError::AddressSpaceExhausted(RangeKind::Unicast))
    }

    /// Point the unicast cursor at `address` after checking that
    /// `element_count` addresses from there are unicast and free.
    pub fn assign_unicast_address(
        &mut self,
        address: u16,
        element_count: u8,
    ) -> Result<(), ModelError> {
        let last = u32::from(address) + u32::from(element_count.max(1)) - 1;
        if !is_unicast(address) || last > u32::from(btmesh_proto::address::MAX_UNICAST_ADDRESS) {
            return Err(ModelError::AddressOutOfRange { kind: "unicast", address });
        }
        if let Some(taken) = (u32::from(address)..=last).find(|&a| self.is_address_in_use(a as u16)) {
            return Err(ModelError::AddressInUse(taken as u16));
        }

        let mut next = self.state.clone();
        next.next_unicast = address;
        self.commit(next, vec![NetworkEvent::NetworkUpdated])?;
        debug!(address, "unicast cursor assigned");
        Ok(())
    }

    /// First group address in the selected provisioner's group ranges not
    /// used by a group.
    pub fn next_available_group_address(&self) -> Result<u16, ModelError> {
        let provisioner = self.selected_provisioner().ok_or(ModelError::NoProvisionerSelected)?;
        provisioner
            .group_ranges
            .iter()
            .flat_map(|range| range.low..=range.high)
            .find(|&address| self.group(address).is_none())
            .ok_or(ModelError::AddressSpaceExhausted(RangeKind::Group))
    }

    /// First scene number in the selected provisioner's scene ranges not
    /// used by a scene.
    pub fn next_available_scene_number(&self) -> Result<u16, ModelError> {
        let provisioner = self.selected_provisioner().ok_or(ModelError::NoProvisionerSelected)?;
        provisioner
            .scene_ranges
            .iter()
            .flat_map(|range| range.low..=range.high)
            .find(|&number| self.scene(number).is_none())
            .ok_or(ModelError::AddressSpaceExhausted(RangeKind::Scene))
    }
}
