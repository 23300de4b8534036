//! Groups: named group or virtual addresses.

use btmesh_crypto::virtual_address;
use btmesh_proto::address::{is_group, is_virtual};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::{MeshNetwork, NetworkEvent};
use crate::error::ModelError;

/// Address of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupAddress {
    /// A group address in `0xC000..=0xFEFF`
    Group(u16),
    /// A label UUID and the virtual address derived from it
    Virtual {
        /// Label UUID
        label: Uuid,
        /// Derived virtual address
        address: u16,
    },
}

impl GroupAddress {
    /// Virtual address for `label`.
    pub fn from_label(label: Uuid) -> Self {
        Self::Virtual { label, address: virtual_address(label.as_bytes()) }
    }

    /// The 16-bit destination address.
    pub fn address(&self) -> u16 {
        match *self {
            Self::Group(address) | Self::Virtual { address, .. } => address,
        }
    }

    /// Label UUID of a virtual address.
    pub fn label(&self) -> Option<Uuid> {
        match *self {
            Self::Group(_) => None,
            Self::Virtual { label, .. } => Some(label),
        }
    }

    /// True if the address is a proper group address, or a virtual address
    /// that matches its label.
    pub fn is_valid(&self) -> bool {
        match *self {
            Self::Group(address) => is_group(address),
            Self::Virtual { label, address } => {
                is_virtual(address) && virtual_address(label.as_bytes()) == address
            },
        }
    }
}

/// A named group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Group address
    pub address: GroupAddress,
    /// Parent group, if any
    pub parent: Option<GroupAddress>,
    /// Display name
    pub name: String,
}

impl Group {
    /// A top level group.
    pub fn new(name: impl Into<String>, address: GroupAddress) -> Self {
        Self { address, parent: None, name: name.into() }
    }
}

impl MeshNetwork {
    /// All groups.
    pub fn groups(&self) -> &[Group] {
        &self.state.groups
    }

    /// Group by 16-bit address.
    pub fn group(&self, address: u16) -> Option<&Group> {
        self.state.groups.iter().find(|group| group.address.address() == address)
    }

    /// Create a group at the next free address of the selected provisioner.
    pub fn create_group(&mut self, name: impl Into<String>) -> Result<Group, ModelError> {
        let group = Group::new(name, GroupAddress::Group(self.next_available_group_address()?));
        self.add_group(group.clone())?;
        Ok(group)
    }

    /// Add a group.
    pub fn add_group(&mut self, group: Group) -> Result<(), ModelError> {
        let address = group.address.address();
        if self.group(address).is_some() {
            return Err(ModelError::GroupExists(address));
        }
        self.validate_group(&group)?;

        let mut next = self.state.clone();
        next.groups.push(group);
        self.commit(next, vec![NetworkEvent::GroupAdded(address)])?;
        debug!(address, "group added");
        Ok(())
    }

    /// Replace the group with the same address (name or parent change).
    pub fn update_group(&mut self, group: Group) -> Result<(), ModelError> {
        let address = group.address.address();
        if self.group(address).is_none() {
            return Err(ModelError::GroupNotFound(address));
        }
        self.validate_group(&group)?;

        let mut next = self.state.clone();
        if let Some(slot) = next.groups.iter_mut().find(|g| g.address.address() == address) {
            *slot = group;
        }
        self.commit(next, vec![NetworkEvent::GroupUpdated(address)])?;
        debug!(address, "group updated");
        Ok(())
    }

    /// Remove a group. Its child groups become top level groups.
    pub fn remove_group(&mut self, address: u16) -> Result<Group, ModelError> {
        let group = self.group(address).cloned().ok_or(ModelError::GroupNotFound(address))?;

        let mut next = self.state.clone();
        let mut events = vec![NetworkEvent::GroupDeleted(address)];
        next.groups.retain(|g| g.address.address() != address);
        for child in &mut next.groups {
            if child.parent.is_some_and(|parent| parent.address() == address) {
                child.parent = None;
                events.push(NetworkEvent::GroupUpdated(child.address.address()));
            }
        }
        self.commit(next, events)?;
        debug!(address, "group removed");
        Ok(group)
    }

    fn validate_group(&self, group: &Group) -> Result<(), ModelError> {
        if !group.address.is_valid() {
            return Err(ModelError::AddressOutOfRange {
                kind: "group",
                address: group.address.address(),
            });
        }
        if let Some(parent) = group.parent {
            if parent.address() == group.address.address() || self.group(parent.address()).is_none()
            {
                return Err(ModelError::GroupNotFound(parent.address()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{drain, network, subscribe};

    #[test]
    fn virtual_address_follows_label() {
        let label = Uuid::from_u128(0x1234);
        let group = GroupAddress::from_label(label);
        assert!(is_virtual(group.address()));
        assert_eq!(group.label(), Some(label));
        assert!(group.is_valid());

        let forged = GroupAddress::Virtual { label, address: group.address() ^ 1 };
        assert!(!forged.is_valid());
        assert!(!GroupAddress::Group(0x0001).is_valid());
    }

    #[test]
    fn removing_parent_promotes_children() {
        let mut network = network();
        let parent = network.create_group("house").unwrap();
        let mut child = network.create_group("kitchen").unwrap();
        child.parent = Some(parent.address);
        network.update_group(child.clone()).unwrap();

        let mut events = subscribe(&mut network);
        network.remove_group(parent.address.address()).unwrap();
        assert_eq!(network.group(child.address.address()).unwrap().parent, None);
        assert_eq!(
            drain(&mut events),
            vec![
                NetworkEvent::GroupDeleted(parent.address.address()),
                NetworkEvent::GroupUpdated(child.address.address()),
            ]
        );
    }

    #[test]
    fn group_validation() {
        let mut network = network();
        let group = network.create_group("house").unwrap();
        assert_eq!(network.add_group(group.clone()), Err(ModelError::GroupExists(group.address.address())));

        let mut orphan = Group::new("orphan", GroupAddress::Group(0xC0F0));
        orphan.parent = Some(GroupAddress::Group(0xC0F1));
        assert_eq!(network.add_group(orphan), Err(ModelError::GroupNotFound(0xC0F1)));
        assert_eq!(
            network.add_group(Group::new("bad", GroupAddress::Group(0xFF00))),
            Err(ModelError::AddressOutOfRange { kind: "group", address: 0xFF00 })
        );
        assert_eq!(network.remove_group(0xC0F0), Err(ModelError::GroupNotFound(0xC0F0)));
    }
}
