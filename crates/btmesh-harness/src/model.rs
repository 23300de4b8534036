//! Reference model for model-based testing.
//!
//! [`ModelWorld`] is a deliberately naive re-statement of the network
//! model's rules over plain collections: key indexes, bindings, node element
//! ranges, the unicast cursor and group addresses. Property tests run the
//! same [`Operation`] sequence against it and against a real
//! [`btmesh_core::MeshNetwork`] and compare results and resulting state.

use std::collections::{BTreeMap, BTreeSet};

use arbitrary::Arbitrary;
use btmesh_core::{MeshNetwork, ModelError};

/// Index into the list of nodes added so far (taken modulo its length).
pub type NodeSlot = u8;

/// Key indexes used by operations are folded into `0..KEY_SPACE`.
pub const KEY_SPACE: u16 = 8;

/// Unicast range of the provisioner every world starts with.
pub const UNICAST_RANGE: (u16, u16) = (0x0001, 0x1000);

/// Group range of the provisioner every world starts with.
pub const GROUP_RANGE: (u16, u16) = (0xC000, 0xC0FF);

/// One step of a generated test.
#[derive(Debug, Clone, PartialEq, Eq, Arbitrary)]
pub enum Operation {
    /// Create a network key with the next index
    CreateNetKey,
    /// Remove a network key
    RemoveNetKey {
        /// Key index
        index: u8,
    },
    /// Create an application key bound to a network key
    CreateAppKey {
        /// Bound network key index
        bound: u8,
    },
    /// Remove an application key
    RemoveAppKey {
        /// Key index
        index: u8,
    },
    /// Allocate an address and add a node holding the given keys
    AddNode {
        /// Element count, folded into `1..=4`
        elements: u8,
        /// Network key index
        net_key: u8,
        /// Application key index
        app_key: Option<u8>,
    },
    /// Remove a node
    RemoveNode {
        /// Which node
        slot: NodeSlot,
    },
    /// Create a group at the next free group address
    CreateGroup,
    /// Remove a group
    RemoveGroup {
        /// Which group, in creation order
        slot: u8,
    },
}

impl Operation {
    /// Operation with every parameter folded into its valid domain.
    pub fn normalized(&self) -> Self {
        let key = |index: u8| u8::try_from(u16::from(index) % KEY_SPACE).unwrap_or(0);
        match *self {
            Self::RemoveNetKey { index } => Self::RemoveNetKey { index: key(index) },
            Self::CreateAppKey { bound } => Self::CreateAppKey { bound: key(bound) },
            Self::RemoveAppKey { index } => Self::RemoveAppKey { index: key(index) },
            Self::AddNode { elements, net_key, app_key } => Self::AddNode {
                elements: elements % 4 + 1,
                net_key: key(net_key),
                app_key: app_key.map(key),
            },
            ref other => other.clone(),
        }
    }
}

/// Result class of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationResult {
    /// Committed
    Ok,
    /// Rejected
    Error(OperationError),
}

/// Error class, coarse enough to compare model and implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationError {
    /// Referenced key does not exist
    KeyNotFound,
    /// Key still listed by a node
    KeyInUse,
    /// Network key still has application keys bound
    KeyBound,
    /// A network key must exist first
    MissingPrerequisite,
    /// No node to remove
    NodeNotFound,
    /// No group to remove
    GroupNotFound,
    /// Range exhausted
    AddressSpaceExhausted,
    /// Anything else
    Other,
}

impl From<&ModelError> for OperationError {
    fn from(err: &ModelError) -> Self {
        match err {
            ModelError::KeyNotFound(_) => Self::KeyNotFound,
            ModelError::KeyInUse(_) => Self::KeyInUse,
            ModelError::KeyBound { .. } => Self::KeyBound,
            ModelError::MissingPrerequisite(_) => Self::MissingPrerequisite,
            ModelError::NodeNotFound(_) => Self::NodeNotFound,
            ModelError::GroupNotFound(_) => Self::GroupNotFound,
            ModelError::AddressSpaceExhausted(_) => Self::AddressSpaceExhausted,
            _ => Self::Other,
        }
    }
}

impl<T> From<Result<T, ModelError>> for OperationResult {
    fn from(result: Result<T, ModelError>) -> Self {
        match result {
            Ok(_) => Self::Ok,
            Err(err) => Self::Error(OperationError::from(&err)),
        }
    }
}

/// A node as the reference model sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelNode {
    /// Primary element address
    pub address: u16,
    /// Element count
    pub elements: u8,
    /// The single network key it holds
    pub net_key: u16,
    /// The application key it holds, if any
    pub app_key: Option<u16>,
}

impl ModelNode {
    fn last(&self) -> u16 {
        self.address + u16::from(self.elements) - 1
    }
}

/// Reference implementation of the network model rules.
#[derive(Debug, Clone)]
pub struct ModelWorld {
    provisioner_address: u16,
    net_keys: BTreeSet<u16>,
    app_keys: BTreeMap<u16, u16>,
    nodes: Vec<ModelNode>,
    groups: Vec<u16>,
    cursor: u16,
}

impl Default for ModelWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelWorld {
    /// A world with one provisioner at the start of [`UNICAST_RANGE`] and no
    /// keys.
    pub fn new() -> Self {
        Self {
            provisioner_address: UNICAST_RANGE.0,
            net_keys: BTreeSet::new(),
            app_keys: BTreeMap::new(),
            nodes: Vec::new(),
            groups: Vec::new(),
            cursor: UNICAST_RANGE.0,
        }
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> &[ModelNode] {
        &self.nodes
    }

    /// Apply a (normalized) operation.
    pub fn apply(&mut self, operation: &Operation) -> OperationResult {
        match operation.normalized() {
            Operation::CreateNetKey => {
                let index = self.net_keys.last().map_or(0, |max| max + 1);
                self.net_keys.insert(index);
                OperationResult::Ok
            },
            Operation::RemoveNetKey { index } => self.remove_net_key(u16::from(index)),
            Operation::CreateAppKey { bound } => self.create_app_key(u16::from(bound)),
            Operation::RemoveAppKey { index } => self.remove_app_key(u16::from(index)),
            Operation::AddNode { elements, net_key, app_key } => {
                self.add_node(elements, u16::from(net_key), app_key.map(u16::from))
            },
            Operation::RemoveNode { slot } => {
                if self.nodes.is_empty() {
                    return OperationResult::Error(OperationError::NodeNotFound);
                }
                self.nodes.remove(usize::from(slot) % self.nodes.len());
                OperationResult::Ok
            },
            Operation::CreateGroup => {
                match (GROUP_RANGE.0..=GROUP_RANGE.1).find(|a| !self.groups.contains(a)) {
                    Some(address) => {
                        self.groups.push(address);
                        OperationResult::Ok
                    },
                    None => OperationResult::Error(OperationError::AddressSpaceExhausted),
                }
            },
            Operation::RemoveGroup { slot } => {
                if self.groups.is_empty() {
                    return OperationResult::Error(OperationError::GroupNotFound);
                }
                self.groups.remove(usize::from(slot) % self.groups.len());
                OperationResult::Ok
            },
        }
    }

    fn remove_net_key(&mut self, index: u16) -> OperationResult {
        if !self.net_keys.contains(&index) {
            return OperationResult::Error(OperationError::KeyNotFound);
        }
        if self.nodes.iter().any(|node| node.net_key == index) {
            return OperationResult::Error(OperationError::KeyInUse);
        }
        if self.app_keys.values().any(|&bound| bound == index) {
            return OperationResult::Error(OperationError::KeyBound);
        }
        self.net_keys.remove(&index);
        OperationResult::Ok
    }

    fn create_app_key(&mut self, bound: u16) -> OperationResult {
        if self.net_keys.is_empty() {
            return OperationResult::Error(OperationError::MissingPrerequisite);
        }
        if !self.net_keys.contains(&bound) {
            return OperationResult::Error(OperationError::KeyNotFound);
        }
        let index = self.app_keys.keys().last().map_or(0, |max| max + 1);
        self.app_keys.insert(index, bound);
        OperationResult::Ok
    }

    fn remove_app_key(&mut self, index: u16) -> OperationResult {
        if !self.app_keys.contains_key(&index) {
            return OperationResult::Error(OperationError::KeyNotFound);
        }
        if self.nodes.iter().any(|node| node.app_key == Some(index)) {
            return OperationResult::Error(OperationError::KeyInUse);
        }
        self.app_keys.remove(&index);
        OperationResult::Ok
    }

    /// First address at or after the cursor with `elements` free addresses.
    pub fn next_address(&self, elements: u8) -> Option<u16> {
        let count = u32::from(elements);
        let mut start = u32::from(self.cursor.max(UNICAST_RANGE.0));
        while start + count - 1 <= u32::from(UNICAST_RANGE.1) {
            let end = start + count - 1;
            let blocking = self
                .nodes
                .iter()
                .map(|node| (u32::from(node.address), u32::from(node.last())))
                .chain(std::iter::once((
                    u32::from(self.provisioner_address),
                    u32::from(self.provisioner_address),
                )))
                .filter(|&(low, high)| low <= end && start <= high)
                .map(|(_, high)| high)
                .max();
            match blocking {
                Some(high) => start = high + 1,
                None => return u16::try_from(start).ok(),
            }
        }
        None
    }

    fn add_node(&mut self, elements: u8, net_key: u16, app_key: Option<u16>) -> OperationResult {
        let Some(address) = self.next_address(elements) else {
            return OperationResult::Error(OperationError::AddressSpaceExhausted);
        };
        if !self.net_keys.contains(&net_key) {
            return OperationResult::Error(OperationError::KeyNotFound);
        }
        if app_key.is_some_and(|index| !self.app_keys.contains_key(&index)) {
            return OperationResult::Error(OperationError::KeyNotFound);
        }
        let node = ModelNode { address, elements, net_key, app_key };
        self.cursor = self.cursor.max(node.last() + 1);
        self.nodes.push(node);
        OperationResult::Ok
    }

    /// Compare against a real network built from the same operations.
    ///
    /// `nodes` are the real network's non-provisioner nodes in insertion
    /// order.
    pub fn check_against(&self, network: &MeshNetwork) -> Result<(), String> {
        let net_keys: BTreeSet<u16> = network.net_keys().iter().map(|k| k.index).collect();
        if net_keys != self.net_keys {
            return Err(format!("net keys: model {:?}, real {net_keys:?}", self.net_keys));
        }
        let app_keys: BTreeMap<u16, u16> =
            network.app_keys().iter().map(|k| (k.index, k.bound_net_key)).collect();
        if app_keys != self.app_keys {
            return Err(format!("app keys: model {:?}, real {app_keys:?}", self.app_keys));
        }

        let own = network.selected_provisioner().map(|p| p.uuid);
        let nodes: Vec<ModelNode> = network
            .nodes()
            .iter()
            .filter(|node| Some(node.uuid) != own)
            .map(|node| ModelNode {
                address: node.unicast_address,
                elements: node.element_count,
                net_key: node.net_keys.first().copied().unwrap_or(u16::MAX),
                app_key: node.app_keys.first().copied(),
            })
            .collect();
        if nodes != self.nodes {
            return Err(format!("nodes: model {:?}, real {nodes:?}", self.nodes));
        }

        let groups: Vec<u16> = network.groups().iter().map(|g| g.address.address()).collect();
        if groups != self.groups {
            return Err(format!("groups: model {:?}, real {groups:?}", self.groups));
        }
        if network.next_unicast_cursor() != self.cursor {
            return Err(format!(
                "cursor: model {:04X}, real {:04X}",
                self.cursor,
                network.next_unicast_cursor()
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_lifecycle() {
        let mut world = ModelWorld::new();
        assert_eq!(
            world.apply(&Operation::CreateAppKey { bound: 0 }),
            OperationResult::Error(OperationError::MissingPrerequisite)
        );
        assert_eq!(world.apply(&Operation::CreateNetKey), OperationResult::Ok);
        assert_eq!(world.apply(&Operation::CreateAppKey { bound: 0 }), OperationResult::Ok);
        assert_eq!(
            world.apply(&Operation::RemoveNetKey { index: 0 }),
            OperationResult::Error(OperationError::KeyBound)
        );
        assert_eq!(world.apply(&Operation::RemoveAppKey { index: 0 }), OperationResult::Ok);
        assert_eq!(world.apply(&Operation::RemoveNetKey { index: 0 }), OperationResult::Ok);
    }

    #[test]
    fn nodes_skip_the_provisioner_and_never_reclaim() {
        let mut world = ModelWorld::new();
        world.apply(&Operation::CreateNetKey);
        let add = Operation::AddNode { elements: 2, net_key: 0, app_key: None };
        world.apply(&add);
        assert_eq!(world.nodes()[0].address, 0x0002);
        assert_eq!(world.nodes()[0].elements, 3);

        world.apply(&Operation::RemoveNode { slot: 0 });
        world.apply(&add);
        assert_eq!(world.nodes()[0].address, 0x0005);
    }

    #[test]
    fn node_keys_block_removal() {
        let mut world = ModelWorld::new();
        world.apply(&Operation::CreateNetKey);
        world.apply(&Operation::CreateNetKey);
        world.apply(&Operation::AddNode { elements: 0, net_key: 1, app_key: None });
        assert_eq!(
            world.apply(&Operation::RemoveNetKey { index: 1 }),
            OperationResult::Error(OperationError::KeyInUse)
        );
        assert_eq!(world.apply(&Operation::RemoveNetKey { index: 0 }), OperationResult::Ok);
        assert_eq!(
            world.apply(&Operation::AddNode { elements: 0, net_key: 0, app_key: None }),
            OperationResult::Error(OperationError::KeyNotFound)
        );
    }

    #[test]
    fn groups_fill_lowest_free_address() {
        let mut world = ModelWorld::new();
        world.apply(&Operation::CreateGroup);
        world.apply(&Operation::CreateGroup);
        world.apply(&Operation::RemoveGroup { slot: 0 });
        world.apply(&Operation::CreateGroup);
        assert_eq!(world.groups, vec![0xC001, 0xC000]);
    }

    #[test]
    fn normalization_folds_parameters() {
        let op = Operation::AddNode { elements: 7, net_key: 9, app_key: Some(17) };
        assert_eq!(
            op.normalized(),
            Operation::AddNode { elements: 4, net_key: 1, app_key: Some(1) }
        );
    }
}
