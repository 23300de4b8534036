//! Network and application keys.
//!
//! Keys are identified by a 12-bit index that is unique within its own list.
//! A key may only change its cosmetic metadata while it is in use, i.e. while
//! a node other than the selected provisioner's own node has it added.

use btmesh_crypto::{Key, NetworkKeyMaterial, aid};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{KeyIndex, MAX_KEY_INDEX, MeshNetwork, NetworkEvent};
use crate::{
    env::{Environment, random_key},
    error::ModelError,
};

/// Key refresh procedure phase of a network key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum KeyRefreshPhase {
    /// Normal operation
    #[default]
    Normal,
    /// New key distributed, old key still used for transmission
    KeyDistribution,
    /// New key used for transmission
    UsingNewKeys,
}

impl KeyRefreshPhase {
    /// Numeric phase as stored in documents.
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::KeyDistribution => 1,
            Self::UsingNewKeys => 2,
        }
    }

    /// Parse a numeric phase.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Normal),
            1 => Some(Self::KeyDistribution),
            2 => Some(Self::UsingNewKeys),
            _ => None,
        }
    }
}

/// Minimum security level for provisioning with a network key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Security {
    /// Nodes must have been provisioned with authentication
    #[default]
    Secure,
    /// Any node
    Insecure,
}

/// A network key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkKey {
    /// Global key index
    pub index: KeyIndex,
    /// Display name
    pub name: String,
    /// Key material
    pub key: Key,
    /// Previous key material during key refresh
    pub old_key: Option<Key>,
    /// Key refresh phase
    pub phase: KeyRefreshPhase,
    /// Minimum security
    pub min_security: Security,
    /// Last change of phase or key
    pub timestamp: DateTime<FixedOffset>,
}

impl NetworkKey {
    /// A key in the normal phase with a default name.
    pub fn new(index: KeyIndex, key: Key, timestamp: DateTime<FixedOffset>) -> Self {
        Self {
            index,
            name: format!("Network Key {}", u32::from(index) + 1),
            key,
            old_key: None,
            phase: KeyRefreshPhase::Normal,
            min_security: Security::Secure,
            timestamp,
        }
    }

    /// NID, encryption and privacy keys of [`NetworkKey::transmit_key`].
    pub fn transmit_material(&self) -> NetworkKeyMaterial {
        NetworkKeyMaterial::derive(self.transmit_key())
    }

    /// Key used for transmission. During key distribution nodes may not
    /// have the new key yet, so the old one is still used.
    pub fn transmit_key(&self) -> &Key {
        match (self.phase, &self.old_key) {
            (KeyRefreshPhase::KeyDistribution, Some(old)) => old,
            _ => &self.key,
        }
    }

    /// Current key, then the old key if a refresh is in progress.
    pub fn receive_keys(&self) -> impl Iterator<Item = &Key> {
        std::iter::once(&self.key).chain(self.old_key.as_ref())
    }

    fn same_security_fields(&self, other: &Self) -> bool {
        self.index == other.index && self.key == other.key && self.old_key == other.old_key
    }
}

/// An application key, bound to one network key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationKey {
    /// Global key index
    pub index: KeyIndex,
    /// Display name
    pub name: String,
    /// Key material
    pub key: Key,
    /// Previous key material during key refresh
    pub old_key: Option<Key>,
    /// Index of the network key this key is bound to
    pub bound_net_key: KeyIndex,
}

impl ApplicationKey {
    /// A key with a default name.
    pub fn new(index: KeyIndex, key: Key, bound_net_key: KeyIndex) -> Self {
        Self {
            index,
            name: format!("Application Key {}", u32::from(index) + 1),
            key,
            old_key: None,
            bound_net_key,
        }
    }

    /// 6-bit application key identifier.
    pub fn aid(&self) -> u8 {
        aid(&self.key)
    }

    fn same_security_fields(&self, other: &Self) -> bool {
        self.index == other.index
            && self.key == other.key
            && self.old_key == other.old_key
            && self.bound_net_key == other.bound_net_key
    }
}

fn next_index(existing: impl Iterator<Item = KeyIndex>) -> Result<KeyIndex, ModelError> {
    match existing.max() {
        None => Ok(0),
        Some(max) if max >= MAX_KEY_INDEX => Err(ModelError::KeyIndexOutOfRange(max + 1)),
        Some(max) => Ok(max + 1),
    }
}

impl MeshNetwork {
    /// Network keys in insertion order.
    pub fn net_keys(&self) -> &[NetworkKey] {
        &self.state.net_keys
    }

    /// Network key by index.
    pub fn net_key(&self, index: KeyIndex) -> Option<&NetworkKey> {
        self.state.net_keys.iter().find(|key| key.index == index)
    }

    /// Application keys in insertion order.
    pub fn app_keys(&self) -> &[ApplicationKey] {
        &self.state.app_keys
    }

    /// Application key by index.
    pub fn app_key(&self, index: KeyIndex) -> Option<&ApplicationKey> {
        self.state.app_keys.iter().find(|key| key.index == index)
    }

    /// Index the next network key gets: one past the highest, or 0.
    pub fn next_net_key_index(&self) -> Result<KeyIndex, ModelError> {
        next_index(self.state.net_keys.iter().map(|key| key.index))
    }

    /// Index the next application key gets: one past the highest, or 0.
    pub fn next_app_key_index(&self) -> Result<KeyIndex, ModelError> {
        next_index(self.state.app_keys.iter().map(|key| key.index))
    }

    /// True if a node other than the selected provisioner's has the network
    /// key added.
    pub fn is_net_key_in_use(&self, index: KeyIndex) -> bool {
        self.foreign_nodes().any(|node| node.net_keys.contains(&index))
    }

    /// True if a node other than the selected provisioner's has the
    /// application key added.
    pub fn is_app_key_in_use(&self, index: KeyIndex) -> bool {
        self.foreign_nodes().any(|node| node.app_keys.contains(&index))
    }

    /// Generate a random network key with the next free index and add it.
    pub fn create_network_key<E: Environment>(&mut self, env: &E) -> Result<NetworkKey, ModelError> {
        let key = NetworkKey::new(self.next_net_key_index()?, random_key(env), self.state.timestamp);
        self.add_network_key(key.clone())?;
        Ok(key)
    }

    /// Add a network key.
    ///
    /// The selected provisioner's own node gets the key as well.
    pub fn add_network_key(&mut self, key: NetworkKey) -> Result<(), ModelError> {
        if key.index > MAX_KEY_INDEX {
            return Err(ModelError::KeyIndexOutOfRange(key.index));
        }
        if self.net_key(key.index).is_some() {
            return Err(ModelError::DuplicateKeyIndex(key.index));
        }
        if let Some(existing) = self.state.net_keys.iter().find(|k| k.key == key.key) {
            return Err(ModelError::DuplicateKey { index: existing.index });
        }

        let index = key.index;
        let mut next = self.state.clone();
        next.net_keys.push(key);
        if let Some(node) = next.selected_provisioner_node_mut() {
            node.net_keys.insert(index);
        }
        self.commit(next, vec![NetworkEvent::NetKeyAdded(index)])?;
        debug!(index, "network key added");
        Ok(())
    }

    /// Replace a network key.
    ///
    /// While the key is in use only the name, phase, minimum security and
    /// timestamp may change.
    pub fn update_network_key(&mut self, key: NetworkKey) -> Result<(), ModelError> {
        let current = self.net_key(key.index).ok_or(ModelError::KeyNotFound(key.index))?;
        if !current.same_security_fields(&key) {
            if self.is_net_key_in_use(key.index) {
                return Err(ModelError::KeyInUse(key.index));
            }
            if let Some(existing) =
                self.state.net_keys.iter().find(|k| k.index != key.index && k.key == key.key)
            {
                return Err(ModelError::DuplicateKey { index: existing.index });
            }
        }

        let index = key.index;
        let mut next = self.state.clone();
        if let Some(slot) = next.net_keys.iter_mut().find(|k| k.index == index) {
            *slot = key;
        }
        self.commit(next, vec![NetworkEvent::NetKeyUpdated(index)])?;
        debug!(index, "network key updated");
        Ok(())
    }

    /// Remove an unused network key with no application keys bound to it.
    pub fn remove_network_key(&mut self, index: KeyIndex) -> Result<NetworkKey, ModelError> {
        let key = self.net_key(index).cloned().ok_or(ModelError::KeyNotFound(index))?;
        if self.is_net_key_in_use(index) {
            return Err(ModelError::KeyInUse(index));
        }
        if let Some(app_key) = self.state.app_keys.iter().find(|k| k.bound_net_key == index) {
            return Err(ModelError::KeyBound { net_key: index, app_key: app_key.index });
        }

        let mut next = self.state.clone();
        next.net_keys.retain(|k| k.index != index);
        if let Some(node) = next.selected_provisioner_node_mut() {
            node.net_keys.remove(&index);
        }
        self.commit(next, vec![NetworkEvent::NetKeyDeleted(index)])?;
        debug!(index, "network key removed");
        Ok(key)
    }

    /// Generate a random application key bound to `bound_net_key` and add it.
    pub fn create_app_key<E: Environment>(
        &mut self,
        bound_net_key: KeyIndex,
        env: &E,
    ) -> Result<ApplicationKey, ModelError> {
        if self.state.net_keys.is_empty() {
            return Err(ModelError::MissingPrerequisite("a network key must exist first"));
        }
        let key = ApplicationKey::new(self.next_app_key_index()?, random_key(env), bound_net_key);
        self.add_app_key(key.clone())?;
        Ok(key)
    }

    /// Add an application key.
    ///
    /// The selected provisioner's own node gets the key as well.
    pub fn add_app_key(&mut self, key: ApplicationKey) -> Result<(), ModelError> {
        if self.state.net_keys.is_empty() {
            return Err(ModelError::MissingPrerequisite("a network key must exist first"));
        }
        if self.net_key(key.bound_net_key).is_none() {
            return Err(ModelError::KeyNotFound(key.bound_net_key));
        }
        if key.index > MAX_KEY_INDEX {
            return Err(ModelError::KeyIndexOutOfRange(key.index));
        }
        if self.app_key(key.index).is_some() {
            return Err(ModelError::DuplicateKeyIndex(key.index));
        }
        if let Some(existing) = self.state.app_keys.iter().find(|k| k.key == key.key) {
            return Err(ModelError::DuplicateKey { index: existing.index });
        }

        let index = key.index;
        let mut next = self.state.clone();
        next.app_keys.push(key);
        if let Some(node) = next.selected_provisioner_node_mut() {
            node.app_keys.insert(index);
        }
        self.commit(next, vec![NetworkEvent::AppKeyAdded(index)])?;
        debug!(index, "application key added");
        Ok(())
    }

    /// Replace an application key.
    ///
    /// While the key is in use only the name may change.
    pub fn update_app_key(&mut self, key: ApplicationKey) -> Result<(), ModelError> {
        let current = self.app_key(key.index).ok_or(ModelError::KeyNotFound(key.index))?;
        if !current.same_security_fields(&key) {
            if self.is_app_key_in_use(key.index) {
                return Err(ModelError::KeyInUse(key.index));
            }
            if let Some(existing) =
                self.state.app_keys.iter().find(|k| k.index != key.index && k.key == key.key)
            {
                return Err(ModelError::DuplicateKey { index: existing.index });
            }
        }

        let index = key.index;
        let mut next = self.state.clone();
        if let Some(slot) = next.app_keys.iter_mut().find(|k| k.index == index) {
            *slot = key;
        }
        self.commit(next, vec![NetworkEvent::AppKeyUpdated(index)])?;
        debug!(index, "application key updated");
        Ok(())
    }

    /// Remove an unused application key.
    pub fn remove_app_key(&mut self, index: KeyIndex) -> Result<ApplicationKey, ModelError> {
        let key = self.app_key(index).cloned().ok_or(ModelError::KeyNotFound(index))?;
        if self.is_app_key_in_use(index) {
            return Err(ModelError::KeyInUse(index));
        }

        let mut next = self.state.clone();
        next.app_keys.retain(|k| k.index != index);
        if let Some(node) = next.selected_provisioner_node_mut() {
            node.app_keys.remove(&index);
        }
        self.commit(next, vec![NetworkEvent::AppKeyDeleted(index)])?;
        debug!(index, "application key removed");
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        env::SystemEnv,
        model::fixtures::{drain, node, subscribe, timestamp},
    };

    fn empty() -> MeshNetwork {
        let mut network = MeshNetwork::new("keys", timestamp(), &SystemEnv);
        network.create_provisioner("provisioner", &SystemEnv).unwrap();
        network
    }

    #[test]
    fn net_key_indexes_and_in_use_removal() {
        let mut network = empty();
        assert_eq!(network.create_network_key(&SystemEnv).unwrap().index, 0);
        assert_eq!(network.create_network_key(&SystemEnv).unwrap().index, 1);

        let mut device = node(7, 0x0100, 1);
        device.net_keys.insert(1);
        network.add_node(device).unwrap();

        assert_eq!(network.remove_network_key(0).unwrap().index, 0);
        assert_eq!(network.remove_network_key(1), Err(ModelError::KeyInUse(1)));
        assert!(network.net_key(1).is_some());
    }

    #[test]
    fn own_node_does_not_count_as_use() {
        let mut network = empty();
        let key = network.create_network_key(&SystemEnv).unwrap();
        let own = network.selected_provisioner().unwrap().uuid;
        assert!(network.node(own).unwrap().net_keys.contains(&key.index));
        assert!(!network.is_net_key_in_use(key.index));
        network.remove_network_key(key.index).unwrap();
        assert!(network.node(own).unwrap().net_keys.is_empty());
    }

    #[test]
    fn app_key_needs_a_network_key() {
        let mut network = empty();
        assert_eq!(
            network.create_app_key(0, &SystemEnv),
            Err(ModelError::MissingPrerequisite("a network key must exist first"))
        );
        network.create_network_key(&SystemEnv).unwrap();
        let app_key = network.create_app_key(0, &SystemEnv).unwrap();
        assert_eq!(app_key.index, 0);
        assert_eq!(
            network.add_app_key(ApplicationKey::new(1, [1; 16], 5)),
            Err(ModelError::KeyNotFound(5))
        );
    }

    #[test]
    fn duplicate_key_material_is_rejected() {
        let mut network = empty();
        network.add_network_key(NetworkKey::new(0, [0xAA; 16], timestamp())).unwrap();
        assert_eq!(
            network.add_network_key(NetworkKey::new(3, [0xAA; 16], timestamp())),
            Err(ModelError::DuplicateKey { index: 0 })
        );
        assert_eq!(
            network.add_network_key(NetworkKey::new(0, [0xBB; 16], timestamp())),
            Err(ModelError::DuplicateKeyIndex(0))
        );
        assert_eq!(
            network.add_network_key(NetworkKey::new(4096, [0xCC; 16], timestamp())),
            Err(ModelError::KeyIndexOutOfRange(4096))
        );
    }

    #[test]
    fn in_use_key_only_takes_cosmetic_updates() {
        let mut network = empty();
        network.create_network_key(&SystemEnv).unwrap();
        let app_key = network.create_app_key(0, &SystemEnv).unwrap();
        let mut device = node(9, 0x0200, 2);
        device.net_keys.insert(0);
        device.app_keys.insert(app_key.index);
        network.add_node(device).unwrap();

        let renamed = ApplicationKey { name: "Lights".into(), ..app_key.clone() };
        network.update_app_key(renamed).unwrap();
        assert_eq!(network.app_key(0).unwrap().name, "Lights");

        let rekeyed = ApplicationKey { key: [0x55; 16], ..app_key };
        let before = network.state().clone();
        assert_eq!(network.update_app_key(rekeyed), Err(ModelError::KeyInUse(0)));
        assert_eq!(network.state(), &before);
        assert_eq!(network.remove_app_key(0), Err(ModelError::KeyInUse(0)));
    }

    #[test]
    fn bound_net_key_cannot_be_removed() {
        let mut network = empty();
        network.create_network_key(&SystemEnv).unwrap();
        network.create_network_key(&SystemEnv).unwrap();
        network.create_app_key(1, &SystemEnv).unwrap();
        assert_eq!(
            network.remove_network_key(1),
            Err(ModelError::KeyBound { net_key: 1, app_key: 0 })
        );
        network.remove_app_key(0).unwrap();
        network.remove_network_key(1).unwrap();
    }

    #[test]
    fn key_changes_are_notified_in_order() {
        let mut network = empty();
        let mut events = subscribe(&mut network);
        network.create_network_key(&SystemEnv).unwrap();
        network.create_app_key(0, &SystemEnv).unwrap();
        network.remove_app_key(0).unwrap();
        assert_eq!(
            drain(&mut events),
            vec![
                NetworkEvent::NetKeyAdded(0),
                NetworkEvent::AppKeyAdded(0),
                NetworkEvent::AppKeyDeleted(0),
            ]
        );
    }

    #[test]
    fn key_distribution_transmits_with_old_key() {
        let mut key = NetworkKey::new(0, [2; 16], timestamp());
        key.old_key = Some([1; 16]);
        key.phase = KeyRefreshPhase::KeyDistribution;
        assert_eq!(key.transmit_key(), &[1; 16]);
        assert_eq!(key.receive_keys().count(), 2);

        key.phase = KeyRefreshPhase::UsingNewKeys;
        assert_eq!(key.transmit_key(), &[2; 16]);
        assert_eq!(KeyRefreshPhase::from_u8(key.phase.as_u8()), Some(key.phase));
        assert_eq!(KeyRefreshPhase::from_u8(3), None);
    }
}
