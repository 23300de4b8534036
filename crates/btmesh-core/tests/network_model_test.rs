//! Network model properties.
//!
//! Random sequences of key, provisioner and node operations must only ever
//! commit states that satisfy every model invariant, and a rejected
//! operation must leave the model exactly as it was.

use btmesh_core::{
    ModelError, NetworkEvent,
    env::SystemEnv,
    model::{AddressRange, MeshNetwork, Node, Provisioner, RangeKind},
};
use chrono::DateTime;
use proptest::prelude::*;
use uuid::Uuid;

fn empty_network() -> MeshNetwork {
    let timestamp = DateTime::parse_from_rfc3339("2026-05-04T08:00:00+00:00").unwrap();
    MeshNetwork::new("model test", timestamp, &SystemEnv)
}

#[derive(Debug, Clone)]
enum Operation {
    CreateNetKey,
    RemoveNetKey(u16),
    CreateAppKey { bound: u16 },
    RemoveAppKey(u16),
    AddProvisioner { id: u8, low: u16, len: u16, with_address: bool },
    RemoveProvisioner(u8),
    SelectProvisioner(u8),
    AddNode { id: u8, address: u16, elements: u8, net_key: u16, app_key: Option<u16> },
    RemoveNode(u8),
}

fn operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        3 => Just(Operation::CreateNetKey),
        1 => (0u16..4).prop_map(Operation::RemoveNetKey),
        3 => (0u16..4).prop_map(|bound| Operation::CreateAppKey { bound }),
        1 => (0u16..4).prop_map(Operation::RemoveAppKey),
        2 => (0u8..4, 1u16..0x40, 1u16..0x20, any::<bool>()).prop_map(
            |(id, low, len, with_address)| Operation::AddProvisioner { id, low, len, with_address }
        ),
        1 => (0u8..4).prop_map(Operation::RemoveProvisioner),
        1 => (0u8..4).prop_map(Operation::SelectProvisioner),
        3 => (0u8..8, 1u16..0x60, 1u8..4, 0u16..4, proptest::option::of(0u16..4)).prop_map(
            |(id, address, elements, net_key, app_key)| Operation::AddNode {
                id,
                address,
                elements,
                net_key,
                app_key,
            }
        ),
        1 => (0u8..8).prop_map(Operation::RemoveNode),
    ]
}

fn provisioner_uuid(id: u8) -> Uuid {
    Uuid::from_u128(0x1000 + u128::from(id))
}

fn node_uuid(id: u8) -> Uuid {
    Uuid::from_u128(0x2000 + u128::from(id))
}

/// True if a node other than the selected provisioner's lists the key.
fn net_key_in_use(network: &MeshNetwork, index: u16) -> bool {
    let own = network.selected_provisioner().map(|p| p.uuid);
    network.nodes().iter().any(|node| Some(node.uuid) != own && node.net_keys.contains(&index))
}

fn apply(network: &mut MeshNetwork, operation: &Operation) -> Result<(), ModelError> {
    match *operation {
        Operation::CreateNetKey => network.create_network_key(&SystemEnv).map(drop),
        Operation::RemoveNetKey(index) => network.remove_network_key(index).map(drop),
        Operation::CreateAppKey { bound } => network.create_app_key(bound, &SystemEnv).map(drop),
        Operation::RemoveAppKey(index) => network.remove_app_key(index).map(drop),
        Operation::AddProvisioner { id, low, len, with_address } => {
            let unicast = AddressRange::new(low * 0x40, low * 0x40 + len);
            let group = AddressRange::new(0xC000 + u16::from(id) * 0x10, 0xC00F + u16::from(id) * 0x10);
            let mut provisioner =
                Provisioner::new(provisioner_uuid(id), format!("p{id}"), vec![unicast], vec![group], vec![]);
            provisioner.address = with_address.then_some(unicast.low);
            network.add_provisioner(provisioner)
        },
        Operation::RemoveProvisioner(id) => network.remove_provisioner(provisioner_uuid(id)).map(drop),
        Operation::SelectProvisioner(id) => network.select_provisioner(provisioner_uuid(id)),
        Operation::AddNode { id, address, elements, net_key, app_key } => {
            let mut node = Node::new(node_uuid(id), format!("n{id}"), address, elements);
            node.net_keys.insert(net_key);
            node.app_keys.extend(app_key);
            network.add_node(node)
        },
        Operation::RemoveNode(id) => network.remove_node(node_uuid(id)).map(drop),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn committed_states_satisfy_invariants(operations in proptest::collection::vec(operation(), 1..40)) {
        let mut network = empty_network();
        for operation in &operations {
            let before = network.state().clone();
            let expect_in_use = match *operation {
                Operation::RemoveNetKey(index) => {
                    network.net_key(index).is_some() && net_key_in_use(&network, index)
                },
                _ => false,
            };

            let result = apply(&mut network, operation);
            prop_assert!(network.state().check_invariants().is_ok(), "{operation:?} broke invariants");
            match result {
                Ok(()) => prop_assert!(!expect_in_use, "{operation:?} removed a key in use"),
                Err(err) => {
                    prop_assert_eq!(network.state(), &before, "{:?} changed state on error", operation);
                    if expect_in_use {
                        prop_assert!(matches!(err, ModelError::KeyInUse(_)), "unexpected {err:?}");
                    }
                },
            }
        }

        let selected = network.provisioners().iter().filter(|p| Some(p.uuid) == network.selected_provisioner().map(|s| s.uuid)).count();
        prop_assert!(selected <= 1);
        if network.provisioners().len() == 1 {
            prop_assert!(network.selected_provisioner().is_some());
        }
    }
}

#[test]
fn key_index_scenario() {
    let mut network = empty_network();
    network.create_provisioner("admin", &SystemEnv).unwrap();
    assert_eq!(network.create_network_key(&SystemEnv).unwrap().index, 0);
    assert_eq!(network.create_network_key(&SystemEnv).unwrap().index, 1);

    let mut node = Node::new(Uuid::from_u128(5), "sensor", 0x0100, 1);
    node.net_keys.insert(1);
    network.add_node(node).unwrap();

    network.remove_network_key(0).unwrap();
    assert_eq!(network.remove_network_key(1), Err(ModelError::KeyInUse(1)));
}

#[test]
fn adjacent_provisioner_ranges_are_accepted() {
    let mut network = empty_network();
    let first = Provisioner::new(
        Uuid::from_u128(1),
        "first",
        vec![AddressRange::new(0x0001, 0x00FF)],
        vec![AddressRange::new(0xC000, 0xC00F)],
        vec![AddressRange::new(0x0001, 0x000F)],
    );
    network.add_provisioner(first).unwrap();

    let overlapping = Provisioner::new(
        Uuid::from_u128(2),
        "overlapping",
        vec![AddressRange::new(0x00FF, 0x01FF)],
        vec![AddressRange::new(0xC010, 0xC01F)],
        vec![AddressRange::new(0x0010, 0x001F)],
    );
    assert_eq!(
        network.add_provisioner(overlapping),
        Err(ModelError::RangeOverlap { kind: RangeKind::Unicast, other: Uuid::from_u128(1) })
    );

    let adjacent = Provisioner::new(
        Uuid::from_u128(3),
        "adjacent",
        vec![AddressRange::new(0x0100, 0x01FF)],
        vec![AddressRange::new(0xC010, 0xC01F)],
        vec![AddressRange::new(0x0010, 0x001F)],
    );
    network.add_provisioner(adjacent).unwrap();
}

#[test]
fn selecting_a_provisioner_notifies_full_list() {
    let mut network = empty_network();
    let first = network.create_provisioner("first", &SystemEnv).unwrap();
    let second = network.create_provisioner("second", &SystemEnv).unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    network.subscribe(std::sync::Arc::new(tx));

    network.select_provisioner(first.uuid).unwrap();
    assert!(rx.try_recv().is_err());

    network.select_provisioner(second.uuid).unwrap();
    match rx.try_recv().unwrap() {
        NetworkEvent::ProvisionersUpdated { provisioners, selected } => {
            assert_eq!(selected, Some(second.uuid));
            assert_eq!(
                provisioners.iter().map(|p| p.uuid).collect::<Vec<_>>(),
                vec![first.uuid, second.uuid]
            );
        },
        other => panic!("unexpected event {other:?}"),
    }
    assert!(rx.try_recv().is_err());
}
