//! Transport behaviour between two nodes sharing one network description.

use std::time::{Duration, Instant};

use bytes::Bytes;
use btmesh_core::{
    MeshMessage, MeshNetwork, MeshTransport, TransportAction, TransportConfig, TransportError,
    env::SystemEnv,
    model::Node,
};
use chrono::DateTime;
use uuid::Uuid;

const COMPANY: u16 = 0x0059;
const DEVICE: u16 = 0x0100;

struct Side {
    network: MeshNetwork,
    transport: MeshTransport,
}

fn sides() -> (Side, Side) {
    let timestamp = DateTime::parse_from_rfc3339("2026-04-20T07:00:00+00:00").unwrap();
    let mut network = MeshNetwork::new("transport", timestamp, &SystemEnv);
    let provisioner = network.create_provisioner("gateway", &SystemEnv).unwrap();
    network.create_network_key(&SystemEnv).unwrap();
    network.create_app_key(0, &SystemEnv).unwrap();

    let mut device = Node::new(Uuid::from_u128(0xDE71CE), "thermostat", DEVICE, 1);
    device.device_key = Some([0x5A; 16]);
    device.net_keys.insert(0);
    device.app_keys.insert(0);
    network.add_node(device).unwrap();

    let remote = MeshNetwork::from_state(network.state().clone()).unwrap();
    let local_address = provisioner.address.unwrap();
    (
        Side { network, transport: MeshTransport::new(TransportConfig::default(), local_address, 1) },
        Side { network: remote, transport: MeshTransport::new(TransportConfig::default(), DEVICE, 1) },
    )
}

fn transmitted(actions: &[TransportAction]) -> Vec<Bytes> {
    actions
        .iter()
        .flat_map(|action| match action {
            TransportAction::Transmit { pdus, .. } => pdus.clone(),
            _ => Vec::new(),
        })
        .collect()
}

fn query() -> MeshMessage {
    MeshMessage::vendor_acknowledged(0x01, COMPANY, vec![0x10, 0x20], 0, 0x02).unwrap()
}

#[test]
fn vendor_query_without_answer_times_out_once() {
    let (mut local, _) = sides();
    let src = local.transport.primary_address();
    let start = Instant::now();
    let (id, _) = local.transport.send(&mut local.network, src, DEVICE, query(), start).unwrap();
    local.transport.handle_send_complete(id, Ok(()), start).unwrap();

    let mut now = start;
    let mut sends = 1;
    let mut failures = 0;
    while let Some(deadline) = local.transport.next_deadline() {
        now = deadline;
        for action in local.transport.tick(&mut local.network, now) {
            match action {
                TransportAction::Transmit { transaction: Some(tx), .. } => {
                    sends += 1;
                    local.transport.handle_send_complete(tx, Ok(()), now).unwrap();
                },
                TransportAction::Failed { transaction, error } => {
                    assert_eq!(transaction, id);
                    assert_eq!(error, TransportError::TransactionTimeout { attempts: 3 });
                    failures += 1;
                },
                other => panic!("unexpected action {other:?}"),
            }
        }
    }

    assert_eq!(sends, 3);
    assert_eq!(failures, 1);
    assert_eq!(now - start, Duration::from_secs(28));
    assert_eq!(local.transport.active(), 0);
}

#[test]
fn vendor_query_is_answered() {
    let (mut local, mut remote) = sides();
    let src = local.transport.primary_address();
    let now = Instant::now();
    let (id, actions) = local.transport.send(&mut local.network, src, DEVICE, query(), now).unwrap();
    local.transport.handle_send_complete(id, Ok(()), now).unwrap();

    let request = transmitted(&actions)
        .iter()
        .flat_map(|pdu| remote.transport.handle_pdu(&mut remote.network, pdu, now).unwrap())
        .find_map(|action| match action {
            TransportAction::Received(message) => Some(message),
            _ => None,
        })
        .unwrap();
    assert_eq!(request.src, src);
    assert_eq!(request.parameters.as_ref(), &[0x10, 0x20]);

    let reply = MeshMessage::vendor(0x02, COMPANY, vec![0x42], 0).unwrap();
    let (reply_id, reply_actions) =
        remote.transport.send(&mut remote.network, DEVICE, request.src, reply, now).unwrap();
    remote.transport.handle_send_complete(reply_id, Ok(()), now).unwrap();

    let completed: Vec<_> = transmitted(&reply_actions)
        .iter()
        .flat_map(|pdu| local.transport.handle_pdu(&mut local.network, pdu, now).unwrap())
        .collect();
    match completed.as_slice() {
        [TransportAction::Completed { transaction, response: Some(response) }] => {
            assert_eq!(*transaction, id);
            assert_eq!(response.src, DEVICE);
            assert_eq!(response.parameters.as_ref(), &[0x42]);
        },
        other => panic!("unexpected actions {other:?}"),
    }
    assert_eq!(local.transport.next_deadline(), None);
}

#[test]
fn retry_after_lost_request_is_answered() {
    let (mut local, mut remote) = sides();
    let src = local.transport.primary_address();
    let start = Instant::now();
    let (id, _lost) = local.transport.send(&mut local.network, src, DEVICE, query(), start).unwrap();
    local.transport.handle_send_complete(id, Ok(()), start).unwrap();

    let retry_at = start + Duration::from_secs(4);
    let retry = local.transport.tick(&mut local.network, retry_at);
    local.transport.handle_send_complete(id, Ok(()), retry_at).unwrap();
    assert_eq!(local.transport.transaction(id).unwrap().attempts(), 2);

    let delivered: Vec<_> = transmitted(&retry)
        .iter()
        .flat_map(|pdu| remote.transport.handle_pdu(&mut remote.network, pdu, retry_at).unwrap())
        .collect();
    assert!(matches!(delivered.as_slice(), [TransportAction::Received(_)]));

    let reply = MeshMessage::vendor(0x02, COMPANY, vec![0x00], 0).unwrap();
    let (_, reply_actions) =
        remote.transport.send(&mut remote.network, DEVICE, src, reply, retry_at).unwrap();
    let completed: Vec<_> = transmitted(&reply_actions)
        .iter()
        .flat_map(|pdu| local.transport.handle_pdu(&mut local.network, pdu, retry_at).unwrap())
        .collect();
    assert!(matches!(
        completed.as_slice(),
        [TransportAction::Completed { transaction, .. }] if *transaction == id
    ));
}
