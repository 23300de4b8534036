#![no_main]

use std::time::{Duration, Instant};

use arbitrary::Arbitrary;
use btmesh_core::{
    MeshNetwork, MeshTransport, TransportConfig,
    env::{random_key, random_uuid},
    model::Node,
};
use btmesh_crypto::{NetworkNonceKind, encrypt_network_pdu};
use btmesh_harness::SimEnv;
use btmesh_proto::NetworkHeader;
use chrono::DateTime;
use libfuzzer_sys::fuzz_target;

/// One lower transport PDU from the remote node.
#[derive(Debug, Arbitrary)]
struct Delivery {
    seq_step: u8,
    ctl: bool,
    lower: Vec<u8>,
    delay_ms: u16,
}

fuzz_target!(|deliveries: Vec<Delivery>| {
    let env = SimEnv::with_seed(7);
    let Ok(timestamp) = DateTime::parse_from_rfc3339("2026-01-01T00:00:00+00:00") else {
        return;
    };
    let mut network = MeshNetwork::new("fuzz", timestamp, &env);
    let provisioner = network.create_provisioner("fuzzer", &env).unwrap();
    let key = network.create_network_key(&env).unwrap();
    network.create_app_key(key.index, &env).unwrap();

    let remote = network.next_available_unicast(1).unwrap();
    let mut node = Node::new(random_uuid(&env), "remote", remote, 1);
    node.device_key = Some(random_key(&env));
    node.net_keys.insert(key.index);
    network.add_node(node).unwrap();

    let local = provisioner.address.unwrap();
    let mut transport = MeshTransport::new(TransportConfig::default(), local, 1);
    let material = key.transmit_material();
    let iv_index = network.iv_index().index;

    let mut now = Instant::now();
    let mut seq = 0u32;
    for delivery in deliveries.iter().take(64) {
        seq += u32::from(delivery.seq_step);
        now += Duration::from_millis(u64::from(delivery.delay_ms));
        let header = NetworkHeader::new(
            iv_index & 1 == 1,
            material.nid,
            delivery.ctl,
            5,
            seq,
            remote,
            local,
        );
        let lower = &delivery.lower[..delivery.lower.len().min(16)];
        let Ok(pdu) =
            encrypt_network_pdu(&material, iv_index, &header, lower, NetworkNonceKind::Network)
        else {
            continue;
        };
        let _ = transport.handle_pdu(&mut network, &pdu, now);
        if transport.next_deadline().is_some_and(|deadline| deadline <= now) {
            transport.tick(&mut network, now);
        }
    }

    // Every partial message is dropped once the incomplete timer runs out.
    let later = now + transport.config().incomplete_timeout + Duration::from_secs(1);
    transport.tick(&mut network, later);
    assert_eq!(transport.incomplete_messages(), 0);
});
