//! Client runtime against simulated devices on an in-memory medium.
//!
//! Tests run on paused tokio time: the clock jumps to the next timer only
//! when every task is idle, so retries and timeouts take no wall time.

use std::time::Duration;

use btmesh_client::{ClientError, MeshClient};
use btmesh_core::{
    Bearer, Environment, MeshMessage, MeshNetwork, MeshTransport, TransportConfig, TransportError,
    bearer::PduType,
    env::{SystemEnv, random_key, random_uuid},
    model::Node,
};
use btmesh_harness::{SimBearer, SimEnv, SimMedium, SimNode};
use btmesh_proto::{FilterType, ProxyConfigMessage, opcode::generic};
use chrono::DateTime;
use tokio::{task::JoinHandle, time::Instant};

struct Fixture {
    client: MeshClient<SimBearer, SystemEnv>,
    medium: SimMedium,
    device: SimNode,
    address: u16,
}

impl Fixture {
    fn new() -> Self {
        let env = SystemEnv;
        let timestamp = DateTime::parse_from_rfc3339("2026-05-05T05:05:05+00:00").unwrap();
        let mut network = MeshNetwork::new("client", timestamp, &env);
        network.create_provisioner("phone", &env).unwrap();
        network.create_network_key(&env).unwrap();
        network.create_app_key(0, &env).unwrap();

        let address = network.next_available_unicast(1).unwrap();
        let uuid = random_uuid(&env);
        let mut node = Node::new(uuid, "lamp", address, 1);
        node.device_key = Some(random_key(&env));
        node.net_keys.insert(0);
        node.app_keys.insert(0);
        node.config_complete = true;
        network.add_node(node).unwrap();

        let device = SimNode::new(network.state().clone(), uuid).unwrap();
        let medium = SimMedium::new(SimEnv::with_seed(1), 0.0);
        let client =
            MeshClient::new(network, medium.attach(), env, TransportConfig::default()).unwrap();
        Self { client, medium, device, address }
    }

    /// Spawn the client loop and the device; returns their handles.
    fn start(self) -> Running {
        let runner = tokio::spawn({
            let client = self.client.clone();
            async move { client.run().await }
        });
        let device = tokio::spawn(serve(self.device, self.medium.attach()));
        Running { client: self.client, medium: self.medium, address: self.address, runner, device }
    }
}

struct Running {
    client: MeshClient<SimBearer, SystemEnv>,
    medium: SimMedium,
    address: u16,
    runner: JoinHandle<Result<(), ClientError>>,
    device: JoinHandle<SimNode>,
}

impl Running {
    async fn stop(self) -> SimNode {
        self.medium.close();
        assert!(self.runner.await.unwrap().is_ok());
        self.device.await.unwrap()
    }
}

/// Answer network PDUs and fire the device's timers until the medium closes.
async fn serve(mut device: SimNode, bearer: SimBearer) -> SimNode {
    loop {
        let deadline = device.next_deadline();
        let timer = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(Instant::from_std(deadline)).await,
                None => std::future::pending::<()>().await,
            }
        };
        let replies = tokio::select! {
            received = bearer.recv() => match received {
                Ok(Some((PduType::Network, pdu))) => device.handle_pdu(&pdu, SystemEnv.now()),
                Ok(Some(_)) => Vec::new(),
                Ok(None) | Err(_) => return device,
            },
            () = timer => device.tick(SystemEnv.now()),
        };
        for pdu in replies {
            if bearer.send(PduType::Network, pdu, 0).await.is_err() {
                return device;
            }
        }
    }
}

#[tokio::test(start_paused = true)]
async fn acknowledged_set_returns_status() {
    let mesh = Fixture::new().start();

    let response = mesh
        .client
        .send(mesh.address, MeshMessage::generic_onoff_set(true, 1, 0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.opcode, generic::ONOFF_STATUS);
    assert_eq!(response.src, mesh.address);
    assert_eq!(response.parameters.as_ref(), &[1]);

    let device = mesh.stop().await;
    assert!(device.is_on());
}

#[tokio::test(start_paused = true)]
async fn segmented_app_key_add_is_acknowledged() {
    let mesh = Fixture::new().start();
    let key = {
        let network = mesh.client.network();
        let mut network = network.write().await;
        network.create_app_key(0, &SystemEnv).unwrap()
    };

    let response = mesh
        .client
        .send(mesh.address, MeshMessage::config_app_key_add(&key))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.parameters[0], 0x00);

    let device = mesh.stop().await;
    assert_eq!(device.network().app_key(key.index).map(|k| k.key), Some(key.key));
}

#[tokio::test(start_paused = true)]
async fn silent_device_times_out_after_retries() {
    let mut fixture = Fixture::new();
    fixture.device.set_silent(true);
    let mesh = fixture.start();
    let started = Instant::now();

    let err = mesh.client.send(mesh.address, MeshMessage::generic_onoff_get(0)).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Transport(TransportError::TransactionTimeout { attempts: 3 })
    ));
    assert!(err.is_retryable());
    assert!(started.elapsed() >= Duration::from_secs(28));

    let device = mesh.stop().await;
    assert_eq!(device.received().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn cancel_resolves_the_handle() {
    let mut fixture = Fixture::new();
    fixture.device.set_silent(true);
    let mesh = fixture.start();

    let pending = mesh.client.start(mesh.address, MeshMessage::generic_onoff_get(0)).await.unwrap();
    mesh.client.cancel(pending.id()).await.unwrap();
    let err = pending.response().await.unwrap_err();
    assert!(matches!(err, ClientError::Transport(TransportError::TransactionCancelled)));

    mesh.stop().await;
}

#[tokio::test(start_paused = true)]
async fn closing_the_bearer_cancels_pending_messages() {
    let mut fixture = Fixture::new();
    fixture.device.set_silent(true);
    let mesh = fixture.start();

    let pending = mesh.client.start(mesh.address, MeshMessage::generic_onoff_get(0)).await.unwrap();
    let client = mesh.client.clone();
    mesh.stop().await;

    let err = pending.response().await.unwrap_err();
    assert!(matches!(err, ClientError::Transport(TransportError::TransactionCancelled)));
    let err = client.send(0x0002, MeshMessage::generic_onoff_get(0)).await.unwrap_err();
    assert!(matches!(err, ClientError::Disconnected));
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_start_resolves_every_handle() {
    let mut fixture = Fixture::new();
    fixture.device.set_silent(true);
    let mesh = fixture.start();

    let starts: Vec<_> = (0..8)
        .map(|_| {
            let client = mesh.client.clone();
            let address = mesh.address;
            tokio::spawn(async move { client.start(address, MeshMessage::generic_onoff_get(0)).await })
        })
        .collect();
    tokio::task::yield_now().await;
    mesh.client.shutdown();

    for start in starts {
        match start.await.unwrap() {
            Ok(pending) => {
                let outcome = tokio::time::timeout(Duration::from_secs(60), pending.response()).await;
                assert!(
                    matches!(
                        outcome,
                        Ok(Err(ClientError::Transport(TransportError::TransactionCancelled)))
                    ),
                    "{outcome:?}"
                );
            },
            Err(err) => assert!(matches!(err, ClientError::Disconnected), "{err:?}"),
        }
    }
    mesh.stop().await;
}

#[tokio::test(start_paused = true)]
async fn late_status_reaches_subscribers() {
    let mesh = Fixture::new().start();
    let mut incoming = mesh.client.subscribe();

    // An unacknowledged Get completes on transmission; the status that
    // follows has no transaction waiting for it.
    let done = mesh
        .client
        .send(mesh.address, MeshMessage::generic(generic::ONOFF_GET, Vec::new(), 0))
        .await
        .unwrap();
    assert_eq!(done, None);

    let message = incoming.recv().await.unwrap();
    assert_eq!(message.src, mesh.address);
    assert_eq!(message.opcode, generic::ONOFF_STATUS);
    mesh.stop().await;
}

#[tokio::test(start_paused = true)]
async fn filter_changes_are_sent_once_and_resynced_on_mismatch() {
    let fixture = Fixture::new();
    let proxy = fixture.medium.attach();
    let state = fixture.client.network().read().await.state().clone();
    let mut proxy_network = MeshNetwork::from_state(state).unwrap();
    let proxy_transport = MeshTransport::new(TransportConfig::default(), fixture.address, 1);
    let client = fixture.client.clone();

    client.add_to_filter([0xC001, 0xC000, 0xC001]).await.unwrap();
    let (kind, pdu) = proxy.try_recv().unwrap();
    assert_eq!(kind, PduType::ProxyConfiguration);
    let (src, message) = proxy_transport.decode_proxy_configuration(&proxy_network, &pdu).unwrap();
    assert_eq!(src, client.primary_address());
    assert_eq!(message, ProxyConfigMessage::AddAddresses(vec![0xC000, 0xC001]));

    client.add_to_filter([0xC000]).await.unwrap();
    assert_eq!(proxy.try_recv(), None);

    let mesh = fixture.start();
    let status = ProxyConfigMessage::FilterStatus { filter_type: FilterType::Inclusion, list_size: 0 };
    let pdu = proxy_transport.encode_proxy_configuration(&mut proxy_network, &status).unwrap();
    proxy.send(PduType::ProxyConfiguration, pdu, 0).await.unwrap();

    let mut resync = Vec::new();
    while resync.len() < 2 {
        let (kind, pdu) = proxy.recv().await.unwrap().unwrap();
        if kind == PduType::ProxyConfiguration {
            resync.push(proxy_transport.decode_proxy_configuration(&proxy_network, &pdu).unwrap().1);
        }
    }
    assert_eq!(
        resync,
        vec![
            ProxyConfigMessage::SetFilterType(FilterType::Inclusion),
            ProxyConfigMessage::AddAddresses(vec![0xC000, 0xC001]),
        ]
    );
    mesh.stop().await;
}
