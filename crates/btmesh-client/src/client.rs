//! Async mesh client.
//!
//! [`MeshClient`] owns the network model, the transport state machine of
//! the local node and a [`Bearer`]. Callers start messages and await their
//! outcome; [`MeshClient::run`] pumps inbound PDUs and timer deadlines into
//! the state machine until the bearer closes or [`MeshClient::shutdown`] is
//! called.
//!
//! ```text
//!  send() ──► transport.send ──► Transmit ──► bearer
//!                                   ▲            │
//!  run()  ── recv / deadline ───────┘            ▼
//!            Completed / Failed ──► oneshot ──► caller
//! ```
//!
//! Lock order is network, then transport. Bearer I/O happens with neither
//! held.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError},
};

use btmesh_core::{
    Bearer, Environment, MeshMessage, MeshNetwork, MeshTransport, ModelError, ProxyFilter,
    TransportAction, TransportConfig, TransportError,
    bearer::PduType,
    transport::{AccessMessage, TransactionId},
};
use btmesh_proto::{FilterType, ProxyConfigMessage, address::UNASSIGNED_ADDRESS};
use tokio::sync::{Mutex, Notify, RwLock, broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::ClientError;

/// Capacity of the unsolicited message channel.
const INCOMING_CAPACITY: usize = 64;

type Completion = oneshot::Sender<Result<Option<AccessMessage>, TransportError>>;

struct Inner<B, E> {
    network: Arc<RwLock<MeshNetwork>>,
    transport: Mutex<MeshTransport>,
    proxy: Mutex<ProxyFilter>,
    pending: StdMutex<HashMap<TransactionId, Completion>>,
    incoming: broadcast::Sender<AccessMessage>,
    bearer: B,
    env: E,
    primary_address: u16,
    wake: Notify,
    shutdown: CancellationToken,
}

/// A message in flight.
#[derive(Debug)]
pub struct PendingMessage {
    id: TransactionId,
    outcome: oneshot::Receiver<Result<Option<AccessMessage>, TransportError>>,
}

impl PendingMessage {
    /// Transaction id, for [`MeshClient::cancel`].
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Wait for the outcome: the response of an acknowledged message, or
    /// `None` once an unacknowledged message is sent.
    pub async fn response(self) -> Result<Option<AccessMessage>, ClientError> {
        let outcome = self.outcome.await.map_err(|_| ClientError::Disconnected)?;
        Ok(outcome?)
    }
}

/// Mesh client over bearer `B`.
///
/// Cheap to clone; clones share the same state.
pub struct MeshClient<B, E> {
    inner: Arc<Inner<B, E>>,
}

impl<B, E> Clone for MeshClient<B, E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<B: Bearer, E: Environment> MeshClient<B, E> {
    /// Client acting as the network's selected provisioner.
    pub fn new(
        network: MeshNetwork,
        bearer: B,
        env: E,
        config: TransportConfig,
    ) -> Result<Self, ClientError> {
        let primary_address = network
            .selected_provisioner()
            .and_then(|provisioner| provisioner.address)
            .ok_or(ModelError::NoProvisionerSelected)?;
        let (incoming, _) = broadcast::channel(INCOMING_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                network: Arc::new(RwLock::new(network)),
                transport: Mutex::new(MeshTransport::new(config, primary_address, 1)),
                proxy: Mutex::new(ProxyFilter::new()),
                pending: StdMutex::new(HashMap::new()),
                incoming,
                bearer,
                env,
                primary_address,
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// The network model. Take the write lock for edits; the client takes
    /// it while processing PDUs.
    pub fn network(&self) -> Arc<RwLock<MeshNetwork>> {
        Arc::clone(&self.inner.network)
    }

    /// Address of the local node.
    pub fn primary_address(&self) -> u16 {
        self.inner.primary_address
    }

    /// Messages that arrive without a transaction waiting for them.
    pub fn subscribe(&self) -> broadcast::Receiver<AccessMessage> {
        self.inner.incoming.subscribe()
    }

    /// Send `message` to `dst` and wait for its outcome.
    pub async fn send(
        &self,
        dst: u16,
        message: MeshMessage,
    ) -> Result<Option<AccessMessage>, ClientError> {
        self.start(dst, message).await?.response().await
    }

    /// Start sending `message` to `dst`. The returned handle resolves when
    /// the transaction completes or fails.
    ///
    /// If the returned future is dropped before it resolves, the transaction
    /// fails once the transport's send timeout passes.
    pub async fn start(&self, dst: u16, message: MeshMessage) -> Result<PendingMessage, ClientError> {
        let now = self.inner.env.now();
        let (id, outcome, actions) = {
            let mut network = self.inner.network.write().await;
            let mut transport = self.inner.transport.lock().await;
            // Shutdown cancels the token before it takes the transport lock
            // to cancel everything, so a transaction registered here is seen.
            if self.inner.shutdown.is_cancelled() {
                return Err(ClientError::Disconnected);
            }
            let (id, actions) =
                transport.send(&mut network, self.inner.primary_address, dst, message, now)?;
            let (tx, outcome) = oneshot::channel();
            self.pending().insert(id, tx);
            (id, outcome, actions)
        };
        debug!(transaction = %id, dst, "message started");

        self.execute(actions).await;
        self.inner.wake.notify_one();
        Ok(PendingMessage { id, outcome })
    }

    /// Cancel a transaction. Its handle resolves with
    /// [`TransportError::TransactionCancelled`].
    pub async fn cancel(&self, id: TransactionId) -> Result<(), ClientError> {
        let actions = self.inner.transport.lock().await.cancel(id)?;
        self.execute(actions).await;
        Ok(())
    }

    /// Switch the proxy filter type; the list is cleared.
    pub async fn set_filter_type(&self, filter_type: FilterType) -> Result<(), ClientError> {
        let message = self.inner.proxy.lock().await.set_filter_type(filter_type);
        self.send_proxy_configuration(message.into_iter().collect()).await
    }

    /// Add addresses to the proxy filter. Addresses already on it are not
    /// sent again.
    pub async fn add_to_filter(
        &self,
        addresses: impl IntoIterator<Item = u16>,
    ) -> Result<(), ClientError> {
        let messages = self.inner.proxy.lock().await.add_addresses(addresses);
        self.send_proxy_configuration(messages).await
    }

    /// Remove addresses from the proxy filter.
    pub async fn remove_from_filter(
        &self,
        addresses: impl IntoIterator<Item = u16>,
    ) -> Result<(), ClientError> {
        let messages = self.inner.proxy.lock().await.remove_addresses(addresses);
        self.send_proxy_configuration(messages).await
    }

    /// Forget the proxy filter after connecting to a new proxy.
    pub async fn reset_proxy_filter(&self) {
        self.inner.proxy.lock().await.reset();
    }

    /// Stop [`MeshClient::run`]. Transactions in progress are cancelled.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Drive the client until the bearer closes or [`MeshClient::shutdown`]
    /// is called. Every transaction still in progress is then cancelled.
    pub async fn run(&self) -> Result<(), ClientError> {
        let inner = &self.inner;
        info!(address = inner.primary_address, "mesh client running");

        let result = loop {
            let deadline = inner.transport.lock().await.next_deadline();
            let timer = async {
                match deadline {
                    Some(deadline) => {
                        inner.env.sleep(deadline.saturating_duration_since(inner.env.now())).await;
                    },
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                () = inner.shutdown.cancelled() => break Ok(()),
                received = inner.bearer.recv() => match received {
                    Ok(Some((PduType::Network, pdu))) => self.handle_network_pdu(&pdu).await,
                    Ok(Some((PduType::ProxyConfiguration, pdu))) => self.handle_proxy_pdu(&pdu).await,
                    Ok(None) => {
                        info!("bearer closed");
                        break Ok(());
                    },
                    Err(err) => {
                        warn!(%err, "bearer failed");
                        break Err(ClientError::Bearer(err));
                    },
                },
                () = timer => self.tick().await,
                () = inner.wake.notified() => {},
            }
        };

        self.disconnect().await;
        result
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<TransactionId, Completion>> {
        self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn handle_network_pdu(&self, pdu: &[u8]) {
        let now = self.inner.env.now();
        let result = {
            let mut network = self.inner.network.write().await;
            let mut transport = self.inner.transport.lock().await;
            transport.handle_pdu(&mut network, pdu, now)
        };
        match result {
            Ok(actions) => self.execute(actions).await,
            Err(err) => warn!(%err, len = pdu.len(), "inbound network PDU rejected"),
        }
    }

    async fn handle_proxy_pdu(&self, pdu: &[u8]) {
        let decoded = {
            let network = self.inner.network.read().await;
            let transport = self.inner.transport.lock().await;
            transport.decode_proxy_configuration(&network, pdu)
        };
        match decoded {
            Ok((src, ProxyConfigMessage::FilterStatus { filter_type, list_size })) => {
                trace!(src, ?filter_type, list_size, "proxy filter status");
                let resync = self.inner.proxy.lock().await.handle_status(filter_type, list_size);
                if let Err(err) = self.send_proxy_configuration(resync).await {
                    warn!(%err, "proxy filter resync failed");
                }
            },
            Ok((src, message)) => debug!(src, ?message, "unexpected proxy configuration message"),
            Err(err) => warn!(%err, "proxy configuration PDU rejected"),
        }
    }

    async fn tick(&self) {
        let now = self.inner.env.now();
        let actions = {
            let mut network = self.inner.network.write().await;
            let mut transport = self.inner.transport.lock().await;
            transport.tick(&mut network, now)
        };
        self.execute(actions).await;
    }

    async fn disconnect(&self) {
        self.inner.shutdown.cancel();
        let actions = self.inner.transport.lock().await.cancel_all();
        self.execute(actions).await;
        // Anything left was never handed to the transport's timers.
        let orphaned = self.pending().drain().count();
        if orphaned > 0 {
            debug!(orphaned, "pending messages dropped");
        }
        info!("mesh client stopped");
    }

    async fn send_proxy_configuration(
        &self,
        messages: Vec<ProxyConfigMessage>,
    ) -> Result<(), ClientError> {
        for message in messages {
            let pdu = {
                let mut network = self.inner.network.write().await;
                let transport = self.inner.transport.lock().await;
                transport.encode_proxy_configuration(&mut network, &message)?
            };
            self.inner.bearer.send(PduType::ProxyConfiguration, pdu, UNASSIGNED_ADDRESS).await?;
            debug!(?message, "proxy configuration sent");
        }
        Ok(())
    }

    async fn execute(&self, actions: Vec<TransportAction>) {
        let mut queue = VecDeque::from(actions);
        while let Some(action) = queue.pop_front() {
            match action {
                TransportAction::Transmit { transaction, pdus, destination } => {
                    let mut result = Ok(());
                    for pdu in pdus {
                        if let Err(err) =
                            self.inner.bearer.send(PduType::Network, pdu, destination).await
                        {
                            result = Err(err.to_string());
                            break;
                        }
                    }
                    match transaction {
                        Some(id) => {
                            let now = self.inner.env.now();
                            let more = self.inner.transport.lock().await.handle_send_complete(
                                id, result, now,
                            );
                            match more {
                                Ok(more) => queue.extend(more),
                                Err(err) => debug!(%err, "send completion ignored"),
                            }
                            self.inner.wake.notify_one();
                        },
                        None => {
                            if let Err(reason) = result {
                                warn!(%reason, destination, "segment acknowledgment not sent");
                            }
                        },
                    }
                },
                TransportAction::Completed { transaction, response } => {
                    self.finish(transaction, Ok(response)).await;
                },
                TransportAction::Failed { transaction, error } => {
                    self.finish(transaction, Err(error)).await;
                },
                TransportAction::Received(message) => {
                    trace!(src = message.src, opcode = %message.opcode, "unsolicited message");
                    // No subscribers is fine.
                    let _ = self.inner.incoming.send(message);
                },
            }
        }
    }

    async fn finish(
        &self,
        id: TransactionId,
        outcome: Result<Option<AccessMessage>, TransportError>,
    ) {
        match &outcome {
            Ok(_) => debug!(transaction = %id, "message complete"),
            Err(err) => debug!(transaction = %id, %err, "message failed"),
        }
        let waiter = self.pending().remove(&id);
        if let Some(waiter) = waiter {
            // The caller may have dropped its handle.
            let _ = waiter.send(outcome);
        }
        self.inner.transport.lock().await.forget(id);
    }
}
