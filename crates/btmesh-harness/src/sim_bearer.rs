//! In-memory broadcast medium.
//!
//! Every [`SimBearer`] attached to a [`SimMedium`] hears what the others
//! send, like devices sharing the advertising channels. Loss is drawn from
//! the medium's [`SimEnv`], so drop patterns are reproducible.

use std::{
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use btmesh_core::{Bearer, bearer::PduType};
use bytes::Bytes;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::trace;

use crate::SimEnv;

type Delivery = (PduType, Bytes);

#[derive(Debug)]
struct Medium {
    env: SimEnv,
    loss_rate: f64,
    next_id: usize,
    endpoints: Vec<(usize, UnboundedSender<Delivery>)>,
    sent: u64,
    dropped: u64,
}

/// Shared medium connecting simulated bearers.
#[derive(Debug, Clone)]
pub struct SimMedium {
    inner: Arc<Mutex<Medium>>,
}

impl SimMedium {
    /// Medium that loses each delivery with probability `loss_rate`.
    pub fn new(env: SimEnv, loss_rate: f64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Medium {
                env,
                loss_rate,
                next_id: 0,
                endpoints: Vec::new(),
                sent: 0,
                dropped: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Medium> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a new bearer.
    pub fn attach(&self) -> SimBearer {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut medium = self.lock();
        let id = medium.next_id;
        medium.next_id += 1;
        medium.endpoints.push((id, tx));
        SimBearer { id, medium: self.clone(), rx: tokio::sync::Mutex::new(rx) }
    }

    /// Change the loss rate.
    pub fn set_loss_rate(&self, loss_rate: f64) {
        self.lock().loss_rate = loss_rate;
    }

    /// Detach every bearer; pending and future receives return `None`.
    pub fn close(&self) {
        self.lock().endpoints.clear();
    }

    /// Deliveries attempted so far.
    pub fn sent(&self) -> u64 {
        self.lock().sent
    }

    /// Deliveries lost so far.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    fn broadcast(&self, from: usize, kind: PduType, pdu: &Bytes) -> io::Result<()> {
        let mut medium = self.lock();
        if !medium.endpoints.iter().any(|(id, _)| *id == from) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "bearer detached"));
        }
        let mut lost = 0;
        let mut delivered = 0;
        for (id, tx) in &medium.endpoints {
            if *id == from {
                continue;
            }
            if medium.env.chance(medium.loss_rate) {
                lost += 1;
            } else if tx.send((kind, pdu.clone())).is_ok() {
                delivered += 1;
            }
        }
        medium.sent += lost + delivered;
        medium.dropped += lost;
        trace!(from, len = pdu.len(), delivered, lost, "pdu broadcast");
        Ok(())
    }

    fn detach(&self, id: usize) {
        self.lock().endpoints.retain(|(endpoint, _)| *endpoint != id);
    }
}

/// A bearer on a [`SimMedium`].
#[derive(Debug)]
pub struct SimBearer {
    id: usize,
    medium: SimMedium,
    rx: tokio::sync::Mutex<UnboundedReceiver<Delivery>>,
}

impl SimBearer {
    /// Next PDU if one is queued, without waiting.
    pub fn try_recv(&self) -> Option<Delivery> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Leave the medium. Queued PDUs can still be received.
    pub fn disconnect(&self) {
        self.medium.detach(self.id);
    }

    /// The medium this bearer is attached to.
    pub fn medium(&self) -> &SimMedium {
        &self.medium
    }
}

#[async_trait]
impl Bearer for SimBearer {
    async fn send(&self, kind: PduType, pdu: Bytes, _destination: u16) -> io::Result<()> {
        self.medium.broadcast(self.id, kind, &pdu)
    }

    async fn recv(&self) -> io::Result<Option<Delivery>> {
        Ok(self.rx.lock().await.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_skips_sender() {
        let medium = SimMedium::new(SimEnv::with_seed(1), 0.0);
        let (a, b, c) = (medium.attach(), medium.attach(), medium.attach());

        a.send(PduType::Network, Bytes::from_static(b"hello"), 0x0002).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Some((PduType::Network, Bytes::from_static(b"hello"))));
        assert_eq!(c.try_recv(), Some((PduType::Network, Bytes::from_static(b"hello"))));
        assert_eq!(a.try_recv(), None);
        assert_eq!(medium.sent(), 2);
    }

    #[tokio::test]
    async fn total_loss_drops_everything() {
        let medium = SimMedium::new(SimEnv::with_seed(1), 1.0);
        let (a, b) = (medium.attach(), medium.attach());

        a.send(PduType::Network, Bytes::from_static(b"x"), 0x0002).await.unwrap();
        assert_eq!(b.try_recv(), None);
        assert_eq!(medium.dropped(), 1);
    }

    #[tokio::test]
    async fn close_ends_receives() {
        let medium = SimMedium::new(SimEnv::with_seed(1), 0.0);
        let (a, b) = (medium.attach(), medium.attach());
        medium.close();

        assert_eq!(b.recv().await.unwrap(), None);
        let err = a.send(PduType::Network, Bytes::new(), 0).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn disconnected_bearer_stops_hearing() {
        let medium = SimMedium::new(SimEnv::with_seed(1), 0.0);
        let (a, b) = (medium.attach(), medium.attach());
        b.disconnect();

        a.send(PduType::Network, Bytes::from_static(b"x"), 0x0002).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), None);
    }
}
