//! Bearer abstraction.
//!
//! A bearer carries network PDUs between this client and the mesh: the
//! advertising bearer, or a GATT connection to a proxy node. Production
//! bearers live outside this crate; tests use the in-memory bearer from the
//! simulation harness.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;

/// What a PDU on the bearer contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PduType {
    /// Network PDU
    Network,
    /// Proxy configuration PDU (only on a proxy connection)
    ProxyConfiguration,
}

/// Carries PDUs to and from the mesh.
#[async_trait]
pub trait Bearer: Send + Sync + 'static {
    /// Send one PDU.
    ///
    /// `destination` is the mesh destination address of the PDU. Bearers
    /// that broadcast ignore it; simulated bearers use it for routing.
    /// Completion means the PDU left this device, not that it was delivered.
    async fn send(&self, kind: PduType, pdu: Bytes, destination: u16) -> io::Result<()>;

    /// Receive the next PDU.
    ///
    /// Returns `Ok(None)` once the bearer is closed. Must be cancel safe:
    /// runtimes race it against timers.
    async fn recv(&self) -> io::Result<Option<(PduType, Bytes)>>;
}
