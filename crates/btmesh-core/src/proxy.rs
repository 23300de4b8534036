//! Proxy filter bookkeeping.
//!
//! A client connected to a proxy node only receives messages whose
//! destination passes the proxy's filter. [`ProxyFilter`] remembers what was
//! last pushed to the proxy and turns requested changes into the
//! [`ProxyConfigMessage`]s that bring the proxy in line. It performs no I/O;
//! encrypting the messages is [`crate::MeshTransport::encode_proxy_configuration`]'s
//! job.

use std::collections::BTreeSet;

use btmesh_proto::{FilterType, ProxyConfigMessage};
use tracing::{debug, warn};

/// Addresses that fit one proxy configuration PDU.
///
/// A network PDU carries at most 12 bytes of proxy configuration after the
/// 64-bit NetMIC: the opcode plus five 16-bit addresses.
pub const MAX_ADDRESSES_PER_MESSAGE: usize = 5;

/// Filter state of the current proxy connection.
///
/// The filter is not persisted. A proxy starts every connection with an empty
/// inclusion list, so call [`ProxyFilter::reset`] whenever a new proxy
/// connection is established and push the addresses again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyFilter {
    filter_type: FilterType,
    addresses: BTreeSet<u16>,
}

impl ProxyFilter {
    /// Empty inclusion list, the state of a fresh proxy connection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current filter type.
    pub fn filter_type(&self) -> FilterType {
        self.filter_type
    }

    /// Addresses pushed to the proxy.
    pub fn addresses(&self) -> &BTreeSet<u16> {
        &self.addresses
    }

    /// Forget everything; the proxy connection was (re)established.
    pub fn reset(&mut self) {
        debug!("proxy filter reset");
        *self = Self::default();
    }

    /// Switch the filter type. The proxy clears its list when the type is
    /// set, and so does this filter.
    ///
    /// Returns `None` if the filter already has this type and an empty list.
    pub fn set_filter_type(&mut self, filter_type: FilterType) -> Option<ProxyConfigMessage> {
        if self.filter_type == filter_type && self.addresses.is_empty() {
            return None;
        }
        self.filter_type = filter_type;
        self.addresses.clear();
        debug!(?filter_type, "proxy filter type set");
        Some(ProxyConfigMessage::SetFilterType(filter_type))
    }

    /// Add addresses. Returns the messages for the addresses not yet on the
    /// list; empty if there are none.
    pub fn add_addresses(
        &mut self,
        addresses: impl IntoIterator<Item = u16>,
    ) -> Vec<ProxyConfigMessage> {
        let delta: Vec<u16> = addresses
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|address| !self.addresses.contains(address))
            .collect();
        self.addresses.extend(&delta);
        chunked(&delta, ProxyConfigMessage::AddAddresses)
    }

    /// Remove addresses. Returns the messages for the addresses actually on
    /// the list; empty if there are none.
    pub fn remove_addresses(
        &mut self,
        addresses: impl IntoIterator<Item = u16>,
    ) -> Vec<ProxyConfigMessage> {
        let delta: Vec<u16> = addresses
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|address| self.addresses.remove(address))
            .collect();
        chunked(&delta, ProxyConfigMessage::RemoveAddresses)
    }

    /// Check a Filter Status against the expected state.
    ///
    /// On mismatch, returns the messages that push the whole filter again.
    pub fn handle_status(&self, filter_type: FilterType, list_size: u16) -> Vec<ProxyConfigMessage> {
        if filter_type == self.filter_type && usize::from(list_size) == self.addresses.len() {
            return Vec::new();
        }
        warn!(
            ?filter_type,
            list_size,
            expected_type = ?self.filter_type,
            expected_size = self.addresses.len(),
            "proxy filter out of sync"
        );
        self.resync()
    }

    /// Messages that rebuild the filter on a proxy from scratch.
    pub fn resync(&self) -> Vec<ProxyConfigMessage> {
        let addresses: Vec<u16> = self.addresses.iter().copied().collect();
        let mut messages = vec![ProxyConfigMessage::SetFilterType(self.filter_type)];
        messages.extend(chunked(&addresses, ProxyConfigMessage::AddAddresses));
        messages
    }
}

fn chunked(
    addresses: &[u16],
    message: impl Fn(Vec<u16>) -> ProxyConfigMessage,
) -> Vec<ProxyConfigMessage> {
    addresses.chunks(MAX_ADDRESSES_PER_MESSAGE).map(|chunk| message(chunk.to_vec())).collect()
}
