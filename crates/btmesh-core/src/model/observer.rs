//! Change notifications.
//!
//! Observers register explicitly and receive every committed change in commit
//! order. Delivery happens after the change is visible in the model and must
//! not block; an observer that needs to do real work should forward the
//! event to a channel (an unbounded tokio sender is an observer as is).

use std::{fmt, sync::Arc};

use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use super::{KeyIndex, Provisioner, node::DeviceState};

/// A committed change to the network model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// Network key added
    NetKeyAdded(KeyIndex),
    /// Network key updated
    NetKeyUpdated(KeyIndex),
    /// Network key deleted
    NetKeyDeleted(KeyIndex),
    /// Application key added
    AppKeyAdded(KeyIndex),
    /// Application key updated
    AppKeyUpdated(KeyIndex),
    /// Application key deleted
    AppKeyDeleted(KeyIndex),
    /// Provisioner added
    ProvisionerAdded(Uuid),
    /// Provisioner updated
    ProvisionerUpdated(Uuid),
    /// Provisioner deleted
    ProvisionerDeleted(Uuid),
    /// The provisioner selection changed; carries the full list.
    ProvisionersUpdated {
        /// Every provisioner after the change
        provisioners: Vec<Provisioner>,
        /// The selected provisioner
        selected: Option<Uuid>,
    },
    /// Node added
    NodeAdded(Uuid),
    /// Node updated
    NodeUpdated(Uuid),
    /// Node deleted
    NodeDeleted {
        /// Node UUID
        node: Uuid,
        /// What the device was left with
        device: DeviceState,
    },
    /// Group added
    GroupAdded(u16),
    /// Group updated
    GroupUpdated(u16),
    /// Group deleted
    GroupDeleted(u16),
    /// Scene added
    SceneAdded(u16),
    /// Scene updated
    SceneUpdated(u16),
    /// Scene deleted
    SceneDeleted(u16),
    /// Network level fields changed (name, IV index, unicast cursor,
    /// sequence reservation)
    NetworkUpdated,
}

/// Receives committed changes.
pub trait NetworkObserver: Send + Sync {
    /// Called once per event, in commit order.
    fn on_event(&self, event: &NetworkEvent);
}

impl NetworkObserver for UnboundedSender<NetworkEvent> {
    fn on_event(&self, event: &NetworkEvent) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.send(event.clone());
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Registered observers.
#[derive(Default)]
pub(crate) struct Observers {
    next_id: u64,
    entries: Vec<(ObserverId, Arc<dyn NetworkObserver>)>,
}

impl Observers {
    pub(crate) fn subscribe(&mut self, observer: Arc<dyn NetworkObserver>) -> ObserverId {
        let id = ObserverId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, observer));
        id
    }

    pub(crate) fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    pub(crate) fn dispatch(&self, events: &[NetworkEvent]) {
        for event in events {
            for (_, observer) in &self.entries {
                observer.on_event(event);
            }
        }
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers").field("count", &self.entries.len()).finish()
    }
}
