//! Bluetooth Mesh protocol core logic
//!
//! The authoritative network model and the message transport state machine,
//! both decoupled from I/O.
//!
//! # Architecture
//!
//! [`MeshNetwork`] owns keys, provisioners, nodes, groups and scenes. Every
//! mutating call validates the prospective state in full before anything is
//! changed, so a rejected call leaves the model exactly as it was. Committed
//! changes are then reported to registered observers in commit order.
//!
//! [`MeshTransport`] turns messages into encrypted network PDUs and tracks
//! one transaction per outstanding message. Like the model it never performs
//! I/O: time is passed in, and every call returns [`TransportAction`]s for a
//! runtime or test harness to execute.
//!
//! # Components
//!
//! - [`model`]: Network model, key store, address allocation, JSON document
//! - [`transport`]: Message transport state machine
//! - [`proxy`]: Proxy filter bookkeeping
//! - [`mod@env`]: Environment abstraction (time, RNG)
//! - [`bearer`]: Bearer abstraction (advertising or GATT proxy)
//! - [`error`]: Model and transport error types

pub mod bearer;
pub mod env;
pub mod error;
pub mod model;
pub mod proxy;
pub mod transport;

pub use bearer::Bearer;
pub use env::Environment;
pub use error::{ModelError, TransportError};
pub use model::{MeshNetwork, NetworkEvent, NetworkObserver};
pub use proxy::ProxyFilter;
pub use transport::{MeshMessage, MeshTransport, TransportAction, TransportConfig};
