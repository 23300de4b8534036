//! Deterministic simulation harness for Bluetooth Mesh testing.
//!
//! Seeded implementations of the [`btmesh_core::Environment`] and
//! [`btmesh_core::Bearer`] seams, simulated mesh devices, and a reference
//! model for model-based property tests.
//!
//! ```text
//!   World ── gateway (MeshNetwork + MeshTransport)
//!     │
//!     ├── medium: lossy, seeded, virtual clock
//!     │
//!     └── SimNode × n (own network copy + transport + device state)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod model;
pub mod sim_bearer;
pub mod sim_env;
pub mod sim_node;
pub mod world;

pub use model::{ModelWorld, NodeSlot, Operation, OperationError, OperationResult};
pub use sim_bearer::{SimBearer, SimMedium};
pub use sim_env::SimEnv;
pub use sim_node::SimNode;
pub use world::{Outcome, World};
