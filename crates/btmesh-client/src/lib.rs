//! Async Bluetooth Mesh client.
//!
//! Glues the sans-IO [`btmesh_core::MeshTransport`] and the
//! [`btmesh_core::MeshNetwork`] model to a [`btmesh_core::Bearer`] on tokio.
//! The state machine decides; this crate only performs the I/O it asks for
//! and wakes it when deadlines pass.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod error;

pub use client::{MeshClient, PendingMessage};
pub use error::ClientError;
