//! Wire format for Bluetooth Mesh.
//!
//! Everything in this crate is plain data: addresses, opcodes, the lower
//! transport and network headers, and proxy configuration messages. There is
//! no cryptography and no state here. `btmesh-crypto` encrypts and
//! obfuscates the bytes produced by these types, and `btmesh-core` decides
//! when to produce them.
//!
//! # Layering
//!
//! ```text
//! access       opcode (1-3 bytes) || parameters
//! upper        AES-CCM(access)    || TransMIC (4 or 8 bytes)
//! lower        SEG|AKF|AID header || upper PDU or one segment of it
//! network      IVI|NID, CTL|TTL, SEQ, SRC, DST || lower PDU || NetMIC
//! ```
//!
//! # Security
//!
//! All parsing is bounds checked and returns [`ProtocolError`]. Header layouts
//! that are read directly from bytes use `zerocopy` so no parser needs unsafe
//! code.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod address;
pub mod errors;
pub mod features;
pub mod lower;
pub mod network;
pub mod opcode;
pub mod proxy;

pub use address::{MeshAddress, UNASSIGNED_ADDRESS};
pub use errors::{ProtocolError, Result};
pub use features::{CompositionData, CompositionElement, Features};
pub use lower::{LowerHeader, SegmentAck, SegmentHeader, full_block_mask};
pub use network::NetworkHeader;
pub use opcode::Opcode;
pub use proxy::{FilterType, ProxyConfigMessage};
