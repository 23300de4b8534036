//! Bluetooth Mesh security toolbox.
//!
//! Every mesh message is protected twice. The upper transport layer encrypts
//! the access payload with an application key (or a node's device key), and
//! the network layer encrypts the result again with a network key and then
//! obfuscates the header so that sequence numbers and sources are not visible
//! to passive observers.
//!
//! All key material is derived from 128-bit keys with AES-CMAC based
//! functions:
//!
//! - `k2` turns a network key into its NID, encryption key and privacy key
//! - `k3` gives the 64-bit network identifier used in beacons
//! - `k4` gives the 6-bit AID that tells a receiver which application key to
//!   try
//!
//! # Security
//!
//! Nonces include the sequence number and IV index, so the caller must never
//! encrypt twice with the same `(SEQ, SRC, IV index)` triple. Sequence number
//! allocation lives in `btmesh-core`; this crate only assembles the bytes.

mod aead;
pub mod error;
pub mod keys;
pub mod network;
pub mod nonce;
pub mod toolbox;

pub use aead::{MicSize, decrypt, encrypt};
pub use error::CryptoError;
pub use keys::{NetworkKeyMaterial, aid, virtual_address};
pub use network::{NetworkNonceKind, decrypt_network_pdu, encrypt_network_pdu};
pub use nonce::Nonce;

/// A 128-bit AES key.
pub type Key = [u8; 16];
