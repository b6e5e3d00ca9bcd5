//! Rats core - identity and configuration primitives.
//!
//! Provides the 160-bit identifier types shared by the DHT and the peer
//! mesh, the persisted Noise static key material, and the on-disk
//! configuration that keeps a node's identity stable across restarts.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod identifiers;
pub mod keys;

pub use config::{BootstrapNode, Config, ConfigError};
pub use identifiers::{sha1_digest, InfoHash, NodeId, PeerHash, ID_LEN};
pub use keys::StaticSecretKey;

/// Protocol version carried in the post-handshake hello frame.
///
/// Peers with a different major component are rejected.
pub const PROTOCOL_VERSION: &str = "1.0";
