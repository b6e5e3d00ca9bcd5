//! Rats net - the encrypted peer mesh.
//!
//! Builds the peer-to-peer transport on four pieces:
//! - a Noise_XX session over TCP with length-prefixed AEAD frames
//! - a JSON application protocol spoken inside those frames
//! - a peer registry giving every session a stable hash identity
//! - the mesh engine tying accept/connect/handshake/dispatch together,
//!   plus the DHT-driven auto-discovery loop

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod discovery;
pub mod engine;
pub mod error;
pub mod frame;
pub mod noise;
pub mod registry;
pub mod session;
pub mod wire;

pub use discovery::{discovery_hash, Discovery, DiscoveryConfig};
pub use engine::{FileFrame, MeshConfig, MeshEngine, MeshHandler};
pub use error::NetError;
pub use registry::{ConnectDirection, PeerRegistry};
pub use session::{DisconnectReason, PeerSession, SessionStats};
pub use wire::{Body, DirEntry, Frame};

use std::time::Duration;

/// TCP connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Noise handshake plus hello exchange timeout.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// A session idle this long gets a keepalive ping.
pub const IDLE_PING_AFTER: Duration = Duration::from_secs(30);

/// A session silent this long is declared dead.
pub const SESSION_DEAD_AFTER: Duration = Duration::from_secs(60);

/// Grace period for tasks to finish during shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
