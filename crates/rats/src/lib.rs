//! Rats - a peer-to-peer mesh networking library.
//!
//! A [`RatsClient`] joins a decentralized mesh: it discovers peers
//! through a BEP-5 compatible Kademlia DHT, rendezvouses with other
//! rats nodes on a well-known info-hash, establishes Noise-encrypted
//! TCP channels, and exchanges structured messages and resumable file
//! transfers.
//!
//! ```no_run
//! use std::path::Path;
//! use rats::RatsClient;
//!
//! # async fn demo() -> Result<(), rats::RatsError> {
//! let client = RatsClient::open(Path::new("rats.json"), 8000)?;
//! client.start().await?;
//! let peer = client.connect("203.0.113.7", 8000).await?;
//! client.send_string(peer, "hello").await?;
//! client.stop().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod client;
pub mod error;

pub use client::{PeerInfo, RatsClient};
pub use error::{ErrorKind, RatsError};

pub use rats_core::{BootstrapNode, Config, InfoHash, NodeId, PeerHash, PROTOCOL_VERSION};
pub use rats_net::{discovery_hash, DisconnectReason, MeshHandler, SessionStats};
pub use rats_transfer::{
    Transfer, TransferDirection, TransferHandler, TransferOffer, TransferStatus,
};
pub use uuid::Uuid;
