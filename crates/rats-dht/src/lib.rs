//! Rats DHT - Kademlia distributed hash table.
//!
//! Implements a BEP-5 compatible Mainline DHT node used for content-hash
//! lookup and mesh rendezvous:
//! - KRPC request/response correlation over UDP
//! - K-bucket routing table with contact quality tracking
//! - Iterative `find_node` / `get_peers` lookups
//! - Token-guarded `announce_peer` storage

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod error;
pub mod krpc;
pub mod lookup;
pub mod node;
pub mod routing;
pub mod socket;
pub mod storage;
pub mod token;

pub use error::DhtError;
pub use node::{DhtConfig, DhtHandle, DhtNode, LookupOutcome};
pub use routing::{Contact, ContactStatus, RoutingTable};

/// Bucket size (k).
pub const K: usize = 8;

/// Lookup parallelism (alpha).
pub const ALPHA: usize = 3;

/// Iterative lookups keep at most this many candidates.
pub const MAX_LOOKUP_CANDIDATES: usize = 20;

/// Deadline for a single KRPC request.
pub const REQUEST_TIMEOUT_SECS: u64 = 5;

/// A contact unheard from for this long is questionable.
pub const QUESTIONABLE_AFTER_SECS: u64 = 15 * 60;

/// Consecutive failed pings before a contact is bad.
pub const MAX_CONTACT_FAILURES: u8 = 2;

/// Interval between bucket refresh passes.
pub const REFRESH_INTERVAL_SECS: u64 = 15 * 60;

/// Announced peers expire after this long.
pub const PEER_TTL_SECS: u64 = 30 * 60;
