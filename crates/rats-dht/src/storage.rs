//! Storage for announced peers.
//!
//! Maps each info-hash to the endpoints that announced it. Entries
//! expire after 30 minutes; the table is bounded to 1000 info-hashes
//! (least-recently-announced evicted first) and 8 peers per info-hash
//! (oldest evicted).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rats_core::InfoHash;

use crate::PEER_TTL_SECS;

/// Maximum number of tracked info-hashes.
const MAX_INFO_HASHES: usize = 1000;

/// Maximum peers stored per info-hash.
const MAX_PEERS_PER_HASH: usize = 8;

#[derive(Debug)]
struct PeerSet {
    peers: HashMap<SocketAddr, Instant>,
    last_announce: Instant,
}

/// Bounded store of announced peers.
pub struct PeerStore {
    entries: HashMap<InfoHash, PeerSet>,
    peer_ttl: Duration,
}

impl PeerStore {
    /// Creates an empty store with the standard TTL.
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(PEER_TTL_SECS))
    }

    /// Creates an empty store with a custom TTL (used by tests).
    pub fn with_ttl(peer_ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            peer_ttl,
        }
    }

    /// Records `peer` as announced for `info_hash`.
    pub fn insert(&mut self, info_hash: InfoHash, peer: SocketAddr) {
        let now = Instant::now();

        if !self.entries.contains_key(&info_hash) && self.entries.len() >= MAX_INFO_HASHES {
            self.evict_least_recent();
        }

        let set = self.entries.entry(info_hash).or_insert_with(|| PeerSet {
            peers: HashMap::new(),
            last_announce: now,
        });
        set.last_announce = now;
        set.peers.retain(|_, inserted| inserted.elapsed() < self.peer_ttl);

        if set.peers.len() >= MAX_PEERS_PER_HASH && !set.peers.contains_key(&peer) {
            if let Some(oldest) = set
                .peers
                .iter()
                .min_by_key(|(_, inserted)| **inserted)
                .map(|(addr, _)| *addr)
            {
                set.peers.remove(&oldest);
            }
        }
        set.peers.insert(peer, now);
    }

    /// Returns the live peers announced for `info_hash`.
    pub fn get(&mut self, info_hash: &InfoHash) -> Vec<SocketAddr> {
        let ttl = self.peer_ttl;
        match self.entries.get_mut(info_hash) {
            Some(set) => {
                set.peers.retain(|_, inserted| inserted.elapsed() < ttl);
                set.peers.keys().copied().collect()
            }
            None => Vec::new(),
        }
    }

    /// Drops expired peers and empty entries.
    pub fn expire(&mut self) {
        let ttl = self.peer_ttl;
        self.entries.retain(|_, set| {
            set.peers.retain(|_, inserted| inserted.elapsed() < ttl);
            !set.peers.is_empty()
        });
    }

    /// Number of tracked info-hashes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_least_recent(&mut self) {
        if let Some(victim) = self
            .entries
            .iter()
            .min_by_key(|(_, set)| set.last_announce)
            .map(|(hash, _)| *hash)
        {
            self.entries.remove(&victim);
        }
    }
}

impl Default for PeerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn test_insert_and_get() {
        let mut store = PeerStore::new();
        let hash = InfoHash::random();
        store.insert(hash, peer(9000));

        assert_eq!(store.get(&hash), vec![peer(9000)]);
        assert!(store.get(&InfoHash::random()).is_empty());
    }

    #[test]
    fn test_per_hash_peer_cap() {
        let mut store = PeerStore::new();
        let hash = InfoHash::random();
        for port in 0..20 {
            store.insert(hash, peer(9000 + port));
        }
        assert_eq!(store.get(&hash).len(), MAX_PEERS_PER_HASH);
    }

    #[test]
    fn test_info_hash_cap_evicts_least_recent() {
        let mut store = PeerStore::new();
        let first = InfoHash::new([0u8; 20]);
        store.insert(first, peer(1));

        for i in 0..MAX_INFO_HASHES {
            let mut bytes = [0u8; 20];
            bytes[..8].copy_from_slice(&(i as u64 + 1).to_be_bytes());
            store.insert(InfoHash::new(bytes), peer(2));
        }

        assert!(store.len() <= MAX_INFO_HASHES);
        assert!(store.get(&first).is_empty());
    }

    #[test]
    fn test_expiry() {
        let mut store = PeerStore::with_ttl(Duration::from_millis(0));
        let hash = InfoHash::random();
        store.insert(hash, peer(9000));

        std::thread::sleep(Duration::from_millis(5));
        assert!(store.get(&hash).is_empty());

        store.expire();
        assert!(store.is_empty());
    }

    #[test]
    fn test_reannounce_refreshes_peer() {
        let mut store = PeerStore::new();
        let hash = InfoHash::random();
        store.insert(hash, peer(9000));
        store.insert(hash, peer(9000));
        assert_eq!(store.get(&hash).len(), 1);
    }
}
