//! Peer registry.
//!
//! Tracks every live session by stable peer hash and by remote socket
//! address, plus half-open connections still in handshake. Everything
//! sits behind a single readers-writer lock; the two maps are kept as
//! mutual inverses.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use rats_core::PeerHash;

use crate::session::PeerSession;

/// Who opened the TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectDirection {
    /// The remote dialed us
    Inbound,
    /// We dialed the remote
    Outbound,
}

/// Result of registering a completed session.
#[derive(Debug)]
pub enum RegisterOutcome {
    /// First session for this peer
    Registered,
    /// A collision was won; the caller must close the returned loser
    Replaced(Arc<PeerSession>),
    /// A collision was lost; the caller must close the new session
    Rejected,
}

#[derive(Default)]
struct Inner {
    by_hash: HashMap<PeerHash, Arc<PeerSession>>,
    by_socket: HashMap<SocketAddr, PeerHash>,
    pending: HashMap<SocketAddr, Instant>,
}

/// Registry of live and half-open sessions.
#[derive(Default)]
pub struct PeerRegistry {
    inner: RwLock<Inner>,
}

impl PeerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Notes a connection whose handshake is still running.
    pub fn add_pending(&self, addr: SocketAddr) {
        self.inner.write().pending.insert(addr, Instant::now());
    }

    /// Drops a half-open entry (handshake finished or failed).
    pub fn remove_pending(&self, addr: SocketAddr) {
        self.inner.write().pending.remove(&addr);
    }

    /// Number of half-open connections.
    pub fn pending_count(&self) -> usize {
        self.inner.read().pending.len()
    }

    /// Registers a session that completed its handshake.
    ///
    /// On a hash collision the session initiated by the numerically
    /// lower peer hash is kept, deterministically on both ends.
    pub fn register(&self, session: Arc<PeerSession>, local_hash: PeerHash) -> RegisterOutcome {
        let mut inner = self.inner.write();
        inner.pending.remove(&session.remote_addr());

        if let Some(existing) = inner.by_hash.get(&session.hash()).cloned() {
            if !new_session_wins(
                local_hash,
                session.hash(),
                session.direction(),
                existing.direction(),
            ) {
                return RegisterOutcome::Rejected;
            }
            inner.by_socket.remove(&existing.remote_addr());
            inner.by_socket.insert(session.remote_addr(), session.hash());
            inner.by_hash.insert(session.hash(), session);
            return RegisterOutcome::Replaced(existing);
        }

        inner.by_socket.insert(session.remote_addr(), session.hash());
        inner.by_hash.insert(session.hash(), session);
        RegisterOutcome::Registered
    }

    /// Removes a session, but only if the socket still maps to it, so a
    /// late cleanup cannot evict a replacement session.
    pub fn unregister(&self, hash: PeerHash, remote_addr: SocketAddr) -> Option<Arc<PeerSession>> {
        let mut inner = self.inner.write();
        match inner.by_socket.get(&remote_addr) {
            Some(mapped) if *mapped == hash => {
                inner.by_socket.remove(&remote_addr);
                inner.by_hash.remove(&hash)
            }
            _ => None,
        }
    }

    /// Looks up a session by peer hash.
    pub fn get(&self, hash: &PeerHash) -> Option<Arc<PeerSession>> {
        self.inner.read().by_hash.get(hash).cloned()
    }

    /// Resolves a socket address to a peer hash.
    pub fn hash_for_socket(&self, addr: &SocketAddr) -> Option<PeerHash> {
        self.inner.read().by_socket.get(addr).copied()
    }

    /// Number of live sessions.
    pub fn peer_count(&self) -> usize {
        self.inner.read().by_hash.len()
    }

    /// Snapshot of all live sessions.
    pub fn peers(&self) -> Vec<Arc<PeerSession>> {
        self.inner.read().by_hash.values().cloned().collect()
    }

    /// True when a live session already covers this endpoint, either as
    /// the actual remote socket or as the advertised listen endpoint.
    pub fn covers_endpoint(&self, addr: &SocketAddr) -> bool {
        let inner = self.inner.read();
        if inner.by_socket.contains_key(addr) {
            return true;
        }
        inner
            .by_hash
            .values()
            .any(|session| session.listen_addr() == *addr)
    }
}

/// Collision rule: the session initiated by the lower hash is kept.
fn new_session_wins(
    local_hash: PeerHash,
    remote_hash: PeerHash,
    new_direction: ConnectDirection,
    existing_direction: ConnectDirection,
) -> bool {
    let local_is_lower = local_hash < remote_hash;
    let initiated_by_lower = |direction: ConnectDirection| match direction {
        ConnectDirection::Outbound => local_is_lower,
        ConnectDirection::Inbound => !local_is_lower,
    };
    initiated_by_lower(new_direction) && !initiated_by_lower(existing_direction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise;
    use crate::session::PeerSession;
    use tokio::net::{TcpListener, TcpStream};

    /// Builds a throwaway session over a real loopback socket pair.
    async fn make_session(
        hash: PeerHash,
        direction: ConnectDirection,
    ) -> (Arc<PeerSession>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, _accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let stream = client.unwrap();
        let remote = stream.peer_addr().unwrap();
        let (_, write) = stream.into_split();

        let (established, _) = noise::handshake_pair();
        let (session, _closed) =
            PeerSession::new(hash, remote, remote.port(), direction, established.send, write);
        (session, remote)
    }

    #[tokio::test]
    async fn test_maps_stay_mutual_inverses() {
        let registry = PeerRegistry::new();
        let local = PeerHash::new([0u8; 20]);

        let mut sessions = Vec::new();
        for i in 1..=5u8 {
            let hash = PeerHash::new([i; 20]);
            let (session, addr) = make_session(hash, ConnectDirection::Outbound).await;
            registry.register(session.clone(), local);
            sessions.push((hash, addr, session));
        }

        for (hash, addr, _) in &sessions {
            assert_eq!(registry.hash_for_socket(addr), Some(*hash));
            assert_eq!(registry.get(hash).unwrap().remote_addr(), *addr);
        }
        assert_eq!(registry.peer_count(), 5);

        for (hash, addr, _) in &sessions {
            assert!(registry.unregister(*hash, *addr).is_some());
            assert!(registry.get(hash).is_none());
            assert_eq!(registry.hash_for_socket(addr), None);
        }
        assert_eq!(registry.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_pending_lifecycle() {
        let registry = PeerRegistry::new();
        let addr: SocketAddr = "10.0.0.1:1234".parse().unwrap();
        registry.add_pending(addr);
        assert_eq!(registry.pending_count(), 1);
        registry.remove_pending(addr);
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_collision_keeps_lower_hash_initiator() {
        // local < remote: the locally initiated (outbound) session wins.
        let local = PeerHash::new([0u8; 20]);
        let remote = PeerHash::new([9u8; 20]);
        let registry = PeerRegistry::new();

        let (inbound, _) = make_session(remote, ConnectDirection::Inbound).await;
        assert!(matches!(
            registry.register(inbound, local),
            RegisterOutcome::Registered
        ));

        let (outbound, addr) = make_session(remote, ConnectDirection::Outbound).await;
        assert!(matches!(
            registry.register(outbound, local),
            RegisterOutcome::Replaced(_)
        ));
        assert_eq!(registry.peer_count(), 1);
        assert_eq!(registry.hash_for_socket(&addr), Some(remote));
    }

    #[tokio::test]
    async fn test_collision_rejects_higher_hash_initiator() {
        // local < remote: a second, remote-initiated session loses.
        let local = PeerHash::new([0u8; 20]);
        let remote = PeerHash::new([9u8; 20]);
        let registry = PeerRegistry::new();

        let (outbound, addr) = make_session(remote, ConnectDirection::Outbound).await;
        registry.register(outbound, local);

        let (inbound, _) = make_session(remote, ConnectDirection::Inbound).await;
        assert!(matches!(
            registry.register(inbound, local),
            RegisterOutcome::Rejected
        ));
        assert_eq!(registry.hash_for_socket(&addr), Some(remote));
    }

    #[tokio::test]
    async fn test_unregister_ignores_stale_socket() {
        let local = PeerHash::new([0u8; 20]);
        let remote = PeerHash::new([9u8; 20]);
        let registry = PeerRegistry::new();

        let (session, addr) = make_session(remote, ConnectDirection::Outbound).await;
        registry.register(session, local);

        let stale: SocketAddr = "10.9.9.9:1".parse().unwrap();
        assert!(registry.unregister(remote, stale).is_none());
        assert_eq!(registry.hash_for_socket(&addr), Some(remote));
    }
}
