//! Automatic peer discovery.
//!
//! Every rats node rendezvouses on one well-known info-hash in the
//! global DHT: it announces its own listen port there periodically and
//! searches it for other nodes, dialing whatever it finds. Endpoints
//! that fail to connect sit on a blacklist for a while so the loop does
//! not hammer dead addresses. Endpoints learned through peer exchange
//! frames are fed into the same dialer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use rats_core::InfoHash;
use rats_dht::DhtHandle;

use crate::engine::MeshEngine;

/// Name hashed into the well-known rendezvous key.
const DISCOVERY_NAME: &str = "rats_peer_discovery_v1";

/// The well-known info-hash every rats node announces and searches.
pub fn discovery_hash() -> InfoHash {
    InfoHash::from_name(DISCOVERY_NAME)
}

/// Discovery loop configuration.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// How often to announce our listen port
    pub announce_interval: Duration,
    /// How often to search for other nodes
    pub search_interval: Duration,
    /// How long a failed endpoint stays blacklisted
    pub blacklist_for: Duration,
    /// Cap on simultaneous outbound dials
    pub max_concurrent_dials: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            announce_interval: Duration::from_secs(10 * 60),
            search_interval: Duration::from_secs(5 * 60),
            blacklist_for: Duration::from_secs(10 * 60),
            max_concurrent_dials: 8,
        }
    }
}

/// The auto-discovery loop.
pub struct Discovery {
    config: DiscoveryConfig,
    dht: DhtHandle,
    engine: Arc<MeshEngine>,
    blacklist: Mutex<HashMap<SocketAddr, Instant>>,
    dial_limit: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
}

impl Discovery {
    /// Builds the loop and wires peer-exchange candidates from the
    /// engine into the dialer.
    pub fn new(config: DiscoveryConfig, dht: DhtHandle, engine: Arc<MeshEngine>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let discovery = Arc::new(Self {
            dial_limit: Arc::new(Semaphore::new(config.max_concurrent_dials)),
            config,
            dht,
            engine,
            blacklist: Mutex::new(HashMap::new()),
            shutdown_tx,
        });

        let (candidate_tx, candidate_rx) = mpsc::channel(64);
        discovery.engine.set_candidate_sink(candidate_tx);
        tokio::spawn(discovery.clone().candidate_loop(candidate_rx));

        discovery
    }

    /// Runs announce and search timers until [`Discovery::stop`].
    ///
    /// Both fire once immediately so a fresh node joins the mesh without
    /// waiting out the first interval.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut announce_tick = interval(self.config.announce_interval);
        announce_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut search_tick = interval(self.config.search_interval);
        search_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(hash = %discovery_hash(), "auto-discovery running");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("discovery loop stopping");
                    return;
                }
                _ = announce_tick.tick() => {
                    self.announce().await;
                }
                _ = search_tick.tick() => {
                    self.search().await;
                }
            }
        }
    }

    /// Stops the loop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn announce(&self) {
        let port = self.engine.advertised_port();
        match self.dht.announce(discovery_hash(), port).await {
            Ok(accepted) => {
                debug!(port, accepted, "announced to discovery hash");
            }
            Err(err) => {
                warn!(%err, "discovery announce failed");
            }
        }
    }

    async fn search(self: &Arc<Self>) {
        let outcome = match self.dht.get_peers(discovery_hash()).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(%err, "discovery search failed");
                return;
            }
        };
        debug!(found = outcome.peers.len(), "discovery search finished");

        for endpoint in outcome.peers {
            self.consider(endpoint);
        }
    }

    async fn candidate_loop(self: Arc<Self>, mut candidate_rx: mpsc::Receiver<SocketAddr>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                candidate = candidate_rx.recv() => {
                    match candidate {
                        Some(endpoint) => self.consider(endpoint),
                        None => return,
                    }
                }
            }
        }
    }

    /// Queues a dial for an endpoint that is not us, not already a
    /// live peer, and not blacklisted.
    fn consider(self: &Arc<Self>, endpoint: SocketAddr) {
        if endpoint.port() == 0 {
            return;
        }
        if self.is_self(endpoint) || self.engine.registry().covers_endpoint(&endpoint) {
            return;
        }
        if self.is_blacklisted(endpoint) {
            return;
        }

        let discovery = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = discovery.dial_limit.clone().acquire_owned().await else {
                return;
            };
            // Re-check: the picture may have changed while queued.
            if discovery.engine.registry().covers_endpoint(&endpoint) {
                return;
            }

            debug!(%endpoint, "dialing discovered peer");
            match discovery
                .engine
                .connect(&endpoint.ip().to_string(), endpoint.port())
                .await
            {
                Ok(peer) => {
                    info!(%endpoint, %peer, "connected to discovered peer");
                }
                Err(err) => {
                    debug!(%endpoint, %err, "discovered peer unreachable");
                    discovery.blacklist_endpoint(endpoint);
                }
            }
        });
    }

    fn is_self(&self, endpoint: SocketAddr) -> bool {
        endpoint.port() == self.engine.advertised_port()
            && (endpoint.ip().is_loopback() || endpoint.ip() == self.engine.listen_addr().ip())
    }

    fn is_blacklisted(&self, endpoint: SocketAddr) -> bool {
        let mut blacklist = self.blacklist.lock();
        blacklist.retain(|_, since| since.elapsed() < self.config.blacklist_for);
        blacklist.contains_key(&endpoint)
    }

    fn blacklist_endpoint(&self, endpoint: SocketAddr) {
        self.blacklist.lock().insert(endpoint, Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_hash_is_stable() {
        assert_eq!(discovery_hash(), discovery_hash());
        assert_eq!(
            discovery_hash(),
            InfoHash::from_name("rats_peer_discovery_v1")
        );
    }

    #[test]
    fn test_default_intervals() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.announce_interval, Duration::from_secs(600));
        assert_eq!(config.search_interval, Duration::from_secs(300));
        assert_eq!(config.blacklist_for, Duration::from_secs(600));
        assert_eq!(config.max_concurrent_dials, 8);
    }
}
