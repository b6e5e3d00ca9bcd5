//! The rats client.
//!
//! Composes the DHT node, the mesh engine, the auto-discovery loop and
//! the transfer manager behind one object with the full library API:
//! start/stop, connect, send/broadcast, DHT lookup/announce and file
//! transfer control.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::OnceLock;

use tokio::net::lookup_host;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use rats_core::{Config, InfoHash, NodeId, PeerHash};
use rats_dht::{DhtConfig, DhtHandle, DhtNode};
use rats_net::engine::{MeshConfig, MeshEngine, MeshHandler};
use rats_net::{Discovery, DiscoveryConfig, DisconnectReason, SessionStats};
use rats_transfer::{
    Transfer, TransferConfig, TransferHandler, TransferManager,
};

use crate::error::RatsError;

/// A connected peer, as reported by [`RatsClient::peers`].
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Stable identity
    pub hash: PeerHash,
    /// Remote socket address
    pub remote_addr: SocketAddr,
    /// True if we dialed the peer
    pub outbound: bool,
    /// Traffic counters
    pub stats: SessionStats,
}

/// No-op mesh handler used until the caller installs one.
struct NullMeshHandler;
impl MeshHandler for NullMeshHandler {}

/// Default transfer policy: reject every offer.
struct NullTransferHandler;
impl TransferHandler for NullTransferHandler {}

/// Forwards mesh events to the user handler and keeps the transfer
/// manager informed about disconnects.
struct HandlerBridge {
    user: Arc<dyn MeshHandler>,
    transfers: OnceLock<TransferManager>,
}

impl MeshHandler for HandlerBridge {
    fn on_connect(&self, peer: PeerHash) {
        self.user.on_connect(peer);
    }

    fn on_message(&self, peer: PeerHash, payload: &[u8]) {
        self.user.on_message(peer, payload);
    }

    fn on_string(&self, peer: PeerHash, text: &str) {
        self.user.on_string(peer, text);
    }

    fn on_disconnect(&self, peer: PeerHash, reason: DisconnectReason) {
        if let Some(manager) = self.transfers.get() {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager.peer_disconnected(peer).await;
            });
        }
        self.user.on_disconnect(peer, reason);
    }
}

struct Running {
    engine: Arc<MeshEngine>,
    dht: DhtHandle,
    discovery: Arc<Discovery>,
    transfers: TransferManager,
}

/// A node in the rats mesh.
pub struct RatsClient {
    config: Config,
    config_path: Option<PathBuf>,
    mesh_handler: parking_lot::Mutex<Arc<dyn MeshHandler>>,
    transfer_handler: parking_lot::Mutex<Arc<dyn TransferHandler>>,
    running: Mutex<Option<Running>>,
}

impl RatsClient {
    /// Creates a client from the configuration at `path`, generating a
    /// fresh identity when the file does not exist.
    pub fn open(path: &Path, listen_port: u16) -> Result<Self, RatsError> {
        let config = Config::load_or_generate(path, listen_port)?;
        Ok(Self {
            config,
            config_path: Some(path.to_path_buf()),
            mesh_handler: parking_lot::Mutex::new(Arc::new(NullMeshHandler)),
            transfer_handler: parking_lot::Mutex::new(Arc::new(NullTransferHandler)),
            running: Mutex::new(None),
        })
    }

    /// Creates a client from an in-memory configuration (no persistence).
    pub fn with_config(config: Config) -> Self {
        Self {
            config,
            config_path: None,
            mesh_handler: parking_lot::Mutex::new(Arc::new(NullMeshHandler)),
            transfer_handler: parking_lot::Mutex::new(Arc::new(NullTransferHandler)),
            running: Mutex::new(None),
        }
    }

    /// Installs the mesh callbacks. Takes effect at the next `start`.
    pub fn set_mesh_handler(&self, handler: Arc<dyn MeshHandler>) {
        *self.mesh_handler.lock() = handler;
    }

    /// Installs the transfer callbacks. Takes effect at the next `start`.
    pub fn set_transfer_handler(&self, handler: Arc<dyn TransferHandler>) {
        *self.transfer_handler.lock() = handler;
    }

    /// The persisted DHT identity.
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// Our mesh identity, available while running.
    pub async fn local_hash(&self) -> Result<PeerHash, RatsError> {
        let running = self.running.lock().await;
        let running = running.as_ref().ok_or(RatsError::NotRunning)?;
        Ok(running.engine.local_hash())
    }

    /// Brings the node up: DHT, mesh listener, discovery and transfers.
    ///
    /// Startup failures (ports in use, bad config) are returned; the
    /// client stays stopped in that case.
    pub async fn start(&self) -> Result<(), RatsError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(RatsError::AlreadyRunning);
        }

        let port = self.config.listen_port;
        let dht = DhtNode::spawn(DhtConfig {
            local_id: self.config.node_id,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
        })
        .await?;

        let bridge = Arc::new(HandlerBridge {
            user: self.mesh_handler.lock().clone(),
            transfers: OnceLock::new(),
        });

        let (file_tx, file_rx) = tokio::sync::mpsc::channel(256);
        let engine = MeshEngine::start(
            MeshConfig {
                max_peers: self.config.max_peers,
                ..MeshConfig::new(SocketAddr::from(([0, 0, 0, 0], port)))
            },
            self.config.noise_static_sk.clone(),
            bridge.clone(),
            Some(file_tx),
        )
        .await?;

        let transfers = TransferManager::spawn(
            TransferConfig::new(self.config.file_dir.clone()),
            engine.clone(),
            self.transfer_handler.lock().clone(),
            file_rx,
        );
        let _ = bridge.transfers.set(transfers.clone());

        let discovery = Discovery::new(DiscoveryConfig::default(), dht.clone(), engine.clone());
        tokio::spawn(discovery.clone().run());

        // Bootstrap in the background; a slow or dead bootstrap node
        // must not hold up start().
        let bootstrap_nodes = self.config.bootstrap_nodes.clone();
        let dht_for_bootstrap = dht.clone();
        tokio::spawn(async move {
            let mut addrs = Vec::new();
            for node in &bootstrap_nodes {
                match lookup_host((node.host.as_str(), node.port)).await {
                    Ok(resolved) => addrs.extend(resolved),
                    Err(err) => warn!(host = %node.host, %err, "bootstrap resolve failed"),
                }
            }
            if addrs.is_empty() {
                return;
            }
            match dht_for_bootstrap.bootstrap(addrs).await {
                Ok(size) => info!(routing_table_size = size, "DHT bootstrap finished"),
                Err(err) => warn!(%err, "DHT bootstrap failed"),
            }
        });

        info!(
            node_id = %self.config.node_id,
            local_hash = %engine.local_hash(),
            port,
            "rats client started"
        );
        *running = Some(Running {
            engine,
            dht,
            discovery,
            transfers,
        });
        Ok(())
    }

    /// Takes the node down, failing active transfers with "shutdown"
    /// and persisting the configuration.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        running.discovery.stop();
        running.transfers.shutdown().await;
        running.engine.stop().await;
        running.dht.shutdown().await;

        if let Some(path) = &self.config_path {
            if let Err(err) = self.config.save(path) {
                warn!(%err, "failed to persist configuration");
            }
        }
        info!("rats client stopped");
    }

    /// True while started.
    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// The bound TCP mesh listen address.
    pub async fn listen_addr(&self) -> Result<SocketAddr, RatsError> {
        self.with_running(|r| r.engine.listen_addr()).await
    }

    /// The bound UDP DHT address.
    pub async fn dht_addr(&self) -> Result<SocketAddr, RatsError> {
        self.with_running(|r| r.dht.local_addr()).await
    }

    /// Pings the given DHT endpoints and walks toward our own id;
    /// returns the routing table size. Also runs automatically against
    /// the configured bootstrap nodes at start.
    pub async fn bootstrap(&self, addrs: Vec<SocketAddr>) -> Result<usize, RatsError> {
        let dht = self.with_running(|r| r.dht.clone()).await?;
        Ok(dht.bootstrap(addrs).await?)
    }

    async fn with_running<T>(
        &self,
        use_it: impl FnOnce(&Running) -> T,
    ) -> Result<T, RatsError> {
        let running = self.running.lock().await;
        let running = running.as_ref().ok_or(RatsError::NotRunning)?;
        Ok(use_it(running))
    }

    /// Dials a peer and returns its hash once the session is up.
    pub async fn connect(&self, host: &str, port: u16) -> Result<PeerHash, RatsError> {
        let engine = self.with_running(|r| r.engine.clone()).await?;
        Ok(engine.connect(host, port).await?)
    }

    /// Closes the session with a peer.
    pub async fn disconnect(&self, peer: PeerHash) -> Result<(), RatsError> {
        let engine = self.with_running(|r| r.engine.clone()).await?;
        Ok(engine.disconnect(peer)?)
    }

    /// Sends bytes to one peer.
    pub async fn send(&self, peer: PeerHash, payload: &[u8]) -> Result<(), RatsError> {
        let engine = self.with_running(|r| r.engine.clone()).await?;
        Ok(engine.send(peer, payload).await?)
    }

    /// Sends text to one peer.
    pub async fn send_string(&self, peer: PeerHash, text: &str) -> Result<(), RatsError> {
        let engine = self.with_running(|r| r.engine.clone()).await?;
        Ok(engine.send_string(peer, text).await?)
    }

    /// Sends bytes to every connected peer; returns the delivery count.
    pub async fn broadcast(&self, payload: &[u8]) -> Result<usize, RatsError> {
        let engine = self.with_running(|r| r.engine.clone()).await?;
        Ok(engine.broadcast(payload).await)
    }

    /// Sends text to every connected peer; returns the delivery count.
    pub async fn broadcast_string(&self, text: &str) -> Result<usize, RatsError> {
        let engine = self.with_running(|r| r.engine.clone()).await?;
        Ok(engine.broadcast_string(text).await)
    }

    /// Number of live sessions.
    pub async fn peer_count(&self) -> usize {
        match self.with_running(|r| r.engine.peer_count()).await {
            Ok(count) => count,
            Err(_) => 0,
        }
    }

    /// Snapshot of connected peers.
    pub async fn peers(&self) -> Vec<PeerInfo> {
        let Ok(engine) = self.with_running(|r| r.engine.clone()).await else {
            return Vec::new();
        };
        engine
            .registry()
            .peers()
            .into_iter()
            .map(|session| PeerInfo {
                hash: session.hash(),
                remote_addr: session.remote_addr(),
                outbound: session.direction() == rats_net::ConnectDirection::Outbound,
                stats: session.stats(),
            })
            .collect()
    }

    /// Iterative DHT lookup for peers announced under `info_hash`.
    pub async fn find_peers(&self, info_hash: InfoHash) -> Result<Vec<SocketAddr>, RatsError> {
        let dht = self.with_running(|r| r.dht.clone()).await?;
        Ok(dht.get_peers(info_hash).await?.peers)
    }

    /// Announces this node under `info_hash` on `port`.
    pub async fn announce(&self, info_hash: InfoHash, port: u16) -> Result<usize, RatsError> {
        let dht = self.with_running(|r| r.dht.clone()).await?;
        Ok(dht.announce(info_hash, port).await?)
    }

    /// Offers a file to a peer; returns the transfer id.
    pub async fn send_file(&self, peer: PeerHash, path: PathBuf) -> Result<Uuid, RatsError> {
        let transfers = self.with_running(|r| r.transfers.clone()).await?;
        Ok(transfers.send_file(peer, path).await?)
    }

    /// Offers a whole directory to a peer; returns the parent id.
    pub async fn send_directory(&self, peer: PeerHash, path: PathBuf) -> Result<Uuid, RatsError> {
        let transfers = self.with_running(|r| r.transfers.clone()).await?;
        Ok(transfers.send_directory(peer, path).await?)
    }

    /// Pauses a transfer.
    pub async fn pause_transfer(&self, id: Uuid) -> Result<(), RatsError> {
        let transfers = self.with_running(|r| r.transfers.clone()).await?;
        Ok(transfers.pause(id).await?)
    }

    /// Resumes a paused transfer.
    pub async fn resume_transfer(&self, id: Uuid) -> Result<(), RatsError> {
        let transfers = self.with_running(|r| r.transfers.clone()).await?;
        Ok(transfers.resume(id).await?)
    }

    /// Cancels a transfer.
    pub async fn cancel_transfer(&self, id: Uuid) -> Result<(), RatsError> {
        let transfers = self.with_running(|r| r.transfers.clone()).await?;
        Ok(transfers.cancel(id).await?)
    }

    /// Snapshots of all transfers.
    pub async fn transfers(&self) -> Vec<Transfer> {
        match self.with_running(|r| r.transfers.clone()).await {
            Ok(transfers) => transfers.list().await.unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    /// One transfer's snapshot.
    pub async fn transfer(&self, id: Uuid) -> Option<Transfer> {
        match self.with_running(|r| r.transfers.clone()).await {
            Ok(transfers) => transfers.get(id).await.ok().flatten(),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_operations_require_start() {
        let client = RatsClient::with_config(Config::generate(0));
        assert!(matches!(
            client.connect("127.0.0.1", 1).await,
            Err(RatsError::NotRunning)
        ));
        assert_eq!(client.peer_count().await, 0);
        assert!(client.peers().await.is_empty());
        assert!(client.transfers().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let client = RatsClient::with_config(Config::generate(0));
        client.start().await.unwrap();
        assert!(matches!(
            client.start().await,
            Err(RatsError::AlreadyRunning)
        ));
        client.stop().await;
        assert!(!client.is_running().await);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let client = RatsClient::with_config(Config::generate(0));
        client.stop().await;
        client.start().await.unwrap();
        client.stop().await;
        client.stop().await;
    }
}
