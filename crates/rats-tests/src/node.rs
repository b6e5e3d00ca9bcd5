//! A single test node with recording callbacks.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::time::sleep;

use rats::{
    Config, DisconnectReason, MeshHandler, PeerHash, RatsClient, Transfer, TransferHandler,
    TransferOffer,
};

/// Records every mesh event for assertions.
#[derive(Default)]
pub struct MeshRecorder {
    /// Peers that connected, in order
    pub connects: Mutex<Vec<PeerHash>>,
    /// Peers that disconnected, with reasons
    pub disconnects: Mutex<Vec<(PeerHash, DisconnectReason)>>,
    /// Text messages received
    pub strings: Mutex<Vec<(PeerHash, String)>>,
    /// Binary messages received
    pub messages: Mutex<Vec<(PeerHash, Vec<u8>)>>,
}

impl MeshRecorder {
    /// Number of on_connect events so far.
    pub fn connect_count(&self) -> usize {
        self.connects.lock().len()
    }

    /// Number of on_disconnect events so far.
    pub fn disconnect_count(&self) -> usize {
        self.disconnects.lock().len()
    }

    /// All strings received from any peer.
    pub fn string_payloads(&self) -> Vec<String> {
        self.strings.lock().iter().map(|(_, s)| s.clone()).collect()
    }
}

impl MeshHandler for MeshRecorder {
    fn on_connect(&self, peer: PeerHash) {
        self.connects.lock().push(peer);
    }

    fn on_message(&self, peer: PeerHash, payload: &[u8]) {
        self.messages.lock().push((peer, payload.to_vec()));
    }

    fn on_string(&self, peer: PeerHash, text: &str) {
        self.strings.lock().push((peer, text.to_string()));
    }

    fn on_disconnect(&self, peer: PeerHash, reason: DisconnectReason) {
        self.disconnects.lock().push((peer, reason));
    }
}

/// Accepts every offer and records progress and completions.
#[derive(Default)]
pub struct TransferRecorder {
    /// Offers seen
    pub offers: Mutex<Vec<TransferOffer>>,
    /// Progress snapshots in callback order
    pub progress: Mutex<Vec<Transfer>>,
    /// Terminal snapshots
    pub completions: Mutex<Vec<Transfer>>,
}

impl TransferRecorder {
    /// Progress values (chunks_done) for one transfer, in order.
    pub fn progress_for(&self, id: rats::Uuid) -> Vec<u64> {
        self.progress
            .lock()
            .iter()
            .filter(|t| t.id == id)
            .map(|t| t.chunks_done)
            .collect()
    }

    /// The terminal snapshot for one transfer, if any.
    pub fn completion_for(&self, id: rats::Uuid) -> Option<Transfer> {
        self.completions
            .lock()
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }
}

impl TransferHandler for TransferRecorder {
    fn on_offer(&self, offer: &TransferOffer) -> bool {
        self.offers.lock().push(offer.clone());
        true
    }

    fn on_progress(&self, transfer: &Transfer) {
        self.progress.lock().push(transfer.clone());
    }

    fn on_complete(&self, transfer: &Transfer) {
        self.completions.lock().push(transfer.clone());
    }
}

/// One running node plus its recorders and scratch directory.
pub struct TestNode {
    /// The client under test
    pub client: RatsClient,
    /// Mesh event recorder
    pub mesh: Arc<MeshRecorder>,
    /// Transfer event recorder (accepts all offers)
    pub transfers: Arc<TransferRecorder>,
    /// Scratch directory holding received files
    dir: TempDir,
}

impl TestNode {
    /// Starts a node on ephemeral ports with no bootstrap nodes.
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");

        let mut config = Config::generate(0);
        config.bootstrap_nodes = Vec::new();
        config.file_dir = dir.path().join("downloads");

        let client = RatsClient::with_config(config);
        let mesh = Arc::new(MeshRecorder::default());
        let transfers = Arc::new(TransferRecorder::default());
        client.set_mesh_handler(mesh.clone());
        client.set_transfer_handler(transfers.clone());
        client.start().await.expect("node start");

        Self {
            client,
            mesh,
            transfers,
            dir,
        }
    }

    /// The node's TCP mesh listen address.
    pub async fn listen_addr(&self) -> SocketAddr {
        self.client.listen_addr().await.expect("running")
    }

    /// The node's UDP DHT address.
    pub async fn dht_addr(&self) -> SocketAddr {
        self.client.dht_addr().await.expect("running")
    }

    /// Directory received files land in.
    pub fn download_dir(&self) -> PathBuf {
        self.dir.path().join("downloads")
    }

    /// Scratch space for building source files.
    pub fn scratch_dir(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Dials another test node over loopback.
    pub async fn connect_to(&self, other: &TestNode) -> PeerHash {
        let addr = other.listen_addr().await;
        self.client
            .connect("127.0.0.1", addr.port())
            .await
            .expect("connect")
    }

    /// Polls until `predicate` holds or `timeout` elapses.
    pub async fn wait_until(
        timeout: Duration,
        mut predicate: impl FnMut() -> bool,
    ) -> Result<(), &'static str> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if predicate() {
                return Ok(());
            }
            sleep(Duration::from_millis(20)).await;
        }
        Err("condition not reached in time")
    }

    /// Polls an async probe until it yields true or `timeout` elapses.
    pub async fn wait_until_async<F, Fut>(timeout: Duration, mut probe: F) -> Result<(), &'static str>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if probe().await {
                return Ok(());
            }
            sleep(Duration::from_millis(20)).await;
        }
        Err("condition not reached in time")
    }
}
