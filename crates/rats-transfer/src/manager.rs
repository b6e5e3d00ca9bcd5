//! Transfer manager.
//!
//! One actor owns every transfer record. It consumes file frames routed
//! out of the mesh engine, commands from the library facade, and events
//! from per-transfer sender tasks. Sender tasks stream chunks under a
//! windowed-ack flow control and react to pause/resume/cancel through a
//! small shared control block.

use std::collections::HashMap;
use std::io::Read;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use rats_core::PeerHash;
use rats_net::engine::{FileFrame, MeshEngine};
use rats_net::wire::{Body, DirEntry};

use crate::transfer::{Transfer, TransferDirection, TransferStatus};
use crate::{effective_chunk_size, ACK_EVERY, DEFAULT_CHUNK_SIZE, MAX_UNACKED};

const COMMAND_CHANNEL_CAPACITY: usize = 32;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long a sender waits on a stalled ack window before giving up.
const ACK_STALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Transfer-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// Local file problem (missing, unreadable, disk full)
    #[error("file error: {0}")]
    Io(#[from] std::io::Error),

    /// Sending a frame failed
    #[error(transparent)]
    Net(#[from] rats_net::NetError),

    /// Unknown transfer id
    #[error("unknown transfer {0}")]
    NotFound(Uuid),

    /// Operation does not apply in the transfer's current state
    #[error("transfer is {0}")]
    InvalidState(TransferStatus),

    /// The manager actor is gone
    #[error("transfer manager shut down")]
    Shutdown,
}

/// An incoming offer, handed to the acceptance policy hook.
#[derive(Debug, Clone)]
pub struct TransferOffer {
    /// Transfer identity
    pub id: Uuid,
    /// Offering peer
    pub peer: PeerHash,
    /// Offered name (relative path for directory members)
    pub filename: String,
    /// Total size in bytes
    pub total_bytes: u64,
    /// Parent transfer for directory members
    pub parent_id: Option<Uuid>,
}

/// Transfer callbacks.
///
/// Invoked on the transfer manager's task; implementations must not
/// block.
pub trait TransferHandler: Send + Sync + 'static {
    /// Decide whether to accept an incoming offer. Defaults to reject.
    fn on_offer(&self, _offer: &TransferOffer) -> bool {
        false
    }

    /// Progress changed (chunks_done is monotonic non-decreasing).
    fn on_progress(&self, _transfer: &Transfer) {}

    /// The transfer reached a terminal state.
    fn on_complete(&self, _transfer: &Transfer) {}
}

/// Transfer manager configuration.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Directory received files land in
    pub file_dir: PathBuf,
    /// Requested chunk size (clamped to the per-frame cap)
    pub chunk_size: u32,
    /// Keep partial files when a transfer is cancelled
    pub keep_partial_on_cancel: bool,
}

impl TransferConfig {
    /// Standard configuration writing into `file_dir`.
    pub fn new(file_dir: PathBuf) -> Self {
        Self {
            file_dir,
            chunk_size: DEFAULT_CHUNK_SIZE,
            keep_partial_on_cancel: false,
        }
    }
}

enum Command {
    SendFile {
        peer: PeerHash,
        path: PathBuf,
        filename: Option<String>,
        parent_id: Option<Uuid>,
        reply: oneshot::Sender<Result<Uuid, TransferError>>,
    },
    SendDirectory {
        peer: PeerHash,
        path: PathBuf,
        reply: oneshot::Sender<Result<Uuid, TransferError>>,
    },
    Pause {
        id: Uuid,
        reply: oneshot::Sender<Result<(), TransferError>>,
    },
    Resume {
        id: Uuid,
        reply: oneshot::Sender<Result<(), TransferError>>,
    },
    Cancel {
        id: Uuid,
        reply: oneshot::Sender<Result<(), TransferError>>,
    },
    List {
        reply: oneshot::Sender<Vec<Transfer>>,
    },
    Get {
        id: Uuid,
        reply: oneshot::Sender<Option<Transfer>>,
    },
    PeerGone {
        peer: PeerHash,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum SenderEvent {
    Sent { id: Uuid, bytes: u64 },
    StreamDone { id: Uuid },
    Failed { id: Uuid, reason: String },
}

/// Shared control block between the actor and one sender task.
struct SendCtl {
    acked: AtomicU64,
    paused: AtomicBool,
    cancelled: AtomicBool,
    rewind: parking_lot::Mutex<Option<u64>>,
    notify: Notify,
}

impl SendCtl {
    fn new(acked: u64) -> Arc<Self> {
        Arc::new(Self {
            acked: AtomicU64::new(acked),
            paused: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            rewind: parking_lot::Mutex::new(None),
            notify: Notify::new(),
        })
    }

    fn wake(&self) {
        self.notify.notify_one();
    }
}

struct PartFile {
    file: tokio::fs::File,
    part_path: PathBuf,
    final_path: PathBuf,
}

struct Entry {
    info: Transfer,
    file_hash: String,
    source: Option<PathBuf>,
    ctl: Option<Arc<SendCtl>>,
    part: Option<PartFile>,
    expected_index: u64,
    last_acked: u64,
    last_chunk_at: Instant,
    /// True while the pause came from this side; remote traffic must
    /// not flip the state back then.
    paused_locally: bool,
}

/// Handle to the transfer manager actor.
#[derive(Clone)]
pub struct TransferManager {
    cmd_tx: mpsc::Sender<Command>,
}

impl TransferManager {
    /// Spawns the manager actor.
    ///
    /// `frames_rx` is the engine's file-frame channel; the manager also
    /// sends frames back through `engine`.
    pub fn spawn(
        config: TransferConfig,
        engine: Arc<MeshEngine>,
        handler: Arc<dyn TransferHandler>,
        frames_rx: mpsc::Receiver<FileFrame>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let actor = Actor {
            config,
            engine,
            handler,
            transfers: HashMap::new(),
            event_tx,
        };
        tokio::spawn(actor.run(cmd_rx, frames_rx, event_rx));

        Self { cmd_tx }
    }

    async fn send<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, TransferError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| TransferError::Shutdown)?;
        reply_rx.await.map_err(|_| TransferError::Shutdown)
    }

    /// Offers a file to a peer. Returns the transfer id immediately;
    /// streaming starts when the peer accepts.
    pub async fn send_file(&self, peer: PeerHash, path: PathBuf) -> Result<Uuid, TransferError> {
        self.send(|reply| Command::SendFile {
            peer,
            path,
            filename: None,
            parent_id: None,
            reply,
        })
        .await?
    }

    /// Offers every file under a directory, sharing a parent id.
    pub async fn send_directory(
        &self,
        peer: PeerHash,
        path: PathBuf,
    ) -> Result<Uuid, TransferError> {
        self.send(|reply| Command::SendDirectory { peer, path, reply })
            .await?
    }

    /// Freezes a transfer.
    pub async fn pause(&self, id: Uuid) -> Result<(), TransferError> {
        self.send(|reply| Command::Pause { id, reply }).await?
    }

    /// Continues a paused transfer, replaying from the receiver's
    /// resume point when needed.
    pub async fn resume(&self, id: Uuid) -> Result<(), TransferError> {
        self.send(|reply| Command::Resume { id, reply }).await?
    }

    /// Abandons a transfer. Idempotent.
    pub async fn cancel(&self, id: Uuid) -> Result<(), TransferError> {
        self.send(|reply| Command::Cancel { id, reply }).await?
    }

    /// Snapshots of every known transfer.
    pub async fn list(&self) -> Result<Vec<Transfer>, TransferError> {
        self.send(|reply| Command::List { reply }).await
    }

    /// Snapshot of one transfer.
    pub async fn get(&self, id: Uuid) -> Result<Option<Transfer>, TransferError> {
        self.send(|reply| Command::Get { id, reply }).await
    }

    /// Fails every active transfer with the given peer.
    pub async fn peer_disconnected(&self, peer: PeerHash) {
        let _ = self.cmd_tx.send(Command::PeerGone { peer }).await;
    }

    /// Fails all non-terminal transfers with reason "shutdown" and
    /// stops the actor.
    pub async fn shutdown(&self) {
        let _ = self.send(|reply| Command::Shutdown { reply }).await;
    }
}

struct Actor {
    config: TransferConfig,
    engine: Arc<MeshEngine>,
    handler: Arc<dyn TransferHandler>,
    transfers: HashMap<Uuid, Entry>,
    event_tx: mpsc::Sender<SenderEvent>,
}

impl Actor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut frames_rx: mpsc::Receiver<FileFrame>,
        mut event_rx: mpsc::Receiver<SenderEvent>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown { reply }) => {
                            self.fail_all("shutdown").await;
                            let _ = reply.send(());
                            return;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            self.fail_all("shutdown").await;
                            return;
                        }
                    }
                }
                frame = frames_rx.recv() => {
                    match frame {
                        Some(FileFrame { peer, body }) => self.handle_frame(peer, body).await,
                        None => {
                            debug!("engine frame channel closed");
                            self.fail_all("shutdown").await;
                            return;
                        }
                    }
                }
                Some(event) = event_rx.recv() => {
                    self.handle_sender_event(event).await;
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SendFile {
                peer,
                path,
                filename,
                parent_id,
                reply,
            } => {
                let result = self.start_send(peer, path, filename, parent_id).await;
                let _ = reply.send(result);
            }
            Command::SendDirectory { peer, path, reply } => {
                let result = self.start_send_directory(peer, path).await;
                let _ = reply.send(result);
            }
            Command::Pause { id, reply } => {
                let _ = reply.send(self.pause(id).await);
            }
            Command::Resume { id, reply } => {
                let _ = reply.send(self.resume(id).await);
            }
            Command::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(id, "cancelled locally").await);
            }
            Command::List { reply } => {
                let _ = reply.send(self.transfers.values().map(|e| e.info.clone()).collect());
            }
            Command::Get { id, reply } => {
                let _ = reply.send(self.transfers.get(&id).map(|e| e.info.clone()));
            }
            Command::PeerGone { peer } => {
                let ids: Vec<Uuid> = self
                    .transfers
                    .iter()
                    .filter(|(_, e)| e.info.peer == peer && !e.info.status.is_terminal())
                    .map(|(id, _)| *id)
                    .collect();
                for id in ids {
                    self.fail_transfer(id, "peer disconnected").await;
                }
            }
            Command::Shutdown { .. } => unreachable!("handled in run()"),
        }
    }

    async fn start_send(
        &mut self,
        peer: PeerHash,
        path: PathBuf,
        filename: Option<String>,
        parent_id: Option<Uuid>,
    ) -> Result<Uuid, TransferError> {
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "not a regular file",
            )));
        }
        let total_bytes = metadata.len();

        let filename = match filename {
            Some(name) => name,
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".to_string()),
        };

        let hash_path = path.clone();
        let file_hash = tokio::task::spawn_blocking(move || hash_file(&hash_path))
            .await
            .map_err(|_| TransferError::Shutdown)??;

        let chunk_size = effective_chunk_size(self.config.chunk_size);
        let id = Uuid::new_v4();
        let mut info = Transfer::new(
            id,
            peer,
            TransferDirection::Sending,
            filename.clone(),
            path.clone(),
            total_bytes,
            chunk_size,
        );
        info.parent_id = parent_id;

        self.engine
            .send_frame(
                peer,
                Body::FileOffer {
                    transfer_id: id,
                    filename,
                    total_bytes,
                    chunk_size,
                    file_hash: file_hash.clone(),
                    parent_id,
                },
            )
            .await?;

        info!(transfer = %id, %peer, total_bytes, "file offered");
        self.transfers.insert(
            id,
            Entry {
                info,
                file_hash,
                source: Some(path),
                ctl: None,
                part: None,
                expected_index: 0,
                last_acked: 0,
                last_chunk_at: Instant::now(),
                paused_locally: false,
            },
        );
        Ok(id)
    }

    async fn start_send_directory(
        &mut self,
        peer: PeerHash,
        path: PathBuf,
    ) -> Result<Uuid, TransferError> {
        let root = path.clone();
        let files = tokio::task::spawn_blocking(move || walk_directory(&root))
            .await
            .map_err(|_| TransferError::Shutdown)??;

        let dir_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "directory".to_string());

        let parent_id = Uuid::new_v4();
        let entries: Vec<DirEntry> = files
            .iter()
            .map(|(rel, size)| DirEntry {
                path: rel.clone(),
                total_bytes: *size,
            })
            .collect();

        self.engine
            .send_frame(
                peer,
                Body::DirManifest {
                    transfer_id: parent_id,
                    name: dir_name.clone(),
                    entries,
                },
            )
            .await?;
        info!(transfer = %parent_id, %peer, files = files.len(), "directory offered");

        for (rel, _) in files {
            let member_path = path.join(&rel);
            let member_name = format!("{dir_name}/{rel}");
            self.start_send(peer, member_path, Some(member_name), Some(parent_id))
                .await?;
        }
        Ok(parent_id)
    }

    async fn pause(&mut self, id: Uuid) -> Result<(), TransferError> {
        let entry = self
            .transfers
            .get_mut(&id)
            .ok_or(TransferError::NotFound(id))?;
        match entry.info.status {
            TransferStatus::Pending
            | TransferStatus::Starting
            | TransferStatus::InProgress
            | TransferStatus::Resuming => {}
            status => return Err(TransferError::InvalidState(status)),
        }

        entry.info.status = TransferStatus::Paused;
        entry.paused_locally = true;
        if let Some(ctl) = &entry.ctl {
            ctl.paused.store(true, Ordering::Release);
            ctl.wake();
        }
        let peer = entry.info.peer;
        let _ = self
            .engine
            .send_frame(peer, Body::FilePause { transfer_id: id })
            .await;
        debug!(transfer = %id, "paused");
        Ok(())
    }

    async fn resume(&mut self, id: Uuid) -> Result<(), TransferError> {
        let entry = self
            .transfers
            .get_mut(&id)
            .ok_or(TransferError::NotFound(id))?;
        if entry.info.status != TransferStatus::Paused {
            return Err(TransferError::InvalidState(entry.info.status));
        }
        entry.paused_locally = false;
        let peer = entry.info.peer;

        match entry.info.direction {
            TransferDirection::Sending => {
                if let Some(ctl) = &entry.ctl {
                    // The stream task is alive; just unfreeze it.
                    entry.info.status = TransferStatus::InProgress;
                    ctl.paused.store(false, Ordering::Release);
                    ctl.wake();
                } else {
                    // The stream ended (disconnect, restart); offer the
                    // same id again and let the receiver pick the
                    // resume point.
                    entry.info.status = TransferStatus::Resuming;
                    let body = Body::FileOffer {
                        transfer_id: id,
                        filename: entry.info.filename.clone(),
                        total_bytes: entry.info.total_bytes,
                        chunk_size: entry.info.chunk_size,
                        file_hash: entry.file_hash.clone(),
                        parent_id: entry.info.parent_id,
                    };
                    self.engine.send_frame(peer, body).await?;
                }
            }
            TransferDirection::Receiving => {
                entry.info.status = TransferStatus::Resuming;
                let next = entry.expected_index;
                self.engine
                    .send_frame(
                        peer,
                        Body::FileResume {
                            transfer_id: id,
                            next_expected_index: next,
                        },
                    )
                    .await?;
            }
        }
        debug!(transfer = %id, "resume requested");
        Ok(())
    }

    async fn cancel(&mut self, id: Uuid, reason: &str) -> Result<(), TransferError> {
        let Some(entry) = self.transfers.get_mut(&id) else {
            return Err(TransferError::NotFound(id));
        };
        if entry.info.status.is_terminal() {
            return Ok(());
        }

        let peer = entry.info.peer;
        let _ = self
            .engine
            .send_frame(peer, Body::FileCancel { transfer_id: id })
            .await;
        self.finish_cancelled(id, reason).await;
        Ok(())
    }

    async fn handle_frame(&mut self, peer: PeerHash, body: Body) {
        match body {
            Body::FileOffer {
                transfer_id,
                filename,
                total_bytes,
                chunk_size,
                file_hash,
                parent_id,
            } => {
                self.handle_offer(
                    peer,
                    transfer_id,
                    filename,
                    total_bytes,
                    chunk_size,
                    file_hash,
                    parent_id,
                )
                .await;
            }

            Body::FileAccept {
                transfer_id,
                next_expected_index,
            } => {
                self.handle_accept(peer, transfer_id, next_expected_index).await;
            }

            Body::FileReject {
                transfer_id,
                reason,
            } => {
                if self.entry_for(peer, transfer_id).is_some() {
                    info!(transfer = %transfer_id, %reason, "offer rejected");
                    self.fail_transfer(transfer_id, &format!("rejected: {reason}"))
                        .await;
                }
            }

            Body::FileChunk {
                transfer_id,
                chunk_index,
                data,
            } => {
                self.handle_chunk(peer, transfer_id, chunk_index, data).await;
            }

            Body::FileAck {
                transfer_id,
                next_expected_index,
            } => {
                if let Some(entry) = self.entry_for_mut(peer, transfer_id) {
                    if let Some(ctl) = &entry.ctl {
                        let previous = ctl.acked.load(Ordering::Acquire);
                        if next_expected_index > previous {
                            ctl.acked.store(next_expected_index, Ordering::Release);
                            ctl.wake();
                        }
                    }
                }
            }

            Body::FileDone {
                transfer_id,
                file_hash,
            } => {
                self.handle_done(peer, transfer_id, file_hash).await;
            }

            Body::FileOk { transfer_id } => {
                if self.entry_for(peer, transfer_id).is_some() {
                    self.finish_completed(transfer_id).await;
                }
            }

            Body::FileBad { transfer_id } => {
                if self.entry_for(peer, transfer_id).is_some() {
                    self.fail_transfer(transfer_id, "receiver hash mismatch").await;
                }
            }

            Body::FilePause { transfer_id } => {
                if let Some(entry) = self.entry_for_mut(peer, transfer_id) {
                    if !entry.info.status.is_terminal() {
                        entry.info.status = TransferStatus::Paused;
                        entry.paused_locally = false;
                        if let Some(ctl) = &entry.ctl {
                            ctl.paused.store(true, Ordering::Release);
                            ctl.wake();
                        }
                        debug!(transfer = %transfer_id, "paused by remote");
                    }
                }
            }

            Body::FileResume {
                transfer_id,
                next_expected_index,
            } => {
                self.handle_remote_resume(peer, transfer_id, next_expected_index)
                    .await;
            }

            Body::FileCancel { transfer_id } => {
                if let Some(entry) = self.entry_for(peer, transfer_id) {
                    if !entry.info.status.is_terminal() {
                        self.finish_cancelled(transfer_id, "cancelled by remote").await;
                    }
                } // Unknown or already terminal: cancel is idempotent.
            }

            Body::DirManifest {
                transfer_id,
                name,
                entries,
            } => {
                info!(
                    transfer = %transfer_id,
                    %name,
                    files = entries.len(),
                    "incoming directory"
                );
            }

            other => {
                debug!(?other, "unexpected body on transfer channel");
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_offer(
        &mut self,
        peer: PeerHash,
        id: Uuid,
        filename: String,
        total_bytes: u64,
        chunk_size: u32,
        file_hash: String,
        parent_id: Option<Uuid>,
    ) {
        let offer = TransferOffer {
            id,
            peer,
            filename: filename.clone(),
            total_bytes,
            parent_id,
        };

        // A re-offer of a transfer we already track is the sender
        // resuming; skip the policy hook we already ran.
        let known = self
            .transfers
            .get(&id)
            .is_some_and(|e| e.info.direction == TransferDirection::Receiving);

        let handler = self.handler.clone();
        let accepted = known
            || catch_unwind(AssertUnwindSafe(|| handler.on_offer(&offer))).unwrap_or(false);
        if !accepted {
            debug!(transfer = %id, %peer, "offer declined");
            let _ = self
                .engine
                .send_frame(
                    peer,
                    Body::FileReject {
                        transfer_id: id,
                        reason: "declined".to_string(),
                    },
                )
                .await;
            return;
        }

        let Some(relative) = sanitize_filename(&filename) else {
            warn!(transfer = %id, %filename, "unsafe filename in offer");
            let _ = self
                .engine
                .send_frame(
                    peer,
                    Body::FileReject {
                        transfer_id: id,
                        reason: "unsafe filename".to_string(),
                    },
                )
                .await;
            return;
        };

        match self
            .open_receiving(peer, id, &filename, &relative, total_bytes, chunk_size, file_hash, parent_id)
            .await
        {
            Ok(next_expected) => {
                let _ = self
                    .engine
                    .send_frame(
                        peer,
                        Body::FileAccept {
                            transfer_id: id,
                            next_expected_index: next_expected,
                        },
                    )
                    .await;
                info!(transfer = %id, %peer, next_expected, "offer accepted");
            }
            Err(err) => {
                warn!(transfer = %id, %err, "cannot prepare destination");
                let _ = self
                    .engine
                    .send_frame(
                        peer,
                        Body::FileReject {
                            transfer_id: id,
                            reason: err.to_string(),
                        },
                    )
                    .await;
            }
        }
    }

    /// Opens (or reopens) the `.part` destination, returning the resume
    /// chunk index derived from its length.
    #[allow(clippy::too_many_arguments)]
    async fn open_receiving(
        &mut self,
        peer: PeerHash,
        id: Uuid,
        filename: &str,
        relative: &Path,
        total_bytes: u64,
        chunk_size: u32,
        file_hash: String,
        parent_id: Option<Uuid>,
    ) -> Result<u64, std::io::Error> {
        let chunk_size = chunk_size.max(1);
        let final_path = self.config.file_dir.join(relative);
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part_path = final_path.with_extension(part_extension(&final_path));

        // Resume from whatever whole chunks already landed on disk.
        let existing = match tokio::fs::metadata(&part_path).await {
            Ok(metadata) => metadata.len(),
            Err(_) => 0,
        };
        let next_expected = (existing / u64::from(chunk_size)).min(total_bytes.div_ceil(u64::from(chunk_size)));

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&part_path)
            .await?;
        file.set_len(next_expected * u64::from(chunk_size)).await?;

        let mut info = Transfer::new(
            id,
            peer,
            TransferDirection::Receiving,
            filename.to_string(),
            final_path.clone(),
            total_bytes,
            chunk_size,
        );
        info.parent_id = parent_id;
        info.chunks_done = next_expected;
        info.status = if next_expected > 0 {
            TransferStatus::Resuming
        } else {
            TransferStatus::Starting
        };

        self.transfers.insert(
            id,
            Entry {
                info,
                file_hash,
                source: None,
                ctl: None,
                part: Some(PartFile {
                    file,
                    part_path,
                    final_path,
                }),
                expected_index: next_expected,
                last_acked: next_expected,
                last_chunk_at: Instant::now(),
                paused_locally: false,
            },
        );
        Ok(next_expected)
    }

    async fn handle_accept(&mut self, peer: PeerHash, id: Uuid, next_expected: u64) {
        let Some(entry) = self.entry_for_mut(peer, id) else {
            return;
        };
        if entry.info.direction != TransferDirection::Sending || entry.ctl.is_some() {
            return;
        }
        let Some(source) = entry.source.clone() else {
            return;
        };

        // A pause issued before the accept arrived stays in force; the
        // stream task starts frozen then.
        let was_paused = entry.info.status == TransferStatus::Paused;
        if !was_paused {
            entry.info.status = TransferStatus::InProgress;
        }
        entry.info.chunks_done = next_expected.min(entry.info.chunks_total);
        let chunk_size = u64::from(entry.info.chunk_size);
        let total_bytes = entry.info.total_bytes;

        let ctl = SendCtl::new(next_expected);
        if was_paused {
            ctl.paused.store(true, Ordering::Release);
        }
        entry.ctl = Some(ctl.clone());

        info!(transfer = %id, %peer, from_chunk = next_expected, "streaming");
        tokio::spawn(sender_task(
            self.engine.clone(),
            self.event_tx.clone(),
            ctl,
            id,
            peer,
            source,
            chunk_size,
            total_bytes,
            next_expected,
        ));
        self.emit_progress(id);
    }

    async fn handle_chunk(&mut self, peer: PeerHash, id: Uuid, index: u64, data: Vec<u8>) {
        let Some(entry) = self.entry_for_mut(peer, id) else {
            return;
        };
        if entry.info.direction != TransferDirection::Receiving
            || entry.info.status.is_terminal()
        {
            return;
        }

        // Duplicates can arrive right after a resume; drop them quietly.
        if index < entry.expected_index {
            return;
        }
        if index > entry.expected_index {
            warn!(
                transfer = %id,
                expected = entry.expected_index,
                got = index,
                "chunk out of order"
            );
            let _ = self
                .engine
                .send_frame(peer, Body::FileCancel { transfer_id: id })
                .await;
            self.fail_transfer(id, "chunk out of order").await;
            return;
        }

        let offset = index * u64::from(entry.info.chunk_size);
        let write_result = async {
            let part = entry
                .part
                .as_mut()
                .ok_or_else(|| std::io::Error::other("no destination file"))?;
            part.file.seek(std::io::SeekFrom::Start(offset)).await?;
            part.file.write_all(&data).await?;
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(err) = write_result {
            warn!(transfer = %id, %err, "write failed");
            let _ = self
                .engine
                .send_frame(peer, Body::FileCancel { transfer_id: id })
                .await;
            self.fail_transfer(id, &format!("write failed: {err}")).await;
            return;
        }

        entry.expected_index = index + 1;
        // In-flight chunks still land after a local pause; only a
        // remote sender resuming moves the state forward again.
        if !entry.paused_locally {
            entry.info.status = TransferStatus::InProgress;
        }
        let elapsed = entry.last_chunk_at.elapsed().as_secs_f64();
        entry.last_chunk_at = Instant::now();
        entry.info.record_chunk(data.len() as u64, elapsed);

        let next = entry.expected_index;
        let done = next >= entry.info.chunks_total;
        if done || next - entry.last_acked >= ACK_EVERY {
            entry.last_acked = next;
            let _ = self
                .engine
                .send_frame(
                    peer,
                    Body::FileAck {
                        transfer_id: id,
                        next_expected_index: next,
                    },
                )
                .await;
        }
        self.emit_progress(id);
    }

    async fn handle_done(&mut self, peer: PeerHash, id: Uuid, claimed_hash: String) {
        let Some(entry) = self.entry_for_mut(peer, id) else {
            return;
        };
        if entry.info.direction != TransferDirection::Receiving {
            return;
        }
        if entry.expected_index < entry.info.chunks_total {
            let _ = self
                .engine
                .send_frame(peer, Body::FileCancel { transfer_id: id })
                .await;
            self.fail_transfer(id, "done before all chunks arrived").await;
            return;
        }

        // Flush and drop the handle before hashing the file.
        let Some(mut part) = entry.part.take() else {
            return;
        };
        let flush_result = async {
            part.file.flush().await?;
            part.file.sync_all().await
        }
        .await;
        let part_path = part.part_path.clone();
        let final_path = part.final_path.clone();
        drop(part);

        if let Err(err) = flush_result {
            self.fail_transfer(id, &format!("flush failed: {err}")).await;
            return;
        }

        let hash_path = part_path.clone();
        let computed = tokio::task::spawn_blocking(move || hash_file(&hash_path)).await;

        let matches = matches!(&computed, Ok(Ok(hash)) if *hash == claimed_hash);
        if matches {
            if let Err(err) = tokio::fs::rename(&part_path, &final_path).await {
                self.fail_transfer(id, &format!("rename failed: {err}")).await;
                return;
            }
            let _ = self
                .engine
                .send_frame(peer, Body::FileOk { transfer_id: id })
                .await;
            self.finish_completed(id).await;
        } else {
            warn!(transfer = %id, "file hash mismatch");
            let _ = self
                .engine
                .send_frame(peer, Body::FileBad { transfer_id: id })
                .await;
            let _ = tokio::fs::remove_file(&part_path).await;
            self.fail_transfer(id, "hash mismatch").await;
        }
    }

    async fn handle_remote_resume(&mut self, peer: PeerHash, id: Uuid, next_expected: u64) {
        let Some(entry) = self.entry_for_mut(peer, id) else {
            // The stream state is gone (e.g. we restarted); nothing to
            // replay from, so tell the other side to give up.
            let _ = self
                .engine
                .send_frame(peer, Body::FileCancel { transfer_id: id })
                .await;
            return;
        };
        if entry.info.direction != TransferDirection::Sending {
            return;
        }

        match &entry.ctl {
            Some(ctl) => {
                *ctl.rewind.lock() = Some(next_expected);
                ctl.acked.store(next_expected, Ordering::Release);
                ctl.paused.store(false, Ordering::Release);
                ctl.wake();
                entry.info.status = TransferStatus::InProgress;
                entry.paused_locally = false;
                entry.info.chunks_done = next_expected.min(entry.info.chunks_total);
                debug!(transfer = %id, next_expected, "rewinding stream");
            }
            None => {
                // No live stream; run the accept path to start one.
                self.handle_accept(peer, id, next_expected).await;
            }
        }
    }

    async fn handle_sender_event(&mut self, event: SenderEvent) {
        match event {
            SenderEvent::Sent { id, bytes } => {
                if let Some(entry) = self.transfers.get_mut(&id) {
                    let elapsed = entry.last_chunk_at.elapsed().as_secs_f64();
                    entry.last_chunk_at = Instant::now();
                    entry.info.record_chunk(bytes, elapsed);
                    self.emit_progress(id);
                }
            }
            SenderEvent::StreamDone { id } => {
                let Some(entry) = self.transfers.get_mut(&id) else {
                    return;
                };
                entry.ctl = None;
                let peer = entry.info.peer;
                let file_hash = entry.file_hash.clone();
                debug!(transfer = %id, "all chunks sent");
                let _ = self
                    .engine
                    .send_frame(
                        peer,
                        Body::FileDone {
                            transfer_id: id,
                            file_hash,
                        },
                    )
                    .await;
            }
            SenderEvent::Failed { id, reason } => {
                if let Some(entry) = self.transfers.get_mut(&id) {
                    entry.ctl = None;
                    if !entry.info.status.is_terminal()
                        && entry.info.status != TransferStatus::Paused
                    {
                        self.fail_transfer(id, &reason).await;
                    }
                }
            }
        }
    }

    fn entry_for(&self, peer: PeerHash, id: Uuid) -> Option<&Entry> {
        self.transfers.get(&id).filter(|e| e.info.peer == peer)
    }

    fn entry_for_mut(&mut self, peer: PeerHash, id: Uuid) -> Option<&mut Entry> {
        self.transfers.get_mut(&id).filter(|e| e.info.peer == peer)
    }

    async fn fail_all(&mut self, reason: &str) {
        let ids: Vec<Uuid> = self
            .transfers
            .iter()
            .filter(|(_, e)| !e.info.status.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.fail_transfer(id, reason).await;
        }
    }

    async fn fail_transfer(&mut self, id: Uuid, reason: &str) {
        let Some(entry) = self.transfers.get_mut(&id) else {
            return;
        };
        if entry.info.status.is_terminal() {
            return;
        }
        if let Some(ctl) = entry.ctl.take() {
            ctl.cancelled.store(true, Ordering::Release);
            ctl.wake();
        }
        entry.part = None;
        entry.info.fail(reason);
        info!(transfer = %id, %reason, "transfer failed");
        self.emit_complete(id);
    }

    async fn finish_cancelled(&mut self, id: Uuid, reason: &str) {
        let Some(entry) = self.transfers.get_mut(&id) else {
            return;
        };
        if entry.info.status.is_terminal() {
            return;
        }
        if let Some(ctl) = entry.ctl.take() {
            ctl.cancelled.store(true, Ordering::Release);
            ctl.wake();
        }
        entry.info.status = TransferStatus::Cancelled;
        entry.info.error = Some(reason.to_string());

        if let Some(part) = entry.part.take() {
            drop(part.file);
            if !self.config.keep_partial_on_cancel {
                let _ = tokio::fs::remove_file(&part.part_path).await;
            }
        }
        info!(transfer = %id, %reason, "transfer cancelled");
        self.emit_complete(id);
    }

    async fn finish_completed(&mut self, id: Uuid) {
        let Some(entry) = self.transfers.get_mut(&id) else {
            return;
        };
        entry.ctl = None;
        entry.part = None;
        entry.info.status = TransferStatus::Completed;
        entry.info.chunks_done = entry.info.chunks_total;
        info!(transfer = %id, "transfer completed");
        self.emit_progress(id);
        self.emit_complete(id);
    }

    fn emit_progress(&self, id: Uuid) {
        if let Some(entry) = self.transfers.get(&id) {
            let snapshot = entry.info.clone();
            let handler = self.handler.clone();
            if catch_unwind(AssertUnwindSafe(|| handler.on_progress(&snapshot))).is_err() {
                warn!("on_progress callback panicked");
            }
        }
    }

    fn emit_complete(&self, id: Uuid) {
        if let Some(entry) = self.transfers.get(&id) {
            let snapshot = entry.info.clone();
            let handler = self.handler.clone();
            if catch_unwind(AssertUnwindSafe(|| handler.on_complete(&snapshot))).is_err() {
                warn!("on_complete callback panicked");
            }
        }
    }
}

/// Streams chunks for one sending transfer.
#[allow(clippy::too_many_arguments)]
async fn sender_task(
    engine: Arc<MeshEngine>,
    events: mpsc::Sender<SenderEvent>,
    ctl: Arc<SendCtl>,
    id: Uuid,
    peer: PeerHash,
    path: PathBuf,
    chunk_size: u64,
    total_bytes: u64,
    start_index: u64,
) {
    let total_chunks = total_bytes.div_ceil(chunk_size.max(1));
    let mut file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) => {
            let _ = events
                .send(SenderEvent::Failed {
                    id,
                    reason: format!("open failed: {err}"),
                })
                .await;
            return;
        }
    };

    let mut index = start_index;
    loop {
        if ctl.cancelled.load(Ordering::Acquire) {
            return;
        }
        if let Some(rewind) = ctl.rewind.lock().take() {
            index = rewind;
        }
        if ctl.paused.load(Ordering::Acquire) {
            ctl.notify.notified().await;
            continue;
        }
        if index >= total_chunks {
            let _ = events.send(SenderEvent::StreamDone { id }).await;
            return;
        }

        // Flow control: stall once the unacked window is full.
        if index.saturating_sub(ctl.acked.load(Ordering::Acquire)) >= MAX_UNACKED {
            if timeout(ACK_STALL_TIMEOUT, ctl.notify.notified()).await.is_err() {
                let _ = events
                    .send(SenderEvent::Failed {
                        id,
                        reason: "acknowledgement stalled".to_string(),
                    })
                    .await;
            }
            continue;
        }

        let offset = index * chunk_size;
        let len = chunk_size.min(total_bytes - offset) as usize;
        let mut buf = vec![0u8; len];
        let read_result = async {
            file.seek(std::io::SeekFrom::Start(offset)).await?;
            file.read_exact(&mut buf).await?;
            Ok::<(), std::io::Error>(())
        }
        .await;
        if let Err(err) = read_result {
            let _ = events
                .send(SenderEvent::Failed {
                    id,
                    reason: format!("read failed: {err}"),
                })
                .await;
            return;
        }

        if let Err(err) = engine
            .send_frame(
                peer,
                Body::FileChunk {
                    transfer_id: id,
                    chunk_index: index,
                    data: buf,
                },
            )
            .await
        {
            let _ = events
                .send(SenderEvent::Failed {
                    id,
                    reason: format!("send failed: {err}"),
                })
                .await;
            return;
        }

        let _ = events
            .send(SenderEvent::Sent {
                id,
                bytes: len as u64,
            })
            .await;
        index += 1;
    }
}

/// SHA-1 of a file's contents, as lowercase hex.
fn hash_file(path: &Path) -> Result<String, std::io::Error> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Collects `(relative_path, size)` for every file under `root`.
fn walk_directory(root: &Path) -> Result<Vec<(String, u64)>, std::io::Error> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let metadata = entry.metadata()?;
            if metadata.is_dir() {
                stack.push(path);
            } else if metadata.is_file() {
                let relative = path
                    .strip_prefix(root)
                    .map_err(|_| std::io::Error::other("path outside root"))?
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                files.push((relative, metadata.len()));
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Rejects absolute paths and traversal; returns a safe relative path.
fn sanitize_filename(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    let mut clean = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        return None;
    }
    Some(clean)
}

/// `name.bin` becomes `name.bin.part` (extension appended, not replaced).
fn part_extension(path: &Path) -> String {
    match path.extension() {
        Some(ext) => format!("{}.part", ext.to_string_lossy()),
        None => "part".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("a.bin"), Some(PathBuf::from("a.bin")));
        assert_eq!(
            sanitize_filename("dir/sub/a.bin"),
            Some(PathBuf::from("dir/sub/a.bin"))
        );
        assert_eq!(sanitize_filename("./a.bin"), Some(PathBuf::from("a.bin")));
        assert_eq!(sanitize_filename("../a.bin"), None);
        assert_eq!(sanitize_filename("/etc/passwd"), None);
        assert_eq!(sanitize_filename("a/../../b"), None);
        assert_eq!(sanitize_filename(""), None);
    }

    #[test]
    fn test_part_extension_appends() {
        assert_eq!(part_extension(Path::new("f.bin")), "bin.part");
        assert_eq!(part_extension(Path::new("f")), "part");
        // with_extension on "f.bin" + "bin.part" yields "f.bin.part".
        assert_eq!(
            Path::new("f.bin").with_extension(part_extension(Path::new("f.bin"))),
            Path::new("f.bin.part")
        );
    }

    #[test]
    fn test_hash_file_matches_incremental() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let expected = hex::encode(rats_core::sha1_digest(&data));
        assert_eq!(hash_file(&path).unwrap(), expected);
    }

    #[test]
    fn test_walk_directory_is_recursive_and_relative() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub/deep")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"bb").unwrap();
        std::fs::write(dir.path().join("sub/deep/c.txt"), b"ccc").unwrap();

        let files = walk_directory(dir.path()).unwrap();
        assert_eq!(
            files,
            vec![
                ("a.txt".to_string(), 1),
                ("sub/b.txt".to_string(), 2),
                ("sub/deep/c.txt".to_string(), 3),
            ]
        );
    }
}
