//! Live peer sessions.
//!
//! A session's send half (write side of the TCP stream plus the send
//! cipher) sits behind one async mutex so any task may send; the receive
//! half is owned exclusively by the session's receiver task and never
//! appears here. Liveness stamps are atomics read by the keepalive
//! scanner.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{watch, Mutex};

use rats_core::PeerHash;

use crate::error::NetError;
use crate::frame::write_frame;
use crate::noise::SendCipher;
use crate::registry::ConnectDirection;
use crate::wire::{Body, Frame};

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Keepalive window elapsed without traffic
    Timeout,
    /// The remote closed the stream
    Closed,
    /// Malformed frame, AEAD failure or protocol violation
    Protocol,
    /// Declared identity did not check out, or a collision lost
    Identity,
    /// Local engine shutdown
    Shutdown,
    /// Transport error
    Error,
}

impl DisconnectReason {
    /// Stable string form passed to callbacks.
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Timeout => "timeout",
            DisconnectReason::Closed => "closed",
            DisconnectReason::Protocol => "protocol",
            DisconnectReason::Identity => "identity",
            DisconnectReason::Shutdown => "shutdown",
            DisconnectReason::Error => "error",
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Send/receive counters for a session.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    /// Ciphertext bytes written
    pub bytes_sent: u64,
    /// Ciphertext bytes read
    pub bytes_received: u64,
    /// Frames written
    pub frames_sent: u64,
    /// Frames read
    pub frames_received: u64,
}

struct SendHalf {
    cipher: SendCipher,
    stream: OwnedWriteHalf,
}

/// One encrypted connection to a peer.
pub struct PeerSession {
    hash: PeerHash,
    remote_addr: SocketAddr,
    listen_addr: SocketAddr,
    direction: ConnectDirection,
    writer: Mutex<SendHalf>,
    alive: AtomicBool,
    created: Instant,
    last_recv_ms: AtomicU64,
    last_send_ms: AtomicU64,
    ping_outstanding: AtomicBool,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    next_frame_id: AtomicU64,
    announced: AtomicBool,
    closed_tx: watch::Sender<bool>,
    close_reason: parking_lot::Mutex<Option<DisconnectReason>>,
}

impl PeerSession {
    /// Builds a session around an established send half.
    ///
    /// Returns the session and the watch the receiver task uses to learn
    /// about forced closes.
    pub fn new(
        hash: PeerHash,
        remote_addr: SocketAddr,
        listen_port: u16,
        direction: ConnectDirection,
        cipher: SendCipher,
        stream: OwnedWriteHalf,
    ) -> (std::sync::Arc<Self>, watch::Receiver<bool>) {
        let (closed_tx, closed_rx) = watch::channel(false);
        let session = std::sync::Arc::new(Self {
            hash,
            remote_addr,
            listen_addr: SocketAddr::new(remote_addr.ip(), listen_port),
            direction,
            writer: Mutex::new(SendHalf { cipher, stream }),
            alive: AtomicBool::new(true),
            created: Instant::now(),
            last_recv_ms: AtomicU64::new(0),
            last_send_ms: AtomicU64::new(0),
            ping_outstanding: AtomicBool::new(false),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            next_frame_id: AtomicU64::new(1),
            announced: AtomicBool::new(false),
            closed_tx,
            close_reason: parking_lot::Mutex::new(None),
        });
        (session, closed_rx)
    }

    /// The peer's stable identity.
    pub fn hash(&self) -> PeerHash {
        self.hash
    }

    /// Remote endpoint of the TCP stream.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// The remote's advertised mesh listen endpoint.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Who initiated the connection.
    pub fn direction(&self) -> ConnectDirection {
        self.direction
    }

    /// False once the session is closing or closed.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Allocates a frame id; parts of one message share an id.
    pub fn next_frame_id(&self) -> u64 {
        self.next_frame_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends one body as a single frame.
    pub async fn send_body(&self, body: Body) -> Result<(), NetError> {
        let id = self.next_frame_id();
        self.send_parts(id, std::iter::once(body)).await
    }

    /// Sends several bodies under one frame id, holding the send lock
    /// across all of them so other senders cannot interleave.
    pub async fn send_parts(
        &self,
        id: u64,
        bodies: impl IntoIterator<Item = Body>,
    ) -> Result<(), NetError> {
        if !self.is_alive() {
            return Err(NetError::NotConnected(self.hash));
        }

        let mut writer = self.writer.lock().await;
        for body in bodies {
            let plaintext = Frame { id, body }.to_bytes()?;
            let ciphertext = writer.cipher.encrypt(&plaintext)?;
            write_frame(&mut writer.stream, &ciphertext).await?;

            self.bytes_sent
                .fetch_add(ciphertext.len() as u64 + 2, Ordering::Relaxed);
            self.frames_sent.fetch_add(1, Ordering::Relaxed);
            self.stamp(&self.last_send_ms);
        }
        Ok(())
    }

    /// Records received ciphertext for stats and liveness.
    pub fn mark_received(&self, ciphertext_len: usize) {
        self.bytes_received
            .fetch_add(ciphertext_len as u64 + 2, Ordering::Relaxed);
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.ping_outstanding.store(false, Ordering::Release);
        self.stamp(&self.last_recv_ms);
    }

    /// Time since anything was received.
    pub fn recv_idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_recv_ms.load(Ordering::Acquire));
        self.created.elapsed().saturating_sub(last)
    }

    /// Time since anything was sent.
    pub fn send_idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_send_ms.load(Ordering::Acquire));
        self.created.elapsed().saturating_sub(last)
    }

    /// Marks a keepalive ping as in flight. Returns false if one already
    /// was, meaning the previous ping went unanswered.
    pub fn mark_ping_sent(&self) -> bool {
        !self.ping_outstanding.swap(true, Ordering::AcqRel)
    }

    /// Flags the session as closing and wakes its receiver task.
    ///
    /// The first caller's reason wins; later calls are no-ops.
    pub fn close(&self, reason: DisconnectReason) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.alive.store(false, Ordering::Release);
        let _ = self.closed_tx.send(true);
    }

    /// The reason recorded by the first close.
    pub fn close_reason(&self) -> Option<DisconnectReason> {
        *self.close_reason.lock()
    }

    /// Records that `on_connect` fired for this session.
    pub fn mark_announced(&self) {
        self.announced.store(true, Ordering::Release);
    }

    /// Consumes the announced flag, so `on_disconnect` fires exactly
    /// once per announced session.
    pub fn take_announced(&self) -> bool {
        self.announced.swap(false, Ordering::AcqRel)
    }

    /// Shuts the write half down, flushing what was queued.
    pub async fn shutdown_writer(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.stream.shutdown().await;
    }

    /// Counter snapshot.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
        }
    }

    /// How long the session has existed.
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    fn stamp(&self, slot: &AtomicU64) {
        slot.store(self.created.elapsed().as_millis() as u64, Ordering::Release);
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("hash", &self.hash)
            .field("remote_addr", &self.remote_addr)
            .field("direction", &self.direction)
            .field("alive", &self.is_alive())
            .finish()
    }
}
