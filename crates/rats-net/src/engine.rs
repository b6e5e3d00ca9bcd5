//! Mesh engine.
//!
//! Ties the transport together: accepts TCP connections, dials peers,
//! drives the Noise handshake and hello exchange on both roles, spawns
//! one receiver task per session, dispatches application frames to the
//! registered handler, and keeps sessions alive with ping/pong.
//!
//! Callbacks run on the owning session's receiver task and must not
//! block; panics are caught at the dispatch boundary and logged.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use rats_core::{PeerHash, StaticSecretKey, PROTOCOL_VERSION};

use crate::error::NetError;
use crate::frame::{read_frame, write_frame};
use crate::noise::{self, Handshake, RecvCipher};
use crate::registry::{ConnectDirection, PeerRegistry, RegisterOutcome};
use crate::session::{DisconnectReason, PeerSession};
use crate::wire::{split_user_binary, Body, Frame, MAX_REASSEMBLED_LEN};
use crate::{
    CONNECT_TIMEOUT, HANDSHAKE_TIMEOUT, IDLE_PING_AFTER, SESSION_DEAD_AFTER, SHUTDOWN_GRACE,
};

/// How many peer endpoints one peer_exchange frame shares.
const PEER_EXCHANGE_LIMIT: usize = 10;

/// Application callbacks.
///
/// All methods are invoked on the receiver task of the session that
/// produced the event; long work belongs on the caller's own executor.
pub trait MeshHandler: Send + Sync + 'static {
    /// A session reached the connected state.
    fn on_connect(&self, _peer: PeerHash) {}

    /// A complete binary message arrived.
    fn on_message(&self, _peer: PeerHash, _payload: &[u8]) {}

    /// A text message arrived.
    fn on_string(&self, _peer: PeerHash, _text: &str) {}

    /// A session ended.
    fn on_disconnect(&self, _peer: PeerHash, _reason: DisconnectReason) {}
}

/// A file-transfer frame routed out of the engine.
#[derive(Debug)]
pub struct FileFrame {
    /// Which peer sent it
    pub peer: PeerHash,
    /// The frame body (always one of the `file_*` / `dir_manifest` set)
    pub body: Body,
}

/// Mesh engine configuration.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// TCP listen address
    pub listen_addr: SocketAddr,
    /// Port advertised in hello frames (defaults to the bound port)
    pub advertised_port: Option<u16>,
    /// Cap on live sessions, 0 = unlimited
    pub max_peers: usize,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Noise handshake + hello timeout
    pub handshake_timeout: Duration,
    /// Idle time before a keepalive ping
    pub idle_ping_after: Duration,
    /// Silence before a session is declared dead
    pub session_dead_after: Duration,
    /// Keepalive scanner period
    pub keepalive_tick: Duration,
}

impl MeshConfig {
    /// Standard configuration for the given listen address.
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            advertised_port: None,
            max_peers: 0,
            connect_timeout: CONNECT_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            idle_ping_after: IDLE_PING_AFTER,
            session_dead_after: SESSION_DEAD_AFTER,
            keepalive_tick: Duration::from_secs(5),
        }
    }
}

/// The mesh engine.
pub struct MeshEngine {
    weak: Weak<MeshEngine>,
    config: MeshConfig,
    static_key: StaticSecretKey,
    local_public: [u8; 32],
    local_hash: PeerHash,
    listen_addr: SocketAddr,
    advertised_port: u16,
    registry: PeerRegistry,
    handler: Arc<dyn MeshHandler>,
    file_tx: Option<mpsc::Sender<FileFrame>>,
    candidate_tx: parking_lot::Mutex<Option<mpsc::Sender<SocketAddr>>>,
    shutdown_tx: watch::Sender<bool>,
    active_receivers: AtomicUsize,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl MeshEngine {
    /// Binds the listener and starts the accept and keepalive loops.
    ///
    /// Bind failures are fatal and returned to the caller.
    pub async fn start(
        config: MeshConfig,
        static_key: StaticSecretKey,
        handler: Arc<dyn MeshHandler>,
        file_tx: Option<mpsc::Sender<FileFrame>>,
    ) -> Result<Arc<Self>, NetError> {
        let local_public = noise::public_key(&static_key)?;
        let local_hash = PeerHash::from_static_key(&local_public);

        let listener = TcpListener::bind(config.listen_addr).await?;
        let listen_addr = listener.local_addr()?;
        let advertised_port = config.advertised_port.unwrap_or_else(|| listen_addr.port());

        let (shutdown_tx, _) = watch::channel(false);
        let engine = Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            config,
            static_key,
            local_public,
            local_hash,
            listen_addr,
            advertised_port,
            registry: PeerRegistry::new(),
            handler,
            file_tx,
            candidate_tx: parking_lot::Mutex::new(None),
            shutdown_tx,
            active_receivers: AtomicUsize::new(0),
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        let accept = tokio::spawn(engine.clone().accept_loop(listener));
        let keepalive = tokio::spawn(engine.clone().keepalive_loop());
        engine.tasks.lock().extend([accept, keepalive]);

        info!(local_hash = %local_hash, %listen_addr, "mesh engine listening");
        Ok(engine)
    }

    /// Our stable peer identity.
    pub fn local_hash(&self) -> PeerHash {
        self.local_hash
    }

    /// The bound TCP listen address.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// The port advertised to peers.
    pub fn advertised_port(&self) -> u16 {
        self.advertised_port
    }

    /// The session registry.
    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Number of live sessions.
    pub fn peer_count(&self) -> usize {
        self.registry.peer_count()
    }

    /// Routes endpoints learned from peer_exchange frames to `tx`.
    pub fn set_candidate_sink(&self, tx: mpsc::Sender<SocketAddr>) {
        *self.candidate_tx.lock() = Some(tx);
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn arc(&self) -> Result<Arc<Self>, NetError> {
        self.weak.upgrade().ok_or(NetError::Shutdown)
    }

    /// Dials a peer. Resolves dual-stack with IPv6 preferred and tries
    /// each address with the connect timeout.
    pub async fn connect(&self, host: &str, port: u16) -> Result<PeerHash, NetError> {
        if self.is_shutting_down() {
            return Err(NetError::Shutdown);
        }
        // Over the cap, an outbound dial is not even started.
        if self.config.max_peers > 0 && self.registry.peer_count() >= self.config.max_peers {
            return Err(NetError::PeerLimit);
        }

        let mut addrs: Vec<SocketAddr> = lookup_host((host, port)).await?.collect();
        if addrs.is_empty() {
            return Err(NetError::Resolve(format!("{host}:{port}")));
        }
        addrs.sort_by_key(|addr| if addr.is_ipv6() { 0 } else { 1 });

        let mut last_err = NetError::Resolve(format!("{host}:{port}"));
        for addr in addrs {
            if let Some(hash) = self.registry.hash_for_socket(&addr) {
                return Ok(hash);
            }

            self.registry.add_pending(addr);
            let attempt = async {
                let stream = timeout(self.config.connect_timeout, TcpStream::connect(addr))
                    .await
                    .map_err(|_| NetError::ConnectTimeout)??;
                self.establish(stream, ConnectDirection::Outbound).await
            }
            .await;
            self.registry.remove_pending(addr);

            match attempt {
                Ok(hash) => return Ok(hash),
                Err(err) => {
                    debug!(%addr, %err, "dial attempt failed");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// Sends a binary message, splitting it into parts as needed.
    pub async fn send(&self, peer: PeerHash, payload: &[u8]) -> Result<(), NetError> {
        let session = self
            .registry
            .get(&peer)
            .ok_or(NetError::NotConnected(peer))?;
        let id = session.next_frame_id();
        session.send_parts(id, split_user_binary(payload)).await
    }

    /// Sends a text message.
    pub async fn send_string(&self, peer: PeerHash, text: &str) -> Result<(), NetError> {
        let session = self
            .registry
            .get(&peer)
            .ok_or(NetError::NotConnected(peer))?;
        session
            .send_body(Body::UserString {
                text: text.to_string(),
            })
            .await
    }

    /// Sends one protocol body to a peer; used by the transfer layer.
    pub async fn send_frame(&self, peer: PeerHash, body: Body) -> Result<(), NetError> {
        let session = self
            .registry
            .get(&peer)
            .ok_or(NetError::NotConnected(peer))?;
        session.send_body(body).await
    }

    /// Sends a binary message to every live session.
    ///
    /// Returns how many peers it reached.
    pub async fn broadcast(&self, payload: &[u8]) -> usize {
        let mut delivered = 0;
        for session in self.registry.peers() {
            let id = session.next_frame_id();
            if session
                .send_parts(id, split_user_binary(payload))
                .await
                .is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// Sends a text message to every live session.
    pub async fn broadcast_string(&self, text: &str) -> usize {
        let mut delivered = 0;
        for session in self.registry.peers() {
            if session
                .send_body(Body::UserString {
                    text: text.to_string(),
                })
                .await
                .is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// Closes a single session.
    pub fn disconnect(&self, peer: PeerHash) -> Result<(), NetError> {
        let session = self
            .registry
            .get(&peer)
            .ok_or(NetError::NotConnected(peer))?;
        session.close(DisconnectReason::Closed);
        Ok(())
    }

    /// Stops the engine: closes the listener, asks every session to
    /// finish, and force-closes whatever outlives the grace period.
    pub async fn stop(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!("mesh engine stopping");

        for session in self.registry.peers() {
            session.close(DisconnectReason::Shutdown);
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while self.active_receivers.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // Grace expired: force the sockets closed.
        for session in self.registry.peers() {
            warn!(peer = %session.hash(), "force-closing session after grace period");
            session.shutdown_writer().await;
        }

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if timeout(Duration::from_secs(1), task).await.is_err() {
                debug!("engine task did not finish in time");
            }
        }
        info!("mesh engine stopped");
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("accept loop stopping");
                    return;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            debug!(%remote, "inbound connection");
                            let engine = self.clone();
                            engine.registry.add_pending(remote);
                            tokio::spawn(async move {
                                match engine.establish(stream, ConnectDirection::Inbound).await {
                                    Ok(peer) => debug!(%remote, %peer, "inbound session up"),
                                    Err(err) => debug!(%remote, %err, "inbound connection failed"),
                                }
                                engine.registry.remove_pending(remote);
                            });
                        }
                        Err(err) => {
                            warn!(%err, "accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
    }

    /// Handshake, hello exchange, registration and receiver spawn for
    /// one freshly opened stream, on either role.
    async fn establish(
        &self,
        stream: TcpStream,
        direction: ConnectDirection,
    ) -> Result<PeerHash, NetError> {
        let remote_addr = stream.peer_addr()?;
        let _ = stream.set_nodelay(true);

        let (session, closed_rx, read_half, recv_cipher) = timeout(
            self.config.handshake_timeout,
            self.handshake_and_hello(stream, remote_addr, direction),
        )
        .await
        .map_err(|_| NetError::HandshakeTimeout)??;

        let remote_hash = session.hash();

        if self.config.max_peers > 0 && self.registry.peer_count() >= self.config.max_peers {
            session.shutdown_writer().await;
            return Err(NetError::PeerLimit);
        }

        match self.registry.register(session.clone(), self.local_hash) {
            RegisterOutcome::Registered => {}
            RegisterOutcome::Replaced(loser) => {
                debug!(peer = %remote_hash, "session collision, replacing older session");
                loser.close(DisconnectReason::Identity);
            }
            RegisterOutcome::Rejected => {
                debug!(peer = %remote_hash, "session collision, keeping existing session");
                session.shutdown_writer().await;
                return Err(NetError::DuplicateSession(remote_hash));
            }
        }

        let engine = self.arc()?;
        self.active_receivers.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(engine.clone().receiver_loop(
            session.clone(),
            read_half,
            recv_cipher,
            closed_rx,
        ));

        session.mark_announced();
        self.invoke(|handler| handler.on_connect(remote_hash));

        // Introduce this peer to the endpoints we already know.
        let known: Vec<String> = self
            .registry
            .peers()
            .into_iter()
            .filter(|other| other.hash() != remote_hash)
            .map(|other| other.listen_addr().to_string())
            .take(PEER_EXCHANGE_LIMIT)
            .collect();
        if !known.is_empty() {
            let _ = session.send_body(Body::PeerExchange { peers: known }).await;
        }

        Ok(remote_hash)
    }

    async fn handshake_and_hello(
        &self,
        stream: TcpStream,
        remote_addr: SocketAddr,
        direction: ConnectDirection,
    ) -> Result<
        (
            Arc<PeerSession>,
            watch::Receiver<bool>,
            OwnedReadHalf,
            RecvCipher,
        ),
        NetError,
    > {
        let (mut read_half, mut write_half) = stream.into_split();

        let mut handshake = match direction {
            ConnectDirection::Outbound => Handshake::initiator(&self.static_key)?,
            ConnectDirection::Inbound => Handshake::responder(&self.static_key)?,
        };

        if handshake.is_initiator() {
            // -> e
            let msg = handshake.write_message()?;
            write_frame(&mut write_half, &msg).await?;
            // <- e, ee, s, es
            let msg = read_frame(&mut read_half).await?;
            handshake.read_message(&msg)?;
            // -> s, se
            let msg = handshake.write_message()?;
            write_frame(&mut write_half, &msg).await?;
        } else {
            // <- e
            let msg = read_frame(&mut read_half).await?;
            handshake.read_message(&msg)?;
            // -> e, ee, s, es
            let msg = handshake.write_message()?;
            write_frame(&mut write_half, &msg).await?;
            // <- s, se
            let msg = read_frame(&mut read_half).await?;
            handshake.read_message(&msg)?;
        }

        let established = handshake.into_transport()?;
        let remote_hash = PeerHash::from_static_key(&established.remote_static);
        if remote_hash == self.local_hash {
            return Err(NetError::SelfConnection);
        }
        let expected_binding =
            PeerHash::session_binding(&established.remote_static, &established.handshake_hash);
        let our_binding =
            PeerHash::session_binding(&self.local_public, &established.handshake_hash);

        let mut send_cipher = established.send;
        let mut recv_cipher = established.recv;

        // hello must be the first application frame in each direction.
        let hello = Frame {
            id: 0,
            body: Body::Hello {
                peer_hash: self.local_hash.to_hex(),
                binding: our_binding.to_hex(),
                version: PROTOCOL_VERSION.to_string(),
                listen_port: self.advertised_port,
            },
        };
        let ciphertext = send_cipher.encrypt(&hello.to_bytes()?)?;
        write_frame(&mut write_half, &ciphertext).await?;

        let ciphertext = read_frame(&mut read_half).await?;
        let frame = Frame::from_bytes(&recv_cipher.decrypt(&ciphertext)?)?;
        let Body::Hello {
            peer_hash,
            binding,
            version,
            listen_port,
        } = frame.body
        else {
            return Err(NetError::UnexpectedFrame("expected hello"));
        };

        let declared =
            PeerHash::from_hex(&peer_hash).map_err(|_| NetError::IdentityMismatch)?;
        if declared != remote_hash || binding != expected_binding.to_hex() {
            warn!(%remote_addr, "hello identity does not match handshake");
            return Err(NetError::IdentityMismatch);
        }
        if version.split('.').next() != PROTOCOL_VERSION.split('.').next() {
            return Err(NetError::VersionMismatch(version));
        }

        let (session, closed_rx) = PeerSession::new(
            remote_hash,
            remote_addr,
            listen_port,
            direction,
            send_cipher,
            write_half,
        );
        Ok((session, closed_rx, read_half, recv_cipher))
    }

    async fn receiver_loop(
        self: Arc<Self>,
        session: Arc<PeerSession>,
        mut read_half: OwnedReadHalf,
        mut recv_cipher: RecvCipher,
        mut closed_rx: watch::Receiver<bool>,
    ) {
        // Partial multi-part messages, keyed by frame id.
        let mut reassembly: HashMap<u64, (Vec<u8>, u32)> = HashMap::new();

        let reason = loop {
            tokio::select! {
                _ = closed_rx.changed() => {
                    break session.close_reason().unwrap_or(DisconnectReason::Closed);
                }
                result = read_frame(&mut read_half) => {
                    let ciphertext = match result {
                        Ok(ciphertext) => ciphertext,
                        Err(NetError::Io(err))
                            if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                        {
                            break DisconnectReason::Closed;
                        }
                        Err(err) => {
                            debug!(peer = %session.hash(), %err, "read failed");
                            break DisconnectReason::Error;
                        }
                    };
                    session.mark_received(ciphertext.len());

                    let plaintext = match recv_cipher.decrypt(&ciphertext) {
                        Ok(plaintext) => plaintext,
                        Err(err) => {
                            warn!(peer = %session.hash(), %err, "AEAD failure");
                            break DisconnectReason::Protocol;
                        }
                    };
                    let frame = match Frame::from_bytes(&plaintext) {
                        Ok(frame) => frame,
                        Err(err) => {
                            warn!(peer = %session.hash(), %err, "malformed frame");
                            break DisconnectReason::Protocol;
                        }
                    };

                    if let Err(reason) = self
                        .dispatch(&session, frame, &mut reassembly)
                        .await
                    {
                        break reason;
                    }
                }
            }
        };

        self.finish_session(session, reason).await;
        self.active_receivers.fetch_sub(1, Ordering::AcqRel);
    }

    /// Handles one application frame. Returns the disconnect reason on
    /// a violation.
    async fn dispatch(
        &self,
        session: &Arc<PeerSession>,
        frame: Frame,
        reassembly: &mut HashMap<u64, (Vec<u8>, u32)>,
    ) -> Result<(), DisconnectReason> {
        let peer = session.hash();
        match frame.body {
            Body::Hello { .. } => {
                warn!(%peer, "unexpected second hello");
                Err(DisconnectReason::Protocol)
            }

            Body::Ping => {
                let _ = session.send_body(Body::Pong).await;
                Ok(())
            }

            // Receipt already refreshed the liveness stamp.
            Body::Pong => Ok(()),

            Body::PeerExchange { peers } => {
                let sink = self.candidate_tx.lock().clone();
                if let Some(sink) = sink {
                    for endpoint in peers {
                        if let Ok(addr) = endpoint.parse::<SocketAddr>() {
                            let _ = sink.try_send(addr);
                        }
                    }
                }
                Ok(())
            }

            Body::UserString { text } => {
                self.invoke(|handler| handler.on_string(peer, &text));
                Ok(())
            }

            Body::UserBinary { data, seq, last } => {
                let (buffer, next_seq) = reassembly.entry(frame.id).or_default();
                if *next_seq != seq {
                    warn!(%peer, expected = *next_seq, got = seq, "binary part out of order");
                    reassembly.remove(&frame.id);
                    return Err(DisconnectReason::Protocol);
                }
                buffer.extend_from_slice(&data);
                *next_seq += 1;
                if buffer.len() > MAX_REASSEMBLED_LEN {
                    warn!(%peer, "binary message exceeds reassembly cap");
                    reassembly.remove(&frame.id);
                    return Err(DisconnectReason::Protocol);
                }
                if last {
                    let (payload, _) = reassembly
                        .remove(&frame.id)
                        .unwrap_or_default();
                    self.invoke(|handler| handler.on_message(peer, &payload));
                }
                Ok(())
            }

            body if body.is_file_frame() => {
                if let Some(file_tx) = &self.file_tx {
                    if file_tx.send(FileFrame { peer, body }).await.is_err() {
                        debug!(%peer, "transfer layer gone, dropping file frame");
                    }
                } else {
                    debug!(%peer, "no transfer layer, dropping file frame");
                }
                Ok(())
            }

            // is_file_frame covers every remaining variant.
            _ => Ok(()),
        }
    }

    async fn finish_session(&self, session: Arc<PeerSession>, reason: DisconnectReason) {
        session.close(reason);
        session.shutdown_writer().await;

        let hash = session.hash();
        self.registry.unregister(hash, session.remote_addr());

        if session.take_announced() {
            // A collision replacement leaves the peer connected through
            // the winning session; no disconnect to report then.
            if self.registry.get(&hash).is_none() {
                let final_reason = session.close_reason().unwrap_or(reason);
                debug!(peer = %hash, reason = %final_reason, "session closed");
                self.invoke(|handler| handler.on_disconnect(hash, final_reason));
            }
        }
    }

    async fn keepalive_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut tick = interval(self.config.keepalive_tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tick.tick() => {
                    for session in self.registry.peers() {
                        let idle = session.recv_idle();
                        if idle >= self.config.session_dead_after {
                            debug!(peer = %session.hash(), "session timed out");
                            session.close(DisconnectReason::Timeout);
                        } else if idle >= self.config.idle_ping_after {
                            session.mark_ping_sent();
                            let session = session.clone();
                            tokio::spawn(async move {
                                let _ = session.send_body(Body::Ping).await;
                            });
                        }
                    }
                }
            }
        }
    }

    fn invoke(&self, call: impl FnOnce(&dyn MeshHandler)) {
        let handler = self.handler.as_ref();
        if catch_unwind(AssertUnwindSafe(|| call(handler))).is_err() {
            error!("handler callback panicked");
        }
    }
}

impl std::fmt::Debug for MeshEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshEngine")
            .field("local_hash", &self.local_hash)
            .field("listen_addr", &self.listen_addr)
            .field("peers", &self.peer_count())
            .finish()
    }
}
