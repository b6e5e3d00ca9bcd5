//! DHT node actor.
//!
//! Owns the routing table, announce storage, token secrets and the
//! transaction table, and drives iterative lookups. Incoming queries are
//! answered synchronously on the event loop; outgoing requests are
//! correlated by transaction id with a 5 second deadline. Callers talk
//! to the actor through [`DhtHandle`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use rats_core::{InfoHash, NodeId};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::DhtError;
use crate::krpc::{error_codes, KrpcMessage, MessageBody, NodeInfo, Query, Response, TransactionId};
use crate::lookup::{Lookup, LookupKind};
use crate::routing::{Contact, RoutingTable};
use crate::socket::{DhtSocket, SocketEvent, SocketHandle};
use crate::storage::PeerStore;
use crate::token::TokenManager;
use crate::{K, REFRESH_INTERVAL_SECS, REQUEST_TIMEOUT_SECS};

const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// DHT node configuration.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Stable local identity
    pub local_id: NodeId,
    /// UDP bind address (port 0 = ephemeral)
    pub bind_addr: SocketAddr,
}

/// Result of a get_peers lookup.
#[derive(Debug, Clone)]
pub struct LookupOutcome {
    /// Peer endpoints announced for the info-hash
    pub peers: Vec<SocketAddr>,
    /// Closest responding nodes, best first
    pub closest: Vec<NodeInfo>,
}

/// Routing and storage counters.
#[derive(Debug, Clone, Copy)]
pub struct DhtStats {
    /// Contacts in the routing table
    pub routing_table_size: usize,
    /// Tracked info-hashes in announce storage
    pub stored_info_hashes: usize,
}

enum DhtCommand {
    Bootstrap {
        addrs: Vec<SocketAddr>,
        reply: oneshot::Sender<usize>,
    },
    FindNode {
        target: NodeId,
        reply: oneshot::Sender<Vec<NodeInfo>>,
    },
    GetPeers {
        info_hash: InfoHash,
        reply: oneshot::Sender<LookupOutcome>,
    },
    Announce {
        info_hash: InfoHash,
        port: u16,
        reply: oneshot::Sender<Result<usize, DhtError>>,
    },
    Ping {
        to: SocketAddr,
        reply: oneshot::Sender<Result<NodeId, DhtError>>,
    },
    Stats {
        reply: oneshot::Sender<DhtStats>,
    },
    Shutdown,
}

/// Cloneable handle to a running DHT node.
#[derive(Clone)]
pub struct DhtHandle {
    cmd_tx: mpsc::Sender<DhtCommand>,
    local_id: NodeId,
    local_addr: SocketAddr,
}

impl DhtHandle {
    /// The local node id.
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// The bound UDP address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> DhtCommand,
    ) -> Result<T, DhtError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| DhtError::Shutdown)?;
        reply_rx.await.map_err(|_| DhtError::Shutdown)
    }

    /// Pings the given bootstrap endpoints and then walks toward the
    /// local id to populate the routing table. Returns the table size.
    pub async fn bootstrap(&self, addrs: Vec<SocketAddr>) -> Result<usize, DhtError> {
        self.send(|reply| DhtCommand::Bootstrap { addrs, reply }).await
    }

    /// Iterative node lookup toward `target`.
    pub async fn find_node(&self, target: NodeId) -> Result<Vec<NodeInfo>, DhtError> {
        self.send(|reply| DhtCommand::FindNode { target, reply }).await
    }

    /// Iterative peer lookup for `info_hash`.
    pub async fn get_peers(&self, info_hash: InfoHash) -> Result<LookupOutcome, DhtError> {
        self.send(|reply| DhtCommand::GetPeers { info_hash, reply }).await
    }

    /// Announces the local node as a peer for `info_hash` on `port`.
    ///
    /// Returns the number of nodes that accepted the announce.
    pub async fn announce(&self, info_hash: InfoHash, port: u16) -> Result<usize, DhtError> {
        self.send(|reply| DhtCommand::Announce {
            info_hash,
            port,
            reply,
        })
        .await?
    }

    /// Pings a single endpoint, returning its node id.
    pub async fn ping(&self, to: SocketAddr) -> Result<NodeId, DhtError> {
        self.send(|reply| DhtCommand::Ping { to, reply }).await?
    }

    /// Snapshot of routing/storage counters.
    pub async fn stats(&self) -> Result<DhtStats, DhtError> {
        self.send(|reply| DhtCommand::Stats { reply }).await
    }

    /// Stops the node actor.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(DhtCommand::Shutdown).await;
    }
}

enum QueryKind {
    Ping {
        reply: Option<oneshot::Sender<Result<NodeId, DhtError>>>,
        bootstrap: bool,
    },
    FindNode,
    GetPeers,
    Announce,
}

struct PendingQuery {
    addr: SocketAddr,
    remote_id: Option<NodeId>,
    kind: QueryKind,
    lookup_id: Option<u64>,
    sent_at: Instant,
}

enum LookupReply {
    FindNode(oneshot::Sender<Vec<NodeInfo>>),
    GetPeers(oneshot::Sender<LookupOutcome>),
    Announce {
        port: u16,
        reply: oneshot::Sender<Result<usize, DhtError>>,
    },
    /// Internal maintenance lookup; result feeds the routing table only.
    Refresh,
    Bootstrap(oneshot::Sender<usize>),
}

struct ActiveLookup {
    lookup: Lookup,
    reply: LookupReply,
}

/// The DHT node actor and its spawn entry point.
pub struct DhtNode {
    local_id: NodeId,
    socket: SocketHandle,
    routing: RoutingTable,
    storage: PeerStore,
    tokens: TokenManager,
    pending: HashMap<Vec<u8>, PendingQuery>,
    lookups: HashMap<u64, ActiveLookup>,
    next_lookup_id: u64,
    bootstrap_outstanding: usize,
    bootstrap_reply: Option<oneshot::Sender<usize>>,
    cmd_rx: mpsc::Receiver<DhtCommand>,
    events: mpsc::Receiver<SocketEvent>,
}

impl DhtNode {
    /// Binds the UDP socket and spawns the socket and node actors.
    pub async fn spawn(config: DhtConfig) -> Result<DhtHandle, DhtError> {
        let (socket_actor, socket, events) = DhtSocket::bind(config.bind_addr).await?;
        let local_addr = socket.local_addr();
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

        let node = Self {
            local_id: config.local_id,
            socket,
            routing: RoutingTable::new(config.local_id),
            storage: PeerStore::new(),
            tokens: TokenManager::new(),
            pending: HashMap::new(),
            lookups: HashMap::new(),
            next_lookup_id: 0,
            bootstrap_outstanding: 0,
            bootstrap_reply: None,
            cmd_rx,
            events,
        };

        tokio::spawn(socket_actor.run());
        tokio::spawn(node.run());

        info!(local_id = %config.local_id, %local_addr, "DHT node started");
        Ok(DhtHandle {
            cmd_tx,
            local_id: config.local_id,
            local_addr,
        })
    }

    async fn run(mut self) {
        let mut expiry_tick = interval(Duration::from_secs(1));
        expiry_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut refresh_tick = interval(Duration::from_secs(REFRESH_INTERVAL_SECS));
        refresh_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval fires immediately; skip it so a
        // freshly started node does not refresh an empty table.
        refresh_tick.tick().await;

        loop {
            tokio::select! {
                event = self.events.recv() => {
                    match event {
                        Some(SocketEvent::Message { message, from }) => {
                            self.handle_message(message, from).await;
                        }
                        None => {
                            debug!("socket actor gone, node actor stopping");
                            return;
                        }
                    }
                }

                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(DhtCommand::Shutdown) | None => {
                            self.socket.shutdown().await;
                            info!("DHT node stopped");
                            return;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }

                _ = expiry_tick.tick() => {
                    self.expire_pending().await;
                }

                _ = refresh_tick.tick() => {
                    self.refresh_buckets().await;
                    self.storage.expire();
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: DhtCommand) {
        match cmd {
            DhtCommand::Bootstrap { addrs, reply } => {
                if addrs.is_empty() {
                    let _ = reply.send(self.routing.len());
                    return;
                }
                self.bootstrap_outstanding = addrs.len();
                self.bootstrap_reply = Some(reply);
                for addr in addrs {
                    self.send_query(
                        addr,
                        None,
                        Query::Ping,
                        None,
                        QueryKind::Ping {
                            reply: None,
                            bootstrap: true,
                        },
                    )
                    .await;
                }
            }

            DhtCommand::FindNode { target, reply } => {
                self.start_lookup(target, LookupKind::FindNode, LookupReply::FindNode(reply))
                    .await;
            }

            DhtCommand::GetPeers { info_hash, reply } => {
                self.start_lookup(
                    NodeId::new(*info_hash.as_bytes()),
                    LookupKind::GetPeers(info_hash),
                    LookupReply::GetPeers(reply),
                )
                .await;
            }

            DhtCommand::Announce {
                info_hash,
                port,
                reply,
            } => {
                self.start_lookup(
                    NodeId::new(*info_hash.as_bytes()),
                    LookupKind::GetPeers(info_hash),
                    LookupReply::Announce { port, reply },
                )
                .await;
            }

            DhtCommand::Ping { to, reply } => {
                self.send_query(
                    to,
                    None,
                    Query::Ping,
                    None,
                    QueryKind::Ping {
                        reply: Some(reply),
                        bootstrap: false,
                    },
                )
                .await;
            }

            DhtCommand::Stats { reply } => {
                let _ = reply.send(DhtStats {
                    routing_table_size: self.routing.len(),
                    stored_info_hashes: self.storage.len(),
                });
            }

            DhtCommand::Shutdown => unreachable!("handled in run()"),
        }
    }

    async fn handle_message(&mut self, message: KrpcMessage, from: SocketAddr) {
        match message.body {
            MessageBody::Query { id, query } => {
                self.routing.insert(Contact::new(id, from));
                self.answer_query(message.transaction_id, id, query, from).await;
            }
            MessageBody::Response(response) => {
                self.handle_response(message.transaction_id, response, from).await;
            }
            MessageBody::Error { code, message: text } => {
                self.handle_error(message.transaction_id, code, text, from).await;
            }
        }
    }

    async fn answer_query(
        &mut self,
        txid: TransactionId,
        sender_id: NodeId,
        query: Query,
        from: SocketAddr,
    ) {
        let response = match query {
            Query::Ping => Response {
                id: self.local_id,
                ..Response::default()
            },

            Query::FindNode { target } => {
                self.closest_response(&target)
            }

            Query::GetPeers { info_hash } => {
                let peers = self.storage.get(&info_hash);
                let mut response = if peers.is_empty() {
                    self.closest_response(&NodeId::new(*info_hash.as_bytes()))
                } else {
                    Response {
                        id: self.local_id,
                        values: peers,
                        ..Response::default()
                    }
                };
                response.token = Some(self.tokens.generate(&from.ip()));
                response
            }

            Query::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
            } => {
                if !self.tokens.validate(&from.ip(), &token) {
                    debug!(%from, %info_hash, "rejecting announce with bad token");
                    self.socket
                        .send(
                            KrpcMessage::error(txid, error_codes::PROTOCOL, "bad token"),
                            from,
                        )
                        .await;
                    return;
                }
                let peer_port = if implied_port { from.port() } else { port };
                let peer = SocketAddr::new(from.ip(), peer_port);
                self.storage.insert(info_hash, peer);
                debug!(%info_hash, %peer, announced_by = %sender_id, "stored announced peer");
                Response {
                    id: self.local_id,
                    ..Response::default()
                }
            }
        };

        self.socket
            .send(KrpcMessage::response(txid, response), from)
            .await;
    }

    fn closest_response(&self, target: &NodeId) -> Response {
        let contacts = self.routing.closest(target, K);
        let mut response = Response {
            id: self.local_id,
            ..Response::default()
        };
        for contact in contacts {
            let info = NodeInfo {
                id: contact.id,
                addr: contact.addr,
            };
            if contact.addr.is_ipv6() {
                response.nodes6.push(info);
            } else {
                response.nodes.push(info);
            }
        }
        response
    }

    async fn handle_response(
        &mut self,
        txid: TransactionId,
        response: Response,
        from: SocketAddr,
    ) {
        let Some(pending) = self.pending.get(txid.as_bytes()) else {
            debug!(%from, "response with unknown transaction id");
            return;
        };
        if pending.addr != from {
            warn!(%from, expected = %pending.addr, "response from unexpected address");
            return;
        }
        let pending = self
            .pending
            .remove(txid.as_bytes())
            .expect("entry was just found");

        // Any successful response makes the contact good.
        self.routing.insert(Contact::new(response.id, from));
        self.routing.touch(&response.id);

        match pending.kind {
            QueryKind::Ping { reply, bootstrap } => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(response.id));
                }
                if bootstrap {
                    self.bootstrap_step().await;
                }
            }
            QueryKind::FindNode | QueryKind::GetPeers => {
                if let Some(lookup_id) = pending.lookup_id {
                    let mut nodes = response.nodes;
                    nodes.extend(response.nodes6);
                    nodes.retain(|n| n.id != self.local_id);
                    if let Some(active) = self.lookups.get_mut(&lookup_id) {
                        if matches!(active.lookup.kind, LookupKind::GetPeers(_)) {
                            active.lookup.on_values(
                                NodeInfo {
                                    id: response.id,
                                    addr: from,
                                },
                                response.values,
                                response.token,
                            );
                        }
                        active.lookup.on_response(&response.id, nodes);
                    }
                    self.drive_lookup(lookup_id).await;
                }
            }
            QueryKind::Announce => {
                debug!(node = %response.id, "announce accepted");
            }
        }
    }

    async fn handle_error(
        &mut self,
        txid: TransactionId,
        code: i64,
        text: String,
        from: SocketAddr,
    ) {
        let Some(mut pending) = self.pending.remove(txid.as_bytes()) else {
            return;
        };
        debug!(%from, code, %text, "KRPC error response");

        // A waiting ping caller gets the remote error itself; lookups
        // just treat the contact as failed.
        if let QueryKind::Ping { reply, .. } = &mut pending.kind {
            if let Some(reply) = reply.take() {
                let _ = reply.send(Err(DhtError::Remote {
                    code,
                    message: text,
                }));
            }
        }
        self.fail_pending(pending).await;
    }

    /// Marks the target of a dead request failed and unblocks whatever
    /// was waiting on it.
    async fn fail_pending(&mut self, pending: PendingQuery) {
        if let Some(id) = pending.remote_id {
            self.routing.record_failure(&id);
        }
        match pending.kind {
            QueryKind::Ping { reply, bootstrap } => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(DhtError::Timeout));
                }
                if bootstrap {
                    self.bootstrap_step().await;
                }
            }
            QueryKind::FindNode | QueryKind::GetPeers => {
                if let Some(lookup_id) = pending.lookup_id {
                    if let (Some(active), Some(id)) =
                        (self.lookups.get_mut(&lookup_id), pending.remote_id)
                    {
                        active.lookup.on_failure(&id);
                    }
                    self.drive_lookup(lookup_id).await;
                }
            }
            QueryKind::Announce => {}
        }
    }

    async fn expire_pending(&mut self) {
        let deadline = Duration::from_secs(REQUEST_TIMEOUT_SECS);
        let expired: Vec<Vec<u8>> = self
            .pending
            .iter()
            .filter(|(_, p)| p.sent_at.elapsed() >= deadline)
            .map(|(txid, _)| txid.clone())
            .collect();

        for txid in expired {
            if let Some(pending) = self.pending.remove(&txid) {
                debug!(to = %pending.addr, "request timed out");
                self.fail_pending(pending).await;
            }
        }
    }

    /// One bootstrap ping resolved; once all have, walk toward our own
    /// id to fill the routing table.
    async fn bootstrap_step(&mut self) {
        if self.bootstrap_outstanding > 0 {
            self.bootstrap_outstanding -= 1;
        }
        if self.bootstrap_outstanding == 0 {
            if let Some(reply) = self.bootstrap_reply.take() {
                let local_id = self.local_id;
                self.start_lookup(local_id, LookupKind::FindNode, LookupReply::Bootstrap(reply))
                    .await;
            }
        }
    }

    async fn refresh_buckets(&mut self) {
        let targets = self.routing.stale_buckets(REFRESH_INTERVAL_SECS);
        if targets.is_empty() {
            return;
        }
        debug!(count = targets.len(), "refreshing stale buckets");
        for target in targets {
            self.start_lookup(target, LookupKind::FindNode, LookupReply::Refresh)
                .await;
        }
    }

    async fn start_lookup(&mut self, target: NodeId, kind: LookupKind, reply: LookupReply) {
        let seeds: Vec<NodeInfo> = self
            .routing
            .closest(&target, K)
            .into_iter()
            .map(|c| NodeInfo {
                id: c.id,
                addr: c.addr,
            })
            .collect();

        let lookup_id = self.next_lookup_id;
        self.next_lookup_id += 1;
        self.lookups.insert(
            lookup_id,
            ActiveLookup {
                lookup: Lookup::new(target, kind, seeds),
                reply,
            },
        );
        self.drive_lookup(lookup_id).await;
    }

    /// Issues the next query batch for a lookup and completes it when done.
    async fn drive_lookup(&mut self, lookup_id: u64) {
        let batch = match self.lookups.get_mut(&lookup_id) {
            Some(active) => active.lookup.next_batch(),
            None => return,
        };

        for node in batch {
            let query = match &self.lookups[&lookup_id].lookup.kind {
                LookupKind::FindNode => Query::FindNode {
                    target: self.lookups[&lookup_id].lookup.target,
                },
                LookupKind::GetPeers(info_hash) => Query::GetPeers {
                    info_hash: *info_hash,
                },
            };
            let kind = match query {
                Query::FindNode { .. } => QueryKind::FindNode,
                _ => QueryKind::GetPeers,
            };
            self.send_query(node.addr, Some(node.id), query, Some(lookup_id), kind)
                .await;
        }

        let complete = self
            .lookups
            .get(&lookup_id)
            .map(|active| active.lookup.is_complete())
            .unwrap_or(false);
        if complete {
            if let Some(active) = self.lookups.remove(&lookup_id) {
                self.finish_lookup(active).await;
            }
        }
    }

    async fn finish_lookup(&mut self, active: ActiveLookup) {
        let lookup = active.lookup;
        match active.reply {
            LookupReply::FindNode(reply) => {
                let _ = reply.send(lookup.closest_responded(K));
            }
            LookupReply::GetPeers(reply) => {
                let mut peers: Vec<SocketAddr> = lookup.peers.iter().copied().collect();
                // Locally stored announcements count too.
                if let LookupKind::GetPeers(info_hash) = &lookup.kind {
                    for peer in self.storage.get(info_hash) {
                        if !peers.contains(&peer) {
                            peers.push(peer);
                        }
                    }
                }
                let _ = reply.send(LookupOutcome {
                    peers,
                    closest: lookup.closest_responded(K),
                });
            }
            LookupReply::Announce { port, reply } => {
                let LookupKind::GetPeers(info_hash) = lookup.kind else {
                    let _ = reply.send(Err(DhtError::Parse(
                        "announce lookup without info-hash".to_string(),
                    )));
                    return;
                };
                let mut sent = 0usize;
                for (node, token) in lookup.tokens.iter().take(K) {
                    self.send_query(
                        node.addr,
                        Some(node.id),
                        Query::AnnouncePeer {
                            info_hash,
                            port,
                            token: token.clone(),
                            implied_port: false,
                        },
                        None,
                        QueryKind::Announce,
                    )
                    .await;
                    sent += 1;
                }
                debug!(%info_hash, sent, "announced to token holders");
                let _ = reply.send(Ok(sent));
            }
            LookupReply::Refresh => {}
            LookupReply::Bootstrap(reply) => {
                let size = self.routing.len();
                info!(routing_table_size = size, "bootstrap lookup finished");
                let _ = reply.send(size);
            }
        }
    }

    async fn send_query(
        &mut self,
        to: SocketAddr,
        remote_id: Option<NodeId>,
        query: Query,
        lookup_id: Option<u64>,
        kind: QueryKind,
    ) {
        let mut txid = TransactionId::random();
        while self.pending.contains_key(txid.as_bytes()) {
            txid = TransactionId::random();
        }

        self.pending.insert(
            txid.0.clone(),
            PendingQuery {
                addr: to,
                remote_id,
                kind,
                lookup_id,
                sent_at: Instant::now(),
            },
        );
        self.socket
            .send(KrpcMessage::query(txid, self.local_id, query), to)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind_addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn spawn_node() -> DhtHandle {
        DhtNode::spawn(DhtConfig {
            local_id: NodeId::random(),
            bind_addr: bind_addr(),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_ping_between_nodes() {
        let a = spawn_node().await;
        let b = spawn_node().await;

        let id = a.ping(b.local_addr()).await.unwrap();
        assert_eq!(id, b.local_id());
    }

    #[tokio::test]
    async fn test_bootstrap_populates_routing_table() {
        let a = spawn_node().await;
        let b = spawn_node().await;

        let size = b.bootstrap(vec![a.local_addr()]).await.unwrap();
        assert!(size >= 1);
    }

    #[tokio::test]
    async fn test_announce_then_get_peers() {
        let a = spawn_node().await;
        let b = spawn_node().await;

        b.bootstrap(vec![a.local_addr()]).await.unwrap();

        let info_hash = InfoHash::random();
        let accepted = b.announce(info_hash, 9000).await.unwrap();
        assert!(accepted >= 1);

        // The announce ack is not awaited; give it a moment to land.
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Node a observed the announce; a lookup from b finds it.
        let outcome = b.get_peers(info_hash).await.unwrap();
        assert!(outcome.peers.iter().any(|p| p.port() == 9000));
    }

    #[tokio::test]
    async fn test_ping_unreachable_times_out() {
        let a = spawn_node().await;
        // An address nothing listens on; expiry fires within ~6 s.
        let dead: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let result = tokio::time::timeout(Duration::from_secs(8), a.ping(dead)).await;
        assert!(matches!(result, Ok(Err(DhtError::Timeout))));
    }

    #[tokio::test]
    async fn test_stats() {
        let a = spawn_node().await;
        let stats = a.stats().await.unwrap();
        assert_eq!(stats.routing_table_size, 0);
        assert_eq!(stats.stored_info_hashes, 0);
    }
}
