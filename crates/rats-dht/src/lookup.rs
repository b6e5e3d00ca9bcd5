//! Iterative lookup state.
//!
//! A lookup walks the id space toward a target by querying the alpha
//! closest unqueried candidates in parallel, folding returned nodes back
//! into a candidate set bounded to the closest 20. It finishes when the
//! K closest candidates have all been heard from, or when a full round
//! brings nothing closer.

use std::collections::HashSet;
use std::net::SocketAddr;

use rats_core::{InfoHash, NodeId};

use crate::krpc::NodeInfo;
use crate::{ALPHA, K, MAX_LOOKUP_CANDIDATES};

/// What the lookup is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupKind {
    /// Walk toward a node id; collects closest contacts
    FindNode,
    /// Walk toward an info-hash; additionally collects peers and tokens
    GetPeers(InfoHash),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateState {
    Pending,
    InFlight,
    Responded,
    Failed,
}

#[derive(Debug, Clone)]
struct Candidate {
    node: NodeInfo,
    distance: [u8; 20],
    state: CandidateState,
}

/// Iterative lookup state machine, driven by the node actor.
pub struct Lookup {
    /// Target point in the id space
    pub target: NodeId,
    /// Lookup flavor
    pub kind: LookupKind,
    candidates: Vec<Candidate>,
    seen: HashSet<NodeId>,
    in_flight: usize,
    /// Closest distance observed at the end of the previous round
    best_at_round_start: Option<[u8; 20]>,
    stalled: bool,
    /// Peers accumulated from `values` fields (get_peers only)
    pub peers: HashSet<SocketAddr>,
    /// Responders and their announce tokens (get_peers only)
    pub tokens: Vec<(NodeInfo, Vec<u8>)>,
}

impl Lookup {
    /// Seeds a lookup with the closest known contacts.
    pub fn new(target: NodeId, kind: LookupKind, seeds: Vec<NodeInfo>) -> Self {
        let mut lookup = Self {
            target,
            kind,
            candidates: Vec::new(),
            seen: HashSet::new(),
            in_flight: 0,
            best_at_round_start: None,
            stalled: false,
            peers: HashSet::new(),
            tokens: Vec::new(),
        };
        lookup.merge(seeds);
        lookup
    }

    /// Adds new candidates, keeping the set sorted and bounded.
    pub fn merge(&mut self, nodes: Vec<NodeInfo>) {
        for node in nodes {
            if !self.seen.insert(node.id) {
                continue;
            }
            let distance = self.target.xor_distance(&node.id);
            self.candidates.push(Candidate {
                node,
                distance,
                state: CandidateState::Pending,
            });
        }

        self.candidates.sort_by(|a, b| a.distance.cmp(&b.distance));
        // Bound the set, but never drop an entry we are still waiting on.
        if self.candidates.len() > MAX_LOOKUP_CANDIDATES {
            let mut keep = Vec::with_capacity(MAX_LOOKUP_CANDIDATES);
            for candidate in self.candidates.drain(..) {
                if keep.len() < MAX_LOOKUP_CANDIDATES
                    || candidate.state == CandidateState::InFlight
                {
                    keep.push(candidate);
                }
            }
            self.candidates = keep;
        }
    }

    /// Returns the next endpoints to query, marking them in flight.
    ///
    /// Empty while the alpha window is full; also empty once the lookup
    /// is finished.
    pub fn next_batch(&mut self) -> Vec<NodeInfo> {
        if self.is_complete() {
            return Vec::new();
        }

        // A round boundary: all outstanding queries resolved. If the
        // closest known candidate did not improve since the previous
        // boundary, the lookup has converged.
        if self.in_flight == 0 {
            let best = self.candidates.first().map(|c| c.distance);
            if let (Some(best), Some(previous)) = (best, self.best_at_round_start) {
                if best >= previous {
                    self.stalled = true;
                    return Vec::new();
                }
            }
            self.best_at_round_start = best;
        }

        let mut batch = Vec::new();
        for candidate in self.candidates.iter_mut() {
            if self.in_flight >= ALPHA {
                break;
            }
            if candidate.state == CandidateState::Pending {
                candidate.state = CandidateState::InFlight;
                self.in_flight += 1;
                batch.push(candidate.node.clone());
            }
        }
        batch
    }

    /// Records a response from `id`, merging any returned nodes.
    pub fn on_response(&mut self, id: &NodeId, nodes: Vec<NodeInfo>) {
        if let Some(candidate) = self
            .candidates
            .iter_mut()
            .find(|c| &c.node.id == id && c.state == CandidateState::InFlight)
        {
            candidate.state = CandidateState::Responded;
            self.in_flight -= 1;
        }
        self.merge(nodes);
    }

    /// Records peers and a token returned by a get_peers responder.
    pub fn on_values(&mut self, responder: NodeInfo, values: Vec<SocketAddr>, token: Option<Vec<u8>>) {
        self.peers.extend(values);
        if let Some(token) = token {
            self.tokens.push((responder, token));
        }
    }

    /// Records a failed or timed out query to `id`.
    pub fn on_failure(&mut self, id: &NodeId) {
        if let Some(candidate) = self
            .candidates
            .iter_mut()
            .find(|c| c.node.id == *id && c.state == CandidateState::InFlight)
        {
            candidate.state = CandidateState::Failed;
            self.in_flight -= 1;
        }
    }

    /// True when the lookup cannot usefully continue.
    pub fn is_complete(&self) -> bool {
        if self.stalled && self.in_flight == 0 {
            return true;
        }

        // All of the K closest heard from (responded or given up on).
        let top_k_done = self
            .candidates
            .iter()
            .take(K)
            .all(|c| matches!(c.state, CandidateState::Responded | CandidateState::Failed));
        if top_k_done && !self.candidates.is_empty() && self.in_flight == 0 {
            return true;
        }

        // Nothing left to ask.
        self.in_flight == 0
            && !self
                .candidates
                .iter()
                .any(|c| c.state == CandidateState::Pending)
    }

    /// The closest responded contacts, best first.
    pub fn closest_responded(&self, n: usize) -> Vec<NodeInfo> {
        self.candidates
            .iter()
            .filter(|c| c.state == CandidateState::Responded)
            .take(n)
            .map(|c| c.node.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn node(id: NodeId) -> NodeInfo {
        NodeInfo {
            id,
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 6881),
        }
    }

    fn seeds(n: usize) -> Vec<NodeInfo> {
        (0..n).map(|_| node(NodeId::random())).collect()
    }

    #[test]
    fn test_batch_respects_alpha() {
        let mut lookup = Lookup::new(NodeId::random(), LookupKind::FindNode, seeds(10));
        let batch = lookup.next_batch();
        assert_eq!(batch.len(), ALPHA);
        // Window is full until something resolves.
        assert!(lookup.next_batch().is_empty());
    }

    #[test]
    fn test_candidate_set_is_bounded() {
        let mut lookup = Lookup::new(NodeId::random(), LookupKind::FindNode, seeds(5));
        lookup.merge(seeds(100));
        assert!(lookup.candidates.len() <= MAX_LOOKUP_CANDIDATES);
    }

    #[test]
    fn test_duplicate_nodes_ignored() {
        let shared = node(NodeId::random());
        let mut lookup =
            Lookup::new(NodeId::random(), LookupKind::FindNode, vec![shared.clone()]);
        lookup.merge(vec![shared]);
        assert_eq!(lookup.candidates.len(), 1);
    }

    #[test]
    fn test_completes_when_all_queried() {
        let mut lookup = Lookup::new(NodeId::random(), LookupKind::FindNode, seeds(4));
        while !lookup.is_complete() {
            let batch = lookup.next_batch();
            if batch.is_empty() && lookup.in_flight == 0 {
                break;
            }
            for peer in batch {
                lookup.on_response(&peer.id, Vec::new());
            }
        }
        assert!(lookup.is_complete());
        assert_eq!(lookup.closest_responded(K).len(), 4);
    }

    #[test]
    fn test_failures_count_toward_completion() {
        let mut lookup = Lookup::new(NodeId::random(), LookupKind::FindNode, seeds(3));
        let batch = lookup.next_batch();
        for peer in batch {
            lookup.on_failure(&peer.id);
        }
        assert!(lookup.is_complete());
        assert!(lookup.closest_responded(K).is_empty());
    }

    #[test]
    fn test_stalls_without_progress() {
        let target = NodeId::new([0u8; 20]);
        // Seeds far from the target.
        let mut far = Vec::new();
        for i in 0..3u8 {
            let mut bytes = [0xffu8; 20];
            bytes[19] = i;
            far.push(node(NodeId::new(bytes)));
        }
        let mut lookup = Lookup::new(target, LookupKind::FindNode, far);

        // Round 1: respond with nothing new.
        for peer in lookup.next_batch() {
            lookup.on_response(&peer.id, Vec::new());
        }
        assert!(lookup.is_complete());
    }

    #[test]
    fn test_get_peers_accumulates_values_and_tokens() {
        let target = NodeId::random();
        let responder = node(NodeId::random());
        let mut lookup = Lookup::new(
            target,
            LookupKind::GetPeers(InfoHash::new(*target.as_bytes())),
            vec![responder.clone()],
        );
        let batch = lookup.next_batch();
        assert_eq!(batch.len(), 1);

        let peer_addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        lookup.on_values(responder.clone(), vec![peer_addr], Some(vec![1, 2]));
        lookup.on_response(&responder.id, Vec::new());

        assert!(lookup.peers.contains(&peer_addr));
        assert_eq!(lookup.tokens.len(), 1);
    }
}
