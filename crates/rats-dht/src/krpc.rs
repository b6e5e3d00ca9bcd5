//! KRPC message types (BEP 5).
//!
//! Every DHT message is a bencoded dictionary with a transaction id `t`,
//! a type marker `y` of `q` (query), `r` (response) or `e` (error), and a
//! type-specific body. Endpoints travel in compact form: 6 bytes for an
//! IPv4 peer, 18 for IPv6; node entries prepend the 20-byte node id.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use rats_bencode::Value;
use rats_core::{InfoHash, NodeId, ID_LEN};

use crate::error::DhtError;

/// Opaque transaction id echoed between query and response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(pub Vec<u8>);

impl TransactionId {
    /// Generates a fresh 2-byte random id.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 2];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes.to_vec())
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A node entry as carried in `nodes` / `nodes6` fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// The node's DHT identity
    pub id: NodeId,
    /// The node's UDP endpoint
    pub addr: SocketAddr,
}

/// DHT query bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// Liveness probe
    Ping,
    /// Request the closest known nodes to `target`
    FindNode {
        /// Lookup target
        target: NodeId,
    },
    /// Request peers announced for `info_hash`
    GetPeers {
        /// Content key
        info_hash: InfoHash,
    },
    /// Register the sender as a peer for `info_hash`
    AnnouncePeer {
        /// Content key
        info_hash: InfoHash,
        /// TCP port the peer listens on
        port: u16,
        /// Write token previously issued by the queried node
        token: Vec<u8>,
        /// Use the UDP source port instead of `port`
        implied_port: bool,
    },
}

impl Query {
    /// BEP-5 method name.
    pub fn method(&self) -> &'static str {
        match self {
            Query::Ping => "ping",
            Query::FindNode { .. } => "find_node",
            Query::GetPeers { .. } => "get_peers",
            Query::AnnouncePeer { .. } => "announce_peer",
        }
    }
}

/// DHT response bodies.
///
/// KRPC responses are not self-describing; the receiver distinguishes
/// them by the query recorded against the transaction id. The decoder
/// therefore keeps every optional field it finds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    /// Responder's node id
    pub id: NodeId,
    /// Closer IPv4 nodes, when present
    pub nodes: Vec<NodeInfo>,
    /// Closer IPv6 nodes, when present
    pub nodes6: Vec<NodeInfo>,
    /// Announced peer endpoints, when present
    pub values: Vec<SocketAddr>,
    /// Write token for a later announce, when present
    pub token: Option<Vec<u8>>,
}

/// A complete KRPC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KrpcMessage {
    /// Correlation id
    pub transaction_id: TransactionId,
    /// Message body
    pub body: MessageBody,
}

/// The three KRPC message kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// A query, with the sender's id
    Query {
        /// Sender's node id (`a.id`)
        id: NodeId,
        /// Query body
        query: Query,
    },
    /// A response to an earlier query
    Response(Response),
    /// An error reply `[code, message]`
    Error {
        /// BEP-5 error code
        code: i64,
        /// Human-readable description
        message: String,
    },
}

/// KRPC error codes (BEP 5).
pub mod error_codes {
    /// Generic error
    pub const GENERIC: i64 = 201;
    /// Server error
    pub const SERVER: i64 = 202;
    /// Protocol error (malformed packet, invalid arguments, bad token)
    pub const PROTOCOL: i64 = 203;
    /// Method unknown
    pub const METHOD_UNKNOWN: i64 = 204;
}

impl KrpcMessage {
    /// Builds a query message.
    pub fn query(transaction_id: TransactionId, id: NodeId, query: Query) -> Self {
        Self {
            transaction_id,
            body: MessageBody::Query { id, query },
        }
    }

    /// Builds a response message.
    pub fn response(transaction_id: TransactionId, response: Response) -> Self {
        Self {
            transaction_id,
            body: MessageBody::Response(response),
        }
    }

    /// Builds an error message.
    pub fn error(transaction_id: TransactionId, code: i64, message: impl Into<String>) -> Self {
        Self {
            transaction_id,
            body: MessageBody::Error {
                code,
                message: message.into(),
            },
        }
    }

    /// Encodes this message to canonical bencode.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut dict: BTreeMap<Vec<u8>, Value> = BTreeMap::new();
        dict.insert(b"t".to_vec(), Value::Bytes(self.transaction_id.0.clone()));

        match &self.body {
            MessageBody::Query { id, query } => {
                dict.insert(b"y".to_vec(), Value::string("q"));
                dict.insert(b"q".to_vec(), Value::string(query.method()));

                let mut args: BTreeMap<Vec<u8>, Value> = BTreeMap::new();
                args.insert(b"id".to_vec(), Value::Bytes(id.as_slice().to_vec()));
                match query {
                    Query::Ping => {}
                    Query::FindNode { target } => {
                        args.insert(b"target".to_vec(), Value::Bytes(target.as_slice().to_vec()));
                    }
                    Query::GetPeers { info_hash } => {
                        args.insert(
                            b"info_hash".to_vec(),
                            Value::Bytes(info_hash.as_slice().to_vec()),
                        );
                    }
                    Query::AnnouncePeer {
                        info_hash,
                        port,
                        token,
                        implied_port,
                    } => {
                        args.insert(
                            b"info_hash".to_vec(),
                            Value::Bytes(info_hash.as_slice().to_vec()),
                        );
                        args.insert(b"port".to_vec(), Value::Int(i64::from(*port)));
                        args.insert(b"token".to_vec(), Value::Bytes(token.clone()));
                        if *implied_port {
                            args.insert(b"implied_port".to_vec(), Value::Int(1));
                        }
                    }
                }
                dict.insert(b"a".to_vec(), Value::Dict(args));
            }
            MessageBody::Response(response) => {
                dict.insert(b"y".to_vec(), Value::string("r"));

                let mut r: BTreeMap<Vec<u8>, Value> = BTreeMap::new();
                r.insert(b"id".to_vec(), Value::Bytes(response.id.as_slice().to_vec()));
                if !response.nodes.is_empty() {
                    r.insert(
                        b"nodes".to_vec(),
                        Value::Bytes(encode_compact_nodes(&response.nodes, false)),
                    );
                }
                if !response.nodes6.is_empty() {
                    r.insert(
                        b"nodes6".to_vec(),
                        Value::Bytes(encode_compact_nodes(&response.nodes6, true)),
                    );
                }
                if !response.values.is_empty() {
                    let values = response
                        .values
                        .iter()
                        .map(|addr| Value::Bytes(encode_compact_peer(addr)))
                        .collect();
                    r.insert(b"values".to_vec(), Value::List(values));
                }
                if let Some(token) = &response.token {
                    r.insert(b"token".to_vec(), Value::Bytes(token.clone()));
                }
                dict.insert(b"r".to_vec(), Value::Dict(r));
            }
            MessageBody::Error { code, message } => {
                dict.insert(b"y".to_vec(), Value::string("e"));
                dict.insert(
                    b"e".to_vec(),
                    Value::List(vec![Value::Int(*code), Value::string(message)]),
                );
            }
        }

        Value::Dict(dict).encode()
    }

    /// Decodes a message from a datagram.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        let value = rats_bencode::decode_all(bytes)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| DhtError::Parse("message is not a dictionary".to_string()))?;

        let transaction_id = TransactionId(
            dict.get(b"t".as_slice())
                .and_then(|v| v.as_bytes())
                .ok_or_else(|| DhtError::Parse("missing transaction id".to_string()))?
                .to_vec(),
        );

        let kind = dict
            .get(b"y".as_slice())
            .and_then(|v| v.as_str())
            .ok_or_else(|| DhtError::Parse("missing message type".to_string()))?;

        let body = match kind {
            "q" => parse_query(dict)?,
            "r" => parse_response(dict)?,
            "e" => parse_error(dict)?,
            other => return Err(DhtError::Parse(format!("unknown message type: {other}"))),
        };

        Ok(Self {
            transaction_id,
            body,
        })
    }
}

fn parse_query(dict: &BTreeMap<Vec<u8>, Value>) -> Result<MessageBody, DhtError> {
    let method = dict
        .get(b"q".as_slice())
        .and_then(|v| v.as_str())
        .ok_or_else(|| DhtError::Parse("missing query method".to_string()))?;

    let args = dict
        .get(b"a".as_slice())
        .and_then(|v| v.as_dict())
        .ok_or_else(|| DhtError::Parse("missing query arguments".to_string()))?;

    let id = parse_id(args, b"id")?;

    let query = match method {
        "ping" => Query::Ping,
        "find_node" => Query::FindNode {
            target: NodeId::new(parse_id_bytes(args, b"target")?),
        },
        "get_peers" => Query::GetPeers {
            info_hash: InfoHash::new(parse_id_bytes(args, b"info_hash")?),
        },
        "announce_peer" => {
            let port = args
                .get(b"port".as_slice())
                .and_then(|v| v.as_int())
                .ok_or_else(|| DhtError::Parse("missing port".to_string()))?;
            if !(0..=i64::from(u16::MAX)).contains(&port) {
                return Err(DhtError::Parse(format!("port out of range: {port}")));
            }
            Query::AnnouncePeer {
                info_hash: InfoHash::new(parse_id_bytes(args, b"info_hash")?),
                port: port as u16,
                token: args
                    .get(b"token".as_slice())
                    .and_then(|v| v.as_bytes())
                    .ok_or_else(|| DhtError::Parse("missing token".to_string()))?
                    .to_vec(),
                implied_port: args
                    .get(b"implied_port".as_slice())
                    .and_then(|v| v.as_int())
                    .map(|v| v != 0)
                    .unwrap_or(false),
            }
        }
        other => return Err(DhtError::Parse(format!("unknown query method: {other}"))),
    };

    Ok(MessageBody::Query { id, query })
}

fn parse_response(dict: &BTreeMap<Vec<u8>, Value>) -> Result<MessageBody, DhtError> {
    let r = dict
        .get(b"r".as_slice())
        .and_then(|v| v.as_dict())
        .ok_or_else(|| DhtError::Parse("missing response body".to_string()))?;

    let mut response = Response {
        id: parse_id(r, b"id")?,
        ..Response::default()
    };

    if let Some(nodes) = r.get(b"nodes".as_slice()).and_then(|v| v.as_bytes()) {
        response.nodes = decode_compact_nodes(nodes, false)?;
    }
    if let Some(nodes6) = r.get(b"nodes6".as_slice()).and_then(|v| v.as_bytes()) {
        response.nodes6 = decode_compact_nodes(nodes6, true)?;
    }
    if let Some(Value::List(values)) = r.get(b"values".as_slice()) {
        for item in values {
            if let Some(bytes) = item.as_bytes() {
                if let Some(addr) = decode_compact_peer(bytes) {
                    response.values.push(addr);
                }
            }
        }
    }
    response.token = r
        .get(b"token".as_slice())
        .and_then(|v| v.as_bytes())
        .map(|t| t.to_vec());

    Ok(MessageBody::Response(response))
}

fn parse_error(dict: &BTreeMap<Vec<u8>, Value>) -> Result<MessageBody, DhtError> {
    let list = dict
        .get(b"e".as_slice())
        .and_then(|v| v.as_list())
        .ok_or_else(|| DhtError::Parse("missing error body".to_string()))?;

    if list.len() < 2 {
        return Err(DhtError::Parse("error body too short".to_string()));
    }
    let code = list[0]
        .as_int()
        .ok_or_else(|| DhtError::Parse("error code must be an integer".to_string()))?;
    let message = list[1]
        .as_bytes()
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .ok_or_else(|| DhtError::Parse("error message must be a string".to_string()))?;

    Ok(MessageBody::Error { code, message })
}

fn parse_id(dict: &BTreeMap<Vec<u8>, Value>, key: &[u8]) -> Result<NodeId, DhtError> {
    Ok(NodeId::new(parse_id_bytes(dict, key)?))
}

fn parse_id_bytes(
    dict: &BTreeMap<Vec<u8>, Value>,
    key: &[u8],
) -> Result<[u8; ID_LEN], DhtError> {
    let bytes = dict
        .get(key)
        .and_then(|v| v.as_bytes())
        .ok_or_else(|| DhtError::Parse(format!("missing {}", String::from_utf8_lossy(key))))?;
    if bytes.len() != ID_LEN {
        return Err(DhtError::Parse(format!(
            "{} has length {}, expected {ID_LEN}",
            String::from_utf8_lossy(key),
            bytes.len()
        )));
    }
    let mut arr = [0u8; ID_LEN];
    arr.copy_from_slice(bytes);
    Ok(arr)
}

/// Encodes a peer endpoint in compact form (6 or 18 bytes).
pub fn encode_compact_peer(addr: &SocketAddr) -> Vec<u8> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut out = Vec::with_capacity(6);
            out.extend_from_slice(&v4.ip().octets());
            out.extend_from_slice(&v4.port().to_be_bytes());
            out
        }
        SocketAddr::V6(v6) => {
            let mut out = Vec::with_capacity(18);
            out.extend_from_slice(&v6.ip().octets());
            out.extend_from_slice(&v6.port().to_be_bytes());
            out
        }
    }
}

/// Decodes a compact peer endpoint, accepting either address family.
pub fn decode_compact_peer(bytes: &[u8]) -> Option<SocketAddr> {
    match bytes.len() {
        6 => {
            let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
            let port = u16::from_be_bytes([bytes[4], bytes[5]]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        18 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes[..16]);
            let port = u16::from_be_bytes([bytes[16], bytes[17]]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

/// Encodes node entries in compact form (26 bytes v4, 38 bytes v6).
///
/// Entries of the other address family are skipped.
pub fn encode_compact_nodes(nodes: &[NodeInfo], v6: bool) -> Vec<u8> {
    let mut out = Vec::new();
    for node in nodes {
        if node.addr.is_ipv6() != v6 {
            continue;
        }
        out.extend_from_slice(node.id.as_slice());
        out.extend_from_slice(&encode_compact_peer(&node.addr));
    }
    out
}

/// Decodes compact node entries.
pub fn decode_compact_nodes(bytes: &[u8], v6: bool) -> Result<Vec<NodeInfo>, DhtError> {
    let entry_len = if v6 { ID_LEN + 18 } else { ID_LEN + 6 };
    if bytes.len() % entry_len != 0 {
        return Err(DhtError::Parse(format!(
            "compact nodes length {} not a multiple of {entry_len}",
            bytes.len()
        )));
    }

    let mut nodes = Vec::with_capacity(bytes.len() / entry_len);
    for chunk in bytes.chunks_exact(entry_len) {
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(&chunk[..ID_LEN]);
        let addr = decode_compact_peer(&chunk[ID_LEN..])
            .ok_or_else(|| DhtError::Parse("bad compact endpoint".to_string()))?;
        nodes.push(NodeInfo {
            id: NodeId::new(id),
            addr,
        });
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr4(last: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), port)
    }

    fn addr6(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port)
    }

    #[test]
    fn test_ping_roundtrip() {
        let id = NodeId::random();
        let msg = KrpcMessage::query(TransactionId::random(), id, Query::Ping);
        let decoded = KrpcMessage::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_find_node_roundtrip() {
        let msg = KrpcMessage::query(
            TransactionId::random(),
            NodeId::random(),
            Query::FindNode {
                target: NodeId::random(),
            },
        );
        assert_eq!(KrpcMessage::from_bytes(&msg.to_bytes()).unwrap(), msg);
    }

    #[test]
    fn test_announce_peer_roundtrip() {
        let msg = KrpcMessage::query(
            TransactionId::random(),
            NodeId::random(),
            Query::AnnouncePeer {
                info_hash: InfoHash::random(),
                port: 9000,
                token: vec![1, 2, 3, 4],
                implied_port: true,
            },
        );
        assert_eq!(KrpcMessage::from_bytes(&msg.to_bytes()).unwrap(), msg);
    }

    #[test]
    fn test_response_with_mixed_nodes_roundtrip() {
        let response = Response {
            id: NodeId::random(),
            nodes: vec![
                NodeInfo {
                    id: NodeId::random(),
                    addr: addr4(1, 6881),
                },
                NodeInfo {
                    id: NodeId::random(),
                    addr: addr4(2, 6882),
                },
            ],
            nodes6: vec![NodeInfo {
                id: NodeId::random(),
                addr: addr6(6883),
            }],
            values: vec![addr4(9, 9000), addr6(9001)],
            token: Some(vec![0xaa, 0xbb]),
        };
        let msg = KrpcMessage::response(TransactionId::random(), response);
        assert_eq!(KrpcMessage::from_bytes(&msg.to_bytes()).unwrap(), msg);
    }

    #[test]
    fn test_error_roundtrip() {
        let msg = KrpcMessage::error(TransactionId::random(), error_codes::PROTOCOL, "bad token");
        assert_eq!(KrpcMessage::from_bytes(&msg.to_bytes()).unwrap(), msg);
    }

    #[test]
    fn test_compact_peer_sizes() {
        assert_eq!(encode_compact_peer(&addr4(1, 80)).len(), 6);
        assert_eq!(encode_compact_peer(&addr6(80)).len(), 18);
        assert!(decode_compact_peer(&[0u8; 5]).is_none());
    }

    #[test]
    fn test_compact_nodes_rejects_ragged_input() {
        assert!(decode_compact_nodes(&[0u8; 27], false).is_err());
        assert!(decode_compact_nodes(&[0u8; 26], false).is_ok());
        assert!(decode_compact_nodes(&[0u8; 38], true).is_ok());
    }

    #[test]
    fn test_rejects_malformed_envelope() {
        assert!(KrpcMessage::from_bytes(b"i1e").is_err());
        assert!(KrpcMessage::from_bytes(b"d1:t2:aae").is_err());
        assert!(KrpcMessage::from_bytes(b"d1:t2:aa1:y1:xe").is_err());
    }
}
