//! Application frames.
//!
//! After the handshake both sides speak one JSON object per Noise
//! transport message, shaped `{"type": ..., "id": ..., "payload": ...}`.
//! The first frame in each direction must be `hello`. Binary payloads
//! ride as base64. Application payloads too large for a single Noise
//! message are split into sequenced `user_binary` parts sharing a frame
//! id and reassembled before dispatch.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::NetError;
use crate::noise::MAX_PLAINTEXT_LEN;

/// Raw bytes a single `user_binary` or `file_chunk` payload may carry.
///
/// Base64 expands by 4/3, so this keeps the serialized frame safely
/// under [`MAX_PLAINTEXT_LEN`] with room for the JSON envelope.
pub const MAX_BINARY_PART: usize = 48_000;

/// Reassembly buffers larger than this abort the session.
pub const MAX_REASSEMBLED_LEN: usize = 16 * 1024 * 1024;

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Frame id; parts of a split payload share one id
    pub id: u64,
    /// Typed payload
    #[serde(flatten)]
    pub body: Body,
}

/// A directory entry announced ahead of a directory transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Path relative to the directory root, `/`-separated
    pub path: String,
    /// File size in bytes
    pub total_bytes: u64,
}

/// Frame bodies, tagged by `type` with contents under `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Body {
    /// Mandatory first frame in each direction
    Hello {
        /// Declared stable identity (hex)
        peer_hash: String,
        /// SHA-1 of static key and handshake hash (hex)
        binding: String,
        /// Protocol version, `major.minor`
        version: String,
        /// The sender's mesh listen port, for peer exchange
        listen_port: u16,
    },
    /// Keepalive probe
    Ping,
    /// Keepalive reply
    Pong,
    /// Known mesh listen endpoints, `host:port` strings
    PeerExchange {
        /// Candidate endpoints
        peers: Vec<String>,
    },
    /// UTF-8 application message
    UserString {
        /// The text
        text: String,
    },
    /// Binary application message, possibly one part of several
    UserBinary {
        /// Part payload
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        /// Part index within the message
        seq: u32,
        /// True on the final part
        last: bool,
    },
    /// Offer to send a file
    FileOffer {
        /// Transfer identity
        transfer_id: Uuid,
        /// Basename of the offered file
        filename: String,
        /// Total file size
        total_bytes: u64,
        /// Bytes per chunk
        chunk_size: u32,
        /// SHA-1 of the file contents (hex)
        file_hash: String,
        /// Parent transfer for directory members
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<Uuid>,
    },
    /// Receiver accepts an offer
    FileAccept {
        /// Transfer identity
        transfer_id: Uuid,
        /// First chunk the receiver wants (nonzero when resuming)
        #[serde(default)]
        next_expected_index: u64,
    },
    /// Receiver declines an offer
    FileReject {
        /// Transfer identity
        transfer_id: Uuid,
        /// Human-readable reason
        reason: String,
    },
    /// One chunk of file data, sent in order
    FileChunk {
        /// Transfer identity
        transfer_id: Uuid,
        /// Zero-based chunk index
        chunk_index: u64,
        /// Chunk payload
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// Receiver acknowledgement, every N chunks
    FileAck {
        /// Transfer identity
        transfer_id: Uuid,
        /// Next chunk index the receiver expects
        next_expected_index: u64,
    },
    /// Sender finished streaming
    FileDone {
        /// Transfer identity
        transfer_id: Uuid,
        /// SHA-1 of the complete file (hex)
        file_hash: String,
    },
    /// Receiver verified the hash
    FileOk {
        /// Transfer identity
        transfer_id: Uuid,
    },
    /// Receiver hash check failed
    FileBad {
        /// Transfer identity
        transfer_id: Uuid,
    },
    /// Freeze a transfer
    FilePause {
        /// Transfer identity
        transfer_id: Uuid,
    },
    /// Continue a paused transfer
    FileResume {
        /// Transfer identity
        transfer_id: Uuid,
        /// Where the sender should pick up
        next_expected_index: u64,
    },
    /// Abandon a transfer; idempotent, either side may send it
    FileCancel {
        /// Transfer identity
        transfer_id: Uuid,
    },
    /// Enumerates a directory ahead of its member transfers
    DirManifest {
        /// Parent transfer identity
        transfer_id: Uuid,
        /// Directory name
        name: String,
        /// Member files
        entries: Vec<DirEntry>,
    },
}

impl Body {
    /// True for the file-transfer subset routed to the transfer manager.
    pub fn is_file_frame(&self) -> bool {
        matches!(
            self,
            Body::FileOffer { .. }
                | Body::FileAccept { .. }
                | Body::FileReject { .. }
                | Body::FileChunk { .. }
                | Body::FileAck { .. }
                | Body::FileDone { .. }
                | Body::FileOk { .. }
                | Body::FileBad { .. }
                | Body::FilePause { .. }
                | Body::FileResume { .. }
                | Body::FileCancel { .. }
                | Body::DirManifest { .. }
        )
    }
}

impl Frame {
    /// Serializes the frame, enforcing the Noise plaintext limit.
    pub fn to_bytes(&self) -> Result<Vec<u8>, NetError> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_PLAINTEXT_LEN {
            return Err(NetError::FrameTooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    /// Parses a frame from decrypted plaintext.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NetError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Splits an application payload into `user_binary` part bodies.
pub fn split_user_binary(data: &[u8]) -> Vec<Body> {
    if data.is_empty() {
        return vec![Body::UserBinary {
            data: Vec::new(),
            seq: 0,
            last: true,
        }];
    }

    let chunks: Vec<&[u8]> = data.chunks(MAX_BINARY_PART).collect();
    let count = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(seq, part)| Body::UserBinary {
            data: part.to_vec(),
            seq: seq as u32,
            last: seq + 1 == count,
        })
        .collect()
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_shape_on_the_wire() {
        let frame = Frame {
            id: 7,
            body: Body::UserString {
                text: "hi".to_string(),
            },
        };
        let json: serde_json::Value =
            serde_json::from_slice(&frame.to_bytes().unwrap()).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["type"], "user_string");
        assert_eq!(json["payload"]["text"], "hi");
    }

    #[test]
    fn test_unit_body_roundtrip() {
        let frame = Frame {
            id: 1,
            body: Body::Ping,
        };
        let parsed = Frame::from_bytes(&frame.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_binary_payload_rides_base64() {
        let frame = Frame {
            id: 2,
            body: Body::UserBinary {
                data: vec![0, 1, 2, 255],
                seq: 0,
                last: true,
            },
        };
        let bytes = frame.to_bytes().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["payload"]["data"], "AAEC/w==");
        assert_eq!(Frame::from_bytes(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_file_offer_roundtrip() {
        let frame = Frame {
            id: 3,
            body: Body::FileOffer {
                transfer_id: Uuid::new_v4(),
                filename: "data.bin".to_string(),
                total_bytes: 1024,
                chunk_size: 512,
                file_hash: "aa".repeat(20),
                parent_id: None,
            },
        };
        let parsed = Frame::from_bytes(&frame.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_split_user_binary_part_bounds() {
        let data = vec![7u8; MAX_BINARY_PART * 2 + 5];
        let parts = split_user_binary(&data);
        assert_eq!(parts.len(), 3);

        let mut joined = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            let Body::UserBinary { data, seq, last } = part else {
                panic!("expected user_binary");
            };
            assert_eq!(*seq, i as u32);
            assert_eq!(*last, i == 2);
            joined.extend_from_slice(data);
        }
        assert_eq!(joined, data);
    }

    #[test]
    fn test_split_empty_payload_is_single_final_part() {
        let parts = split_user_binary(&[]);
        assert_eq!(parts.len(), 1);
        assert!(matches!(
            &parts[0],
            Body::UserBinary { data, seq: 0, last: true } if data.is_empty()
        ));
    }

    #[test]
    fn test_max_part_fits_plaintext_limit() {
        let frame = Frame {
            id: u64::MAX,
            body: Body::FileChunk {
                transfer_id: Uuid::new_v4(),
                chunk_index: u64::MAX,
                data: vec![0xffu8; MAX_BINARY_PART],
            },
        };
        let bytes = frame.to_bytes().unwrap();
        assert!(bytes.len() <= MAX_PLAINTEXT_LEN);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = Frame::from_bytes(br#"{"id":1,"type":"warp_core","payload":{}}"#);
        assert!(err.is_err());
    }
}
