//! DHT error types.

use thiserror::Error;

/// Errors surfaced by the DHT node.
#[derive(Debug, Error)]
pub enum DhtError {
    /// Socket failure (bind, send, receive)
    #[error("DHT I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed bencode in a datagram
    #[error("bencode error: {0}")]
    Bencode(#[from] rats_bencode::BencodeError),

    /// Structurally valid bencode that is not a valid KRPC message
    #[error("KRPC parse error: {0}")]
    Parse(String),

    /// Remote answered with a KRPC error envelope
    #[error("remote error {code}: {message}")]
    Remote {
        /// BEP-5 error code
        code: i64,
        /// Human-readable message from the remote
        message: String,
    },

    /// Request deadline elapsed without a response
    #[error("request timed out")]
    Timeout,

    /// The node actor is no longer running
    #[error("DHT node shut down")]
    Shutdown,
}
