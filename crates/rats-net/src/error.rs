//! Mesh transport errors.

use rats_core::PeerHash;
use thiserror::Error;

/// Errors surfaced by the mesh engine and its sessions.
#[derive(Debug, Error)]
pub enum NetError {
    /// Socket-level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Noise protocol failure (handshake or AEAD)
    #[error("noise error: {0}")]
    Noise(#[from] snow::Error),

    /// A frame exceeded the wire or plaintext limit
    #[error("frame of {0} bytes exceeds the transport limit")]
    FrameTooLarge(usize),

    /// Application frame failed to serialize or parse
    #[error("frame codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// TCP connect did not finish in time
    #[error("connect timed out")]
    ConnectTimeout,

    /// Handshake (Noise + hello) did not finish in time
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Hostname produced no usable addresses
    #[error("could not resolve {0}")]
    Resolve(String),

    /// Declared identity does not match the handshake
    #[error("peer identity mismatch")]
    IdentityMismatch,

    /// Remote speaks an incompatible protocol version
    #[error("incompatible protocol version {0}")]
    VersionMismatch(String),

    /// First frame was not a hello, or a hello arrived twice
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(&'static str),

    /// Connected to ourselves
    #[error("connected to self")]
    SelfConnection,

    /// Session cap reached
    #[error("peer limit reached")]
    PeerLimit,

    /// A session for this peer already exists and wins the collision
    #[error("duplicate session for {0}")]
    DuplicateSession(PeerHash),

    /// No live session for the peer
    #[error("not connected to {0}")]
    NotConnected(PeerHash),

    /// The engine is shutting down or stopped
    #[error("mesh engine stopped")]
    Shutdown,
}
