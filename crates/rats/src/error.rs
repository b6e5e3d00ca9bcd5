//! Library-level error taxonomy.
//!
//! Every failure maps onto one [`ErrorKind`], which is what callers
//! should branch on; the variants preserve the underlying error for
//! diagnostics.

use thiserror::Error;

use rats_core::ConfigError;
use rats_dht::DhtError;
use rats_net::NetError;
use rats_transfer::TransferError;

/// Coarse classification of failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Socket-level I/O failure
    Transport,
    /// Malformed frame, codec violation or crypto failure
    Protocol,
    /// Hash mismatch or duplicate identity
    Identity,
    /// Limits and local policy (peer caps, invalid state)
    Policy,
    /// A deadline elapsed
    Timeout,
    /// Operation aborted by shutdown or cancellation
    Cancelled,
    /// Missing or unusable local resource (files, config)
    Resource,
}

/// Top-level library error.
#[derive(Debug, Error)]
pub enum RatsError {
    /// Configuration load/save failure
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Mesh transport failure
    #[error(transparent)]
    Net(#[from] NetError),

    /// DHT failure
    #[error(transparent)]
    Dht(#[from] DhtError),

    /// File transfer failure
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// The client has not been started
    #[error("client is not running")]
    NotRunning,

    /// The client is already started
    #[error("client is already running")]
    AlreadyRunning,
}

impl RatsError {
    /// The taxonomy bucket this error falls into.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RatsError::Config(_) => ErrorKind::Resource,
            RatsError::Net(err) => net_kind(err),
            RatsError::Dht(err) => dht_kind(err),
            RatsError::Transfer(err) => transfer_kind(err),
            RatsError::NotRunning | RatsError::AlreadyRunning => ErrorKind::Policy,
        }
    }
}

fn net_kind(err: &NetError) -> ErrorKind {
    match err {
        NetError::Io(_) | NetError::Resolve(_) | NetError::NotConnected(_) => ErrorKind::Transport,
        NetError::ConnectTimeout | NetError::HandshakeTimeout => ErrorKind::Timeout,
        NetError::Noise(_)
        | NetError::FrameTooLarge(_)
        | NetError::Codec(_)
        | NetError::VersionMismatch(_)
        | NetError::UnexpectedFrame(_) => ErrorKind::Protocol,
        NetError::IdentityMismatch | NetError::SelfConnection | NetError::DuplicateSession(_) => {
            ErrorKind::Identity
        }
        NetError::PeerLimit => ErrorKind::Policy,
        NetError::Shutdown => ErrorKind::Cancelled,
    }
}

fn dht_kind(err: &DhtError) -> ErrorKind {
    match err {
        DhtError::Io(_) => ErrorKind::Transport,
        DhtError::Bencode(_) | DhtError::Parse(_) | DhtError::Remote { .. } => ErrorKind::Protocol,
        DhtError::Timeout => ErrorKind::Timeout,
        DhtError::Shutdown => ErrorKind::Cancelled,
    }
}

fn transfer_kind(err: &TransferError) -> ErrorKind {
    match err {
        TransferError::Io(_) | TransferError::NotFound(_) => ErrorKind::Resource,
        TransferError::Net(err) => net_kind(err),
        TransferError::InvalidState(_) => ErrorKind::Policy,
        TransferError::Shutdown => ErrorKind::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        assert_eq!(
            RatsError::Net(NetError::ConnectTimeout).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(RatsError::Dht(DhtError::Timeout).kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_identity_classification() {
        assert_eq!(
            RatsError::Net(NetError::IdentityMismatch).kind(),
            ErrorKind::Identity
        );
    }

    #[test]
    fn test_policy_classification() {
        assert_eq!(RatsError::Net(NetError::PeerLimit).kind(), ErrorKind::Policy);
        assert_eq!(RatsError::NotRunning.kind(), ErrorKind::Policy);
    }

    #[test]
    fn test_nested_transfer_net_error_follows_net_rules() {
        let err = RatsError::Transfer(TransferError::Net(NetError::ConnectTimeout));
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
}
