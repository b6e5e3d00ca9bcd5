//! 160-bit identifier types.
//!
//! Defines the identifiers used throughout rats:
//! - `NodeId` - DHT node identity, SHA-1 of a persisted random seed
//! - `InfoHash` - content key / rendezvous key in the DHT
//! - `PeerHash` - mesh peer identity, SHA-1 of the Noise static public key
//!
//! All three are 20-byte values ordered by the Kademlia XOR metric.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Length of every identifier in bytes (160 bits).
pub const ID_LEN: usize = 20;

/// Computes the SHA-1 digest of `data` as a 20-byte array.
pub fn sha1_digest(data: &[u8]) -> [u8; ID_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Macro to define a 20-byte identifier type with common implementations.
macro_rules! define_id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        pub struct $name(pub [u8; ID_LEN]);

        impl $name {
            /// Creates a new identifier from a 20-byte array.
            pub const fn new(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }

            /// Creates an all-zero identifier.
            pub const fn zero() -> Self {
                Self([0u8; ID_LEN])
            }

            /// Returns the inner bytes.
            pub const fn as_bytes(&self) -> &[u8; ID_LEN] {
                &self.0
            }

            /// Returns the inner bytes as a slice.
            pub fn as_slice(&self) -> &[u8] {
                &self.0
            }

            /// Creates from a byte slice of exactly 20 bytes.
            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                if bytes.len() != ID_LEN {
                    return None;
                }
                let mut arr = [0u8; ID_LEN];
                arr.copy_from_slice(bytes);
                Some(Self(arr))
            }

            /// Creates from a hex string.
            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let bytes = hex::decode(s)?;
                Self::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
            }

            /// Returns as a hex string.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Generates a random identifier.
            pub fn random() -> Self {
                use rand::RngCore;
                let mut bytes = [0u8; ID_LEN];
                rand::thread_rng().fill_bytes(&mut bytes);
                Self(bytes)
            }

            /// Computes the XOR distance to another identifier.
            pub fn xor_distance(&self, other: &Self) -> [u8; ID_LEN] {
                let mut result = [0u8; ID_LEN];
                for i in 0..ID_LEN {
                    result[i] = self.0[i] ^ other.0[i];
                }
                result
            }

            /// Returns the leading zero bit count of the XOR distance to `other`.
            ///
            /// 160 means the identifiers are equal.
            pub fn common_prefix_len(&self, other: &Self) -> u32 {
                let distance = self.xor_distance(other);
                let mut zeros = 0u32;
                for byte in &distance {
                    if *byte == 0 {
                        zeros += 8;
                    } else {
                        zeros += byte.leading_zeros();
                        break;
                    }
                }
                zeros
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.to_hex()[..12])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", &self.to_hex()[..12])
            }
        }

        impl From<[u8; ID_LEN]> for $name {
            fn from(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }
        }

        impl From<$name> for [u8; ID_LEN] {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

define_id_type!(
    /// DHT node identity.
    ///
    /// Derived once per install as SHA-1 of a random seed and persisted,
    /// so the identity survives restarts.
    NodeId
);

define_id_type!(
    /// 160-bit content key used for DHT storage and rendezvous.
    InfoHash
);

define_id_type!(
    /// Mesh peer identity: SHA-1 of the peer's Noise static public key.
    PeerHash
);

impl NodeId {
    /// Derives a NodeId from a random seed.
    pub fn from_seed(seed: &[u8]) -> Self {
        Self(sha1_digest(seed))
    }
}

impl InfoHash {
    /// Derives an InfoHash from a well-known name.
    pub fn from_name(name: &str) -> Self {
        Self(sha1_digest(name.as_bytes()))
    }
}

impl PeerHash {
    /// Derives the stable peer identity from a Noise static public key.
    pub fn from_static_key(public_key: &[u8; 32]) -> Self {
        Self(sha1_digest(public_key))
    }

    /// Derives the per-session binding of a static key to a handshake.
    ///
    /// Both ends compute this from their Noise session state and compare it
    /// against the value declared in the remote's hello frame.
    pub fn session_binding(public_key: &[u8; 32], handshake_hash: &[u8]) -> Self {
        let mut input = Vec::with_capacity(32 + handshake_hash.len());
        input.extend_from_slice(public_key);
        input.extend_from_slice(handshake_hash);
        Self(sha1_digest(&input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let id = NodeId::random();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 40);
        assert_eq!(NodeId::from_hex(&hex).unwrap(), id);
    }

    #[test]
    fn test_from_hex_rejects_bad_length() {
        assert!(NodeId::from_hex("abcd").is_err());
        assert!(NodeId::from_hex("zz").is_err());
    }

    #[test]
    fn test_xor_distance_properties() {
        let a = NodeId::random();
        let b = NodeId::random();
        let c = NodeId::random();

        // d(a, a) == 0
        assert_eq!(a.xor_distance(&a), [0u8; ID_LEN]);
        // d(a, b) == d(b, a)
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));

        // d(a, c) == d(a, b) xor d(b, c), bitwise
        let ab = a.xor_distance(&b);
        let bc = b.xor_distance(&c);
        let ac = a.xor_distance(&c);
        let mut combined = [0u8; ID_LEN];
        for i in 0..ID_LEN {
            combined[i] = ab[i] ^ bc[i];
        }
        assert_eq!(ac, combined);
    }

    #[test]
    fn test_common_prefix_len() {
        let zero = NodeId::zero();
        assert_eq!(zero.common_prefix_len(&zero), 160);

        let mut bytes = [0u8; ID_LEN];
        bytes[0] = 0x80;
        assert_eq!(zero.common_prefix_len(&NodeId::new(bytes)), 0);

        bytes = [0u8; ID_LEN];
        bytes[19] = 0x01;
        assert_eq!(zero.common_prefix_len(&NodeId::new(bytes)), 159);
    }

    #[test]
    fn test_node_id_from_seed_deterministic() {
        let seed = [7u8; 32];
        assert_eq!(NodeId::from_seed(&seed), NodeId::from_seed(&seed));
        assert_ne!(NodeId::from_seed(&seed), NodeId::from_seed(&[8u8; 32]));
    }

    #[test]
    fn test_discovery_hash_value() {
        // SHA-1 of the well-known discovery name; pinned so every node
        // rendezvouses on the same key.
        let hash = InfoHash::from_name("rats_peer_discovery_v1");
        assert_eq!(hash, InfoHash::new(sha1_digest(b"rats_peer_discovery_v1")));
    }

    #[test]
    fn test_session_binding_depends_on_both_inputs() {
        let key = [1u8; 32];
        let hh1 = [2u8; 32];
        let hh2 = [3u8; 32];
        assert_ne!(
            PeerHash::session_binding(&key, &hh1),
            PeerHash::session_binding(&key, &hh2)
        );
        assert_ne!(
            PeerHash::session_binding(&key, &hh1),
            PeerHash::session_binding(&[4u8; 32], &hh1)
        );
    }
}
