//! Noise static key material.

use std::fmt;

use zeroize::Zeroize;

/// Curve25519 static secret key for the Noise handshake.
///
/// Persisted in the configuration file so the peer identity derived from
/// the corresponding public key is stable across restarts.
#[derive(Clone, PartialEq, Eq)]
pub struct StaticSecretKey(pub [u8; 32]);

impl StaticSecretKey {
    /// Creates a key from raw bytes.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generates a random secret key.
    ///
    /// Clamping is left to the X25519 implementation consuming the key.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Returns the inner bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Decodes a key from a 64-char hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Encodes the key as hex for persistence.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for StaticSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StaticSecretKey([REDACTED])")
    }
}

impl Drop for StaticSecretKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}
