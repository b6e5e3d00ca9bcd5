//! Noise_XX session.
//!
//! Three-message XX handshake (`e` / `e, ee, s, es` / `s, se`) with
//! X25519, ChaCha20-Poly1305 and SHA-256. After the final message the
//! session is split into an independent send and receive cipher, each
//! tracking its own strictly increasing 64-bit nonce, so the two
//! directions can live on different tasks. A decrypt under the wrong
//! nonce fails authentication, so a reordered or replayed transport
//! message kills the session instead of being silently accepted.

use std::sync::Arc;

use snow::params::{DHChoice, NoiseParams};
use snow::resolvers::{CryptoResolver, DefaultResolver};
use snow::{Builder, HandshakeState, StatelessTransportState};

use rats_core::StaticSecretKey;

use crate::error::NetError;

/// The canonical Noise pattern for the rats mesh.
pub const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_SHA256";

/// Largest ciphertext a wire frame can carry.
pub const MAX_CIPHERTEXT_LEN: usize = 65535;

/// AEAD tag length.
pub const TAG_LEN: usize = 16;

/// Largest plaintext a single transport message can carry.
pub const MAX_PLAINTEXT_LEN: usize = MAX_CIPHERTEXT_LEN - TAG_LEN;

fn params() -> Result<NoiseParams, NetError> {
    Ok(NOISE_PATTERN.parse()?)
}

/// Generates a fresh static keypair, returning (secret, public).
pub fn generate_keypair() -> Result<(StaticSecretKey, [u8; 32]), NetError> {
    let keypair = Builder::new(params()?).generate_keypair()?;
    let mut secret = [0u8; 32];
    let mut public = [0u8; 32];
    secret.copy_from_slice(&keypair.private);
    public.copy_from_slice(&keypair.public);
    Ok((StaticSecretKey::new(secret), public))
}

/// Derives the X25519 public key for a stored secret key.
pub fn public_key(secret: &StaticSecretKey) -> Result<[u8; 32], NetError> {
    let mut dh = DefaultResolver
        .resolve_dh(&DHChoice::Curve25519)
        .ok_or(snow::Error::Dh)?;
    dh.set(secret.as_bytes());
    let mut public = [0u8; 32];
    public.copy_from_slice(dh.pubkey());
    Ok(public)
}

/// Handshake in progress.
pub struct Handshake {
    state: HandshakeState,
    initiator: bool,
}

impl Handshake {
    /// Starts the initiator side with our static key.
    pub fn initiator(local_secret: &StaticSecretKey) -> Result<Self, NetError> {
        let state = Builder::new(params()?)
            .local_private_key(local_secret.as_bytes())
            .build_initiator()?;
        Ok(Self {
            state,
            initiator: true,
        })
    }

    /// Starts the responder side with our static key.
    pub fn responder(local_secret: &StaticSecretKey) -> Result<Self, NetError> {
        let state = Builder::new(params()?)
            .local_private_key(local_secret.as_bytes())
            .build_responder()?;
        Ok(Self {
            state,
            initiator: false,
        })
    }

    /// True for the initiator side.
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Produces the next handshake message.
    pub fn write_message(&mut self) -> Result<Vec<u8>, NetError> {
        let mut buf = vec![0u8; MAX_CIPHERTEXT_LEN];
        let len = self.state.write_message(&[], &mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Consumes a received handshake message.
    pub fn read_message(&mut self, message: &[u8]) -> Result<(), NetError> {
        let mut buf = vec![0u8; MAX_CIPHERTEXT_LEN];
        self.state.read_message(message, &mut buf)?;
        Ok(())
    }

    /// True once all three messages have been exchanged.
    pub fn is_finished(&self) -> bool {
        self.state.is_handshake_finished()
    }

    /// Finalizes the handshake into transport ciphers plus the
    /// authentication material the registry needs.
    pub fn into_transport(self) -> Result<Established, NetError> {
        let mut handshake_hash = [0u8; 32];
        handshake_hash.copy_from_slice(self.state.get_handshake_hash());

        let remote_static = self
            .state
            .get_remote_static()
            .ok_or(snow::Error::Dh)
            .map(|key| {
                let mut arr = [0u8; 32];
                arr.copy_from_slice(key);
                arr
            })?;

        let transport = Arc::new(self.state.into_stateless_transport_mode()?);
        Ok(Established {
            send: SendCipher {
                transport: transport.clone(),
                nonce: 0,
            },
            recv: RecvCipher { transport, nonce: 0 },
            handshake_hash,
            remote_static,
        })
    }
}

/// Output of a completed handshake.
pub struct Established {
    /// Cipher for outgoing transport messages
    pub send: SendCipher,
    /// Cipher for incoming transport messages
    pub recv: RecvCipher,
    /// 32-byte handshake transcript hash, equal on both sides
    pub handshake_hash: [u8; 32],
    /// The remote's static public key, authenticated by the handshake
    pub remote_static: [u8; 32],
}

/// Send direction of an established session.
pub struct SendCipher {
    transport: Arc<StatelessTransportState>,
    nonce: u64,
}

impl SendCipher {
    /// Seals `plaintext` under the next nonce.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NetError> {
        if plaintext.len() > MAX_PLAINTEXT_LEN {
            return Err(NetError::FrameTooLarge(plaintext.len()));
        }
        let mut buf = vec![0u8; plaintext.len() + TAG_LEN];
        let len = self
            .transport
            .write_message(self.nonce, plaintext, &mut buf)?;
        buf.truncate(len);
        // A nonce must never repeat under the same key.
        self.nonce = self
            .nonce
            .checked_add(1)
            .ok_or(snow::Error::State(
                snow::error::StateProblem::Exhausted,
            ))?;
        Ok(buf)
    }
}

/// Receive direction of an established session.
pub struct RecvCipher {
    transport: Arc<StatelessTransportState>,
    nonce: u64,
}

impl RecvCipher {
    /// Opens `ciphertext` under the next expected nonce.
    ///
    /// A reordered, replayed or tampered message fails authentication.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NetError> {
        if ciphertext.len() > MAX_CIPHERTEXT_LEN || ciphertext.len() < TAG_LEN {
            return Err(NetError::FrameTooLarge(ciphertext.len()));
        }
        let mut buf = vec![0u8; ciphertext.len()];
        let len = self
            .transport
            .read_message(self.nonce, ciphertext, &mut buf)?;
        buf.truncate(len);
        self.nonce = self
            .nonce
            .checked_add(1)
            .ok_or(snow::Error::State(
                snow::error::StateProblem::Exhausted,
            ))?;
        Ok(buf)
    }
}

/// Runs the three XX messages over in-memory buffers; used by tests and
/// by the engine's socket driver.
#[cfg(test)]
pub(crate) fn handshake_pair() -> (Established, Established) {
    let (init_sk, _) = generate_keypair().unwrap();
    let (resp_sk, _) = generate_keypair().unwrap();

    let mut initiator = Handshake::initiator(&init_sk).unwrap();
    let mut responder = Handshake::responder(&resp_sk).unwrap();

    // -> e
    let msg1 = initiator.write_message().unwrap();
    responder.read_message(&msg1).unwrap();
    // <- e, ee, s, es
    let msg2 = responder.write_message().unwrap();
    initiator.read_message(&msg2).unwrap();
    // -> s, se
    let msg3 = initiator.write_message().unwrap();
    responder.read_message(&msg3).unwrap();

    assert!(initiator.is_finished());
    assert!(responder.is_finished());

    (
        initiator.into_transport().unwrap(),
        responder.into_transport().unwrap(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_agrees_on_hash_and_statics() {
        let (init, resp) = handshake_pair();
        assert_eq!(init.handshake_hash, resp.handshake_hash);
        assert_ne!(init.remote_static, resp.remote_static);
    }

    #[test]
    fn test_transport_roundtrip_both_directions() {
        let (mut init, mut resp) = handshake_pair();

        let ciphertext = init.send.encrypt(b"hello there").unwrap();
        assert_eq!(resp.recv.decrypt(&ciphertext).unwrap(), b"hello there");

        let ciphertext = resp.send.encrypt(b"general kenobi").unwrap();
        assert_eq!(init.recv.decrypt(&ciphertext).unwrap(), b"general kenobi");
    }

    #[test]
    fn test_nonce_mismatch_fails() {
        let (mut init, mut resp) = handshake_pair();

        // Drop the first message; the receiver's nonce no longer lines up.
        let _skipped = init.send.encrypt(b"first").unwrap();
        let second = init.send.encrypt(b"second").unwrap();
        assert!(resp.recv.decrypt(&second).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let (mut init, mut resp) = handshake_pair();
        let mut ciphertext = init.send.encrypt(b"payload").unwrap();
        ciphertext[0] ^= 0x01;
        assert!(resp.recv.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_replay_fails() {
        let (mut init, mut resp) = handshake_pair();
        let ciphertext = init.send.encrypt(b"once").unwrap();
        assert!(resp.recv.decrypt(&ciphertext).is_ok());
        assert!(resp.recv.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_plaintext_limit_enforced() {
        let (mut init, _resp) = handshake_pair();
        let oversized = vec![0u8; MAX_PLAINTEXT_LEN + 1];
        assert!(matches!(
            init.send.encrypt(&oversized),
            Err(NetError::FrameTooLarge(_))
        ));
        let max = vec![0u8; MAX_PLAINTEXT_LEN];
        assert!(init.send.encrypt(&max).is_ok());
    }

    #[test]
    fn test_public_key_derivation_matches_handshake() {
        let (sk, pk) = generate_keypair().unwrap();
        assert_eq!(public_key(&sk).unwrap(), pk);

        // The responder learns exactly this public key during XX.
        let (resp_sk, resp_pk) = generate_keypair().unwrap();
        let mut initiator = Handshake::initiator(&sk).unwrap();
        let mut responder = Handshake::responder(&resp_sk).unwrap();
        let m1 = initiator.write_message().unwrap();
        responder.read_message(&m1).unwrap();
        let m2 = responder.write_message().unwrap();
        initiator.read_message(&m2).unwrap();
        let m3 = initiator.write_message().unwrap();
        responder.read_message(&m3).unwrap();

        let init_est = initiator.into_transport().unwrap();
        let resp_est = responder.into_transport().unwrap();
        assert_eq!(resp_est.remote_static, pk);
        assert_eq!(init_est.remote_static, resp_pk);
    }
}
