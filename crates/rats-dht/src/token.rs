//! Announce token management.
//!
//! Tokens stop remote nodes from announcing peers on behalf of addresses
//! they do not hold. A token is HMAC-SHA1 over the querying node's IP
//! with a secret that rotates every five minutes; tokens minted under
//! the previous secret remain valid, giving a ten minute window.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use sha1::Sha1;
use tracing::debug;

type HmacSha1 = Hmac<Sha1>;

/// Secret rotation interval.
const ROTATION_INTERVAL: Duration = Duration::from_secs(5 * 60);

const SECRET_LEN: usize = 20;

/// Issues and validates announce tokens.
pub struct TokenManager {
    current_secret: [u8; SECRET_LEN],
    previous_secret: [u8; SECRET_LEN],
    last_rotation: Instant,
}

impl TokenManager {
    /// Creates a manager with freshly random secrets.
    pub fn new() -> Self {
        Self {
            current_secret: random_secret(),
            previous_secret: random_secret(),
            last_rotation: Instant::now(),
        }
    }

    /// Issues a token for the given remote IP.
    pub fn generate(&mut self, ip: &IpAddr) -> Vec<u8> {
        self.maybe_rotate();
        compute_token(ip, &self.current_secret)
    }

    /// Checks a token against the current and previous secrets.
    pub fn validate(&mut self, ip: &IpAddr, token: &[u8]) -> bool {
        self.maybe_rotate();
        token == compute_token(ip, &self.current_secret).as_slice()
            || token == compute_token(ip, &self.previous_secret).as_slice()
    }

    fn maybe_rotate(&mut self) {
        if self.last_rotation.elapsed() >= ROTATION_INTERVAL {
            self.previous_secret = self.current_secret;
            self.current_secret = random_secret();
            self.last_rotation = Instant::now();
            debug!("announce token secret rotated");
        }
    }
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new()
    }
}

fn random_secret() -> [u8; SECRET_LEN] {
    use rand::RngCore;
    let mut secret = [0u8; SECRET_LEN];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}

fn compute_token(ip: &IpAddr, secret: &[u8; SECRET_LEN]) -> Vec<u8> {
    let mut mac = HmacSha1::new_from_slice(secret).expect("HMAC accepts any key length");
    match ip {
        IpAddr::V4(v4) => mac.update(&v4.octets()),
        IpAddr::V6(v6) => mac.update(&v6.octets()),
    }
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 0, last))
    }

    #[test]
    fn test_token_is_stable_per_ip() {
        let mut manager = TokenManager::new();
        assert_eq!(manager.generate(&ip(1)), manager.generate(&ip(1)));
    }

    #[test]
    fn test_token_differs_per_ip() {
        let mut manager = TokenManager::new();
        assert_ne!(manager.generate(&ip(1)), manager.generate(&ip(2)));
    }

    #[test]
    fn test_validate_accepts_issued_token() {
        let mut manager = TokenManager::new();
        let token = manager.generate(&ip(1));
        assert!(manager.validate(&ip(1), &token));
    }

    #[test]
    fn test_validate_rejects_wrong_ip_or_garbage() {
        let mut manager = TokenManager::new();
        let token = manager.generate(&ip(1));
        assert!(!manager.validate(&ip(2), &token));
        assert!(!manager.validate(&ip(1), &[0u8; 20]));
    }

    #[test]
    fn test_previous_epoch_token_accepted() {
        let mut manager = TokenManager::new();
        let token = manager.generate(&ip(1));

        // Force one rotation; the token moved to the previous secret.
        manager.last_rotation = Instant::now() - ROTATION_INTERVAL;
        assert!(manager.validate(&ip(1), &token));

        // A second rotation retires it.
        manager.last_rotation = Instant::now() - ROTATION_INTERVAL;
        assert!(!manager.validate(&ip(1), &token));
    }
}
