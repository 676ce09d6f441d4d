//! Cryptographic building blocks for device pairing
//!
//! - `agreement`: X25519 ECDH shared secrets with fixed 24 h expiry
//! - `envelope`: AES-256-CTR + HMAC-SHA256 authenticated envelopes

pub mod agreement;
pub mod envelope;
pub mod error;

// Re-export commonly used types
pub use agreement::{KeyPair, PublicKey, SharedSecret};
pub use envelope::{Envelope, ReplayGuard};
pub use error::{CryptoError, CryptoResult};

/// Generate cryptographically secure random bytes
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Current Unix time in milliseconds
pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_agreed_secret_opens_peer_envelopes() {
        // Two devices agree on a secret, then exchange an envelope
        let desktop = KeyPair::generate();
        let mobile = KeyPair::generate();

        let desktop_secret = desktop.derive_shared_secret(mobile.public_key());
        let mobile_secret = mobile.derive_shared_secret(desktop.public_key());

        let payload = json!({"type": "registry-sync", "devices": ["desktop-1", "mobile-2"]});
        let sealed = envelope::seal(&payload, desktop_secret.key()).unwrap();

        let opened: serde_json::Value = envelope::open(&sealed, mobile_secret.key()).unwrap();
        assert_eq!(opened, payload);
    }
}
