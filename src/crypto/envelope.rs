//! Authenticated, replay-protected message envelopes
//!
//! Payloads are encrypted with AES-256 in counter mode and authenticated
//! by a detached HMAC-SHA256 signature over the canonical string
//! `ciphertext|iv|timestamp|nonce`. Counter mode is used because
//! authentication comes from the signature, not an AEAD tag.
//!
//! Opening an envelope applies a fixed check order: freshness first, then
//! the signature, then decryption. A stale envelope is rejected before any
//! cryptographic work is spent on it.

use aes::Aes256;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::{HashSet, VecDeque};

use super::error::{CryptoError, CryptoResult};
use super::now_millis;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Size of the encryption key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of the counter-mode IV in bytes
pub const IV_SIZE: usize = 16;

/// Size of a message nonce in bytes (before base64)
pub const NONCE_SIZE: usize = 24;

/// Default freshness window applied when opening envelopes
pub const DEFAULT_MAX_AGE_MS: u64 = 60_000;

/// Retained nonce count per [`ReplayGuard`]
pub const REPLAY_GUARD_CAPACITY: usize = 1024;

/// A complete authenticated-ciphertext unit
///
/// All binary fields are base64; `timestamp` is Unix milliseconds at
/// sealing time.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    /// Base64 AES-256-CTR ciphertext
    pub encrypted: String,
    /// Base64 16-byte IV, freshly random per envelope
    pub iv: String,
    /// Base64 HMAC-SHA256 over `encrypted|iv|timestamp|nonce`
    pub signature: String,
    /// Unix milliseconds at sealing time
    pub timestamp: u64,
    /// Base64 24-byte random nonce, single-use per message
    pub nonce: String,
}

/// Generate a random 24-byte nonce, base64-encoded
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

/// Encrypt plaintext under a fresh random IV
///
/// Returns (base64 ciphertext, base64 iv).
pub fn encrypt(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> (String, String) {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let mut buf = plaintext.to_vec();
    let mut cipher = Aes256Ctr::new(key.into(), &iv.into());
    cipher.apply_keystream(&mut buf);

    (BASE64.encode(buf), BASE64.encode(iv))
}

/// Decrypt base64 ciphertext with the given base64 IV
pub fn decrypt(key: &[u8; KEY_SIZE], encrypted_b64: &str, iv_b64: &str) -> CryptoResult<Vec<u8>> {
    let mut buf = BASE64
        .decode(encrypted_b64)
        .map_err(|e| CryptoError::MalformedPayload(format!("ciphertext base64: {e}")))?;
    let iv_bytes = BASE64
        .decode(iv_b64)
        .map_err(|e| CryptoError::MalformedPayload(format!("iv base64: {e}")))?;
    if iv_bytes.len() != IV_SIZE {
        return Err(CryptoError::MalformedPayload(format!(
            "iv length {} != {IV_SIZE}",
            iv_bytes.len()
        )));
    }

    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&iv_bytes);

    let mut cipher = Aes256Ctr::new(key.into(), &iv.into());
    cipher.apply_keystream(&mut buf);
    Ok(buf)
}

/// The canonical pipe-joined string that gets signed
fn canonical(encrypted: &str, iv: &str, timestamp: u64, nonce: &str) -> String {
    format!("{encrypted}|{iv}|{timestamp}|{nonce}")
}

/// Compute the base64 HMAC-SHA256 signature over a canonical string
pub fn sign(key: &[u8; KEY_SIZE], message: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// Verify a base64 signature over a canonical string, in constant time
pub fn verify_signature(key: &[u8; KEY_SIZE], message: &str, signature_b64: &str) -> bool {
    let Ok(sig) = BASE64.decode(signature_b64) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    mac.verify_slice(&sig).is_ok()
}

/// Seal a JSON-serializable payload into an authenticated envelope
pub fn seal<T: Serialize>(payload: &T, key: &[u8; KEY_SIZE]) -> CryptoResult<Envelope> {
    let plaintext = serde_json::to_vec(payload)
        .map_err(|e| CryptoError::MalformedPayload(format!("serialize: {e}")))?;

    let (encrypted, iv) = encrypt(key, &plaintext);
    let timestamp = now_millis();
    let nonce = generate_nonce();
    let signature = sign(key, &canonical(&encrypted, &iv, timestamp, &nonce));

    Ok(Envelope {
        encrypted,
        iv,
        signature,
        timestamp,
        nonce,
    })
}

/// Open an envelope with the default 60 s freshness window
pub fn open<T: DeserializeOwned>(envelope: &Envelope, key: &[u8; KEY_SIZE]) -> CryptoResult<T> {
    open_with_max_age(envelope, key, DEFAULT_MAX_AGE_MS)
}

/// Open an envelope, enforcing the fixed check order
///
/// 1. Reject if older than `max_age_ms` (StaleEnvelope) - before any
///    cryptographic work.
/// 2. Recompute and compare the signature (InvalidSignature).
/// 3. Decrypt and JSON-parse (MalformedPayload).
pub fn open_with_max_age<T: DeserializeOwned>(
    envelope: &Envelope,
    key: &[u8; KEY_SIZE],
    max_age_ms: u64,
) -> CryptoResult<T> {
    let age_ms = now_millis().saturating_sub(envelope.timestamp);
    if age_ms > max_age_ms {
        return Err(CryptoError::StaleEnvelope { age_ms, max_age_ms });
    }

    let message = canonical(
        &envelope.encrypted,
        &envelope.iv,
        envelope.timestamp,
        &envelope.nonce,
    );
    if !verify_signature(key, &message, &envelope.signature) {
        return Err(CryptoError::InvalidSignature);
    }

    let plaintext = decrypt(key, &envelope.encrypted, &envelope.iv)?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| CryptoError::MalformedPayload(format!("parse: {e}")))
}

/// Bounded per-secret cache of accepted nonces
///
/// The freshness window alone does not stop an attacker replaying a
/// captured envelope inside that window. A guard records each accepted
/// nonce and rejects repeats, evicting oldest-first so memory stays
/// bounded. One guard per shared secret; nonces are only meaningful
/// within a single secret's lifetime.
pub struct ReplayGuard {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl ReplayGuard {
    /// Create a guard with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(REPLAY_GUARD_CAPACITY)
    }

    /// Create a guard retaining at most `capacity` nonces
    pub fn with_capacity(capacity: usize) -> Self {
        ReplayGuard {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Open an envelope, additionally rejecting nonce reuse
    ///
    /// The nonce check runs after signature verification so that forged
    /// envelopes cannot pollute the cache, and the nonce is recorded only
    /// once the envelope fully opens.
    pub fn open<T: DeserializeOwned>(
        &mut self,
        envelope: &Envelope,
        key: &[u8; KEY_SIZE],
        max_age_ms: u64,
    ) -> CryptoResult<T> {
        let age_ms = now_millis().saturating_sub(envelope.timestamp);
        if age_ms > max_age_ms {
            return Err(CryptoError::StaleEnvelope { age_ms, max_age_ms });
        }

        let message = canonical(
            &envelope.encrypted,
            &envelope.iv,
            envelope.timestamp,
            &envelope.nonce,
        );
        if !verify_signature(key, &message, &envelope.signature) {
            return Err(CryptoError::InvalidSignature);
        }

        if self.seen.contains(&envelope.nonce) {
            return Err(CryptoError::ReplayedNonce);
        }

        let plaintext = decrypt(key, &envelope.encrypted, &envelope.iv)?;
        let payload = serde_json::from_slice(&plaintext)
            .map_err(|e| CryptoError::MalformedPayload(format!("parse: {e}")))?;

        self.record(envelope.nonce.clone());
        Ok(payload)
    }

    fn record(&mut self, nonce: String) {
        if self.seen.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(nonce.clone());
        self.order.push_back(nonce);
    }
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::new()
    }
}
