//! X25519 Key Agreement
//!
//! Provides Elliptic Curve Diffie-Hellman (ECDH) key agreement for
//! establishing shared secrets between paired devices. Both peers derive
//! the same secret independently; it is never transmitted.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use super::error::{CryptoError, CryptoResult};
use super::now_millis;

/// Size of a shared secret in bytes
pub const SHARED_SECRET_SIZE: usize = 32;

/// Lifetime of a derived shared secret: 24 hours, fixed at derivation
pub const SECRET_TTL_MS: u64 = 24 * 60 * 60 * 1000;

/// A public key for key agreement (X25519)
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        Ok(PublicKey(arr))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex for transmission in registration frames
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Create from hex
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidPublicKey)?;
        Self::from_bytes(&bytes)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_hex()[..16])
    }
}

impl serde::Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Shared secret derived from key agreement
///
/// Carries its own expiry: `expires_at` is fixed at derivation time and
/// never extended. Rotation is advisory; callers check `needs_rotation`
/// and re-derive. Key bytes are zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct SharedSecret {
    key: [u8; SHARED_SECRET_SIZE],
    #[zeroize(skip)]
    created_at: u64,
    #[zeroize(skip)]
    expires_at: u64,
}

impl SharedSecret {
    /// Get the raw key bytes (be careful with this!)
    pub fn key(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.key
    }

    /// Unix milliseconds at which the secret was derived
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Unix milliseconds after which the secret should be re-derived
    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    /// True once the secret has reached its expiry
    pub fn needs_rotation(&self) -> bool {
        now_millis() >= self.expires_at
    }

    #[cfg(test)]
    pub(crate) fn with_expiry(key: [u8; 32], created_at: u64, expires_at: u64) -> Self {
        SharedSecret { key, created_at, expires_at }
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material
        write!(
            f,
            "SharedSecret(created_at: {}, expires_at: {})",
            self.created_at, self.expires_at
        )
    }
}

/// A device key pair for key agreement
#[derive(ZeroizeOnDrop)]
pub struct KeyPair {
    #[zeroize(skip)]
    public_key: PublicKey,
    secret_key: [u8; 32],
}

impl KeyPair {
    /// Generate a new key pair from the OS CSPRNG
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);

        KeyPair {
            public_key: PublicKey(public.to_bytes()),
            secret_key: secret.to_bytes(),
        }
    }

    /// Get the public key to share with the peer
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Compute the shared secret with a peer's public key
    ///
    /// Both peers compute the same value from their own secret key and
    /// the other's public key. The returned secret expires 24 hours from
    /// now; the expiry is fixed and never auto-extended.
    pub fn derive_shared_secret(&self, their_public: &PublicKey) -> SharedSecret {
        let secret = StaticSecret::from(self.secret_key);
        let peer = X25519Public::from(their_public.0);
        let shared = secret.diffie_hellman(&peer);

        let created_at = now_millis();
        SharedSecret {
            key: shared.to_bytes(),
            created_at,
            expires_at: created_at + SECRET_TTL_MS,
        }
    }
}
