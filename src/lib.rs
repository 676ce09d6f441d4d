//! # Tether
//!
//! Secure device pairing and hybrid relay communication. A primary
//! ("desktop") node, secondary ("mobile") nodes, and ephemeral web guests
//! exchange messages and live audio over either a direct local-network
//! path or a cloud relay, with an authenticated, replay-protected
//! envelope protecting application payloads.
//!
//! ## Features
//!
//! - **Key agreement** via X25519 ECDH; shared secrets carry a fixed
//!   24-hour expiry and are never transmitted
//! - **Secure envelopes**: AES-256-CTR with detached HMAC-SHA256,
//!   staleness and replay rejection
//! - **Hybrid transport**: probe the LAN candidate, fall back to the
//!   relay, once per connect
//! - **Guest bridge**: PIN-gated web guests negotiating a receive-only
//!   audio channel over relayed WebRTC signaling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tether::{ClientConfig, MemoryIdentityStore, SessionClient};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = SessionClient::new(
//!     ClientConfig::with_relay("https://relay.example.com"),
//!     Arc::new(MemoryIdentityStore::new()),
//! );
//!
//! // Desktop side: host a room and share the token
//! let token = client.create_room().await?;
//! println!("Pair with token: {token}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              APPLICATION LAYER              │
//! │        CLI  |  Desktop host  |  Tests       │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │              SESSION LAYER                  │
//! │  SessionClient | GuestBridge | Envelopes    │
//! └─────────────────────┬───────────────────────┘
//! ┌─────────────────────▼───────────────────────┐
//! │               CRYPTO LAYER                  │
//! │     X25519 | AES-256-CTR | HMAC-SHA256      │
//! └─────────────────────┬───────────────────────┘
//! ┌─────────────────────▼───────────────────────┐
//! │             TRANSPORT LAYER                 │
//! │    LAN WebSocket | Relay WebSocket | HTTP   │
//! └─────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod config;
pub mod crypto;
pub mod guest;
pub mod identity;
pub mod relay;
pub mod session;
pub mod transport;

// Re-export main types at crate root
pub use api::{PinPolicy, RelayApi};
pub use config::{ClientConfig, PairingUrl};
pub use crypto::{CryptoError, CryptoResult, Envelope, KeyPair, ReplayGuard, SharedSecret};
pub use guest::{AudioSink, GuestBridge, GuestPhase, NullAudioSink};
pub use identity::{DeviceId, FileIdentityStore, IdentityStore, MemoryIdentityStore};
pub use session::{SessionClient, SessionHandle, SessionPhase, SessionState};
