//! Transport target selection
//!
//! A joining device may carry a local-network candidate URL from its
//! pairing link. The selector probes the candidate's handshake endpoint
//! with a hard 2-second budget; a live candidate wins the local path,
//! anything else silently falls back to the configured relay. Selection
//! happens once per connect - there is no mid-session migration between
//! transports.

use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// WebSocket path used on the relay transport
pub const RELAY_WS_PATH: &str = "/ws";

/// WebSocket path used on the local-network transport
pub const LOCAL_WS_PATH: &str = "/device";

/// Liveness endpoint probed on a local candidate
pub const HANDSHAKE_PATH: &str = "/handshake";

/// Transport errors surfaced through session state
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Connection could not be established
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed by the peer or the network
    #[error("Connection closed")]
    Disconnected,

    /// Send failed
    #[error("Failed to send: {0}")]
    SendFailed(String),

    /// Registration was not acknowledged
    #[error("Registration rejected: {0}")]
    RegistrationRejected(String),

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Which path a connection attempt will take
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetKind {
    /// Direct local-network connection to the desktop
    Local,
    /// Cloud relay connection
    Relay,
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetKind::Local => write!(f, "local"),
            TargetKind::Relay => write!(f, "relay"),
        }
    }
}

/// The resolved transport target for one connect cycle
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportTarget {
    /// Base URL (http/https)
    pub base_url: String,
    /// WebSocket handshake path on that host
    pub ws_path: &'static str,
    /// Local or relay
    pub kind: TargetKind,
}

impl TransportTarget {
    fn local(base_url: &str) -> Self {
        TransportTarget {
            base_url: base_url.trim_end_matches('/').to_string(),
            ws_path: LOCAL_WS_PATH,
            kind: TargetKind::Local,
        }
    }

    fn relay(base_url: &str) -> Self {
        TransportTarget {
            base_url: base_url.trim_end_matches('/').to_string(),
            ws_path: RELAY_WS_PATH,
            kind: TargetKind::Relay,
        }
    }

    /// Full WebSocket URL, with the scheme mapped to ws/wss
    pub fn ws_url(&self) -> String {
        let base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{base}{}", self.ws_path)
    }
}

/// Choose the transport target for one connection attempt
///
/// A candidate is only supplied when a mobile device joins via a pairing
/// link that advertised one. Probe failure is recovered locally; callers
/// never see it.
pub async fn select_target(
    local_candidate: Option<&str>,
    relay_url: &str,
    probe_timeout_ms: u64,
) -> TransportTarget {
    if let Some(candidate) = local_candidate {
        if probe_local(candidate, probe_timeout_ms).await {
            info!("Local candidate {candidate} is live, using direct connection");
            return TransportTarget::local(candidate);
        }
        debug!("Local candidate {candidate} unreachable, falling back to relay");
    }
    TransportTarget::relay(relay_url)
}

/// Bounded liveness probe against a candidate's handshake endpoint
async fn probe_local(candidate: &str, timeout_ms: u64) -> bool {
    let url = format!("{}{HANDSHAKE_PATH}", candidate.trim_end_matches('/'));
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()
    {
        Ok(client) => client,
        Err(_) => return false,
    };

    match client.get(&url).send().await {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_candidate_selects_relay() {
        let target = select_target(None, "https://relay.example.com", 2_000).await;

        assert_eq!(target.kind, TargetKind::Relay);
        assert_eq!(target.ws_url(), "wss://relay.example.com/ws");
    }

    #[tokio::test]
    async fn test_unreachable_candidate_falls_back_to_relay() {
        // Reserved TEST-NET-1 address: nothing listens there
        let start = std::time::Instant::now();
        let target = select_target(
            Some("http://192.0.2.1:9"),
            "http://relay.example.com",
            500,
        )
        .await;

        assert_eq!(target.kind, TargetKind::Relay);
        // The probe must respect its budget rather than hang
        assert!(start.elapsed() < std::time::Duration::from_secs(3));
    }

    #[test]
    fn test_ws_url_scheme_mapping() {
        let local = TransportTarget::local("http://192.168.1.20:8420/");
        assert_eq!(local.ws_url(), "ws://192.168.1.20:8420/device");

        let relay = TransportTarget::relay("https://relay.example.com");
        assert_eq!(relay.ws_url(), "wss://relay.example.com/ws");
    }
}
