//! Client configuration and pairing URL handling

use serde::{Deserialize, Serialize};

/// Built-in relay used when no relay URL is configured
///
/// A missing relay URL is a recoverable configuration gap, never fatal.
pub const DEFAULT_RELAY_URL: &str = "https://relay.tetherlink.io";

/// URL scheme for pairing links
pub const PAIRING_SCHEME: &str = "tether";

/// Configuration for a [`crate::session::SessionClient`]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Relay base URL (http/https)
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    /// Human-readable device name sent in the registration frame
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// LAN liveness probe budget in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// WebSocket connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Bounded reconnection attempts per connect cycle
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    /// Base delay between reconnection attempts in milliseconds
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    /// STUN servers handed to guest peer connections
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    /// Base URL of the PIN-policy service consulted for guest access
    #[serde(default = "default_pin_policy_url")]
    pub pin_policy_url: String,
}

fn default_relay_url() -> String {
    DEFAULT_RELAY_URL.to_string()
}

fn default_device_name() -> String {
    "tether-device".to_string()
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}

fn default_stun_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun.cloudflare.com:3478".to_string(),
    ]
}

fn default_pin_policy_url() -> String {
    "http://127.0.0.1:8321".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            relay_url: default_relay_url(),
            device_name: default_device_name(),
            probe_timeout_ms: default_probe_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            stun_servers: default_stun_servers(),
            pin_policy_url: default_pin_policy_url(),
        }
    }
}

impl ClientConfig {
    /// Config pointing at a specific relay, defaults elsewhere
    pub fn with_relay(relay_url: impl Into<String>) -> Self {
        let relay_url: String = relay_url.into();
        let relay_url = if relay_url.trim().is_empty() {
            default_relay_url()
        } else {
            relay_url
        };
        ClientConfig {
            relay_url,
            ..Default::default()
        }
    }
}

/// A parsed pairing link: `tether://pair?relay=<url>&token=<token>&local=<url>`
///
/// The `local` candidate is present only when the desktop also listens on
/// its LAN address; joining devices probe it before falling back to the
/// relay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairingUrl {
    /// Relay base URL
    pub relay: String,
    /// Short-lived pairing token minted by the relay
    pub token: String,
    /// Optional local-network candidate URL
    pub local: Option<String>,
}

impl PairingUrl {
    /// Build a pairing URL string
    pub fn build(relay: &str, token: &str, local: Option<&str>) -> String {
        let mut url = format!(
            "{PAIRING_SCHEME}://pair?relay={}&token={}",
            percent_encode(relay),
            percent_encode(token)
        );
        if let Some(local) = local {
            url.push_str("&local=");
            url.push_str(&percent_encode(local));
        }
        url
    }

    /// Parse a pairing URL
    ///
    /// Returns `None` on any malformation; the caller decides how to
    /// surface that.
    pub fn parse(input: &str) -> Option<PairingUrl> {
        let rest = input
            .strip_prefix(PAIRING_SCHEME)?
            .strip_prefix("://pair?")?;

        let mut relay = None;
        let mut token = None;
        let mut local = None;
        for pair in rest.split('&') {
            let (key, value) = pair.split_once('=')?;
            let value = percent_decode(value)?;
            match key {
                "relay" => relay = Some(value),
                "token" => token = Some(value),
                "local" => local = Some(value),
                // Unknown parameters are ignored for forward compatibility
                _ => {}
            }
        }

        Some(PairingUrl {
            relay: relay?,
            token: token?,
            local,
        })
    }

    /// Render back to the URL form
    pub fn to_url(&self) -> String {
        Self::build(&self.relay, &self.token, self.local.as_deref())
    }
}

fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            let value = u8::from_str_radix(std::str::from_utf8(hex).ok()?, 16).ok()?;
            out.push(value);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairing_url_round_trip() {
        let url = PairingUrl::build(
            "https://relay.example.com:8443",
            "abc-123",
            Some("http://192.168.1.20:8420"),
        );
        let parsed = PairingUrl::parse(&url).unwrap();

        assert_eq!(parsed.relay, "https://relay.example.com:8443");
        assert_eq!(parsed.token, "abc-123");
        assert_eq!(parsed.local.as_deref(), Some("http://192.168.1.20:8420"));
        assert_eq!(parsed.to_url(), url);
    }

    #[test]
    fn test_pairing_url_without_local_candidate() {
        let url = PairingUrl::build("https://relay.example.com", "tok", None);
        let parsed = PairingUrl::parse(&url).unwrap();

        assert_eq!(parsed.local, None);
    }

    #[test]
    fn test_pairing_url_rejects_malformed_input() {
        assert_eq!(PairingUrl::parse("https://pair?relay=a&token=b"), None);
        assert_eq!(PairingUrl::parse("tether://pair?relay=a"), None);
        assert_eq!(PairingUrl::parse("tether://pair?token=b"), None);
        assert_eq!(PairingUrl::parse("garbage"), None);
        assert_eq!(PairingUrl::parse("tether://pair?relay=%ZZ&token=b"), None);
    }

    #[test]
    fn test_missing_relay_falls_back_to_default() {
        let config = ClientConfig::with_relay("");
        assert_eq!(config.relay_url, DEFAULT_RELAY_URL);

        let config = ClientConfig::with_relay("http://127.0.0.1:9000");
        assert_eq!(config.relay_url, "http://127.0.0.1:9000");
    }
}
