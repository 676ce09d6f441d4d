//! Wire frames exchanged with the relay
//!
//! All frames are JSON text messages tagged by `type` with the body under
//! `data`. Application messages keep their own inner `type` field for the
//! message kind, which is opaque to the transport.

use serde::{Deserialize, Serialize};

use crate::crypto::now_millis;

/// Target value addressing every registered device in the room
pub const TARGET_ALL: &str = "all";

/// Message kind carrying the authoritative device registry
pub const KIND_REGISTRY_SYNC: &str = "registry-sync";

/// Message kind announcing a newly connected guest
pub const KIND_GUEST_CONNECTED: &str = "guest-connected";

/// Message kind announcing a departed guest
pub const KIND_GUEST_DISCONNECTED: &str = "guest-disconnected";

/// Message kind for guest chat / control payloads
pub const KIND_CHAT: &str = "chat";

/// Message kind carrying a WebRTC offer
pub const KIND_WEBRTC_OFFER: &str = "webrtc-offer";

/// Message kind carrying a WebRTC answer
pub const KIND_WEBRTC_ANSWER: &str = "webrtc-answer";

/// Message kind carrying an ICE candidate
pub const KIND_WEBRTC_ICE: &str = "webrtc-ice-candidate";

/// Role a device registers under
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    /// Primary node; owns the pairing token and the guest bridge
    Desktop,
    /// Secondary node joining via token
    Mobile,
    /// Ephemeral unauthenticated web client
    Guest,
}

impl std::fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceRole::Desktop => write!(f, "desktop"),
            DeviceRole::Mobile => write!(f, "mobile"),
            DeviceRole::Guest => write!(f, "guest"),
        }
    }
}

/// A registered device as seen in the registry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Persistent device identifier
    pub device_id: String,
    /// Registered role
    pub role: DeviceRole,
    /// Human-readable name
    pub name: String,
}

/// Registration request sent immediately after the socket opens
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterData {
    /// Persistent device identifier
    pub device_id: String,
    /// Role to register under
    pub role: DeviceRole,
    /// Human-readable device name
    pub name: String,
    /// Pairing token (or guest session id for guests)
    pub token: String,
}

/// Registration acknowledgment
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredData {
    /// The identifier the relay registered us under
    pub device_id: String,
    /// Devices currently in the room
    pub devices: Vec<DeviceInfo>,
}

/// The unit of application-level communication once registered
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique message id
    pub id: String,
    /// Application message kind
    #[serde(rename = "type")]
    pub kind: String,
    /// Sender device id
    pub source: String,
    /// Receiver device id, or [`TARGET_ALL`]
    pub target: String,
    /// Unix milliseconds at send time
    pub timestamp: u64,
    /// Opaque payload; enveloped or plain, by the sender's choice
    pub payload: serde_json::Value,
}

impl Message {
    /// Build a new message from this device
    pub fn new(kind: &str, source: &str, target: &str, payload: serde_json::Value) -> Self {
        Message {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            timestamp: now_millis(),
            payload,
        }
    }

    /// Whether this message addresses the given device
    pub fn addresses(&self, device_id: &str) -> bool {
        self.target == TARGET_ALL || self.target == device_id
    }
}

/// Payload of a registry-sync message
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistrySync {
    /// Authoritative list of devices in the room
    pub devices: Vec<DeviceInfo>,
}

/// Frames on the wire, client and server side
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Frame {
    /// Client -> relay registration request
    Register(RegisterData),
    /// Relay -> client registration acknowledgment
    Registered(RegisteredData),
    /// Application message, either direction
    Message(Message),
    /// Relay-side error report
    Error {
        /// Human-readable reason
        message: String,
    },
}

impl Frame {
    /// Serialize for a text WebSocket frame
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("frames serialize infallibly")
    }

    /// Parse a text WebSocket frame
    pub fn from_json(text: &str) -> Option<Frame> {
        serde_json::from_str(text).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_frame_wire_shape() {
        let frame = Frame::Register(RegisterData {
            device_id: "abc".to_string(),
            role: DeviceRole::Mobile,
            name: "pixel".to_string(),
            token: "tok-1".to_string(),
        });

        let value: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(value["type"], "register");
        assert_eq!(value["data"]["deviceId"], "abc");
        assert_eq!(value["data"]["role"], "mobile");
        assert_eq!(value["data"]["token"], "tok-1");
    }

    #[test]
    fn test_message_frame_round_trip() {
        let msg = Message::new("status", "dev-a", "dev-b", json!({"cpu": 12}));
        let frame = Frame::Message(msg.clone());

        let parsed = Frame::from_json(&frame.to_json()).unwrap();
        match parsed {
            Frame::Message(m) => {
                assert_eq!(m.id, msg.id);
                assert_eq!(m.kind, "status");
                assert_eq!(m.payload, json!({"cpu": 12}));
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn test_message_inner_type_survives_outer_tag() {
        // The frame tag and the message kind are both named "type" on the
        // wire; the data-nested layout keeps them apart.
        let msg = Message::new(KIND_REGISTRY_SYNC, "relay", TARGET_ALL, json!({"devices": []}));
        let value: serde_json::Value =
            serde_json::from_str(&Frame::Message(msg).to_json()).unwrap();

        assert_eq!(value["type"], "message");
        assert_eq!(value["data"]["type"], KIND_REGISTRY_SYNC);
    }

    #[test]
    fn test_addresses_direct_and_broadcast() {
        let msg = Message::new("x", "a", "b", json!(null));
        assert!(msg.addresses("b"));
        assert!(!msg.addresses("c"));

        let all = Message::new("x", "a", TARGET_ALL, json!(null));
        assert!(all.addresses("anything"));
    }

    #[test]
    fn test_malformed_frame_parses_to_none() {
        assert!(Frame::from_json("not json").is_none());
        assert!(Frame::from_json(r#"{"type":"unknown","data":{}}"#).is_none());
    }
}
