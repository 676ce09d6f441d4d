//! Guest bridge
//!
//! Manages ephemeral unauthenticated web guests for a desktop session:
//! PIN challenge/response, peer-media signaling relay, and cleanup. One
//! entry per guest; entries are independent, so a slow PIN verification
//! only delays that guest's frames.
//!
//! Control frames travel as JSON-encoded chat payloads but are modeled
//! as an explicit tagged union rather than sniffed out of free text -
//! anything that is not a recognized control frame is plain chat.

pub mod media;

pub use media::{AudioSink, MediaChannel, NullAudioSink};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::PinPolicy;
use crate::session::protocol::{
    Message, KIND_CHAT, KIND_GUEST_CONNECTED, KIND_GUEST_DISCONNECTED, KIND_WEBRTC_ANSWER,
    KIND_WEBRTC_ICE, KIND_WEBRTC_OFFER,
};
use crate::session::SessionHandle;

/// Errors from guest handling
#[derive(Error, Debug)]
pub enum GuestError {
    /// WebRTC stack failure
    #[error("Media channel error: {0}")]
    Media(#[from] webrtc::Error),

    /// A signaling payload was missing required fields
    #[error("Malformed signaling payload: {0}")]
    Signaling(String),

    /// The referenced guest session does not exist
    #[error("Unknown guest session {0}")]
    UnknownSession(String),
}

/// Per-session authentication and media phase
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuestPhase {
    /// Guest socket is up, policy not yet consulted
    Connected,
    /// Policy requires a PIN, challenge not yet sent
    PinRequired,
    /// Challenge sent, awaiting response
    AuthChallenged,
    /// PIN accepted
    Authenticated,
    /// PIN rejected (guest may retry; no lockout)
    Rejected,
    /// Offer sent, awaiting answer
    Signaling,
    /// Media handshake complete
    Active,
    /// Torn down
    Closed,
}

impl std::fmt::Display for GuestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            GuestPhase::Connected => "connected",
            GuestPhase::PinRequired => "pin-required",
            GuestPhase::AuthChallenged => "auth-challenged",
            GuestPhase::Authenticated => "authenticated",
            GuestPhase::Rejected => "rejected",
            GuestPhase::Signaling => "signaling",
            GuestPhase::Active => "active",
            GuestPhase::Closed => "closed",
        };
        write!(f, "{label}")
    }
}

/// Chat-channel payloads exchanged with guests
///
/// An explicit tagged union: control frames carry a `type` field, plain
/// chat is either the tagged `chat` form or a bare string.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum GuestPayload {
    /// Ordinary chat text
    Chat {
        /// The message text
        text: String,
    },
    /// Desktop -> guest: a PIN is required
    AuthChallenge,
    /// Desktop -> guest: PIN accepted
    AuthSuccess,
    /// Desktop -> guest: PIN rejected
    AuthFailed,
    /// Guest -> desktop: PIN attempt
    AuthResponse {
        /// The guest-supplied PIN
        pin: String,
    },
}

impl GuestPayload {
    /// Serialize for the chat channel
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("guest payloads serialize infallibly")
    }

    /// Interpret a chat payload
    ///
    /// Bare strings are chat; tagged objects parse into their frame.
    /// Unrecognized shapes yield `None` and are left to the host app.
    pub fn from_value(value: &serde_json::Value) -> Option<GuestPayload> {
        if let Some(text) = value.as_str() {
            return Some(GuestPayload::Chat {
                text: text.to_string(),
            });
        }
        serde_json::from_value(value.clone()).ok()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GuestEvent {
    session_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfferPayload {
    session_id: String,
    offer: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnswerPayload {
    session_id: String,
    answer: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IcePayload {
    session_id: String,
    candidate: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from_desktop: Option<bool>,
}

/// One ephemeral guest
struct GuestSession {
    phase: GuestPhase,
    media: Option<Arc<MediaChannel>>,
}

/// Manages all guest sessions for a desktop
pub struct GuestBridge {
    policy: PinPolicy,
    stun_servers: Vec<String>,
    sink: Arc<dyn AudioSink>,
    sessions: Mutex<HashMap<String, GuestSession>>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl GuestBridge {
    /// Create a bridge; it stays idle until [`GuestBridge::arm`]
    pub fn new(policy: PinPolicy, stun_servers: Vec<String>, sink: Arc<dyn AudioSink>) -> Self {
        GuestBridge {
            policy,
            stun_servers,
            sink,
            sessions: Mutex::new(HashMap::new()),
            task: std::sync::Mutex::new(None),
        }
    }

    /// Current phase of a guest session, if it exists
    pub async fn phase(&self, session_id: &str) -> Option<GuestPhase> {
        self.sessions.lock().await.get(session_id).map(|s| s.phase)
    }

    /// Number of live guest sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Start consuming guest-related messages from a registered session
    ///
    /// Called by the session client when a desktop role registers.
    /// Arming twice is a no-op.
    pub fn arm(self: Arc<Self>, handle: SessionHandle) {
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            return;
        }

        let mut messages = handle.subscribe_messages();
        let bridge = self.clone();
        *task = Some(tokio::spawn(async move {
            loop {
                match messages.recv().await {
                    Ok(message) => bridge.dispatch(&handle, message).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Guest bridge lagged, skipped {skipped} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
        info!("Guest bridge armed");
    }

    /// Close every guest session and stop the dispatch task
    pub async fn shutdown(&self) {
        let mut sessions = self.sessions.lock().await;
        for (session_id, mut session) in sessions.drain() {
            if let Some(media) = session.media.take() {
                media.close().await;
            }
            session.phase = GuestPhase::Closed;
            debug!("Closed guest session {session_id}");
        }
        drop(sessions);

        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
        info!("Guest bridge shut down");
    }

    async fn dispatch(&self, handle: &SessionHandle, message: Message) {
        match message.kind.as_str() {
            KIND_GUEST_CONNECTED => {
                match serde_json::from_value::<GuestEvent>(message.payload.clone()) {
                    Ok(event) => self.on_guest_connected(handle, &event.session_id).await,
                    Err(e) => debug!("Malformed guest-connected payload: {e}"),
                }
            }
            KIND_GUEST_DISCONNECTED => {
                match serde_json::from_value::<GuestEvent>(message.payload.clone()) {
                    Ok(event) => self.on_guest_disconnected(&event.session_id).await,
                    Err(e) => debug!("Malformed guest-disconnected payload: {e}"),
                }
            }
            KIND_CHAT => self.on_chat(handle, &message).await,
            KIND_WEBRTC_ANSWER => {
                if let Err(e) = self.on_answer(&message).await {
                    warn!("Answer handling failed: {e}");
                }
            }
            KIND_WEBRTC_ICE => {
                if let Err(e) = self.on_ice(&message).await {
                    debug!("ICE handling failed: {e}");
                }
            }
            _ => {}
        }
    }

    async fn on_guest_connected(&self, handle: &SessionHandle, session_id: &str) {
        info!("Guest connected: {session_id}");
        self.sessions.lock().await.insert(
            session_id.to_string(),
            GuestSession {
                phase: GuestPhase::Connected,
                media: None,
            },
        );

        // Fail-open: an unreachable policy service admits the guest
        // without a PIN.
        let pin_required = self.policy.pin_required().await;

        if pin_required {
            self.set_phase(session_id, GuestPhase::PinRequired).await;
            self.set_phase(session_id, GuestPhase::AuthChallenged).await;
            handle.send(session_id, KIND_CHAT, GuestPayload::AuthChallenge.to_value());
            info!("Guest {session_id} challenged for PIN");
        } else if let Err(e) = self.start_signaling(handle, session_id).await {
            warn!("Signaling setup for guest {session_id} failed: {e}");
        }
    }

    async fn on_chat(&self, handle: &SessionHandle, message: &Message) {
        let session_id = message.source.clone();
        let Some(payload) = GuestPayload::from_value(&message.payload) else {
            return;
        };

        if let GuestPayload::AuthResponse { pin } = payload {
            let phase = self.phase(&session_id).await;
            if phase != Some(GuestPhase::AuthChallenged) && phase != Some(GuestPhase::Rejected) {
                debug!("Ignoring PIN from guest {session_id} in phase {phase:?}");
                return;
            }

            // Fail-closed: an unreachable verification endpoint rejects
            // the attempt.
            if self.policy.verify_pin(&pin, &session_id).await {
                self.set_phase(&session_id, GuestPhase::Authenticated).await;
                handle.send(&session_id, KIND_CHAT, GuestPayload::AuthSuccess.to_value());
                info!("Guest {session_id} authenticated");
                if let Err(e) = self.start_signaling(handle, &session_id).await {
                    warn!("Signaling setup for guest {session_id} failed: {e}");
                }
            } else {
                self.set_phase(&session_id, GuestPhase::Rejected).await;
                // No lockout or backoff: the guest stays challenged
                self.set_phase(&session_id, GuestPhase::AuthChallenged).await;
                handle.send(&session_id, KIND_CHAT, GuestPayload::AuthFailed.to_value());
                info!("Guest {session_id} failed PIN verification");
            }
        }
        // Plain chat and desktop-bound control frames are not the
        // bridge's business; the host app consumes them.
    }

    async fn start_signaling(&self, handle: &SessionHandle, session_id: &str) -> Result<(), GuestError> {
        let (candidate_tx, mut candidate_rx) = mpsc::channel(32);
        let media = Arc::new(
            MediaChannel::new(session_id, &self.stun_servers, self.sink.clone(), candidate_tx)
                .await?,
        );

        // Relay locally gathered candidates to the guest as they appear
        let candidate_handle = handle.clone();
        let candidate_session = session_id.to_string();
        tokio::spawn(async move {
            while let Some(candidate) = candidate_rx.recv().await {
                let payload = IcePayload {
                    session_id: candidate_session.clone(),
                    candidate,
                    from_desktop: Some(true),
                };
                if let Ok(value) = serde_json::to_value(&payload) {
                    candidate_handle.send(&candidate_session, KIND_WEBRTC_ICE, value);
                }
            }
        });

        let offer = media.create_offer().await?;

        {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(session_id) else {
                // Guest vanished while the connection was being built
                drop(sessions);
                media.close().await;
                return Err(GuestError::UnknownSession(session_id.to_string()));
            };
            session.media = Some(media);
            session.phase = GuestPhase::Signaling;
        }

        let payload = OfferPayload {
            session_id: session_id.to_string(),
            offer,
        };
        handle.send(
            session_id,
            KIND_WEBRTC_OFFER,
            serde_json::to_value(&payload)
                .map_err(|e| GuestError::Signaling(e.to_string()))?,
        );
        info!("Sent media offer to guest {session_id}");
        Ok(())
    }

    async fn on_answer(&self, message: &Message) -> Result<(), GuestError> {
        let payload: AnswerPayload = serde_json::from_value(message.payload.clone())
            .map_err(|e| GuestError::Signaling(e.to_string()))?;

        let media = {
            let sessions = self.sessions.lock().await;
            sessions
                .get(&payload.session_id)
                .and_then(|s| s.media.clone())
                .ok_or_else(|| GuestError::UnknownSession(payload.session_id.clone()))?
        };

        media.apply_answer(&payload.answer).await?;
        self.set_phase(&payload.session_id, GuestPhase::Active).await;
        info!("Guest {} media channel active", payload.session_id);
        Ok(())
    }

    async fn on_ice(&self, message: &Message) -> Result<(), GuestError> {
        let payload: IcePayload = serde_json::from_value(message.payload.clone())
            .map_err(|e| GuestError::Signaling(e.to_string()))?;

        // Our own relayed candidates can bounce back on the broadcast path
        if payload.from_desktop == Some(true) {
            return Ok(());
        }

        let media = {
            let sessions = self.sessions.lock().await;
            sessions
                .get(&payload.session_id)
                .and_then(|s| s.media.clone())
        };

        match media {
            Some(media) => media.add_remote_candidate(&payload.candidate).await,
            // Candidates racing ahead of the offer are dropped; the guest
            // re-sends once the handshake completes
            None => {
                debug!("Dropping early candidate for guest {}", payload.session_id);
                Ok(())
            }
        }
    }

    async fn on_guest_disconnected(&self, session_id: &str) {
        let removed = self.sessions.lock().await.remove(session_id);
        if let Some(mut session) = removed {
            if let Some(media) = session.media.take() {
                media.close().await;
            }
            session.phase = GuestPhase::Closed;
            info!("Guest disconnected: {session_id}");
        }
    }

    async fn set_phase(&self, session_id: &str, phase: GuestPhase) {
        if let Some(session) = self.sessions.lock().await.get_mut(session_id) {
            debug!("Guest {session_id}: {} -> {}", session.phase, phase);
            session.phase = phase;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_control_frames_parse_from_tagged_json() {
        let value = json!({"type": "auth-response", "pin": "4321"});
        assert_eq!(
            GuestPayload::from_value(&value),
            Some(GuestPayload::AuthResponse {
                pin: "4321".to_string()
            })
        );

        let value = json!({"type": "auth-challenge"});
        assert_eq!(GuestPayload::from_value(&value), Some(GuestPayload::AuthChallenge));
    }

    #[test]
    fn test_bare_string_is_chat() {
        let value = json!("hello there");
        assert_eq!(
            GuestPayload::from_value(&value),
            Some(GuestPayload::Chat {
                text: "hello there".to_string()
            })
        );
    }

    #[test]
    fn test_untyped_object_is_not_a_control_frame() {
        // A chat message that merely looks like JSON must not be
        // promoted to a control frame.
        assert_eq!(GuestPayload::from_value(&json!({"pin": "1234"})), None);
        assert_eq!(GuestPayload::from_value(&json!({"type": "unknown"})), None);
    }

    #[test]
    fn test_control_frame_wire_shape() {
        let value = GuestPayload::AuthResponse {
            pin: "0000".to_string(),
        }
        .to_value();

        assert_eq!(value["type"], "auth-response");
        assert_eq!(value["pin"], "0000");

        assert_eq!(GuestPayload::AuthFailed.to_value(), json!({"type": "auth-failed"}));
    }

    #[test]
    fn test_ice_payload_round_trip() {
        let payload = IcePayload {
            session_id: "g-1".to_string(),
            candidate: json!({"candidate": "candidate:1 1 UDP 1 10.0.0.1 5000 typ host"}),
            from_desktop: Some(true),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["sessionId"], "g-1");
        assert_eq!(value["fromDesktop"], true);

        let back: IcePayload = serde_json::from_value(value).unwrap();
        assert_eq!(back.session_id, "g-1");
        assert_eq!(back.from_desktop, Some(true));
    }

    #[tokio::test]
    async fn test_sessions_start_empty() {
        let bridge = GuestBridge::new(
            PinPolicy::new("http://127.0.0.1:1"),
            vec![],
            Arc::new(NullAudioSink),
        );
        assert_eq!(bridge.session_count().await, 0);
        assert_eq!(bridge.phase("nope").await, None);
    }
}
