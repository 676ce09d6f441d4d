//! Guest peer media channel
//!
//! Wraps an RTCPeerConnection configured for receive-only audio from a
//! web guest. Signaling (offer/answer/ICE) travels through the session
//! socket; this module only produces and consumes the SDP/candidate
//! payloads. Rendering of received audio is behind the [`AudioSink`]
//! seam - the core never touches an audio device itself.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_remote::TrackRemote;

use super::GuestError;

/// Receiver for guest audio tracks
///
/// The host application renders them; the bridge only delivers.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Called once per inbound audio track
    async fn on_track(&self, session_id: &str, track: Arc<TrackRemote>);
}

/// Sink that drops audio, for headless hosts and tests
pub struct NullAudioSink;

#[async_trait]
impl AudioSink for NullAudioSink {
    async fn on_track(&self, session_id: &str, _track: Arc<TrackRemote>) {
        debug!("Dropping audio track from guest {session_id} (no sink configured)");
    }
}

/// One guest's peer connection
///
/// Exclusively owned by its guest session entry; must be closed before
/// the entry is removed.
pub struct MediaChannel {
    pc: Arc<RTCPeerConnection>,
}

impl MediaChannel {
    /// Build a receive-only audio peer connection
    ///
    /// Locally gathered ICE candidates are pushed into `candidate_tx` as
    /// JSON payloads ready for the signaling relay.
    pub async fn new(
        session_id: &str,
        stun_servers: &[String],
        sink: Arc<dyn AudioSink>,
        candidate_tx: mpsc::Sender<serde_json::Value>,
    ) -> Result<Self, GuestError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await?);

        // Guests only ever send audio toward the desktop
        pc.add_transceiver_from_kind(
            RTPCodecType::Audio,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await?;

        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidate_tx = candidate_tx.clone();
            Box::pin(async move {
                if let Some(c) = candidate {
                    if let Ok(init) = c.to_json() {
                        if let Ok(value) = serde_json::to_value(&init) {
                            let _ = candidate_tx.send(value).await;
                        }
                    }
                }
            })
        }));

        let sink_session = session_id.to_string();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let sink = sink.clone();
            let session_id = sink_session.clone();
            Box::pin(async move {
                info!("Guest {session_id} inbound {} track", track.kind());
                sink.on_track(&session_id, track).await;
            })
        }));

        let state_session = session_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let session_id = state_session.clone();
            Box::pin(async move {
                debug!("Guest {session_id} peer connection state: {state}");
            })
        }));

        Ok(MediaChannel { pc })
    }

    /// Create the local offer and return it as a signaling payload
    pub async fn create_offer(&self) -> Result<serde_json::Value, GuestError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;

        Ok(serde_json::json!({
            "type": "offer",
            "sdp": offer.sdp,
        }))
    }

    /// Apply the guest's answer, completing the handshake
    pub async fn apply_answer(&self, answer: &serde_json::Value) -> Result<(), GuestError> {
        let sdp = answer
            .get("sdp")
            .and_then(|s| s.as_str())
            .ok_or_else(|| GuestError::Signaling("missing sdp in answer".to_string()))?;

        let description = RTCSessionDescription::answer(sdp.to_string())?;
        self.pc.set_remote_description(description).await?;
        Ok(())
    }

    /// Add an ICE candidate relayed from the guest
    pub async fn add_remote_candidate(&self, candidate: &serde_json::Value) -> Result<(), GuestError> {
        let candidate_str = candidate
            .get("candidate")
            .and_then(|c| c.as_str())
            .unwrap_or("");
        if candidate_str.is_empty() {
            // End-of-candidates marker
            return Ok(());
        }

        let init = RTCIceCandidateInit {
            candidate: candidate_str.to_string(),
            sdp_mid: candidate
                .get("sdpMid")
                .and_then(|m| m.as_str())
                .map(|s| s.to_string()),
            sdp_mline_index: candidate
                .get("sdpMLineIndex")
                .and_then(|i| i.as_u64())
                .map(|i| i as u16),
            username_fragment: candidate
                .get("usernameFragment")
                .and_then(|u| u.as_str())
                .map(|s| s.to_string()),
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    /// Close the connection, releasing network and media resources
    pub async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!("Peer connection close error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_stun() -> Vec<String> {
        vec!["stun:stun.l.google.com:19302".to_string()]
    }

    #[tokio::test]
    async fn test_offer_is_audio_receive_only() {
        let (tx, _rx) = mpsc::channel(8);
        let channel = MediaChannel::new("guest-1", &test_stun(), Arc::new(NullAudioSink), tx)
            .await
            .unwrap();

        let offer = channel.create_offer().await.unwrap();
        let sdp = offer["sdp"].as_str().unwrap();

        assert_eq!(offer["type"], "offer");
        assert!(sdp.contains("m=audio"));
        assert!(sdp.contains("a=recvonly"));
        assert!(!sdp.contains("m=video"));

        channel.close().await;
    }

    #[tokio::test]
    async fn test_malformed_answer_is_rejected() {
        let (tx, _rx) = mpsc::channel(8);
        let channel = MediaChannel::new("guest-1", &test_stun(), Arc::new(NullAudioSink), tx)
            .await
            .unwrap();
        channel.create_offer().await.unwrap();

        let err = channel
            .apply_answer(&serde_json::json!({"type": "answer"}))
            .await
            .unwrap_err();
        assert!(matches!(err, GuestError::Signaling(_)));

        channel.close().await;
    }

    #[tokio::test]
    async fn test_end_of_candidates_marker_is_ignored() {
        let (tx, _rx) = mpsc::channel(8);
        let channel = MediaChannel::new("guest-1", &test_stun(), Arc::new(NullAudioSink), tx)
            .await
            .unwrap();

        channel
            .add_remote_candidate(&serde_json::json!({"candidate": ""}))
            .await
            .unwrap();

        channel.close().await;
    }
}
