//! Guest admission and signaling flow against an in-process relay

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tether::guest::GuestPayload;
use tether::session::protocol::{
    DeviceRole, Frame, Message, RegisterData, KIND_CHAT, KIND_WEBRTC_OFFER,
};
use tether::{
    relay, ClientConfig, GuestBridge, GuestPhase, MemoryIdentityStore, NullAudioSink, PinPolicy,
    RelayApi, SessionClient,
};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream,
    WebSocketStream};

const WAIT: Duration = Duration::from_secs(10);
const QUIET: Duration = Duration::from_millis(500);

/// Stub of the external PIN-policy service; "1234" is the valid PIN
async fn spawn_pin_stub(pin_required: bool) -> SocketAddr {
    let app = axum::Router::new()
        .route(
            "/remote-access/info",
            axum::routing::get(move || async move {
                axum::Json(json!({"pinRequired": pin_required, "ip": "127.0.0.1"}))
            }),
        )
        .route(
            "/remote-access/verify-pin",
            axum::routing::post(|axum::Json(body): axum::Json<serde_json::Value>| async move {
                axum::Json(json!({"valid": body["pin"] == "1234"}))
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// Minimal raw-socket guest, standing in for the web client
struct GuestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    session_id: String,
}

impl GuestClient {
    async fn connect(relay_url: &str, session_id: &str) -> Self {
        let ws_url = format!("{}/ws", relay_url.replace("http://", "ws://"));
        let (mut ws, _) = connect_async(&ws_url).await.unwrap();

        let register = Frame::Register(RegisterData {
            device_id: session_id.to_string(),
            role: DeviceRole::Guest,
            name: "web-guest".to_string(),
            token: session_id.to_string(),
        });
        ws.send(WsMessage::Text(register.to_json())).await.unwrap();

        // Wait for the registration ack
        loop {
            match ws.next().await.expect("socket closed").unwrap() {
                WsMessage::Text(text) => {
                    if let Some(Frame::Registered(_)) = Frame::from_json(&text) {
                        break;
                    }
                }
                _ => continue,
            }
        }

        GuestClient {
            ws,
            session_id: session_id.to_string(),
        }
    }

    /// Next application message, skipping registry noise
    async fn next_message(&mut self) -> Message {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.ws.next().await.expect("socket closed").unwrap() {
                    WsMessage::Text(text) => {
                        if let Some(Frame::Message(msg)) = Frame::from_json(&text) {
                            if msg.kind != "registry-sync" {
                                return msg;
                            }
                        }
                    }
                    _ => continue,
                }
            }
        })
        .await
        .expect("timed out waiting for a guest message")
    }

    /// Assert nothing but registry noise arrives for a quiet period
    async fn assert_quiet(&mut self, reason: &str) {
        let outcome = tokio::time::timeout(QUIET, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Some(Frame::Message(msg)) = Frame::from_json(&text) {
                            if msg.kind != "registry-sync" {
                                return msg;
                            }
                        }
                    }
                    _ => continue,
                }
            }
        })
        .await;

        if let Ok(msg) = outcome {
            panic!("expected quiet ({reason}), got {} message", msg.kind);
        }
    }

    /// Assert no further offers arrive for a quiet period
    async fn assert_no_more_offers(&mut self) {
        let outcome = tokio::time::timeout(QUIET, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Some(Frame::Message(msg)) = Frame::from_json(&text) {
                            if msg.kind == KIND_WEBRTC_OFFER {
                                return msg;
                            }
                        }
                    }
                    _ => continue,
                }
            }
        })
        .await;

        assert!(outcome.is_err(), "received a duplicate offer");
    }

    async fn send_to_desktop(&mut self, desktop_id: &str, payload: serde_json::Value) {
        let msg = Message::new(KIND_CHAT, &self.session_id, desktop_id, payload);
        self.ws
            .send(WsMessage::Text(Frame::Message(msg).to_json()))
            .await
            .unwrap();
    }

    async fn close(mut self) {
        let _ = self.ws.send(WsMessage::Close(None)).await;
    }
}

/// Desktop with an armed guest bridge, registered on the given relay
async fn registered_desktop(
    relay_url: &str,
    policy_url: &str,
) -> (SessionClient, Arc<GuestBridge>, String) {
    let client = SessionClient::new(
        ClientConfig::with_relay(relay_url),
        Arc::new(MemoryIdentityStore::new()),
    );

    // No STUN servers: host candidates are enough in-process
    let bridge = Arc::new(GuestBridge::new(
        PinPolicy::new(policy_url),
        vec![],
        Arc::new(NullAudioSink),
    ));
    client.set_guest_bridge(bridge.clone());

    let mut state = client.subscribe_state();
    client.create_room().await.unwrap();
    tokio::time::timeout(WAIT, async {
        loop {
            if state.borrow().connected {
                return;
            }
            state.changed().await.unwrap();
        }
    })
    .await
    .expect("desktop never registered");

    let desktop_id = client.state().device_id.unwrap();
    (client, bridge, desktop_id)
}

#[tokio::test]
async fn pin_gate_challenge_precedes_any_offer() {
    let relay = relay::spawn("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let stub = spawn_pin_stub(true).await;
    let (desktop, bridge, desktop_id) =
        registered_desktop(&relay.base_url(), &format!("http://{stub}")).await;

    let session = RelayApi::new(relay.base_url())
        .generate_guest_session(&desktop_id)
        .await
        .unwrap();
    let mut guest = GuestClient::connect(&relay.base_url(), &session.session_id).await;

    // The very first thing a gated guest sees is the challenge
    let first = guest.next_message().await;
    assert_eq!(first.kind, KIND_CHAT);
    assert_eq!(
        GuestPayload::from_value(&first.payload),
        Some(GuestPayload::AuthChallenge)
    );

    // Wrong PIN: auth-failed, and no offer follows
    guest
        .send_to_desktop(
            &desktop_id,
            GuestPayload::AuthResponse {
                pin: "0000".to_string(),
            }
            .to_value(),
        )
        .await;
    let reply = guest.next_message().await;
    assert_eq!(
        GuestPayload::from_value(&reply.payload),
        Some(GuestPayload::AuthFailed)
    );
    guest.assert_quiet("no offer after failed PIN").await;
    assert_eq!(
        bridge.phase(&session.session_id).await,
        Some(GuestPhase::AuthChallenged)
    );

    // Correct PIN: auth-success, then exactly one offer
    guest
        .send_to_desktop(
            &desktop_id,
            GuestPayload::AuthResponse {
                pin: "1234".to_string(),
            }
            .to_value(),
        )
        .await;
    let success = guest.next_message().await;
    assert_eq!(
        GuestPayload::from_value(&success.payload),
        Some(GuestPayload::AuthSuccess)
    );

    let offer = loop {
        let msg = guest.next_message().await;
        // ICE candidates may interleave once signaling starts
        if msg.kind == KIND_WEBRTC_OFFER {
            break msg;
        }
        assert_ne!(msg.kind, KIND_CHAT, "unexpected control frame before offer");
    };
    assert_eq!(offer.payload["sessionId"], session.session_id.as_str());
    assert!(offer.payload["offer"]["sdp"]
        .as_str()
        .unwrap()
        .contains("m=audio"));

    // Exactly one offer: only ICE traffic may follow it
    guest.assert_no_more_offers().await;

    assert_eq!(
        bridge.phase(&session.session_id).await,
        Some(GuestPhase::Signaling)
    );

    guest.close().await;
    desktop.disconnect().await;
}

#[tokio::test]
async fn unreachable_policy_service_fails_open() {
    let relay = relay::spawn("127.0.0.1:0".parse().unwrap()).await.unwrap();
    // Nothing listens on the policy port: fail-open means no PIN gate
    let (desktop, bridge, desktop_id) =
        registered_desktop(&relay.base_url(), "http://127.0.0.1:9").await;

    let session = RelayApi::new(relay.base_url())
        .generate_guest_session(&desktop_id)
        .await
        .unwrap();
    let mut guest = GuestClient::connect(&relay.base_url(), &session.session_id).await;

    // Straight to signaling, no challenge
    let first = loop {
        let msg = guest.next_message().await;
        assert_ne!(msg.kind, KIND_CHAT, "unexpected auth traffic without a PIN policy");
        if msg.kind == KIND_WEBRTC_OFFER {
            break msg;
        }
    };
    assert_eq!(first.payload["sessionId"], session.session_id.as_str());
    assert_eq!(
        bridge.phase(&session.session_id).await,
        Some(GuestPhase::Signaling)
    );

    guest.close().await;
    desktop.disconnect().await;
}

#[tokio::test]
async fn guest_disconnect_removes_the_session() {
    let relay = relay::spawn("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let (desktop, bridge, desktop_id) =
        registered_desktop(&relay.base_url(), "http://127.0.0.1:9").await;

    let session = RelayApi::new(relay.base_url())
        .generate_guest_session(&desktop_id)
        .await
        .unwrap();
    let guest = GuestClient::connect(&relay.base_url(), &session.session_id).await;

    tokio::time::timeout(WAIT, async {
        while bridge.session_count().await == 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("bridge never saw the guest");

    guest.close().await;

    tokio::time::timeout(WAIT, async {
        while bridge.session_count().await != 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("guest session was not cleaned up");

    desktop.disconnect().await;
}

#[tokio::test]
async fn guest_minting_requires_a_known_desktop() {
    let relay = relay::spawn("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let err = RelayApi::new(relay.base_url())
        .generate_guest_session("nobody-home")
        .await
        .unwrap_err();
    assert!(matches!(err, tether::api::ApiError::BadStatus(404)));
}
