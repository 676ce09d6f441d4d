//! Reference relay server
//!
//! A room-based message broker: one desktop owns a room keyed by its
//! pairing token, mobiles join with the token, guests join with a minted
//! session id. The relay never inspects payloads - enveloped or plain,
//! they route by `target` only.
//!
//! The same router serves both deployment shapes: hosted in the cloud
//! (relay transport) and embedded in the desktop process listening on the
//! LAN (local transport), which is what the `/handshake` liveness
//! endpoint and the `/device` WebSocket path exist for.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::session::protocol::{
    DeviceInfo, DeviceRole, Frame, Message, RegisteredData, RegistrySync, KIND_GUEST_CONNECTED,
    KIND_GUEST_DISCONNECTED, KIND_REGISTRY_SYNC, TARGET_ALL,
};
use crate::transport::{HANDSHAKE_PATH, LOCAL_WS_PATH, RELAY_WS_PATH};

/// Synthetic source id for relay-originated messages
const RELAY_SOURCE: &str = "relay";

/// A room: one desktop plus its token-joined mobiles and guests
struct Room {
    /// Fan-out to every member; each member filters by target
    tx: broadcast::Sender<Message>,
    devices: RwLock<HashMap<String, DeviceInfo>>,
}

impl Room {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Room {
            tx,
            devices: RwLock::new(HashMap::new()),
        }
    }

    async fn snapshot(&self) -> Vec<DeviceInfo> {
        self.devices.read().await.values().cloned().collect()
    }

    async fn desktop_id(&self) -> Option<String> {
        self.devices
            .read()
            .await
            .values()
            .find(|d| d.role == DeviceRole::Desktop)
            .map(|d| d.device_id.clone())
    }

    async fn broadcast_registry(&self) {
        let devices = self.snapshot().await;
        let payload = serde_json::to_value(&RegistrySync { devices })
            .expect("registry sync serializes infallibly");
        let _ = self.tx.send(Message::new(
            KIND_REGISTRY_SYNC,
            RELAY_SOURCE,
            TARGET_ALL,
            payload,
        ));
    }

    fn notify(&self, kind: &str, target: &str, payload: serde_json::Value) {
        let _ = self.tx.send(Message::new(kind, RELAY_SOURCE, target, payload));
    }
}

/// Shared relay state
pub struct RelayState {
    /// Pairing token -> room
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    /// Guest session id -> pairing token
    guest_sessions: RwLock<HashMap<String, String>>,
    /// Desktop device id -> pairing token, for guest minting
    desktop_rooms: RwLock<HashMap<String, String>>,
    /// Base URL baked into minted guest links
    public_url: String,
}

impl RelayState {
    /// Fresh state advertising the given public base URL
    pub fn new(public_url: impl Into<String>) -> Self {
        RelayState {
            rooms: RwLock::new(HashMap::new()),
            guest_sessions: RwLock::new(HashMap::new()),
            desktop_rooms: RwLock::new(HashMap::new()),
            public_url: public_url.into(),
        }
    }

    async fn create_room(&self) -> String {
        let token = Uuid::new_v4().to_string();
        self.rooms
            .write()
            .await
            .insert(token.clone(), Arc::new(Room::new()));
        info!("Room created for token {token}");
        token
    }

    /// Resolve the room a registration belongs to
    async fn resolve_room(&self, role: DeviceRole, token: &str) -> Option<(String, Arc<Room>)> {
        let token = match role {
            DeviceRole::Guest => self.guest_sessions.read().await.get(token)?.clone(),
            _ => token.to_string(),
        };
        let room = self.rooms.read().await.get(&token).cloned()?;
        Some((token, room))
    }

    async fn cleanup_room(&self, token: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(token) {
            if room.devices.read().await.is_empty() {
                rooms.remove(token);
                info!("Room removed for token {token}");
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct PairingTokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GuestGenerateRequest {
    desktop_device_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GuestGenerateResponse {
    session_id: String,
    guest_url: String,
}

/// Build the relay router
pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route(HANDSHAKE_PATH, get(handshake))
        .route("/pairing/generate", post(pairing_generate))
        .route("/guest/generate", post(guest_generate))
        .route(RELAY_WS_PATH, get(ws_handler))
        .route(LOCAL_WS_PATH, get(ws_handler))
        .with_state(state)
}

/// Liveness endpoint for the LAN probe
async fn handshake() -> &'static str {
    "ok"
}

async fn pairing_generate(State(state): State<Arc<RelayState>>) -> Json<PairingTokenResponse> {
    let token = state.create_room().await;
    Json(PairingTokenResponse { token })
}

async fn guest_generate(
    State(state): State<Arc<RelayState>>,
    Json(request): Json<GuestGenerateRequest>,
) -> Result<Json<GuestGenerateResponse>, StatusCode> {
    let token = state
        .desktop_rooms
        .read()
        .await
        .get(&request.desktop_device_id)
        .cloned()
        .ok_or(StatusCode::NOT_FOUND)?;

    let session_id = Uuid::new_v4().to_string();
    state
        .guest_sessions
        .write()
        .await
        .insert(session_id.clone(), token);

    let guest_url = format!("{}/guest/{session_id}", state.public_url);
    info!("Guest session {session_id} minted for desktop {}", request.desktop_device_id);
    Ok(Json(GuestGenerateResponse {
        session_id,
        guest_url,
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<RelayState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Drive one member connection: register, then route until it closes
async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut write, mut read) = socket.split();

    // First frame must be a registration
    let register = loop {
        match read.next().await {
            Some(Ok(WsMessage::Text(text))) => match Frame::from_json(&text) {
                Some(Frame::Register(data)) => break data,
                _ => {
                    let _ = write
                        .send(WsMessage::Text(
                            Frame::Error {
                                message: "Expected register frame".to_string(),
                            }
                            .to_json(),
                        ))
                        .await;
                    return;
                }
            },
            Some(Ok(WsMessage::Ping(data))) => {
                let _ = write.send(WsMessage::Pong(data)).await;
            }
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return,
        }
    };

    let Some((token, room)) = state.resolve_room(register.role, &register.token).await else {
        warn!("Registration with unknown token rejected");
        let _ = write
            .send(WsMessage::Text(
                Frame::Error {
                    message: "Unknown pairing token".to_string(),
                }
                .to_json(),
            ))
            .await;
        return;
    };

    let device_id = register.device_id.clone();
    let info = DeviceInfo {
        device_id: device_id.clone(),
        role: register.role,
        name: register.name.clone(),
    };

    room.devices
        .write()
        .await
        .insert(device_id.clone(), info.clone());
    if register.role == DeviceRole::Desktop {
        state
            .desktop_rooms
            .write()
            .await
            .insert(device_id.clone(), token.clone());
    }

    let mut room_rx = room.tx.subscribe();

    let ack = Frame::Registered(RegisteredData {
        device_id: device_id.clone(),
        devices: room.snapshot().await,
    });
    if write.send(WsMessage::Text(ack.to_json())).await.is_err() {
        room.devices.write().await.remove(&device_id);
        return;
    }
    info!("Registered {} as {}", device_id, register.role);

    // A fresh guest is announced to the room's desktop so it can start
    // the PIN / signaling flow
    if register.role == DeviceRole::Guest {
        if let Some(desktop_id) = room.desktop_id().await {
            room.notify(
                KIND_GUEST_CONNECTED,
                &desktop_id,
                serde_json::json!({ "sessionId": device_id }),
            );
        }
    }
    room.broadcast_registry().await;

    loop {
        tokio::select! {
            incoming = read.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        match Frame::from_json(&text) {
                            Some(Frame::Message(mut message)) => {
                                // The relay is authoritative about sources
                                message.source = device_id.clone();
                                let _ = room.tx.send(message);
                            }
                            Some(_) => debug!("Ignoring non-message frame from {device_id}"),
                            None => debug!("Ignoring malformed frame from {device_id}"),
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = write.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("Socket error from {device_id}: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
            routed = room_rx.recv() => {
                match routed {
                    Ok(message) => {
                        if message.source != device_id && message.addresses(&device_id) {
                            let frame = Frame::Message(message);
                            if write.send(WsMessage::Text(frame.to_json())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Member {device_id} lagged, dropped {skipped} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    // Departure: drop membership, tell the desktop about lost guests,
    // publish the shrunk registry
    room.devices.write().await.remove(&device_id);
    if register.role == DeviceRole::Desktop {
        state.desktop_rooms.write().await.remove(&device_id);
    }
    if register.role == DeviceRole::Guest {
        state.guest_sessions.write().await.remove(&register.token);
        if let Some(desktop_id) = room.desktop_id().await {
            room.notify(
                KIND_GUEST_DISCONNECTED,
                &desktop_id,
                serde_json::json!({ "sessionId": device_id }),
            );
        }
    }
    room.broadcast_registry().await;
    info!("Disconnected {device_id}");

    state.cleanup_room(&token).await;
}

/// A running relay, for embedding and tests
pub struct RelayHandle {
    /// Bound address
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl RelayHandle {
    /// HTTP base URL of this relay
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop serving
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Bind and serve a relay in a background task
pub async fn spawn(addr: SocketAddr) -> std::io::Result<RelayHandle> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;
    let state = Arc::new(RelayState::new(format!("http://{addr}")));
    let app = router(state);

    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("Relay server stopped: {e}");
        }
    });

    info!("Relay listening on {addr}");
    Ok(RelayHandle { addr, task })
}

/// Serve a relay on the current task (for the binary)
pub async fn serve(addr: SocketAddr, public_url: Option<String>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;
    let public_url = public_url.unwrap_or_else(|| format!("http://{addr}"));
    let state = Arc::new(RelayState::new(public_url));

    info!("Relay listening on {addr}");
    axum::serve(listener, router(state)).await
}
