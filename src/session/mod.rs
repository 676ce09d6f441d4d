//! Session client
//!
//! Owns the socket lifecycle: transport selection, registration
//! handshake, message routing, bounded reconnection, and state
//! publication. One client per process is the expected shape, but nothing
//! here is global - construct as many as tests need.
//!
//! Subscribers get state through a `watch` channel (every transition is
//! published) and application messages through a `broadcast` channel.
//! The client never decrypts envelopes on its own; payload protection is
//! layered by the caller.

pub mod protocol;

use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

use crate::api::{ApiError, RelayApi};
use crate::config::{ClientConfig, PairingUrl};
use crate::guest::GuestBridge;
use crate::identity::{load_or_create_device_id, IdentityStore};
use crate::transport::{select_target, TransportError, TransportResult, TransportTarget};
use protocol::{
    DeviceInfo, DeviceRole, Frame, Message, RegisterData, RegistrySync, KIND_REGISTRY_SYNC,
};

/// Connection lifecycle phase
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    /// No socket; the idle and terminal state
    Disconnected,
    /// Transport selected, socket opening or registration in flight
    Connecting,
    /// Registration acknowledged; messages flow
    Registered,
}

/// Process-wide session snapshot, published on every transition
#[derive(Clone, Debug, Default)]
pub struct SessionState {
    /// True once registered
    pub connected: bool,
    /// Our device identifier
    pub device_id: Option<String>,
    /// The pairing token in use
    pub pairing_token: Option<String>,
    /// Devices currently visible in the room (excluding ourselves)
    pub connected_devices: Vec<DeviceInfo>,
    /// Most recent transport or registration error
    pub error: Option<String>,
}

/// Errors surfaced from session entry points
#[derive(Error, Debug)]
pub enum SessionError {
    /// Relay HTTP call failed
    #[error("Relay API error: {0}")]
    Api(#[from] ApiError),

    /// Identity could not be loaded or persisted
    #[error("Identity store error: {0}")]
    Identity(#[from] std::io::Error),

    /// A session is already connecting or registered
    #[error("Session already active")]
    AlreadyActive,

    /// The pairing URL did not parse
    #[error("Malformed pairing URL")]
    InvalidPairingUrl,
}

/// State shared between the client, its driver task, and handles
struct Shared {
    phase: RwLock<SessionPhase>,
    state_tx: watch::Sender<SessionState>,
    message_tx: broadcast::Sender<Message>,
    outbound: RwLock<Option<mpsc::Sender<Frame>>>,
    device_id: RwLock<Option<String>>,
}

impl Shared {
    fn publish(&self, mutate: impl FnOnce(&mut SessionState)) {
        self.state_tx.send_modify(mutate);
    }

    fn send_message(&self, target: &str, kind: &str, payload: serde_json::Value) -> bool {
        if *self.phase.read().unwrap() != SessionPhase::Registered {
            return false;
        }
        let Some(device_id) = self.device_id.read().unwrap().clone() else {
            return false;
        };
        let Some(tx) = self.outbound.read().unwrap().clone() else {
            return false;
        };

        let message = Message::new(kind, &device_id, target, payload);
        tx.try_send(Frame::Message(message)).is_ok()
    }
}

/// Cloneable sending/subscription handle onto a live session
///
/// Handed to collaborators (the guest bridge) so they can push outbound
/// messages without owning the client.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    /// Fire-and-forget send; false when not registered
    pub fn send(&self, target: &str, kind: &str, payload: serde_json::Value) -> bool {
        self.shared.send_message(target, kind, payload)
    }

    /// Our device identifier, once known
    pub fn device_id(&self) -> Option<String> {
        self.shared.device_id.read().unwrap().clone()
    }

    /// Subscribe to incoming application messages
    pub fn subscribe_messages(&self) -> broadcast::Receiver<Message> {
        self.shared.message_tx.subscribe()
    }
}

/// The session client
pub struct SessionClient {
    config: ClientConfig,
    api: RelayApi,
    store: Arc<dyn IdentityStore>,
    guest_bridge: RwLock<Option<Arc<GuestBridge>>>,
    shared: Arc<Shared>,
    shutdown: RwLock<Option<watch::Sender<bool>>>,
}

impl SessionClient {
    /// Create a client; nothing connects until an entry point is called
    pub fn new(config: ClientConfig, store: Arc<dyn IdentityStore>) -> Self {
        let api = RelayApi::new(&config.relay_url);
        let (state_tx, _) = watch::channel(SessionState::default());
        let (message_tx, _) = broadcast::channel(256);

        SessionClient {
            config,
            api,
            store,
            guest_bridge: RwLock::new(None),
            shared: Arc::new(Shared {
                phase: RwLock::new(SessionPhase::Disconnected),
                state_tx,
                message_tx,
                outbound: RwLock::new(None),
                device_id: RwLock::new(None),
            }),
            shutdown: RwLock::new(None),
        }
    }

    /// Attach the guest bridge to arm once a desktop session registers
    pub fn set_guest_bridge(&self, bridge: Arc<GuestBridge>) {
        *self.guest_bridge.write().unwrap() = Some(bridge);
    }

    /// Subscribe to state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// Subscribe to incoming application messages
    pub fn subscribe_messages(&self) -> broadcast::Receiver<Message> {
        self.shared.message_tx.subscribe()
    }

    /// Current state snapshot
    pub fn state(&self) -> SessionState {
        self.shared.state_tx.borrow().clone()
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> SessionPhase {
        *self.shared.phase.read().unwrap()
    }

    /// Sending handle for collaborators
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: self.shared.clone(),
        }
    }

    /// Host a room (desktop role): mint a pairing token and connect
    ///
    /// Returns the token to embed in a pairing link. Registration
    /// progress is published through the state channel.
    pub async fn create_room(&self) -> Result<String, SessionError> {
        let device_id = load_or_create_device_id(self.store.as_ref()).await?;
        let token = self.api.generate_pairing_token().await?;
        self.connect(device_id.as_str(), DeviceRole::Desktop, &token, None)
            .await?;
        Ok(token)
    }

    /// Join a room (mobile role) with a bare token, relay path only
    pub async fn join_with_token(&self, token: &str) -> Result<(), SessionError> {
        let device_id = load_or_create_device_id(self.store.as_ref()).await?;
        self.connect(device_id.as_str(), DeviceRole::Mobile, token, None)
            .await
    }

    /// Join a room from a full pairing URL
    ///
    /// The URL's relay and local candidate both take precedence over the
    /// configured relay.
    pub async fn join_with_pairing_url(&self, url: &str) -> Result<(), SessionError> {
        let pairing = PairingUrl::parse(url).ok_or(SessionError::InvalidPairingUrl)?;
        let device_id = load_or_create_device_id(self.store.as_ref()).await?;
        self.connect_via(
            &pairing.relay,
            device_id.as_str(),
            DeviceRole::Mobile,
            &pairing.token,
            pairing.local.as_deref(),
        )
        .await
    }

    /// Select a transport and open the session against the configured relay
    pub async fn connect(
        &self,
        device_id: &str,
        role: DeviceRole,
        token: &str,
        local_candidate: Option<&str>,
    ) -> Result<(), SessionError> {
        let relay_url = self.config.relay_url.clone();
        self.connect_via(&relay_url, device_id, role, token, local_candidate)
            .await
    }

    /// Select a transport and open the session
    ///
    /// Runs the connection selector once, then spawns the driver task
    /// that owns the socket for the rest of this session.
    async fn connect_via(
        &self,
        relay_url: &str,
        device_id: &str,
        role: DeviceRole,
        token: &str,
        local_candidate: Option<&str>,
    ) -> Result<(), SessionError> {
        {
            let mut phase = self.shared.phase.write().unwrap();
            if *phase != SessionPhase::Disconnected {
                return Err(SessionError::AlreadyActive);
            }
            *phase = SessionPhase::Connecting;
        }

        *self.shared.device_id.write().unwrap() = Some(device_id.to_string());
        let device_id_owned = device_id.to_string();
        let token_owned = token.to_string();
        self.shared.publish(move |state| {
            *state = SessionState {
                connected: false,
                device_id: Some(device_id_owned),
                pairing_token: Some(token_owned),
                connected_devices: Vec::new(),
                error: None,
            };
        });

        let target = select_target(local_candidate, relay_url, self.config.probe_timeout_ms).await;
        info!(
            "Connecting via {} transport: {}",
            target.kind,
            target.ws_url()
        );

        let register = RegisterData {
            device_id: device_id.to_string(),
            role,
            name: self.config.device_name.clone(),
            token: token.to_string(),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.write().unwrap() = Some(shutdown_tx);

        let bridge = self.guest_bridge.read().unwrap().clone();
        tokio::spawn(drive_session(
            self.shared.clone(),
            self.config.clone(),
            target,
            register,
            bridge,
            shutdown_rx,
        ));

        Ok(())
    }

    /// Fire-and-forget send; false and no emission unless registered
    pub fn send(&self, target: &str, kind: &str, payload: serde_json::Value) -> bool {
        self.shared.send_message(target, kind, payload)
    }

    /// Tear down the socket and clear session state
    ///
    /// This is the sole cancellation primitive. It does not close any
    /// guest peer connections; use [`GuestBridge::shutdown`] for that.
    pub async fn disconnect(&self) {
        if let Some(tx) = self.shutdown.write().unwrap().take() {
            let _ = tx.send(true);
        }
        *self.shared.phase.write().unwrap() = SessionPhase::Disconnected;
        *self.shared.outbound.write().unwrap() = None;
        self.shared.publish(|state| *state = SessionState::default());
        info!("Session disconnected");
    }
}

/// How one socket lifetime ended
enum ConnectionEnd {
    /// Explicit disconnect() - stop driving
    Shutdown,
    /// Socket closed or errored after being established
    Dropped(Option<String>),
}

/// Drives connect / register / route / reconnect for one session
async fn drive_session(
    shared: Arc<Shared>,
    config: ClientConfig,
    target: TransportTarget,
    register: RegisterData,
    bridge: Option<Arc<GuestBridge>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;
    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        let outcome = run_connection(
            &shared,
            &config,
            &target,
            &register,
            bridge.clone(),
            &mut shutdown_rx,
        )
        .await;

        let was_registered = *shared.phase.read().unwrap() == SessionPhase::Registered;

        match outcome {
            Ok(ConnectionEnd::Shutdown) => {
                // disconnect() already reset the published state
                return;
            }
            Ok(ConnectionEnd::Dropped(error)) => {
                *shared.phase.write().unwrap() = SessionPhase::Disconnected;
                *shared.outbound.write().unwrap() = None;
                warn!(
                    "Connection dropped: {}",
                    error.as_deref().unwrap_or("closed")
                );
                shared.publish(|state| {
                    state.connected = false;
                    state.connected_devices.clear();
                    state.error = error;
                });
                // A session that made it to registered gets a fresh
                // reconnect budget.
                if was_registered {
                    attempt = 0;
                }
            }
            Err(e) => {
                *shared.phase.write().unwrap() = SessionPhase::Disconnected;
                *shared.outbound.write().unwrap() = None;
                debug!("Connection attempt failed: {e}");
                let text = e.to_string();
                shared.publish(move |state| {
                    state.connected = false;
                    state.connected_devices.clear();
                    state.error = Some(text);
                });
            }
        }

        attempt += 1;
        if attempt >= config.reconnect_attempts {
            warn!(
                "Giving up after {} connection attempts",
                config.reconnect_attempts
            );
            return;
        }

        let delay = Duration::from_millis(config.reconnect_base_delay_ms * u64::from(attempt));
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown_rx.changed() => {
                // A dropped sender means the client is gone
                if changed.is_err() || *shutdown_rx.borrow() {
                    return;
                }
            }
        }
        *shared.phase.write().unwrap() = SessionPhase::Connecting;
    }
}

/// One socket lifetime: open, register, route frames until it ends
async fn run_connection(
    shared: &Arc<Shared>,
    config: &ClientConfig,
    target: &TransportTarget,
    register: &RegisterData,
    bridge: Option<Arc<GuestBridge>>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> TransportResult<ConnectionEnd> {
    let ws_url = target.ws_url();
    let connected = tokio::time::timeout(
        Duration::from_millis(config.connect_timeout_ms),
        connect_async(&ws_url),
    )
    .await;

    let (ws, _) = match connected {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => return Err(TransportError::ConnectionFailed(e.to_string())),
        Err(_) => return Err(TransportError::Timeout),
    };
    let (mut write, mut read) = ws.split();

    // Registration goes out as soon as the transport is up
    write
        .send(WsMessage::Text(Frame::Register(register.clone()).to_json()))
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(64);
    *shared.outbound.write().unwrap() = Some(outbound_tx);

    let mut registered = false;
    let mut bridge_armed = false;

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok(ConnectionEnd::Shutdown);
                }
            }
            outbound = outbound_rx.recv() => {
                let Some(frame) = outbound else {
                    return Ok(ConnectionEnd::Dropped(None));
                };
                if let Err(e) = write.send(WsMessage::Text(frame.to_json())).await {
                    return Ok(ConnectionEnd::Dropped(Some(e.to_string())));
                }
            }
            incoming = read.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_frame(
                            shared,
                            register,
                            &bridge,
                            &text,
                            &mut registered,
                            &mut bridge_armed,
                        )?;
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = write.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        return Ok(ConnectionEnd::Dropped(None));
                    }
                    Some(Err(e)) => {
                        return Ok(ConnectionEnd::Dropped(Some(e.to_string())));
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

/// Dispatch one inbound text frame
fn handle_frame(
    shared: &Arc<Shared>,
    register: &RegisterData,
    bridge: &Option<Arc<GuestBridge>>,
    text: &str,
    registered: &mut bool,
    bridge_armed: &mut bool,
) -> TransportResult<()> {
    match Frame::from_json(text) {
        Some(Frame::Registered(data)) => {
            *registered = true;
            *shared.phase.write().unwrap() = SessionPhase::Registered;
            let own_id = register.device_id.clone();
            let devices: Vec<DeviceInfo> = data
                .devices
                .into_iter()
                .filter(|d| d.device_id != own_id)
                .collect();
            shared.publish(move |state| {
                state.connected = true;
                state.device_id = Some(own_id);
                state.connected_devices = devices;
                state.error = None;
            });
            info!("Registered as {} ({})", data.device_id, register.role);

            if register.role == DeviceRole::Desktop && !*bridge_armed {
                if let Some(bridge) = bridge {
                    bridge.clone().arm(SessionHandle {
                        shared: shared.clone(),
                    });
                    *bridge_armed = true;
                }
            }
            Ok(())
        }
        Some(Frame::Message(message)) => {
            if message.kind == KIND_REGISTRY_SYNC {
                match serde_json::from_value::<RegistrySync>(message.payload.clone()) {
                    Ok(sync) => {
                        let own_id = register.device_id.clone();
                        let devices: Vec<DeviceInfo> = sync
                            .devices
                            .into_iter()
                            .filter(|d| d.device_id != own_id)
                            .collect();
                        shared.publish(move |state| state.connected_devices = devices);
                    }
                    Err(e) => debug!("Ignoring malformed registry sync: {e}"),
                }
            } else {
                // Forwarded verbatim; envelope handling is the caller's
                let _ = shared.message_tx.send(message);
            }
            Ok(())
        }
        Some(Frame::Error { message }) => {
            warn!("Relay error: {message}");
            if !*registered {
                return Err(TransportError::RegistrationRejected(message));
            }
            shared.publish(move |state| state.error = Some(message));
            Ok(())
        }
        Some(Frame::Register(_)) => Ok(()),
        None => {
            debug!("Ignoring malformed frame");
            Ok(())
        }
    }
}
