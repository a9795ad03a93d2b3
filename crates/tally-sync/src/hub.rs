//! # Hub Server
//!
//! The terminal's network face: the channel's WebSocket endpoint and the
//! pairing HTTP routes, on one axum router.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Hub Architecture                               │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                      HubServer (Axum)                           │   │
//! │  │                                                                 │   │
//! │  │  GET  /health                 ──▶ "OK"                         │   │
//! │  │  GET  /ws                     ──▶ WebSocket ──▶ BrokerPort     │   │
//! │  │  POST /devices                ──▶ PairingRegistry::register    │   │
//! │  │  GET  /devices/{id}           ──▶ PairingRegistry::get         │   │
//! │  │  POST /devices/{id}/heartbeat ──▶ PairingRegistry::heartbeat   │   │
//! │  └──────────────────────────────────────┬──────────────────────────┘   │
//! │                                         │                               │
//! │                                         ▼                               │
//! │   ┌────────────┐   memory link   ┌────────────┐   ws   ┌────────────┐  │
//! │   │  Terminal  │ ◀─────────────▶ │   Broker   │ ◀────▶ │  Phone A   │  │
//! │   └────────────┘                 └────────────┘        └────────────┘  │
//! │                                                                         │
//! │  Each socket gets a topic-filtered port: it receives only envelopes    │
//! │  for topics it joined, and never its own publications.                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Error Body
//! ```json
//! { "code": "NOT_FOUND", "message": "Unknown device: 550e8400-..." }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use tally_core::{CoreError, Device};

use crate::error::{PairingError, SyncError, SyncResult, TransportError};
use crate::pairing::PairingRegistry;
use crate::protocol::{Envelope, LinkFrame};
use crate::transport::broker::BrokerPort;
use crate::transport::Broker;

// =============================================================================
// Constants
// =============================================================================

/// Default port for the hub server.
pub const DEFAULT_HUB_PORT: u16 = 8765;

/// Ping interval to keep connections alive.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum message size (1MB).
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

pub const CODE_NOT_FOUND: &str = "NOT_FOUND";
pub const CODE_VALIDATION_ERROR: &str = "VALIDATION_ERROR";
pub const CODE_INVALID_TRANSITION: &str = "INVALID_TRANSITION";
pub const CODE_DATABASE_ERROR: &str = "DATABASE_ERROR";
pub const CODE_INTERNAL_ERROR: &str = "INTERNAL_ERROR";

// =============================================================================
// Hub Configuration
// =============================================================================

/// Configuration for the hub server (`[hub]` in terminal.toml).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Port to listen on. 0 picks a free port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_port() -> u16 {
    DEFAULT_HUB_PORT
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            port: DEFAULT_HUB_PORT,
            bind_addr: default_bind_addr(),
        }
    }
}

impl HubConfig {
    /// Returns the full bind address.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

// =============================================================================
// API Types
// =============================================================================

/// `POST /devices` body. Without `device_id` the hub generates one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub device_id: Option<String>,
    pub name: String,
}

/// JSON error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
}

/// An error on its way out of a handler.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        ApiError {
            status,
            code,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::NOT_FOUND, CODE_NOT_FOUND, message)
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        let message = err.to_string();
        match err {
            SyncError::Pairing(PairingError::UnknownDevice(_)) => ApiError::not_found(message),
            SyncError::Database(ref db) if db.is_not_found() => ApiError::not_found(message),
            SyncError::Core(CoreError::InvalidTransition { .. }) => {
                ApiError::new(StatusCode::CONFLICT, CODE_INVALID_TRANSITION, message)
            }
            SyncError::Core(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, CODE_VALIDATION_ERROR, message)
            }
            SyncError::Database(_) => {
                error!(error = %message, "Database error in hub handler");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, CODE_DATABASE_ERROR, message)
            }
            _ => {
                error!(error = %message, "Unexpected error in hub handler");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, CODE_INTERNAL_ERROR, message)
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            CODE_VALIDATION_ERROR,
            rejection.body_text(),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            code: self.code.to_string(),
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// =============================================================================
// Hub State
// =============================================================================

/// Shared state for the hub server.
#[derive(Debug, Clone)]
pub struct HubState {
    broker: Broker,
    registry: PairingRegistry,
}

impl HubState {
    pub fn new(broker: Broker, registry: PairingRegistry) -> Self {
        HubState { broker, registry }
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn registry(&self) -> &PairingRegistry {
        &self.registry
    }
}

/// Builds the hub's router. Exposed so tests can drive it without a socket.
pub fn router(state: HubState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .route("/devices", post(register_handler))
        .route("/devices/{id}", get(device_handler))
        .route("/devices/{id}/heartbeat", post(heartbeat_handler))
        .with_state(Arc::new(state))
}

// =============================================================================
// Hub Server
// =============================================================================

/// The HTTP + WebSocket server.
pub struct HubServer {
    config: HubConfig,
    state: HubState,
}

/// Handle for controlling the hub server.
#[derive(Debug, Clone)]
pub struct HubHandle {
    local_addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
}

impl HubHandle {
    /// Address actually bound (differs from the config when port is 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shuts down the hub server.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::Internal("Hub shutdown channel closed".into()))
    }
}

impl HubServer {
    pub fn new(config: HubConfig, state: HubState) -> Self {
        HubServer { config, state }
    }

    /// Binds the listener and serves in the background.
    pub async fn start(self) -> SyncResult<HubHandle> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let app = router(self.state);

        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            TransportError::ConnectFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| SyncError::Internal(e.to_string()))?;

        info!(addr = %local_addr, "Hub server started");

        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await;
                    info!("Hub server shutting down");
                })
                .await;
            if let Err(e) = result {
                error!(?e, "Hub server failed");
            }
        });

        Ok(HubHandle {
            local_addr,
            shutdown_tx,
        })
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    "OK"
}

async fn register_handler(
    State(state): State<Arc<HubState>>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Device>)> {
    let Json(request) = body?;

    let device = match request.device_id {
        Some(ref id) => state.registry.register_with_id(id, &request.name).await?,
        None => state.registry.register(&request.name).await?,
    };

    Ok((StatusCode::CREATED, Json(device)))
}

async fn device_handler(
    State(state): State<Arc<HubState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Device>> {
    match state.registry.get(&id).await? {
        Some(device) => Ok(Json(device)),
        None => Err(ApiError::not_found(format!("Unknown device: {}", id))),
    }
}

async fn heartbeat_handler(
    State(state): State<Arc<HubState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Device>> {
    Ok(Json(state.registry.heartbeat(&id).await?))
}

// =============================================================================
// WebSocket Handler
// =============================================================================

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<HubState>>) -> impl IntoResponse {
    let broker = state.broker.clone();
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, broker))
}

/// Bridges one socket into the broker until either side closes.
async fn handle_socket(socket: WebSocket, broker: Broker) {
    let (mut port, mut broker_rx) = broker.attach();
    let port_id = port.id();
    info!(port = port_id, "WebSocket client connected");

    let (mut sender, mut receiver) = socket.split();

    let mut ping = interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await;

    loop {
        tokio::select! {
            message = receiver.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if !reply(&mut sender, apply_frame(&mut port, text.as_bytes())).await {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if !reply(&mut sender, apply_frame(&mut port, &data)).await {
                        break;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if sender.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    info!(port = port_id, "Client requested close");
                    break;
                }
                Some(Err(e)) => {
                    warn!(port = port_id, ?e, "WebSocket error");
                    break;
                }
                None => break,
            },

            routed = broker_rx.recv() => match routed {
                Ok(routed) => {
                    if !port.accepts(&routed) {
                        continue;
                    }
                    let json = match routed.envelope.to_json() {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(port = port_id, ?e, "Failed to encode envelope");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(port = port_id, skipped, "Broadcast receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            _ = ping.tick() => {
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
        }
    }

    info!(port = port_id, "WebSocket client disconnected");
}

fn apply_frame(port: &mut BrokerPort, raw: &[u8]) -> Option<Envelope> {
    match serde_json::from_slice::<LinkFrame>(raw) {
        Ok(frame) => port.apply(frame),
        Err(e) => {
            debug!(port = port.id(), ?e, "Invalid link frame");
            None
        }
    }
}

/// Sends a join reply, if any. Returns false once the socket is gone.
async fn reply(sender: &mut SplitSink<WebSocket, Message>, envelope: Option<Envelope>) -> bool {
    let Some(envelope) = envelope else {
        return true;
    };
    match envelope.to_json() {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(?e, "Failed to encode join reply");
            true
        }
    }
}
