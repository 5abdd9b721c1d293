//! # System-Under-Test Interfaces
//!
//! The engine talks to the chat service through two seams:
//!
//! - [`ChatApi`]: request/response REST calls (auth and room management).
//! - [`ChannelConnector`]: opens a duplex, event-oriented channel for one
//!   authenticated user. The resulting [`EventChannel`] is a pair of queues:
//!   outbound commands go to a driver task that owns the socket, inbound
//!   events come back on a per-agent receiver the agent can `select!` on.
//!
//! Implementations:
//!
//! - `http`: reqwest-based REST client
//! - `socket_io`: Socket.IO v4 over tokio-tungstenite
//! - `loopback`: in-process chat server used for dry runs and tests

use crate::config::RunConfig;
use crate::error::{ApiError, ChannelError};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

pub mod http;
pub mod loopback;
pub mod socket_io;

pub use http::HttpChatApi;
pub use loopback::LoopbackChatServer;
pub use socket_io::SocketIoConnector;

/// Room identifier assigned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(pub String);

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        RoomId(s.to_string())
    }
}

/// Account credentials for a simulated user.
#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
    pub name: String,
}

impl Credentials {
    /// Deterministic credentials for a short user id.
    pub fn for_user(user_id: &str) -> Self {
        Self {
            email: format!("loadtest-rampup-{}@test.com", user_id),
            password: crate::defaults::USER_PASSWORD.to_string(),
            name: format!("RampUp User {}", user_id),
        }
    }
}

/// Result of a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub token: String,
    pub session_id: String,
    pub user_name: String,
}

/// Body of a room creation request.
#[derive(Debug, Clone, Serialize)]
pub struct NewRoom {
    pub name: String,
    pub description: String,
}

/// Informational view of the room listing.
#[derive(Debug, Clone, Default)]
pub struct RoomListing {
    pub total: u64,
}

/// Room metadata as returned by the info endpoint.
#[derive(Debug, Clone)]
pub struct RoomInfo {
    pub id: RoomId,
    pub name: Option<String>,
}

/// REST surface of the chat service.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// `POST /api/auth/login`
    async fn login(&self, credentials: &Credentials) -> Result<AuthSession, ApiError>;

    /// `POST /api/auth/register`
    async fn register(&self, credentials: &Credentials) -> Result<(), ApiError>;

    /// `GET /api/rooms` (privileged)
    async fn list_rooms(
        &self,
        admin: &AuthSession,
        page: u32,
        page_size: u32,
    ) -> Result<RoomListing, ApiError>;

    /// `POST /api/rooms` (privileged)
    async fn create_room(&self, admin: &AuthSession, room: &NewRoom) -> Result<RoomId, ApiError>;

    /// `POST /api/rooms/{id}/join`
    async fn join_room(&self, session: &AuthSession, room: &RoomId) -> Result<(), ApiError>;

    /// `GET /api/rooms/{id}`
    async fn room_info(&self, session: &AuthSession, room: &RoomId) -> Result<RoomInfo, ApiError>;
}

/// Opens event channels for authenticated users.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Perform the transport handshake with the session attached.
    async fn connect(&self, session: &AuthSession) -> Result<EventChannel, ChannelError>;

    /// Transport name for logs.
    fn name(&self) -> &'static str;
}

/// Log in, registering the account first when the server does not know it.
///
/// This is the single authentication path for both the privileged room
/// creator and every simulated user. It never retries beyond the one
/// register-then-login fallback.
pub async fn login_or_register(
    api: &dyn ChatApi,
    credentials: &Credentials,
) -> Result<AuthSession, ApiError> {
    match api.login(credentials).await {
        Ok(session) => Ok(session),
        Err(e) if e.is_unknown_account() => {
            tracing::debug!("Registering new user: {}", credentials.email);
            api.register(credentials).await?;
            api.login(credentials).await
        }
        Err(e) => Err(e),
    }
}

/// Events the client emits.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    JoinRoom {
        room_id: RoomId,
    },
    FetchPreviousMessages {
        room_id: RoomId,
        limit: usize,
    },
    ChatMessage {
        room: RoomId,
        content: String,
    },
    MarkMessagesAsRead {
        room_id: RoomId,
        message_ids: Vec<String>,
    },
}

impl OutboundEvent {
    /// Event name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::JoinRoom { .. } => "joinRoom",
            OutboundEvent::FetchPreviousMessages { .. } => "fetchPreviousMessages",
            OutboundEvent::ChatMessage { .. } => "chatMessage",
            OutboundEvent::MarkMessagesAsRead { .. } => "markMessagesAsRead",
        }
    }

    /// Event argument on the wire.
    pub fn payload(&self) -> Value {
        match self {
            OutboundEvent::JoinRoom { room_id } => json!(room_id.0),
            OutboundEvent::FetchPreviousMessages { room_id, limit } => {
                json!({ "roomId": room_id.0, "limit": limit })
            }
            OutboundEvent::ChatMessage { room, content } => {
                json!({ "room": room.0, "type": "text", "content": content })
            }
            OutboundEvent::MarkMessagesAsRead {
                room_id,
                message_ids,
            } => json!({ "roomId": room_id.0, "messageIds": message_ids }),
        }
    }
}

/// Events the server delivers to one client.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    JoinRoomSuccess,
    JoinRoomError(String),
    PreviousMessages { count: usize },
    Message { id: Option<String> },
    MessagesRead,
    Error(String),
    /// The channel closed; carries the raw transport reason.
    Disconnect(String),
    Unknown(String),
}

impl InboundEvent {
    /// Decode a named event and its first argument.
    pub fn from_wire(name: &str, payload: &Value) -> Self {
        match name {
            "joinRoomSuccess" => InboundEvent::JoinRoomSuccess,
            "joinRoomError" => InboundEvent::JoinRoomError(describe(payload)),
            "previousMessages" | "previousMessagesLoaded" => InboundEvent::PreviousMessages {
                count: payload
                    .get("messages")
                    .and_then(Value::as_array)
                    .map_or(0, Vec::len),
            },
            "message" => InboundEvent::Message {
                id: payload
                    .get("_id")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            "messagesRead" => InboundEvent::MessagesRead,
            "error" => InboundEvent::Error(describe(payload)),
            "disconnect" => InboundEvent::Disconnect(describe(payload)),
            other => InboundEvent::Unknown(other.to_string()),
        }
    }
}

/// Human-readable text for an error-ish payload.
pub(crate) fn describe(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| payload.to_string()),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Why a channel closed, bucketed for the disconnect breakdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectReason {
    ServerInitiated,
    ClientInitiated,
    Timeout,
    Other,
}

impl DisconnectReason {
    /// Bucket a raw Socket.IO disconnect reason.
    pub fn classify(raw: &str) -> Self {
        match raw {
            reasons::SERVER => DisconnectReason::ServerInitiated,
            reasons::CLIENT => DisconnectReason::ClientInitiated,
            reasons::PING_TIMEOUT => DisconnectReason::Timeout,
            _ => DisconnectReason::Other,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ServerInitiated => write!(f, "By Server"),
            DisconnectReason::ClientInitiated => write!(f, "By Client"),
            DisconnectReason::Timeout => write!(f, "Ping Timeout"),
            DisconnectReason::Other => write!(f, "Other"),
        }
    }
}

/// Raw disconnect reasons used by the transports.
pub mod reasons {
    pub const SERVER: &str = "io server disconnect";
    pub const CLIENT: &str = "io client disconnect";
    pub const PING_TIMEOUT: &str = "ping timeout";
    pub const TRANSPORT_CLOSE: &str = "transport close";
    pub const TRANSPORT_ERROR: &str = "transport error";
}

/// Instruction from the agent to the transport driver.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelCommand {
    Emit(OutboundEvent),
    Close,
}

/// Agent-side half of an open event channel.
pub struct EventChannel {
    commands: mpsc::Sender<ChannelCommand>,
    events: mpsc::UnboundedReceiver<InboundEvent>,
}

/// Transport-side half of an event channel.
///
/// Inbound events are unbounded so a driver never waits on its agent and
/// keeps servicing commands and heartbeats.
pub struct ChannelEndpoint {
    pub commands: mpsc::Receiver<ChannelCommand>,
    pub events: mpsc::UnboundedSender<InboundEvent>,
}

impl EventChannel {
    /// Create a connected agent/transport pair with `capacity` outbound slots.
    pub fn pair(capacity: usize) -> (EventChannel, ChannelEndpoint) {
        let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();
        (
            EventChannel {
                commands: cmd_tx,
                events: evt_rx,
            },
            ChannelEndpoint {
                commands: cmd_rx,
                events: evt_tx,
            },
        )
    }

    /// Queue an event for sending. Completes once the driver accepted it.
    pub async fn emit(&self, event: OutboundEvent) -> Result<(), ChannelError> {
        self.commands
            .send(ChannelCommand::Emit(event))
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Queue an event without waiting for a free slot.
    pub fn try_emit(&self, event: OutboundEvent) -> Result<(), ChannelError> {
        self.commands
            .try_send(ChannelCommand::Emit(event))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ChannelError::Backlogged,
                mpsc::error::TrySendError::Closed(_) => ChannelError::Closed,
            })
    }

    /// Ask the driver to close the channel. The matching `Disconnect` event
    /// still arrives through [`EventChannel::recv`] unless the outbound
    /// queue is full, in which case dropping the channel is what ends it.
    pub fn close(&self) {
        let _ = self.commands.try_send(ChannelCommand::Close);
    }

    /// Next inbound event. A vanished driver reads as a transport close.
    pub async fn recv(&mut self) -> InboundEvent {
        self.events
            .recv()
            .await
            .unwrap_or_else(|| InboundEvent::Disconnect(reasons::TRANSPORT_CLOSE.to_string()))
    }
}

/// The pair of SUT clients a run uses.
#[derive(Clone)]
pub struct SutClients {
    pub api: Arc<dyn ChatApi>,
    pub connector: Arc<dyn ChannelConnector>,
}

/// Builds the SUT clients for a configuration.
pub struct SutFactory;

impl SutFactory {
    /// Real HTTP + Socket.IO clients, or the loopback server for dry runs.
    pub fn create(config: &RunConfig) -> Result<SutClients> {
        if config.dry_run {
            info!("Dry run: driving the in-process loopback chat server");
            let server = LoopbackChatServer::new();
            return Ok(SutClients {
                api: server.clone(),
                connector: server,
            });
        }

        let api = HttpChatApi::new(&config.api_url, config.request_timeout)?;
        let connector = SocketIoConnector::new(&config.socket_url, config.connect_timeout);
        Ok(SutClients {
            api: Arc::new(api),
            connector: Arc::new(connector),
        })
    }
}
