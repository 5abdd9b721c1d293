//! In-process chat server.
//!
//! Implements both SUT seams without any sockets: accounts, sessions, rooms
//! with a bounded history, per-room fan-out of chat messages and read acks.
//! Used by `--dry-run` and by the test suite, which also drives its fault
//! knobs (refused connections, failing room creation, server-side kicks).

use super::{
    reasons, AuthSession, ChannelCommand, ChannelConnector, ChannelEndpoint, ChatApi,
    Credentials, EventChannel, InboundEvent, NewRoom, OutboundEvent, RoomId, RoomInfo,
    RoomListing,
};
use crate::error::{ApiError, ChannelError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

const HISTORY_LIMIT: usize = 100;
const ROOM_FEED_CAPACITY: usize = 1024;
const CHANNEL_CAPACITY: usize = 256;

struct Account {
    password: String,
    name: String,
}

struct Room {
    name: String,
    members: HashSet<String>,
    history: Vec<String>,
    feed: broadcast::Sender<String>,
}

#[derive(Default)]
struct State {
    accounts: HashMap<String, Account>,
    sessions: HashMap<String, String>,
    rooms: HashMap<RoomId, Room>,
}

#[derive(Default)]
struct Faults {
    refuse_connects: AtomicUsize,
    fail_room_creation: AtomicBool,
    fail_logins: AtomicBool,
    reject_room_joins: AtomicBool,
}

struct Inner {
    state: Mutex<State>,
    faults: Faults,
    next_id: AtomicU64,
    open_connections: AtomicUsize,
    kick: broadcast::Sender<()>,
}

/// Shared handle to an in-process chat server.
pub struct LoopbackChatServer {
    inner: Arc<Inner>,
}

impl LoopbackChatServer {
    pub fn new() -> Arc<Self> {
        let (kick, _) = broadcast::channel(4);
        Arc::new(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                faults: Faults::default(),
                next_id: AtomicU64::new(1),
                open_connections: AtomicUsize::new(0),
                kick,
            }),
        })
    }

    /// Refuse the next `count` channel handshakes.
    pub fn refuse_next_connects(&self, count: usize) {
        self.inner
            .faults
            .refuse_connects
            .store(count, Ordering::SeqCst);
    }

    pub fn set_room_creation_failing(&self, failing: bool) {
        self.inner
            .faults
            .fail_room_creation
            .store(failing, Ordering::SeqCst);
    }

    pub fn set_logins_failing(&self, failing: bool) {
        self.inner.faults.fail_logins.store(failing, Ordering::SeqCst);
    }

    pub fn set_room_joins_rejected(&self, rejected: bool) {
        self.inner
            .faults
            .reject_room_joins
            .store(rejected, Ordering::SeqCst);
    }

    /// Disconnect every open channel from the server side.
    pub fn kick_all(&self) {
        let _ = self.inner.kick.send(());
    }

    pub fn open_connections(&self) -> usize {
        self.inner.open_connections.load(Ordering::SeqCst)
    }

    pub fn room_count(&self) -> usize {
        self.inner.state.lock().rooms.len()
    }

    pub fn account_count(&self) -> usize {
        self.inner.state.lock().accounts.len()
    }
}

impl Inner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn account_for(state: &State, token: &str) -> Result<String, ApiError> {
        state
            .sessions
            .get(token)
            .cloned()
            .ok_or_else(|| ApiError::Status {
                status: 401,
                message: "Invalid token".into(),
            })
    }

    /// Apply one client command, returning the events owed to that client.
    fn handle(
        &self,
        email: &str,
        command: OutboundEvent,
        feed: &mut Option<broadcast::Receiver<String>>,
    ) -> Vec<InboundEvent> {
        let mut state = self.state.lock();
        match command {
            OutboundEvent::JoinRoom { room_id } => match state.rooms.get(&room_id) {
                Some(room) if room.members.contains(email) => {
                    *feed = Some(room.feed.subscribe());
                    vec![InboundEvent::JoinRoomSuccess]
                }
                Some(_) => vec![InboundEvent::JoinRoomError("Room access denied".into())],
                None => vec![InboundEvent::JoinRoomError("Room not found".into())],
            },
            OutboundEvent::FetchPreviousMessages { room_id, limit } => {
                let count = state
                    .rooms
                    .get(&room_id)
                    .map_or(0, |room| room.history.len().min(limit));
                vec![InboundEvent::PreviousMessages { count }]
            }
            OutboundEvent::ChatMessage { room, .. } => match state.rooms.get_mut(&room) {
                Some(room) if room.members.contains(email) => {
                    let id = format!("msg-{}", self.next_id());
                    room.history.push(id.clone());
                    if room.history.len() > HISTORY_LIMIT {
                        room.history.remove(0);
                    }
                    let _ = room.feed.send(id);
                    Vec::new()
                }
                _ => vec![InboundEvent::Error("Invalid room".into())],
            },
            OutboundEvent::MarkMessagesAsRead { .. } => vec![InboundEvent::MessagesRead],
        }
    }
}

async fn next_feed_message(feed: &mut Option<broadcast::Receiver<String>>) -> String {
    loop {
        let Some(receiver) = feed.as_mut() else {
            return std::future::pending().await;
        };
        let received = receiver.recv().await;
        match received {
            Ok(id) => return id,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => *feed = None,
        }
    }
}

async fn drive(inner: Arc<Inner>, email: String, endpoint: ChannelEndpoint) {
    let ChannelEndpoint {
        mut commands,
        events,
    } = endpoint;
    let mut kick = inner.kick.subscribe();
    let mut feed: Option<broadcast::Receiver<String>> = None;

    let reason = 'session: loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(ChannelCommand::Emit(event)) => {
                    for reply in inner.handle(&email, event, &mut feed) {
                        if events.send(reply).is_err() {
                            break 'session reasons::CLIENT;
                        }
                    }
                }
                Some(ChannelCommand::Close) | None => break reasons::CLIENT,
            },
            id = next_feed_message(&mut feed) => {
                if events.send(InboundEvent::Message { id: Some(id) }).is_err() {
                    break reasons::CLIENT;
                }
            }
            _ = kick.recv() => break reasons::SERVER,
        }
    };

    inner.open_connections.fetch_sub(1, Ordering::SeqCst);
    trace!("Loopback session for {} closed: {}", email, reason);
    let _ = events.send(InboundEvent::Disconnect(reason.to_string()));
}

#[async_trait]
impl ChatApi for LoopbackChatServer {
    async fn login(&self, credentials: &Credentials) -> Result<AuthSession, ApiError> {
        if self.inner.faults.fail_logins.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                status: 500,
                message: "login unavailable".into(),
            });
        }

        let mut state = self.inner.state.lock();
        let name = match state.accounts.get(&credentials.email) {
            Some(account) if account.password == credentials.password => account.name.clone(),
            Some(_) => {
                return Err(ApiError::Status {
                    status: 401,
                    message: "Invalid credentials".into(),
                })
            }
            None => {
                return Err(ApiError::Status {
                    status: 404,
                    message: "User not found".into(),
                })
            }
        };

        let token = Uuid::new_v4().to_string();
        state
            .sessions
            .insert(token.clone(), credentials.email.clone());
        Ok(AuthSession {
            token,
            session_id: Uuid::new_v4().to_string(),
            user_name: name,
        })
    }

    async fn register(&self, credentials: &Credentials) -> Result<(), ApiError> {
        let mut state = self.inner.state.lock();
        if state.accounts.contains_key(&credentials.email) {
            return Err(ApiError::Status {
                status: 409,
                message: "Email already registered".into(),
            });
        }
        state.accounts.insert(
            credentials.email.clone(),
            Account {
                password: credentials.password.clone(),
                name: credentials.name.clone(),
            },
        );
        Ok(())
    }

    async fn list_rooms(
        &self,
        admin: &AuthSession,
        _page: u32,
        _page_size: u32,
    ) -> Result<RoomListing, ApiError> {
        let state = self.inner.state.lock();
        Inner::account_for(&state, &admin.token)?;
        Ok(RoomListing {
            total: state.rooms.len() as u64,
        })
    }

    async fn create_room(&self, admin: &AuthSession, room: &NewRoom) -> Result<RoomId, ApiError> {
        if self.inner.faults.fail_room_creation.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                status: 500,
                message: "room creation unavailable".into(),
            });
        }

        let mut state = self.inner.state.lock();
        Inner::account_for(&state, &admin.token)?;
        let id = RoomId(format!("room-{}", self.inner.next_id()));
        let (feed, _) = broadcast::channel(ROOM_FEED_CAPACITY);
        state.rooms.insert(
            id.clone(),
            Room {
                name: room.name.clone(),
                members: HashSet::new(),
                history: Vec::new(),
                feed,
            },
        );
        Ok(id)
    }

    async fn join_room(&self, session: &AuthSession, room: &RoomId) -> Result<(), ApiError> {
        if self.inner.faults.reject_room_joins.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                status: 403,
                message: "Room is full".into(),
            });
        }

        let mut state = self.inner.state.lock();
        let email = Inner::account_for(&state, &session.token)?;
        let target = state.rooms.get_mut(room).ok_or_else(|| ApiError::Status {
            status: 404,
            message: "Room not found".into(),
        })?;
        target.members.insert(email);
        Ok(())
    }

    async fn room_info(&self, session: &AuthSession, room: &RoomId) -> Result<RoomInfo, ApiError> {
        let state = self.inner.state.lock();
        Inner::account_for(&state, &session.token)?;
        let target = state.rooms.get(room).ok_or_else(|| ApiError::Status {
            status: 404,
            message: "Room not found".into(),
        })?;
        Ok(RoomInfo {
            id: room.clone(),
            name: Some(target.name.clone()),
        })
    }
}

#[async_trait]
impl ChannelConnector for LoopbackChatServer {
    async fn connect(&self, session: &AuthSession) -> Result<EventChannel, ChannelError> {
        let refused = self
            .inner
            .faults
            .refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ChannelError::Rejected("connection refused".into()));
        }

        let email = {
            let state = self.inner.state.lock();
            Inner::account_for(&state, &session.token)
                .map_err(|e| ChannelError::Rejected(e.to_string()))?
        };

        let (channel, endpoint) = EventChannel::pair(CHANNEL_CAPACITY);
        self.inner.open_connections.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(drive(self.inner.clone(), email, endpoint));
        Ok(channel)
    }

    fn name(&self) -> &'static str {
        "loopback"
    }
}
