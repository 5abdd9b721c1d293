//! # Simulated User Agent
//!
//! One agent is one end-user session, run as its own tokio task:
//!
//! ```text
//! Unauthenticated -> Authenticated -> RoomJoinedRest -> RoomInfoFetched
//!   -> ChannelConnecting -> ChannelJoined -> Messaging -> Terminated
//! ```
//!
//! Any error ends the agent; nothing is retried. Errors are turned into
//! counter increments here and never escape the task. Connection failures
//! are also reported to the backpressure governor.
//!
//! Agents are tracked in an [`AgentRegistry`] keyed by agent id. Each entry
//! holds the agent's shutdown sender and a receiver for its current state,
//! so the scheduler can enumerate and stop them. While an agent task is
//! alive it holds an [`ActiveSlot`], which is what the active-agent count
//! measures.

use crate::allocator::Room;
use crate::backpressure::BackpressureGovernor;
use crate::config::RunConfig;
use crate::error::{AgentError, ChannelError};
use crate::metrics::{MetricEvent, Metrics};
use crate::sut::{
    login_or_register, reasons, AuthSession, ChannelConnector, ChatApi, Credentials,
    DisconnectReason, EventChannel, InboundEvent, OutboundEvent,
};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, timeout_at, Instant};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Protocol state of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AgentState {
    Unauthenticated,
    Authenticated,
    RoomJoinedRest,
    RoomInfoFetched,
    ChannelConnecting,
    ChannelJoined,
    Messaging,
    Terminated,
}

/// Per-agent knobs derived from the run configuration.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub min_message_interval: Duration,
    pub max_message_interval: Duration,
    pub backlog_limit: usize,
    pub connect_timeout: Duration,
    /// How long to wait for `joinRoomSuccess` after emitting `joinRoom`.
    pub join_timeout: Duration,
    /// How long a closing agent waits for its transport's disconnect report.
    pub close_timeout: Duration,
}

impl From<&RunConfig> for AgentSettings {
    fn from(config: &RunConfig) -> Self {
        Self {
            min_message_interval: config.min_message_interval,
            max_message_interval: config.max_message_interval,
            backlog_limit: config.backlog_limit,
            connect_timeout: config.connect_timeout,
            join_timeout: config.connect_timeout,
            close_timeout: config.shutdown_grace / 2,
        }
    }
}

/// Run-wide handles every agent shares.
pub struct AgentContext {
    pub api: Arc<dyn ChatApi>,
    pub connector: Arc<dyn ChannelConnector>,
    pub metrics: Arc<Metrics>,
    pub governor: Arc<BackpressureGovernor>,
    pub settings: AgentSettings,
}

/// How the agent's channel phase ended.
struct ChannelOutcome {
    result: Result<(), AgentError>,
    close_reason: String,
}

/// Resolves once the shutdown flag is raised or its sender is gone.
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// One simulated end user.
pub struct SimulatedUser {
    id: String,
    room: Arc<Room>,
    ctx: Arc<AgentContext>,
    state: watch::Sender<AgentState>,
    shutdown: watch::Receiver<bool>,
}

impl SimulatedUser {
    pub fn new(
        id: String,
        room: Arc<Room>,
        ctx: Arc<AgentContext>,
        state: watch::Sender<AgentState>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            room,
            ctx,
            state,
            shutdown,
        }
    }

    fn set_state(&self, state: AgentState) {
        self.state.send_replace(state);
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Drive the agent to termination and charge any failure to the
    /// matching counter.
    pub async fn run(mut self) -> Result<(), AgentError> {
        let started = Instant::now();
        let result = self.drive(started).await;
        self.set_state(AgentState::Terminated);

        if let Err(e) = &result {
            self.ctx.metrics.record(MetricEvent::Error(e.kind()));
            if e.feeds_backpressure() {
                self.ctx.governor.report_connection_failure();
            }
            warn!("User {} stopped: {}", self.id, e);
        }
        result
    }

    async fn drive(&mut self, started: Instant) -> Result<(), AgentError> {
        let credentials = Credentials::for_user(&self.id);
        let session = login_or_register(self.ctx.api.as_ref(), &credentials)
            .await
            .map_err(AgentError::Auth)?;
        self.ctx.metrics.record(MetricEvent::UserCreated);
        self.set_state(AgentState::Authenticated);
        if self.stopping() {
            return Ok(());
        }

        self.ctx
            .api
            .join_room(&session, &self.room.id)
            .await
            .map_err(AgentError::Room)?;
        self.ctx.metrics.record(MetricEvent::RoomJoined);
        debug!("User {} joined room {} via REST", self.id, self.room.id);
        self.set_state(AgentState::RoomJoinedRest);
        if self.stopping() {
            return Ok(());
        }

        match self.ctx.api.room_info(&session, &self.room.id).await {
            Ok(info) => {
                self.ctx.metrics.record(MetricEvent::RoomInfoFetched);
                trace!(
                    "User {} fetched room info: {}",
                    self.id,
                    info.name.as_deref().unwrap_or(&self.room.id.0)
                );
            }
            Err(e) => {
                self.ctx
                    .metrics
                    .record(MetricEvent::Error(crate::error::ErrorKind::Room));
                warn!("User {} failed to fetch room info: {}", self.id, e);
            }
        }
        self.set_state(AgentState::RoomInfoFetched);
        if self.stopping() {
            return Ok(());
        }

        self.set_state(AgentState::ChannelConnecting);
        let ctx = self.ctx.clone();
        let mut channel = tokio::select! {
            opened = open_channel(&ctx, &session) => opened?,
            _ = stop_requested(&mut self.shutdown) => return Ok(()),
        };

        let setup = started.elapsed();
        self.ctx.metrics.record(MetricEvent::Connected { setup });
        debug!(
            "User {} ({}) connected in {}ms",
            self.id,
            session.user_name,
            setup.as_millis()
        );

        let outcome = self.channel_session(&mut channel).await;
        let reason = DisconnectReason::classify(&outcome.close_reason);
        self.ctx.metrics.record(MetricEvent::Disconnected(reason));
        debug!(
            "User {} disconnected: reason={} ({})",
            self.id, outcome.close_reason, reason
        );
        outcome.result
    }

    async fn channel_session(&mut self, channel: &mut EventChannel) -> ChannelOutcome {
        let close_timeout = self.ctx.settings.close_timeout;
        let join = OutboundEvent::JoinRoom {
            room_id: self.room.id.clone(),
        };
        let joined = tokio::select! {
            sent = channel.emit(join) => sent,
            _ = stop_requested(&mut self.shutdown) => {
                return ChannelOutcome {
                    result: Ok(()),
                    close_reason: close_and_drain(channel, close_timeout).await,
                };
            }
        };
        if let Err(e) = joined {
            return ChannelOutcome {
                result: Err(e.into()),
                close_reason: close_and_drain(channel, close_timeout).await,
            };
        }

        let join_deadline = Instant::now() + self.ctx.settings.join_timeout;
        loop {
            tokio::select! {
                event = channel.recv() => match event {
                    InboundEvent::JoinRoomSuccess => break,
                    InboundEvent::JoinRoomError(message) => {
                        return ChannelOutcome {
                            result: Err(AgentError::Connection(format!(
                                "joinRoom rejected: {}",
                                message
                            ))),
                            close_reason: close_and_drain(channel, close_timeout).await,
                        };
                    }
                    InboundEvent::Disconnect(reason) => {
                        return ChannelOutcome {
                            result: Err(AgentError::Connection(format!(
                                "channel closed before joining: {}",
                                reason
                            ))),
                            close_reason: reason,
                        };
                    }
                    other => self.on_event(channel, other),
                },
                _ = sleep_until(join_deadline) => {
                    return ChannelOutcome {
                        result: Err(AgentError::Connection("joinRoom timed out".into())),
                        close_reason: close_and_drain(channel, close_timeout).await,
                    };
                }
                _ = stop_requested(&mut self.shutdown) => {
                    return ChannelOutcome {
                        result: Ok(()),
                        close_reason: close_and_drain(channel, close_timeout).await,
                    };
                }
            }
        }

        self.set_state(AgentState::ChannelJoined);
        debug!("User {} joined room {} over the channel", self.id, self.room.id);
        let backlog = OutboundEvent::FetchPreviousMessages {
            room_id: self.room.id.clone(),
            limit: self.ctx.settings.backlog_limit,
        };
        if let Err(e) = channel.try_emit(backlog) {
            self.message_error(&format!("failed to fetch previous messages: {}", e));
        }

        self.set_state(AgentState::Messaging);
        let mut next_send = Instant::now() + self.next_interval();
        loop {
            tokio::select! {
                _ = sleep_until(next_send) => {
                    if !self.send_chat_message(channel).await {
                        return ChannelOutcome {
                            result: Ok(()),
                            close_reason: close_and_drain(channel, close_timeout).await,
                        };
                    }
                    next_send = Instant::now() + self.next_interval();
                }
                event = channel.recv() => match event {
                    InboundEvent::Disconnect(reason) => {
                        return ChannelOutcome {
                            result: Ok(()),
                            close_reason: reason,
                        };
                    }
                    other => self.on_event(channel, other),
                },
                _ = stop_requested(&mut self.shutdown) => {
                    return ChannelOutcome {
                        result: Ok(()),
                        close_reason: close_and_drain(channel, close_timeout).await,
                    };
                }
            }
        }
    }

    fn next_interval(&self) -> Duration {
        let min = self.ctx.settings.min_message_interval.as_millis() as u64;
        let max = self.ctx.settings.max_message_interval.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Emit one chat message. Returns `false` when a stop arrived while the
    /// outbound queue was full.
    async fn send_chat_message(&mut self, channel: &EventChannel) -> bool {
        let content = format!(
            "Ramp-up test message from user {} at {}",
            self.id,
            chrono::Utc::now().to_rfc3339()
        );
        let message = OutboundEvent::ChatMessage {
            room: self.room.id.clone(),
            content,
        };
        let enqueued = Instant::now();
        let sent = tokio::select! {
            sent = channel.emit(message) => sent,
            _ = stop_requested(&mut self.shutdown) => return false,
        };
        match sent {
            Ok(()) => self.ctx.metrics.record(MetricEvent::MessageSent {
                latency: enqueued.elapsed(),
            }),
            Err(e) => self.message_error(&format!("failed to send message: {}", e)),
        }
        true
    }

    fn on_event(&self, channel: &EventChannel, event: InboundEvent) {
        let metrics = &self.ctx.metrics;
        match event {
            InboundEvent::PreviousMessages { count } => {
                metrics.record(MetricEvent::BacklogFetched);
                if count > 0 {
                    metrics.record(MetricEvent::MessagesReceived(count as u64));
                }
                trace!("User {} received {} previous messages", self.id, count);
            }
            InboundEvent::Message { id } => {
                metrics.record(MetricEvent::MessagesReceived(1));
                if let Some(id) = id {
                    let ack = OutboundEvent::MarkMessagesAsRead {
                        room_id: self.room.id.clone(),
                        message_ids: vec![id],
                    };
                    match channel.try_emit(ack) {
                        Ok(()) => metrics.record(MetricEvent::MessageRead),
                        Err(e) => self.message_error(&format!("failed to mark read: {}", e)),
                    }
                }
            }
            InboundEvent::MessagesRead => metrics.record(MetricEvent::ReadAckReceived),
            InboundEvent::Error(message) => self.message_error(&message),
            InboundEvent::Unknown(name) => trace!("User {} ignored event {}", self.id, name),
            other => trace!("User {} ignored late {:?}", self.id, other),
        }
    }

    fn message_error(&self, message: &str) {
        self.ctx
            .metrics
            .record(MetricEvent::Error(crate::error::ErrorKind::Message));
        warn!("User {} message error: {}", self.id, message);
    }
}

async fn open_channel(
    ctx: &AgentContext,
    session: &AuthSession,
) -> Result<EventChannel, ChannelError> {
    timeout(ctx.settings.connect_timeout, ctx.connector.connect(session))
        .await
        .map_err(|_| ChannelError::Timeout)?
}

/// Ask the transport to close and wait for its disconnect reason. A
/// transport that does not answer within `limit` is abandoned and the
/// close counts as client-initiated.
async fn close_and_drain(channel: &mut EventChannel, limit: Duration) -> String {
    channel.close();
    let drained = timeout(limit, async {
        loop {
            if let InboundEvent::Disconnect(reason) = channel.recv().await {
                return reason;
            }
        }
    })
    .await;
    drained.unwrap_or_else(|_| {
        debug!("Transport did not confirm close within {:?}", limit);
        reasons::CLIENT.to_string()
    })
}

/// Counts one live agent for as long as it is held.
pub struct ActiveSlot {
    active: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl ActiveSlot {
    fn acquire(active: &Arc<AtomicUsize>, idle: &Arc<Notify>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self {
            active: active.clone(),
            idle: idle.clone(),
        }
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

struct AgentHandle {
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<AgentState>,
    task: JoinHandle<()>,
}

/// Live agents keyed by id.
pub struct AgentRegistry {
    agents: Mutex<HashMap<String, AgentHandle>>,
    active: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl AgentRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            agents: Mutex::new(HashMap::new()),
            active: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        })
    }

    /// Start one agent in `room`. The active count is raised before this
    /// returns and lowered exactly once when the agent task ends.
    pub fn spawn(self: &Arc<Self>, room: Arc<Room>, ctx: Arc<AgentContext>) -> String {
        let id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(AgentState::Unauthenticated);
        let slot = ActiveSlot::acquire(&self.active, &self.idle);
        let user = SimulatedUser::new(id.clone(), room, ctx, state_tx, shutdown_rx);

        let registry = Arc::clone(self);
        let agent_id = id.clone();
        let mut agents = self.agents.lock();
        let task = tokio::spawn(async move {
            let _slot = slot;
            let _ = user.run().await;
            registry.agents.lock().remove(&agent_id);
        });
        agents.insert(
            id.clone(),
            AgentHandle {
                shutdown: shutdown_tx,
                state: state_rx,
                task,
            },
        );
        id
    }

    /// Agents whose task has not ended yet.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.agents.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current state of one agent, if it is still registered.
    pub fn state_of(&self, id: &str) -> Option<AgentState> {
        self.agents.lock().get(id).map(|handle| *handle.state.borrow())
    }

    /// Tell every agent to stop. Returns how many were signalled.
    pub fn disconnect_all(&self) -> usize {
        let agents = self.agents.lock();
        for handle in agents.values() {
            let _ = handle.shutdown.send(true);
        }
        agents.len()
    }

    /// Wait until no agent is active or `grace` elapses. Returns whether
    /// every agent finished.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            let notified = self.idle.notified();
            if self.active() == 0 {
                return true;
            }
            if timeout_at(deadline, notified).await.is_err() {
                return self.active() == 0;
            }
        }
    }

    /// Cancel agents that are still running.
    pub fn abort_remaining(&self) -> usize {
        let mut agents = self.agents.lock();
        let count = agents.len();
        for (_, handle) in agents.drain() {
            handle.task.abort();
        }
        if count > 0 {
            info!("Aborted {} agents that did not stop in time", count);
        }
        count
    }
}

/// Yield until `check` holds, polling on the (possibly paused) clock.
#[cfg(test)]
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GovernorConfig;
    use crate::error::ErrorKind;
    use crate::sut::{reasons, ChannelCommand, LoopbackChatServer, NewRoom};
    use async_trait::async_trait;

    fn settings() -> AgentSettings {
        AgentSettings {
            min_message_interval: Duration::from_millis(100),
            max_message_interval: Duration::from_millis(200),
            backlog_limit: 30,
            connect_timeout: Duration::from_secs(10),
            join_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(1),
        }
    }

    fn context(
        api: Arc<dyn ChatApi>,
        connector: Arc<dyn ChannelConnector>,
    ) -> Arc<AgentContext> {
        Arc::new(AgentContext {
            api,
            connector,
            metrics: Arc::new(Metrics::new().unwrap()),
            governor: BackpressureGovernor::new(GovernorConfig::default()),
            settings: settings(),
        })
    }

    async fn loopback_room(server: &Arc<LoopbackChatServer>) -> Arc<Room> {
        let admin = login_or_register(server.as_ref(), &Credentials::for_user("admin"))
            .await
            .unwrap();
        let id = server
            .create_room(
                &admin,
                &NewRoom {
                    name: "Ramp-Up Test Room #1".into(),
                    description: String::new(),
                },
            )
            .await
            .unwrap();
        Arc::new(Room {
            id,
            sequence: 1,
            creator: admin.user_name,
        })
    }

    /// Accepts every handshake and rejects every `joinRoom`.
    struct RejectingConnector;

    #[async_trait]
    impl ChannelConnector for RejectingConnector {
        async fn connect(&self, _session: &AuthSession) -> Result<EventChannel, ChannelError> {
            let (channel, mut endpoint) = EventChannel::pair(8);
            tokio::spawn(async move {
                while let Some(command) = endpoint.commands.recv().await {
                    let reply = match command {
                        ChannelCommand::Emit(OutboundEvent::JoinRoom { .. }) => {
                            InboundEvent::JoinRoomError("Unauthorized".into())
                        }
                        ChannelCommand::Emit(_) => continue,
                        ChannelCommand::Close => break,
                    };
                    let _ = endpoint.events.send(reply);
                }
                let _ = endpoint
                    .events
                    .send(InboundEvent::Disconnect(reasons::CLIENT.into()));
            });
            Ok(channel)
        }

        fn name(&self) -> &'static str {
            "rejecting"
        }
    }

    /// Answers `joinRoom`, then floods messages without reading any further
    /// command, like a server that stopped draining its socket.
    struct StalledConnector;

    #[async_trait]
    impl ChannelConnector for StalledConnector {
        async fn connect(&self, _session: &AuthSession) -> Result<EventChannel, ChannelError> {
            let (channel, mut endpoint) = EventChannel::pair(2);
            tokio::spawn(async move {
                let _ = endpoint.commands.recv().await;
                let _ = endpoint.events.send(InboundEvent::JoinRoomSuccess);
                for n in 0u64.. {
                    let message = InboundEvent::Message {
                        id: Some(format!("m{}", n)),
                    };
                    if endpoint.events.send(message).is_err() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            });
            Ok(channel)
        }

        fn name(&self) -> &'static str {
            "stalled"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_agents_message_and_stop_on_disconnect() {
        let server = LoopbackChatServer::new();
        let room = loopback_room(&server).await;
        let ctx = context(server.clone(), server.clone());
        let registry = AgentRegistry::new();

        let first = registry.spawn(room.clone(), ctx.clone());
        registry.spawn(room.clone(), ctx.clone());
        assert_eq!(registry.active(), 2);

        assert!(eventually(|| ctx.metrics.counters().messages_sent >= 4).await);
        assert_eq!(registry.state_of(&first), Some(AgentState::Messaging));

        assert_eq!(registry.disconnect_all(), 2);
        assert!(registry.wait_idle(Duration::from_secs(2)).await);
        assert!(registry.is_empty());

        let counters = ctx.metrics.counters();
        assert_eq!(counters.users_created, 2);
        assert_eq!(counters.room_joins_rest, 2);
        assert_eq!(counters.room_info_fetches, 2);
        assert_eq!(counters.connected, 2);
        assert_eq!(counters.backlog_fetches, 2);
        assert!(counters.messages_received > 0);
        assert!(counters.messages_read > 0);
        assert_eq!(counters.disconnected, 2);
        assert_eq!(counters.disconnected_by_client, 2);
        assert_eq!(counters.total_errors(), 0);
        assert_eq!(server.open_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_failure_is_isolated() {
        let server = LoopbackChatServer::new();
        let room = loopback_room(&server).await;
        let ctx = context(server.clone(), server.clone());
        let registry = AgentRegistry::new();

        server.refuse_next_connects(1);
        for _ in 0..3 {
            registry.spawn(room.clone(), ctx.clone());
        }

        assert!(eventually(|| registry.active() == 2).await);
        assert!(eventually(|| ctx.metrics.counters().connected == 2).await);
        let counters = ctx.metrics.counters();
        assert_eq!(counters.errors_connection, 1);
        assert_eq!(counters.disconnected, 0);
        assert_eq!(ctx.governor.window_len(), 1);

        registry.disconnect_all();
        assert!(registry.wait_idle(Duration::from_secs(2)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rest_join_failure_is_a_room_error() {
        let server = LoopbackChatServer::new();
        let room = loopback_room(&server).await;
        let ctx = context(server.clone(), server.clone());
        server.set_room_joins_rejected(true);

        let (state_tx, state_rx) = watch::channel(AgentState::Unauthenticated);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let user = SimulatedUser::new("u1".into(), room, ctx.clone(), state_tx, shutdown_rx);

        let err = user.run().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Room);
        assert_eq!(*state_rx.borrow(), AgentState::Terminated);
        assert_eq!(ctx.metrics.counters().errors_room, 1);
        assert_eq!(ctx.governor.window_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_rejection_closes_channel_and_feeds_governor() {
        let server = LoopbackChatServer::new();
        let room = loopback_room(&server).await;
        let ctx = context(server.clone(), Arc::new(RejectingConnector));

        let (state_tx, _state_rx) = watch::channel(AgentState::Unauthenticated);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let user = SimulatedUser::new("u2".into(), room, ctx.clone(), state_tx, shutdown_rx);

        let err = user.run().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);

        let counters = ctx.metrics.counters();
        assert_eq!(counters.connected, 1);
        assert_eq!(counters.errors_connection, 1);
        assert_eq!(counters.disconnected_by_client, 1);
        assert_eq!(ctx.governor.window_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_connecting_skips_channel() {
        let server = LoopbackChatServer::new();
        let room = loopback_room(&server).await;
        let ctx = context(server.clone(), server.clone());

        let (state_tx, state_rx) = watch::channel(AgentState::Unauthenticated);
        let (shutdown_tx, shutdown_rx) = watch::channel(true);
        let user = SimulatedUser::new("u3".into(), room, ctx.clone(), state_tx, shutdown_rx);

        user.run().await.unwrap();
        drop(shutdown_tx);
        assert_eq!(*state_rx.borrow(), AgentState::Terminated);

        let counters = ctx.metrics.counters();
        assert_eq!(counters.users_created, 1);
        assert_eq!(counters.room_joins_rest, 0);
        assert_eq!(counters.connected, 0);
        assert_eq!(counters.disconnected, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_kick_is_classified() {
        let server = LoopbackChatServer::new();
        let room = loopback_room(&server).await;
        let ctx = context(server.clone(), server.clone());
        let registry = AgentRegistry::new();

        registry.spawn(room, ctx.clone());
        assert!(eventually(|| server.open_connections() == 1).await);
        assert!(eventually(|| ctx.metrics.counters().backlog_fetches == 1).await);

        server.kick_all();
        assert!(registry.wait_idle(Duration::from_secs(2)).await);
        assert_eq!(ctx.metrics.counters().disconnected_by_server, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_transport_still_stops_on_disconnect() {
        let server = LoopbackChatServer::new();
        let room = loopback_room(&server).await;
        let ctx = context(server.clone(), Arc::new(StalledConnector));
        let registry = AgentRegistry::new();

        let id = registry.spawn(room, ctx.clone());
        assert!(eventually(|| ctx.metrics.counters().errors_message > 0).await);
        assert_eq!(registry.state_of(&id), Some(AgentState::Messaging));
        // Wait past a send deadline so the agent is parked on a full queue.
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(registry.disconnect_all(), 1);
        assert!(registry.wait_idle(Duration::from_secs(5)).await);
        assert!(registry.is_empty());

        let counters = ctx.metrics.counters();
        assert_eq!(counters.disconnected, 1);
        assert_eq!(counters.disconnected_by_client, 1);
        assert_eq!(counters.errors_connection, 0);
        assert!(counters.messages_read >= 1);
        assert_eq!(counters.messages_sent, 0);
    }
}
