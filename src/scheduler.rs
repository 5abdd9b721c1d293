//! # Phase Scheduler
//!
//! Owns the lifecycle of one run:
//!
//! ```text
//! Initializing -> RampingUp -> Sustaining -> Completed
//!                     \             \
//!                      +-------------+-> Aborted
//! ```
//!
//! - **Initializing** logs in the privileged room-creator account. Failure
//!   here is the only fatal error of a run.
//! - **RampingUp** runs a one-second tick. Each tick draws a batch size,
//!   clamps it to the remaining headroom, allocates a room and spawns the
//!   batch. Ticks are skipped while the backpressure governor is tripped.
//! - **Sustaining** holds the population until a single deadline.
//! - **Completed / Aborted**: every agent is told to disconnect, given a
//!   grace period, and the remaining stragglers are cancelled.
//!
//! A tick that is already spawning always finishes before the scheduler
//! reacts to an abort.

use crate::agent::{AgentContext, AgentRegistry, AgentSettings};
use crate::allocator::RoomAllocator;
use crate::backpressure::{BackpressureGovernor, GovernorStatus};
use crate::config::RunConfig;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::sut::{login_or_register, Credentials, SutClients};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Delay between individual spawns while the governor has seen failures.
const SPAWN_STAGGER: Duration = Duration::from_millis(50);
const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Initializing,
    RampingUp,
    Sustaining,
    Completed,
    Aborted,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Aborted)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Initializing => write!(f, "Initializing"),
            Phase::RampingUp => write!(f, "Ramping Up"),
            Phase::Sustaining => write!(f, "Sustaining"),
            Phase::Completed => write!(f, "Completed"),
            Phase::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Wall-clock times of each phase transition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseTimeline {
    pub run_started: Option<DateTime<Utc>>,
    pub ramp_up_started: Option<DateTime<Utc>>,
    pub sustain_started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    Completed,
    Aborted,
}

impl RunOutcome {
    pub fn exit_code(self) -> u8 {
        match self {
            RunOutcome::Completed => 0,
            RunOutcome::Aborted => 1,
        }
    }
}

struct PhaseClock {
    phase: Phase,
    ramp_started: Option<Instant>,
    sustain_started: Option<Instant>,
    finished: Option<Instant>,
    timeline: PhaseTimeline,
}

/// Lifecycle state of a run, shared with the display layer.
pub struct RunState {
    target: usize,
    sustain_duration: Duration,
    started: Instant,
    clock: Mutex<PhaseClock>,
    ticks: AtomicU64,
    rooms_allocated: AtomicU64,
    agents_spawned: AtomicU64,
}

/// Point-in-time view of [`RunState`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStateSnapshot {
    pub phase: Phase,
    pub ticks: u64,
    pub elapsed_secs: f64,
    pub ramp_up_elapsed_secs: Option<f64>,
    pub sustain_elapsed_secs: Option<f64>,
    pub sustain_remaining_secs: Option<f64>,
    pub target: usize,
    pub active: usize,
    pub users_to_go: usize,
    pub rooms_allocated: u64,
    pub agents_spawned: u64,
}

impl RunState {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            target: config.target_population,
            sustain_duration: config.sustain_duration,
            started: Instant::now(),
            clock: Mutex::new(PhaseClock {
                phase: Phase::Initializing,
                ramp_started: None,
                sustain_started: None,
                finished: None,
                timeline: PhaseTimeline {
                    run_started: Some(Utc::now()),
                    ..PhaseTimeline::default()
                },
            }),
            ticks: AtomicU64::new(0),
            rooms_allocated: AtomicU64::new(0),
            agents_spawned: AtomicU64::new(0),
        }
    }

    pub fn phase(&self) -> Phase {
        self.clock.lock().phase
    }

    /// Move to `next` if the lifecycle allows it. Returns whether the phase
    /// changed; a repeated or backwards transition is ignored.
    fn transition(&self, next: Phase) -> bool {
        let mut clock = self.clock.lock();
        let allowed = matches!(
            (clock.phase, next),
            (Phase::Initializing, Phase::RampingUp)
                | (Phase::RampingUp, Phase::Sustaining)
                | (Phase::Initializing | Phase::RampingUp | Phase::Sustaining, Phase::Completed)
                | (Phase::Initializing | Phase::RampingUp | Phase::Sustaining, Phase::Aborted)
        );
        if !allowed {
            return false;
        }

        let now = Instant::now();
        match next {
            Phase::RampingUp => {
                clock.ramp_started = Some(now);
                clock.timeline.ramp_up_started = Some(Utc::now());
            }
            Phase::Sustaining => {
                clock.sustain_started = Some(now);
                clock.timeline.sustain_started = Some(Utc::now());
            }
            Phase::Completed | Phase::Aborted => {
                clock.finished = Some(now);
                clock.timeline.finished = Some(Utc::now());
            }
            Phase::Initializing => {}
        }
        info!("Phase: {} -> {}", clock.phase, next);
        clock.phase = next;
        true
    }

    pub fn sustain_started(&self) -> Option<Instant> {
        self.clock.lock().sustain_started
    }

    pub fn timeline(&self) -> PhaseTimeline {
        self.clock.lock().timeline.clone()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self, active: usize) -> RunStateSnapshot {
        let clock = self.clock.lock();
        let now = clock.finished.unwrap_or_else(Instant::now);
        let since = |start: Option<Instant>| {
            start.map(|s| now.saturating_duration_since(s).as_secs_f64())
        };
        let sustain_elapsed = since(clock.sustain_started);

        RunStateSnapshot {
            phase: clock.phase,
            ticks: self.ticks.load(Ordering::SeqCst),
            elapsed_secs: now.saturating_duration_since(self.started).as_secs_f64(),
            ramp_up_elapsed_secs: since(clock.ramp_started),
            sustain_elapsed_secs: sustain_elapsed,
            sustain_remaining_secs: sustain_elapsed
                .map(|e| (self.sustain_duration.as_secs_f64() - e).max(0.0)),
            target: self.target,
            active,
            users_to_go: self.target.saturating_sub(active),
            rooms_allocated: self.rooms_allocated.load(Ordering::SeqCst),
            agents_spawned: self.agents_spawned.load(Ordering::SeqCst),
        }
    }
}

/// Everything the display layer renders at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run: RunStateSnapshot,
    pub governor: GovernorStatus,
    pub metrics: MetricsSnapshot,
}

/// Read-only handle onto a live run.
#[derive(Clone)]
pub struct RunMonitor {
    state: Arc<RunState>,
    metrics: Arc<Metrics>,
    governor: Arc<BackpressureGovernor>,
    registry: Arc<AgentRegistry>,
}

impl RunMonitor {
    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run: self.state.snapshot(self.registry.active()),
            governor: self.governor.status(),
            metrics: self.metrics.snapshot(),
        }
    }
}

/// Receives periodic snapshots while a run is in progress.
pub trait SnapshotObserver: Send + 'static {
    fn on_snapshot(&mut self, snapshot: &RunSnapshot);
}

/// What one ramp-up tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The run is not ramping up.
    Idle,
    /// The governor is tripped; nothing was spawned.
    Throttled,
    /// Room allocation failed; nothing was spawned.
    RoomFailed,
    /// `n` agents were spawned and the target is not reached yet.
    Spawned(usize),
    /// The target population is reached; the run is now sustaining.
    TargetReached,
}

/// Final result of [`RampUpRunner::run`].
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub timeline: PhaseTimeline,
    pub final_snapshot: RunSnapshot,
}

/// Drives one ramp-up run from initialization to its terminal phase.
pub struct RampUpRunner {
    config: Arc<RunConfig>,
    clients: SutClients,
    metrics: Arc<Metrics>,
    governor: Arc<BackpressureGovernor>,
    registry: Arc<AgentRegistry>,
    state: Arc<RunState>,
    agent_ctx: Arc<AgentContext>,
    allocator: Option<RoomAllocator>,
    batch_sequence: u64,
    throttle_noticed: bool,
}

impl RampUpRunner {
    pub fn new(config: RunConfig, clients: SutClients) -> Result<Self> {
        let metrics = Arc::new(Metrics::new()?);
        let governor = BackpressureGovernor::new(config.governor.clone());
        let agent_ctx = Arc::new(AgentContext {
            api: clients.api.clone(),
            connector: clients.connector.clone(),
            metrics: metrics.clone(),
            governor: governor.clone(),
            settings: AgentSettings::from(&config),
        });

        Ok(Self {
            state: Arc::new(RunState::new(&config)),
            config: Arc::new(config),
            clients,
            metrics,
            governor,
            registry: AgentRegistry::new(),
            agent_ctx,
            allocator: None,
            batch_sequence: 0,
            throttle_noticed: false,
        })
    }

    pub fn monitor(&self) -> RunMonitor {
        RunMonitor {
            state: self.state.clone(),
            metrics: self.metrics.clone(),
            governor: self.governor.clone(),
            registry: self.registry.clone(),
        }
    }

    pub fn state(&self) -> &Arc<RunState> {
        &self.state
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn governor(&self) -> &Arc<BackpressureGovernor> {
        &self.governor
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Log in the room-creator account and enter `RampingUp`.
    pub async fn initialize(&mut self) -> Result<()> {
        info!(
            "Creating admin user for room management ({} transport)",
            self.clients.connector.name()
        );
        let admin_id = format!("admin-room-creator{}", &Uuid::new_v4().simple().to_string()[..8]);
        let admin = login_or_register(self.clients.api.as_ref(), &Credentials::for_user(&admin_id))
            .await
            .context("Failed to create admin user for room creation")?;
        info!("Admin user {} ready", admin.user_name);

        self.allocator = Some(RoomAllocator::new(
            self.clients.api.clone(),
            admin,
            self.config.room_id.clone(),
            self.metrics.clone(),
        ));
        self.state.transition(Phase::RampingUp);
        Ok(())
    }

    /// Enter `Sustaining` once the active population has reached the target.
    fn check_target(&self) -> bool {
        if self.registry.active() >= self.config.target_population {
            if self.state.transition(Phase::Sustaining) {
                info!(
                    "Target of {} users reached after {} ticks, sustaining for {:?}",
                    self.config.target_population,
                    self.state.ticks(),
                    self.config.sustain_duration
                );
            }
            return true;
        }
        false
    }

    fn batch_size(&self) -> usize {
        let drawn =
            rand::thread_rng().gen_range(self.config.min_per_tick..=self.config.max_per_tick);
        let headroom = self
            .config
            .target_population
            .saturating_sub(self.registry.active());
        drawn.min(headroom)
    }

    /// Run one ramp-up tick.
    pub async fn tick(&mut self) -> TickOutcome {
        if self.state.phase() != Phase::RampingUp {
            return TickOutcome::Idle;
        }
        if self.check_target() {
            return TickOutcome::TargetReached;
        }
        self.state.ticks.fetch_add(1, Ordering::SeqCst);

        if self.governor.is_tripped() {
            if self.throttle_noticed {
                debug!("Backpressure active, skipping tick");
            } else {
                info!("Backpressure active, pausing user creation");
                self.throttle_noticed = true;
            }
            return TickOutcome::Throttled;
        }
        self.throttle_noticed = false;

        let count = self.batch_size();
        let Some(allocator) = self.allocator.as_ref() else {
            warn!("Tick before initialization, nothing to do");
            return TickOutcome::Idle;
        };

        self.batch_sequence += 1;
        let batch = match allocator.allocate_batch(self.batch_sequence, count).await {
            Ok(batch) => batch,
            Err(_) => return TickOutcome::RoomFailed,
        };
        self.state.rooms_allocated.fetch_add(1, Ordering::SeqCst);

        for index in 0..batch.agent_count {
            if index > 0 && self.governor.has_recent_failures() {
                sleep(SPAWN_STAGGER).await;
            }
            self.registry.spawn(batch.room.clone(), self.agent_ctx.clone());
            self.state.agents_spawned.fetch_add(1, Ordering::SeqCst);
        }
        debug!(
            "Tick {}: spawned {} users into room #{} ({} active)",
            self.state.ticks(),
            batch.agent_count,
            batch.room.sequence,
            self.registry.active()
        );

        if self.check_target() {
            TickOutcome::TargetReached
        } else {
            TickOutcome::Spawned(batch.agent_count)
        }
    }

    /// Initialize and drive the run to its terminal phase.
    ///
    /// Returns an error only when initialization fails.
    pub async fn run(mut self, observer: Option<Box<dyn SnapshotObserver>>) -> Result<RunSummary> {
        self.initialize().await?;

        let reporter = observer.map(|mut observer| {
            let monitor = self.monitor();
            let period = self.config.metrics_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    observer.on_snapshot(&monitor.snapshot());
                }
            })
        });

        let outcome = self.drive().await;
        if let Some(reporter) = reporter {
            reporter.abort();
        }
        self.finish(outcome).await;

        Ok(RunSummary {
            outcome,
            timeline: self.state.timeline(),
            final_snapshot: self.monitor().snapshot(),
        })
    }

    async fn drive(&mut self) -> RunOutcome {
        let mut abort = self.governor.abort_signal();
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.state.phase() == Phase::RampingUp {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = abort.wait_for(|aborted| *aborted) => return RunOutcome::Aborted,
            }
            // The tick body runs outside the select so it always completes.
            self.tick().await;
            if self.governor.is_aborted() {
                return RunOutcome::Aborted;
            }
        }

        let Some(sustain_started) = self.state.sustain_started() else {
            return RunOutcome::Aborted;
        };
        let deadline = sustain_started + self.config.sustain_duration;
        tokio::select! {
            _ = sleep_until(deadline) => RunOutcome::Completed,
            _ = abort.wait_for(|aborted| *aborted) => RunOutcome::Aborted,
        }
    }

    /// Stop every agent and record the terminal phase.
    async fn finish(&mut self, outcome: RunOutcome) {
        self.governor.shutdown();

        let signalled = self.registry.disconnect_all();
        info!("Disconnecting {} users", signalled);
        if !self.registry.wait_idle(self.config.shutdown_grace).await {
            self.registry.abort_remaining();
        }

        match outcome {
            RunOutcome::Completed => {
                self.state.transition(Phase::Completed);
                info!("Test completed");
            }
            RunOutcome::Aborted => {
                self.state.transition(Phase::Aborted);
                warn!("Test aborted: connection failures kept tripping backpressure");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GovernorConfig;
    use crate::sut::LoopbackChatServer;

    fn config(target: usize, min: usize, max: usize) -> RunConfig {
        RunConfig {
            target_population: target,
            min_per_tick: min,
            max_per_tick: max,
            sustain_duration: Duration::from_secs(5),
            min_message_interval: Duration::from_millis(200),
            max_message_interval: Duration::from_millis(400),
            dry_run: true,
            ..RunConfig::default()
        }
    }

    fn runner(config: RunConfig) -> (RampUpRunner, Arc<LoopbackChatServer>) {
        let server = LoopbackChatServer::new();
        let clients = SutClients {
            api: server.clone(),
            connector: server.clone(),
        };
        (RampUpRunner::new(config, clients).unwrap(), server)
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_ticks_of_two_reach_ten() {
        let (mut runner, _server) = runner(config(10, 2, 2));
        runner.initialize().await.unwrap();
        assert_eq!(runner.state().phase(), Phase::RampingUp);

        for expected in [2, 4, 6, 8] {
            assert_eq!(runner.tick().await, TickOutcome::Spawned(2));
            assert_eq!(runner.registry().active(), expected);
            assert_eq!(runner.state().phase(), Phase::RampingUp);
        }
        assert_eq!(runner.tick().await, TickOutcome::TargetReached);
        assert_eq!(runner.registry().active(), 10);
        assert_eq!(runner.state().phase(), Phase::Sustaining);
        assert_eq!(runner.state().ticks(), 5);

        // Further ticks do nothing once sustaining.
        assert_eq!(runner.tick().await, TickOutcome::Idle);
        assert_eq!(runner.registry().active(), 10);

        runner.finish(RunOutcome::Completed).await;
        assert_eq!(runner.registry().active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_is_clamped_to_target() {
        let (mut runner, _server) = runner(config(7, 5, 5));
        runner.initialize().await.unwrap();

        assert_eq!(runner.tick().await, TickOutcome::Spawned(5));
        assert_eq!(runner.tick().await, TickOutcome::TargetReached);
        assert_eq!(runner.registry().active(), 7);
        assert_eq!(runner.state().snapshot(7).agents_spawned, 7);
        runner.finish(RunOutcome::Completed).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_spawns_while_tripped() {
        let mut config = config(10, 2, 3);
        config.governor = GovernorConfig {
            threshold: 1,
            ..GovernorConfig::default()
        };
        let (mut runner, server) = runner(config);
        runner.initialize().await.unwrap();

        runner.governor().report_connection_failure();
        for _ in 0..3 {
            assert_eq!(runner.tick().await, TickOutcome::Throttled);
        }
        assert_eq!(runner.registry().active(), 0);
        assert_eq!(server.room_count(), 0);
        assert_eq!(runner.state().ticks(), 3);

        // Released after the grace delay.
        sleep(Duration::from_secs(11)).await;
        assert!(matches!(runner.tick().await, TickOutcome::Spawned(_)));
        runner.finish(RunOutcome::Completed).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_room_failure_spawns_nobody() {
        let (mut runner, server) = runner(config(10, 2, 2));
        runner.initialize().await.unwrap();
        server.set_room_creation_failing(true);

        assert_eq!(runner.tick().await, TickOutcome::RoomFailed);
        assert_eq!(runner.registry().active(), 0);
        assert_eq!(runner.metrics().counters().errors_room, 1);
        assert!(!runner.governor().has_recent_failures());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialization_failure_is_fatal() {
        let (runner, server) = runner(config(10, 2, 2));
        server.set_logins_failing(true);

        let err = runner.run(None).await.unwrap_err();
        assert!(err.to_string().contains("admin user"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_completes_after_sustain_deadline() {
        let (runner, server) = runner(config(4, 2, 2));
        let summary = runner.run(None).await.unwrap();

        assert_eq!(summary.outcome, RunOutcome::Completed);
        let run = &summary.final_snapshot.run;
        assert_eq!(run.phase, Phase::Completed);
        assert!(run.sustain_elapsed_secs.unwrap() >= 5.0);
        assert_eq!(run.active, 0);
        assert_eq!(run.rooms_allocated, 2);
        assert!(summary.timeline.sustain_started.is_some());
        assert!(summary.timeline.finished >= summary.timeline.sustain_started);

        let counters = &summary.final_snapshot.metrics.counters;
        assert_eq!(counters.connected, 4);
        assert_eq!(counters.disconnected_by_client, 4);
        assert!(counters.messages_sent > 0);
        assert_eq!(server.open_connections(), 0);
    }

    #[test]
    fn test_phase_transitions_are_one_way() {
        let state = RunState::new(&config(4, 2, 2));
        assert!(!state.transition(Phase::Sustaining));
        assert!(state.transition(Phase::RampingUp));
        assert!(state.transition(Phase::Sustaining));
        assert!(!state.transition(Phase::Sustaining));
        assert!(!state.transition(Phase::RampingUp));
        assert!(state.transition(Phase::Completed));
        assert!(!state.transition(Phase::Aborted));
        assert!(state.phase().is_terminal());
    }
}
