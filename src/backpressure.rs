//! # Backpressure Governor
//!
//! Admission control for the spawner. Agents report every connection failure
//! here; when `threshold` failures land inside the sliding `window` the
//! governor trips and the scheduler stops spawning. A single timer per trip
//! episode releases it again after the grace delay, clearing the window.
//!
//! Every trip increments a counter. Once the counter exceeds `max_trips`
//! the governor raises the abort signal instead of scheduling a release,
//! and the run ends as aborted.

use crate::config::GovernorConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// What a single failure report did to the governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Logged in the window, no state change.
    Recorded,
    /// This report tripped the governor.
    Tripped,
    /// This report tripped the governor past its trip limit.
    Aborted,
}

/// Display view of the governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GovernorStatus {
    pub tripped: bool,
    pub trip_count: u32,
    pub max_trips: u32,
    pub recent_failures: usize,
}

struct WindowState {
    failures: VecDeque<Instant>,
    tripped: bool,
    trip_count: u32,
    release: Option<JoinHandle<()>>,
}

impl WindowState {
    fn evict(&mut self, now: Instant, window: std::time::Duration) {
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_duration_since(oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

pub struct BackpressureGovernor {
    config: GovernorConfig,
    state: Mutex<WindowState>,
    abort: watch::Sender<bool>,
}

impl BackpressureGovernor {
    pub fn new(config: GovernorConfig) -> Arc<Self> {
        let (abort, _) = watch::channel(false);
        Arc::new(Self {
            config,
            state: Mutex::new(WindowState {
                failures: VecDeque::new(),
                tripped: false,
                trip_count: 0,
                release: None,
            }),
            abort,
        })
    }

    /// Record one connection failure.
    ///
    /// Must be called from within a tokio runtime: tripping spawns the
    /// release timer.
    pub fn report_connection_failure(self: &Arc<Self>) -> ReportOutcome {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.failures.push_back(now);
        state.evict(now, self.config.window);

        if state.tripped || state.failures.len() < self.config.threshold {
            return ReportOutcome::Recorded;
        }

        state.tripped = true;
        state.trip_count += 1;
        warn!(
            "Backpressure activated ({}/{}): {} connection errors in {:?}",
            state.trip_count,
            self.config.max_trips,
            state.failures.len(),
            self.config.window
        );

        if state.trip_count > self.config.max_trips {
            error!(
                "Backpressure tripped {} times (limit {}), aborting run",
                state.trip_count, self.config.max_trips
            );
            self.abort.send_replace(true);
            return ReportOutcome::Aborted;
        }

        let governor = Arc::clone(self);
        let grace = self.config.grace;
        state.release = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            governor.release();
        }));
        ReportOutcome::Tripped
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.failures.clear();
        state.tripped = false;
        state.release = None;
        info!("Backpressure released, resuming spawns");
    }

    pub fn is_tripped(&self) -> bool {
        self.state.lock().tripped
    }

    pub fn trip_count(&self) -> u32 {
        self.state.lock().trip_count
    }

    /// Failures currently inside the window.
    pub fn window_len(&self) -> usize {
        let mut state = self.state.lock();
        state.evict(Instant::now(), self.config.window);
        state.failures.len()
    }

    pub fn has_recent_failures(&self) -> bool {
        self.window_len() > 0
    }

    pub fn is_aborted(&self) -> bool {
        *self.abort.borrow()
    }

    /// Receiver that flips to `true` when the trip limit is exceeded.
    pub fn abort_signal(&self) -> watch::Receiver<bool> {
        self.abort.subscribe()
    }

    pub fn status(&self) -> GovernorStatus {
        let mut state = self.state.lock();
        state.evict(Instant::now(), self.config.window);
        GovernorStatus {
            tripped: state.tripped,
            trip_count: state.trip_count,
            max_trips: self.config.max_trips,
            recent_failures: state.failures.len(),
        }
    }

    /// Cancel a pending release timer.
    pub fn shutdown(&self) {
        if let Some(release) = self.state.lock().release.take() {
            release.abort();
        }
    }
}
