//! # Metrics Aggregator
//!
//! Every agent reports into one shared [`Metrics`] instance. Counters are
//! atomics, latency samples sit behind short `parking_lot` critical sections,
//! and readers only ever see a [`MetricsSnapshot`] copy. Counters are read one
//! at a time, so a snapshot taken under load may split an in-flight event
//! (a connect counted, its matching disconnect not yet).
//!
//! ## Percentiles
//!
//! Percentiles use the sorted-index rule over the raw samples: sort ascending
//! and pick index `ceil(p / 100 * n) - 1`, clamped to `[0, n - 1]`. A query
//! holds a series lock only while copying it; the sort runs on the copy after
//! the lock is released.
//!
//! Each series also feeds an HDR histogram, which only contributes the
//! standard deviation and the p99.9 tail in the summary.

use crate::error::ErrorKind;
use crate::sut::DisconnectReason;
use anyhow::Result;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// One observation reported by an agent or the allocator.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    UserCreated,
    RoomCreated,
    RoomJoined,
    RoomInfoFetched,
    Connected { setup: Duration },
    Disconnected(DisconnectReason),
    MessageSent { latency: Duration },
    MessagesReceived(u64),
    MessageRead,
    ReadAckReceived,
    BacklogFetched,
    Error(ErrorKind),
}

/// Monotonic counters at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub users_created: u64,
    pub rooms_created: u64,
    pub room_joins_rest: u64,
    pub room_info_fetches: u64,
    pub connected: u64,
    pub disconnected: u64,
    pub disconnected_by_server: u64,
    pub disconnected_by_client: u64,
    pub disconnected_by_timeout: u64,
    pub disconnected_other: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_read: u64,
    pub read_acks_received: u64,
    pub backlog_fetches: u64,
    pub errors_auth: u64,
    pub errors_room: u64,
    pub errors_connection: u64,
    pub errors_message: u64,
}

impl Counters {
    pub fn total_errors(&self) -> u64 {
        self.errors_auth + self.errors_room + self.errors_connection + self.errors_message
    }

    /// Channels opened and not yet closed.
    pub fn currently_connected(&self) -> u64 {
        self.connected.saturating_sub(self.disconnected)
    }
}

/// Summary of one latency series, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: usize,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub p999_ms: f64,
    pub std_dev_ms: f64,
}

/// Copy of everything the aggregator knows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub elapsed_secs: f64,
    pub counters: Counters,
    pub messages_sent_per_second: f64,
    pub messages_received_per_second: f64,
    pub message_latency: LatencyStats,
    pub connection_time: LatencyStats,
}

/// Sorted-index percentile over ascending `sorted` samples.
///
/// Returns `None` for an empty slice.
pub fn percentile(sorted: &[u64], p: f64) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    let rank = (p / 100.0 * n as f64).ceil() as isize - 1;
    let index = rank.clamp(0, n as isize - 1) as usize;
    Some(sorted[index])
}

/// Raw samples (microseconds) plus an HDR histogram of the same values.
#[derive(Clone)]
struct LatencySeries {
    samples: Vec<u64>,
    histogram: Histogram<u64>,
}

impl LatencySeries {
    fn new() -> Result<Self> {
        Ok(Self {
            samples: Vec::new(),
            histogram: Histogram::<u64>::new(3)?,
        })
    }

    fn record(&mut self, value: Duration) {
        let micros = value.as_micros().min(u64::MAX as u128) as u64;
        self.samples.push(micros);
        // Auto-resizing histogram; a rejected value only loses the tail summary.
        let _ = self.histogram.record(micros);
    }

    /// Copy `series` under its lock, then summarize the copy unlocked.
    fn stats_of(series: &Mutex<LatencySeries>) -> LatencyStats {
        let copy = series.lock().clone();
        copy.into_stats()
    }

    fn into_stats(self) -> LatencyStats {
        if self.samples.is_empty() {
            return LatencyStats::default();
        }

        let mut sorted = self.samples;
        sorted.sort_unstable();

        let to_ms = |micros: u64| micros as f64 / 1_000.0;
        let pick = |p: f64| percentile(&sorted, p).map_or(0.0, to_ms);
        let sum: u128 = sorted.iter().map(|&v| v as u128).sum();

        LatencyStats {
            count: sorted.len(),
            avg_ms: sum as f64 / sorted.len() as f64 / 1_000.0,
            min_ms: to_ms(sorted[0]),
            max_ms: to_ms(sorted[sorted.len() - 1]),
            p50_ms: pick(50.0),
            p95_ms: pick(95.0),
            p99_ms: pick(99.0),
            p999_ms: to_ms(self.histogram.value_at_percentile(99.9)),
            std_dev_ms: self.histogram.stdev() / 1_000.0,
        }
    }
}

/// Run-scoped, concurrency-safe metrics store.
pub struct Metrics {
    started: Instant,
    users_created: AtomicU64,
    rooms_created: AtomicU64,
    room_joins_rest: AtomicU64,
    room_info_fetches: AtomicU64,
    connected: AtomicU64,
    disconnected: AtomicU64,
    disconnected_by_server: AtomicU64,
    disconnected_by_client: AtomicU64,
    disconnected_by_timeout: AtomicU64,
    disconnected_other: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_read: AtomicU64,
    read_acks_received: AtomicU64,
    backlog_fetches: AtomicU64,
    errors_auth: AtomicU64,
    errors_room: AtomicU64,
    errors_connection: AtomicU64,
    errors_message: AtomicU64,
    message_latency: Mutex<LatencySeries>,
    connection_time: Mutex<LatencySeries>,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Metrics {
    pub fn new() -> Result<Self> {
        Ok(Self {
            started: Instant::now(),
            users_created: AtomicU64::new(0),
            rooms_created: AtomicU64::new(0),
            room_joins_rest: AtomicU64::new(0),
            room_info_fetches: AtomicU64::new(0),
            connected: AtomicU64::new(0),
            disconnected: AtomicU64::new(0),
            disconnected_by_server: AtomicU64::new(0),
            disconnected_by_client: AtomicU64::new(0),
            disconnected_by_timeout: AtomicU64::new(0),
            disconnected_other: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_read: AtomicU64::new(0),
            read_acks_received: AtomicU64::new(0),
            backlog_fetches: AtomicU64::new(0),
            errors_auth: AtomicU64::new(0),
            errors_room: AtomicU64::new(0),
            errors_connection: AtomicU64::new(0),
            errors_message: AtomicU64::new(0),
            message_latency: Mutex::new(LatencySeries::new()?),
            connection_time: Mutex::new(LatencySeries::new()?),
        })
    }

    /// Record one event. Safe to call from any task.
    pub fn record(&self, event: MetricEvent) {
        match event {
            MetricEvent::UserCreated => bump(&self.users_created),
            MetricEvent::RoomCreated => bump(&self.rooms_created),
            MetricEvent::RoomJoined => bump(&self.room_joins_rest),
            MetricEvent::RoomInfoFetched => bump(&self.room_info_fetches),
            MetricEvent::Connected { setup } => {
                bump(&self.connected);
                self.connection_time.lock().record(setup);
            }
            MetricEvent::Disconnected(reason) => {
                bump(&self.disconnected);
                bump(match reason {
                    DisconnectReason::ServerInitiated => &self.disconnected_by_server,
                    DisconnectReason::ClientInitiated => &self.disconnected_by_client,
                    DisconnectReason::Timeout => &self.disconnected_by_timeout,
                    DisconnectReason::Other => &self.disconnected_other,
                });
            }
            MetricEvent::MessageSent { latency } => {
                bump(&self.messages_sent);
                self.message_latency.lock().record(latency);
            }
            MetricEvent::MessagesReceived(count) => {
                self.messages_received.fetch_add(count, Ordering::Relaxed);
            }
            MetricEvent::MessageRead => bump(&self.messages_read),
            MetricEvent::ReadAckReceived => bump(&self.read_acks_received),
            MetricEvent::BacklogFetched => bump(&self.backlog_fetches),
            MetricEvent::Error(kind) => bump(match kind {
                ErrorKind::Auth => &self.errors_auth,
                ErrorKind::Room => &self.errors_room,
                ErrorKind::Connection => &self.errors_connection,
                ErrorKind::Message => &self.errors_message,
            }),
        }
    }

    /// Current counter values. Each counter is loaded on its own, so under
    /// concurrent writers related counters are not guaranteed to be mutually
    /// consistent; `currently_connected` saturates instead of underflowing.
    pub fn counters(&self) -> Counters {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        Counters {
            users_created: load(&self.users_created),
            rooms_created: load(&self.rooms_created),
            room_joins_rest: load(&self.room_joins_rest),
            room_info_fetches: load(&self.room_info_fetches),
            connected: load(&self.connected),
            disconnected: load(&self.disconnected),
            disconnected_by_server: load(&self.disconnected_by_server),
            disconnected_by_client: load(&self.disconnected_by_client),
            disconnected_by_timeout: load(&self.disconnected_by_timeout),
            disconnected_other: load(&self.disconnected_other),
            messages_sent: load(&self.messages_sent),
            messages_received: load(&self.messages_received),
            messages_read: load(&self.messages_read),
            read_acks_received: load(&self.read_acks_received),
            backlog_fetches: load(&self.backlog_fetches),
            errors_auth: load(&self.errors_auth),
            errors_room: load(&self.errors_room),
            errors_connection: load(&self.errors_connection),
            errors_message: load(&self.errors_message),
        }
    }

    /// Copy the counters and latency summaries; throughput is computed fresh
    /// from elapsed time.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let elapsed = self.started.elapsed().as_secs_f64();
        let counters = self.counters();
        let rate = |count: u64| {
            if elapsed > 0.0 {
                count as f64 / elapsed
            } else {
                0.0
            }
        };

        MetricsSnapshot {
            timestamp: chrono::Utc::now(),
            elapsed_secs: elapsed,
            messages_sent_per_second: rate(counters.messages_sent),
            messages_received_per_second: rate(counters.messages_received),
            message_latency: LatencySeries::stats_of(&self.message_latency),
            connection_time: LatencySeries::stats_of(&self.connection_time),
            counters,
        }
    }
}
