//! # Chat Ramp-Up Load Engine
//!
//! Gradually grows a population of simulated chat users against a chat
//! service (REST API plus Socket.IO event channel), holds the population
//! steady for a sustain period and reports live metrics along the way.
//!
//! ## Run Lifecycle
//!
//! A run moves one way through `Initializing -> RampingUp -> Sustaining ->
//! Completed`, or ends in `Aborted` when the backpressure governor gives up.
//! Every second of `RampingUp` one tick allocates a room and spawns a batch
//! of users into it.
//!
//! ## Architecture Overview
//!
//! - `scheduler`: phase state machine, tick loop and the run driver
//! - `backpressure`: sliding-window failure detector that pauses spawning
//! - `allocator`: creates one room per tick for the batch
//! - `agent`: the simulated user task and the registry that owns them
//! - `metrics`: counters, latency samples and snapshots
//! - `sut`: the chat service clients, plus an in-process loopback server
//! - `report` / `results`: console table and JSON output
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use chat_rampup::{RampUpRunner, RunConfig, SutFactory};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RunConfig {
//!         target_population: 50,
//!         dry_run: true,
//!         ..RunConfig::default()
//!     };
//!     let clients = SutFactory::create(&config)?;
//!     let summary = RampUpRunner::new(config, clients)?.run(None).await?;
//!     println!("Finished: {:?}", summary.outcome);
//!     Ok(())
//! }
//! ```

/// Simulated users and the registry that tracks them
///
/// Each user logs in, joins its batch room over REST, opens an event
/// channel and then chats until it is told to stop.
pub mod agent;

pub mod allocator;

/// Connection-failure backpressure
///
/// Counts connection failures in a sliding window. Crossing the threshold
/// pauses user creation for a grace period; too many pauses abort the run.
pub mod backpressure;

/// Command-line interface
///
/// Argument parsing using clap, including human-readable durations
/// (e.g. "180s", "2m").
pub mod cli;

pub mod config;
pub mod error;
pub mod logging;

/// Counters and latency statistics
///
/// Aggregates the events reported by every simulated user. Percentiles
/// come from sorted samples; HDR histograms supply the tail and spread.
pub mod metrics;

pub mod report;

/// Result output
///
/// Final JSON results file and optional streaming of periodic snapshots.
pub mod results;

/// Phase scheduling and the run driver
pub mod scheduler;

/// Clients for the system under test
pub mod sut;

pub mod utils;

pub use cli::Args;
pub use config::{GovernorConfig, RunConfig};
pub use metrics::{Metrics, MetricsSnapshot};
pub use results::ResultsManager;
pub use scheduler::{Phase, RampUpRunner, RunOutcome, RunSnapshot, RunSummary};
pub use sut::{SutClients, SutFactory};

/// The current version, recorded in result files
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
///
/// Durations are strings because they are parsed by the CLI the same way
/// user input is.
pub mod defaults {
    /// Default number of simulated users to ramp up to
    pub const TARGET_POPULATION: usize = 500;

    /// Default lower bound on users spawned per tick
    pub const MIN_USERS_PER_TICK: usize = 2;

    /// Default upper bound on users spawned per tick
    pub const MAX_USERS_PER_TICK: usize = 5;

    /// How long to hold the full population
    pub const SUSTAIN_DURATION: &str = "180s";

    /// Shortest pause between two messages of one user, in milliseconds
    pub const MESSAGE_INTERVAL_MIN_MS: u64 = 500;

    /// Longest pause between two messages of one user, in milliseconds
    pub const MESSAGE_INTERVAL_MAX_MS: u64 = 3000;

    /// Previous messages requested after joining a room
    pub const BACKLOG_LIMIT: usize = 30;

    pub const API_URL: &str = "http://localhost:5001";
    pub const SOCKET_URL: &str = "http://localhost:5002";

    pub const REQUEST_TIMEOUT: &str = "5s";
    pub const CONNECT_TIMEOUT: &str = "10s";

    /// Sliding window for counting connection failures
    ///
    /// Kept in two forms: the CLI default and the value used by
    /// `GovernorConfig::default`.
    pub const BACKPRESSURE_WINDOW: &str = "5s";
    pub const BACKPRESSURE_WINDOW_SECS: u64 = 5;

    /// Connection failures inside the window that trip the governor
    pub const BACKPRESSURE_THRESHOLD: usize = 3;

    /// Trips tolerated before the run is aborted
    pub const MAX_BACKPRESSURE_TRIPS: u32 = 20;

    pub const METRICS_INTERVAL: &str = "2s";

    /// Time agents get to close their channels at the end of a run
    pub const SHUTDOWN_GRACE: &str = "2s";

    /// Password shared by all test accounts
    pub const USER_PASSWORD: &str = "Test1234!";
}
