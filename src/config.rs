//! Run configuration.
//!
//! [`RunConfig`] is built once from the command line, validated, and then
//! shared read-only by every component of the run.

use crate::cli::Args;
use crate::sut::RoomId;
use anyhow::{bail, Result};
use serde::Serialize;
use std::time::Duration;

/// Backpressure governor tuning.
#[derive(Debug, Clone, Serialize)]
pub struct GovernorConfig {
    /// Sliding window over which connection failures are counted.
    pub window: Duration,
    /// Failures inside the window that trip the governor.
    pub threshold: usize,
    /// How long spawning stays paused after a trip.
    pub grace: Duration,
    /// Trips allowed before the run is aborted.
    pub max_trips: u32,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        let window = Duration::from_secs(crate::defaults::BACKPRESSURE_WINDOW_SECS);
        Self {
            window,
            threshold: crate::defaults::BACKPRESSURE_THRESHOLD,
            grace: window * 2,
            max_trips: crate::defaults::MAX_BACKPRESSURE_TRIPS,
        }
    }
}

/// Immutable settings for one ramp-up run.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    pub target_population: usize,
    pub min_per_tick: usize,
    pub max_per_tick: usize,
    pub sustain_duration: Duration,
    pub min_message_interval: Duration,
    pub max_message_interval: Duration,
    pub backlog_limit: usize,
    pub api_url: String,
    pub socket_url: String,
    pub room_id: Option<RoomId>,
    pub dry_run: bool,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub metrics_interval: Duration,
    pub shutdown_grace: Duration,
    pub governor: GovernorConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            target_population: crate::defaults::TARGET_POPULATION,
            min_per_tick: crate::defaults::MIN_USERS_PER_TICK,
            max_per_tick: crate::defaults::MAX_USERS_PER_TICK,
            sustain_duration: Duration::from_secs(180),
            min_message_interval: Duration::from_millis(crate::defaults::MESSAGE_INTERVAL_MIN_MS),
            max_message_interval: Duration::from_millis(crate::defaults::MESSAGE_INTERVAL_MAX_MS),
            backlog_limit: crate::defaults::BACKLOG_LIMIT,
            api_url: crate::defaults::API_URL.to_string(),
            socket_url: crate::defaults::SOCKET_URL.to_string(),
            room_id: None,
            dry_run: false,
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            metrics_interval: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(2),
            governor: GovernorConfig::default(),
        }
    }
}

impl RunConfig {
    /// Build and validate the configuration from parsed arguments.
    pub fn from_args(args: &Args) -> Result<Self> {
        let config = Self {
            target_population: args.max_users,
            min_per_tick: args.min_users_per_second,
            max_per_tick: args.max_users_per_second,
            sustain_duration: args.sustain_duration,
            min_message_interval: Duration::from_millis(args.message_interval_min),
            max_message_interval: Duration::from_millis(args.message_interval_max),
            backlog_limit: args.backlog_limit,
            api_url: args.api_url.clone(),
            socket_url: args.socket_url.clone(),
            room_id: args
                .room_id
                .as_deref()
                .filter(|id| !id.is_empty())
                .map(RoomId::from),
            dry_run: args.dry_run,
            request_timeout: args.request_timeout,
            connect_timeout: args.connect_timeout,
            metrics_interval: args.metrics_interval,
            shutdown_grace: args.shutdown_grace,
            governor: GovernorConfig {
                window: args.backpressure_window,
                threshold: args.backpressure_threshold,
                grace: args
                    .backpressure_grace
                    .unwrap_or(args.backpressure_window * 2),
                max_trips: args.max_backpressure_trips,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.target_population == 0 {
            bail!("Target population must be at least 1");
        }
        if self.min_per_tick == 0 {
            bail!("Minimum users per tick must be at least 1");
        }
        if self.min_per_tick > self.max_per_tick {
            bail!(
                "Minimum users per tick ({}) exceeds maximum ({})",
                self.min_per_tick,
                self.max_per_tick
            );
        }
        if self.min_message_interval > self.max_message_interval {
            bail!(
                "Minimum message interval ({:?}) exceeds maximum ({:?})",
                self.min_message_interval,
                self.max_message_interval
            );
        }
        if self.max_message_interval.is_zero() {
            bail!("Maximum message interval must be greater than zero");
        }
        if self.governor.threshold == 0 {
            bail!("Backpressure threshold must be at least 1");
        }
        if self.governor.window.is_zero() {
            bail!("Backpressure window must be greater than zero");
        }
        if self.metrics_interval.is_zero() {
            bail!("Metrics interval must be greater than zero");
        }
        if !self.dry_run {
            for (name, url) in [("API", &self.api_url), ("Socket", &self.socket_url)] {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    bail!("{} URL must start with http:// or https://: {}", name, url);
                }
            }
        }
        Ok(())
    }

    /// Rooms the run is expected to create, assuming average batch sizes.
    pub fn estimated_rooms(&self) -> usize {
        if self.room_id.is_some() {
            return 1;
        }
        let average = (self.min_per_tick + self.max_per_tick) as f64 / 2.0;
        (self.target_population as f64 / average).ceil() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["chat-rampup"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_from_args_uses_defaults() {
        let config = RunConfig::from_args(&args(&[])).unwrap();
        assert_eq!(config.target_population, 500);
        assert_eq!(config.governor.window, Duration::from_secs(5));
        assert_eq!(config.governor.threshold, 3);
        assert_eq!(config.governor.grace, Duration::from_secs(10));
        assert_eq!(config.governor.max_trips, 20);
        assert_eq!(config.backlog_limit, 30);
        assert!(config.room_id.is_none());
    }

    #[test]
    fn test_grace_follows_window_unless_given() {
        let config = RunConfig::from_args(&args(&["--backpressure-window", "3s"])).unwrap();
        assert_eq!(config.governor.grace, Duration::from_secs(6));

        let config = RunConfig::from_args(&args(&[
            "--backpressure-window",
            "3s",
            "--backpressure-grace",
            "1s",
        ]))
        .unwrap();
        assert_eq!(config.governor.grace, Duration::from_secs(1));
    }

    #[test]
    fn test_rejects_inverted_ranges() {
        assert!(RunConfig::from_args(&args(&[
            "--min-users-per-second",
            "6",
            "--max-users-per-second",
            "5"
        ]))
        .is_err());
        assert!(RunConfig::from_args(&args(&[
            "--message-interval-min",
            "4000",
            "--message-interval-max",
            "3000"
        ]))
        .is_err());
        assert!(RunConfig::from_args(&args(&["-u", "0"])).is_err());
        assert!(RunConfig::from_args(&args(&["--backpressure-threshold", "0"])).is_err());
    }

    #[test]
    fn test_equal_bounds_are_accepted() {
        let config = RunConfig::from_args(&args(&[
            "--min-users-per-second",
            "2",
            "--max-users-per-second",
            "2",
            "--message-interval-min",
            "1000",
            "--message-interval-max",
            "1000",
        ]))
        .unwrap();
        assert_eq!(config.min_per_tick, config.max_per_tick);
    }

    #[test]
    fn test_url_scheme_is_checked_outside_dry_runs() {
        assert!(RunConfig::from_args(&args(&["--api-url", "localhost:5001"])).is_err());
        assert!(
            RunConfig::from_args(&args(&["--api-url", "localhost:5001", "--dry-run"])).is_ok()
        );
    }

    #[test]
    fn test_estimated_rooms() {
        let config = RunConfig {
            target_population: 500,
            min_per_tick: 2,
            max_per_tick: 5,
            ..RunConfig::default()
        };
        assert_eq!(config.estimated_rooms(), 143);

        let fixed = RunConfig {
            room_id: Some(RoomId::from("lobby")),
            ..config
        };
        assert_eq!(fixed.estimated_rooms(), 1);
    }
}
