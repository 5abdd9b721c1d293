use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Chat Ramp-Up Load Tester - grows a population of simulated chat users
/// toward a target, holds it, and reports latency, throughput and errors
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Target number of concurrent simulated users
    #[clap(short = 'u', long, default_value_t = crate::defaults::TARGET_POPULATION, help_heading = "Ramp-Up")]
    pub max_users: usize,

    /// Minimum users to add per tick (one tick per second)
    #[clap(long, default_value_t = crate::defaults::MIN_USERS_PER_TICK, help_heading = "Ramp-Up")]
    pub min_users_per_second: usize,

    /// Maximum users to add per tick
    #[clap(long, default_value_t = crate::defaults::MAX_USERS_PER_TICK, help_heading = "Ramp-Up")]
    pub max_users_per_second: usize,

    /// How long to hold the target population (e.g. "180s", "3m")
    #[clap(short = 's', long, value_parser = parse_duration, default_value = crate::defaults::SUSTAIN_DURATION, help_heading = "Ramp-Up")]
    pub sustain_duration: Duration,

    /// Minimum delay between two messages of one user, in milliseconds
    #[clap(long, default_value_t = crate::defaults::MESSAGE_INTERVAL_MIN_MS, help_heading = "Messaging")]
    pub message_interval_min: u64,

    /// Maximum delay between two messages of one user, in milliseconds
    #[clap(long, default_value_t = crate::defaults::MESSAGE_INTERVAL_MAX_MS, help_heading = "Messaging")]
    pub message_interval_max: u64,

    /// Number of backlog messages requested after joining a room
    #[clap(long, default_value_t = crate::defaults::BACKLOG_LIMIT, help_heading = "Messaging")]
    pub backlog_limit: usize,

    /// Backend REST API URL
    #[clap(long, default_value = crate::defaults::API_URL, help_heading = "Target")]
    pub api_url: String,

    /// Socket.IO server URL
    #[clap(long, default_value = crate::defaults::SOCKET_URL, help_heading = "Target")]
    pub socket_url: String,

    /// Send every user to this existing room instead of creating one per tick
    #[clap(long, help_heading = "Target")]
    pub room_id: Option<String>,

    /// Run against an in-process chat server instead of a real deployment
    #[clap(long, default_value_t = false, help_heading = "Target")]
    pub dry_run: bool,

    /// Deadline for each REST request
    #[clap(long, value_parser = parse_duration, default_value = crate::defaults::REQUEST_TIMEOUT, help_heading = "Target")]
    pub request_timeout: Duration,

    /// Deadline for the socket handshake
    #[clap(long, value_parser = parse_duration, default_value = crate::defaults::CONNECT_TIMEOUT, help_heading = "Target")]
    pub connect_timeout: Duration,

    /// Sliding window over which connection failures are counted
    #[clap(long, value_parser = parse_duration, default_value = crate::defaults::BACKPRESSURE_WINDOW, help_heading = "Backpressure")]
    pub backpressure_window: Duration,

    /// Failures within the window that pause spawning
    #[clap(long, default_value_t = crate::defaults::BACKPRESSURE_THRESHOLD, help_heading = "Backpressure")]
    pub backpressure_threshold: usize,

    /// Pause length after a trip (defaults to twice the window)
    #[clap(long, value_parser = parse_duration, help_heading = "Backpressure")]
    pub backpressure_grace: Option<Duration>,

    /// Abort the run once the governor has tripped more often than this
    #[clap(long, default_value_t = crate::defaults::MAX_BACKPRESSURE_TRIPS, help_heading = "Backpressure")]
    pub max_backpressure_trips: u32,

    /// Interval between live metrics tables
    #[clap(long, value_parser = parse_duration, default_value = crate::defaults::METRICS_INTERVAL, help_heading = "Output")]
    pub metrics_interval: Duration,

    /// Time given to agents to close after the disconnect order
    #[clap(long, value_parser = parse_duration, default_value = crate::defaults::SHUTDOWN_GRACE, help_heading = "Output")]
    pub shutdown_grace: Duration,

    /// Final results file (JSON)
    #[clap(short = 'o', long, help_heading = "Output")]
    pub output_file: Option<PathBuf>,

    /// JSON file that receives every periodic snapshot while the run progresses
    #[clap(long, help_heading = "Output")]
    pub streaming_output: Option<PathBuf>,

    /// Also write logs to this file
    #[clap(long, help_heading = "Output")]
    pub log_file: Option<PathBuf>,

    /// Suppress the periodic metrics table
    #[clap(short = 'q', long, default_value_t = false, help_heading = "Output")]
    pub quiet: bool,

    /// Verbose logging (-v debug, -vv trace)
    #[clap(short = 'v', long, action = clap::ArgAction::Count, help_heading = "Output")]
    pub verbose: u8,
}

/// Parse duration from string (e.g., "500ms", "10s", "5m", "1h")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // bare numbers are seconds
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be non-negative: {}", s));
    }

    let millis = match unit {
        "ms" => num,
        "s" => num * 1_000.0,
        "m" => num * 60_000.0,
        "h" => num * 3_600_000.0,
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Ok(Duration::from_millis(millis as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("180").unwrap(), Duration::from_secs(180));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("-3s").is_err());
    }

    #[test]
    fn test_defaults_match_ramp_up_profile() {
        let args = Args::parse_from(["chat-rampup"]);
        assert_eq!(args.max_users, 500);
        assert_eq!(args.min_users_per_second, 2);
        assert_eq!(args.max_users_per_second, 5);
        assert_eq!(args.sustain_duration, Duration::from_secs(180));
        assert_eq!(args.message_interval_min, 500);
        assert_eq!(args.message_interval_max, 3000);
        assert_eq!(args.api_url, "http://localhost:5001");
        assert_eq!(args.socket_url, "http://localhost:5002");
        assert_eq!(args.backpressure_window, Duration::from_secs(5));
        assert_eq!(args.backpressure_grace, None);
        assert!(args.room_id.is_none());
        assert!(!args.dry_run);
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::parse_from([
            "chat-rampup",
            "-u",
            "20",
            "--sustain-duration",
            "30s",
            "--room-id",
            "abc",
            "--backpressure-grace",
            "6s",
            "-vv",
        ]);
        assert_eq!(args.max_users, 20);
        assert_eq!(args.sustain_duration, Duration::from_secs(30));
        assert_eq!(args.room_id.as_deref(), Some("abc"));
        assert_eq!(args.backpressure_grace, Some(Duration::from_secs(6)));
        assert_eq!(args.verbose, 2);
    }
}
