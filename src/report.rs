//! Console rendering of the run: the start banner, the periodic metrics
//! table and the final summary.

use crate::config::RunConfig;
use crate::results::ResultsManager;
use crate::scheduler::{Phase, RunOutcome, RunSnapshot, RunSummary, SnapshotObserver};
use crate::utils::{
    create_progress_indicator, format_duration, format_millis, format_rate, format_secs,
    format_table_row, format_table_separator,
};
use colored::*;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

const WIDTHS: [usize; 4] = [22, 22, 22, 14];

/// Configuration banner printed before the run starts.
pub fn render_banner(config: &RunConfig, transport: &str) -> String {
    let mut lines = vec![
        format!("{}", "=== Chat Ramp-Up Load Test ===".bold().cyan()),
        format!("Target users:        {}", config.target_population),
        format!(
            "Users per tick:      {}-{}",
            config.min_per_tick, config.max_per_tick
        ),
        format!(
            "Sustain duration:    {}",
            format_duration(config.sustain_duration)
        ),
        format!(
            "Message interval:    {}-{}",
            format_duration(config.min_message_interval),
            format_duration(config.max_message_interval)
        ),
        format!("API URL:             {}", config.api_url),
        format!("Socket URL:          {} ({})", config.socket_url, transport),
    ];
    match &config.room_id {
        Some(room) => lines.push(format!("Room:                {} (fixed)", room)),
        None => lines.push(format!(
            "Rooms (estimated):   {} (one per tick)",
            config.estimated_rooms()
        )),
    }
    lines.push(format!(
        "Backpressure:        {} failures / {} -> pause {}, abort after {} trips",
        config.governor.threshold,
        format_duration(config.governor.window),
        format_duration(config.governor.grace),
        config.governor.max_trips
    ));
    lines.join("\n")
}

fn phase_cell(snapshot: &RunSnapshot) -> String {
    let run = &snapshot.run;
    match run.phase {
        Phase::Initializing => "Initializing".to_string(),
        Phase::RampingUp => format!(
            "Ramping Up ({} to go)",
            run.users_to_go
        ),
        Phase::Sustaining => format!(
            "Sustaining ({})",
            format_secs(run.sustain_elapsed_secs.unwrap_or(0.0))
        ),
        Phase::Completed => "Completed".to_string(),
        Phase::Aborted => "Aborted".to_string(),
    }
}

/// Periodic metrics table.
pub fn render_table(snapshot: &RunSnapshot) -> String {
    let run = &snapshot.run;
    let counters = &snapshot.metrics.counters;
    let latency = &snapshot.metrics.message_latency;
    let connection = &snapshot.metrics.connection_time;

    let remaining = run
        .sustain_remaining_secs
        .map(|secs| format!("{} left", format_secs(secs)))
        .unwrap_or_default();
    let backpressure = if snapshot.governor.trip_count > 0 || snapshot.governor.tripped {
        format!(
            "{}/{}{}",
            snapshot.governor.trip_count,
            snapshot.governor.max_trips,
            if snapshot.governor.tripped { " (active)" } else { "" }
        )
    } else {
        "-".to_string()
    };

    let rows: Vec<[String; 4]> = vec![
        [
            "Test Phase".into(),
            phase_cell(snapshot),
            "Rooms Created".into(),
            counters.rooms_created.to_string(),
        ],
        [
            "Elapsed Time".into(),
            format_secs(run.elapsed_secs),
            "Users Created".into(),
            counters.users_created.to_string(),
        ],
        [
            "Time Remaining".into(),
            remaining,
            "Active Users".into(),
            run.active.to_string(),
        ],
        [
            "Backpressure".into(),
            backpressure,
            "Connected".into(),
            counters.currently_connected().to_string(),
        ],
        [
            "Progress".into(),
            create_progress_indicator(run.active, run.target, 20),
            "Ticks".into(),
            run.ticks.to_string(),
        ],
    ];
    let traffic: Vec<[String; 4]> = vec![
        [
            "Room Joins (REST)".into(),
            counters.room_joins_rest.to_string(),
            "Messages Sent".into(),
            counters.messages_sent.to_string(),
        ],
        [
            "Room Info Fetches".into(),
            counters.room_info_fetches.to_string(),
            "Messages Received".into(),
            counters.messages_received.to_string(),
        ],
        [
            "Prev Msgs Fetched".into(),
            counters.backlog_fetches.to_string(),
            "Messages Read".into(),
            counters.messages_read.to_string(),
        ],
        [
            String::new(),
            String::new(),
            "Read Acks Received".into(),
            counters.read_acks_received.to_string(),
        ],
        [
            String::new(),
            String::new(),
            "Messages/sec".into(),
            format_rate(snapshot.metrics.messages_sent_per_second),
        ],
    ];
    let disconnects: Vec<[String; 4]> = vec![
        [
            "Total Disconnected".into(),
            counters.disconnected.to_string(),
            "Avg Msg Latency".into(),
            format_millis(latency.avg_ms),
        ],
        [
            "  By Server".into(),
            counters.disconnected_by_server.to_string(),
            "P95 Msg Latency".into(),
            format_millis(latency.p95_ms),
        ],
        [
            "  By Client".into(),
            counters.disconnected_by_client.to_string(),
            "P99 Msg Latency".into(),
            format_millis(latency.p99_ms),
        ],
        [
            "  Ping Timeout".into(),
            counters.disconnected_by_timeout.to_string(),
            "Avg Conn Time".into(),
            format_millis(connection.avg_ms),
        ],
        [
            "  Other".into(),
            counters.disconnected_other.to_string(),
            "Max Conn Time".into(),
            format_millis(connection.max_ms),
        ],
    ];
    let errors: Vec<[String; 4]> = vec![
        [
            "Room Errors".into(),
            counters.errors_room.to_string(),
            "Auth Errors".into(),
            counters.errors_auth.to_string(),
        ],
        [
            "Connection Errors".into(),
            counters.errors_connection.to_string(),
            "Message Errors".into(),
            counters.errors_message.to_string(),
        ],
        [
            String::new(),
            String::new(),
            "Total Errors".into(),
            counters.total_errors().to_string(),
        ],
    ];

    let separator = format_table_separator(&WIDTHS);
    let mut lines = vec![
        format!(
            "{}",
            "=== Chat Ramp-Up Load Test - Real-time Metrics ==="
                .bold()
                .cyan()
        ),
        separator.clone(),
    ];
    for section in [rows, traffic, disconnects, errors] {
        for row in &section {
            let cells: Vec<&str> = row.iter().map(String::as_str).collect();
            lines.push(format_table_row(&cells, &WIDTHS));
        }
        lines.push(separator.clone());
    }
    lines.join("\n")
}

/// Closing summary printed after the run ends.
pub fn render_summary(summary: &RunSummary) -> String {
    let snapshot = &summary.final_snapshot;
    let counters = &snapshot.metrics.counters;
    let latency = &snapshot.metrics.message_latency;

    let headline = match summary.outcome {
        RunOutcome::Completed => "=== Ramp-Up Test Completed ===".bold().green(),
        RunOutcome::Aborted => "=== Ramp-Up Test Aborted ===".bold().red(),
    };
    let mut lines = vec![
        format!("{}", headline),
        format!(
            "Duration:            {}",
            format_secs(snapshot.run.elapsed_secs)
        ),
        format!(
            "Users:               {} created, {} targeted",
            counters.users_created, snapshot.run.target
        ),
        format!("Rooms:               {}", counters.rooms_created),
        format!(
            "Messages:            {} sent, {} received ({})",
            counters.messages_sent,
            counters.messages_received,
            format_rate(snapshot.metrics.messages_sent_per_second)
        ),
    ];
    if latency.count > 0 {
        lines.push(format!(
            "Message latency:     avg {}, p50 {}, p95 {}, p99 {}, max {}",
            format_millis(latency.avg_ms),
            format_millis(latency.p50_ms),
            format_millis(latency.p95_ms),
            format_millis(latency.p99_ms),
            format_millis(latency.max_ms)
        ));
    }
    lines.push(format!(
        "Errors:              {} (auth {}, room {}, connection {}, message {})",
        counters.total_errors(),
        counters.errors_auth,
        counters.errors_room,
        counters.errors_connection,
        counters.errors_message
    ));
    if snapshot.governor.trip_count > 0 {
        lines.push(format!(
            "Backpressure trips:  {}/{}",
            snapshot.governor.trip_count, snapshot.governor.max_trips
        ));
    }
    lines.join("\n")
}

/// Prints the table and streams each snapshot to the results manager.
pub struct LiveReporter {
    quiet: bool,
    results: Arc<Mutex<ResultsManager>>,
}

impl LiveReporter {
    pub fn new(quiet: bool, results: Arc<Mutex<ResultsManager>>) -> Self {
        Self { quiet, results }
    }
}

impl SnapshotObserver for LiveReporter {
    fn on_snapshot(&mut self, snapshot: &RunSnapshot) {
        if !self.quiet {
            println!("{}\n", render_table(snapshot));
        }
        if let Err(e) = self.results.lock().stream_snapshot(snapshot) {
            warn!("Failed to stream snapshot: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::RampUpRunner;
    use crate::sut::{LoopbackChatServer, SutClients};

    #[test]
    fn test_banner_mentions_estimated_rooms() {
        colored::control::set_override(false);
        let banner = render_banner(&RunConfig::default(), "socket.io");
        assert!(banner.contains("Target users:        500"));
        assert!(banner.contains("Rooms (estimated):   143"));
        assert!(banner.contains("Users per tick:      2-5"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_table_shows_phase_and_counters() {
        colored::control::set_override(false);
        let server = LoopbackChatServer::new();
        let clients = SutClients {
            api: server.clone(),
            connector: server,
        };
        let config = RunConfig {
            target_population: 6,
            min_per_tick: 2,
            max_per_tick: 2,
            dry_run: true,
            ..RunConfig::default()
        };
        let mut runner = RampUpRunner::new(config, clients).unwrap();
        runner.initialize().await.unwrap();
        runner.tick().await;

        let table = render_table(&runner.monitor().snapshot());
        assert!(table.contains("Ramping Up (4 to go)"));
        assert!(table.contains("Active Users"));
        assert!(table.contains("Total Errors"));

        runner.registry().disconnect_all();
        runner.registry().wait_idle(std::time::Duration::from_secs(2)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_summary_reports_outcome() {
        colored::control::set_override(false);
        let server = LoopbackChatServer::new();
        let clients = SutClients {
            api: server.clone(),
            connector: server,
        };
        let config = RunConfig {
            target_population: 2,
            min_per_tick: 2,
            max_per_tick: 2,
            sustain_duration: std::time::Duration::from_secs(1),
            dry_run: true,
            ..RunConfig::default()
        };
        let summary = RampUpRunner::new(config, clients)
            .unwrap()
            .run(None)
            .await
            .unwrap();

        let text = render_summary(&summary);
        assert!(text.contains("Ramp-Up Test Completed"));
        assert!(text.contains("2 created, 2 targeted"));
    }
}
