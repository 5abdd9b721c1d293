use crate::config::RunConfig;
use crate::scheduler::{PhaseTimeline, RunOutcome, RunSnapshot, RunSummary};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Headline numbers of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct RunResultSummary {
    pub target_population: usize,
    pub users_created: u64,
    pub rooms_created: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_per_second: f64,
    pub avg_message_latency_ms: f64,
    pub p95_message_latency_ms: f64,
    pub p99_message_latency_ms: f64,
    pub avg_connection_time_ms: f64,
    pub total_errors: u64,
    pub backpressure_trips: u32,
}

impl From<&RunSnapshot> for RunResultSummary {
    fn from(snapshot: &RunSnapshot) -> Self {
        let counters = &snapshot.metrics.counters;
        Self {
            target_population: snapshot.run.target,
            users_created: counters.users_created,
            rooms_created: counters.rooms_created,
            messages_sent: counters.messages_sent,
            messages_received: counters.messages_received,
            messages_per_second: snapshot.metrics.messages_sent_per_second,
            avg_message_latency_ms: snapshot.metrics.message_latency.avg_ms,
            p95_message_latency_ms: snapshot.metrics.message_latency.p95_ms,
            p99_message_latency_ms: snapshot.metrics.message_latency.p99_ms,
            avg_connection_time_ms: snapshot.metrics.connection_time.avg_ms,
            total_errors: counters.total_errors(),
            backpressure_trips: snapshot.governor.trip_count,
        }
    }
}

/// Run metadata for reproducibility
#[derive(Debug, Clone, Serialize)]
pub struct RunMetadata {
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub os: String,
    pub architecture: String,
    pub snapshots_streamed: usize,
}

/// Layout of the final results file
#[derive(Debug, Serialize)]
pub struct FinalRunResults<'a> {
    pub metadata: RunMetadata,
    pub config: &'a RunConfig,
    pub outcome: RunOutcome,
    pub timeline: &'a PhaseTimeline,
    pub summary: RunResultSummary,
    pub final_snapshot: &'a RunSnapshot,
}

/// Writes the final results file and, optionally, a stream of snapshots
pub struct ResultsManager {
    output_file: Option<PathBuf>,
    streaming_file: Option<PathBuf>,
    streamed: usize,
}

impl ResultsManager {
    pub fn new(output_file: Option<&Path>) -> Self {
        Self {
            output_file: output_file.map(Path::to_path_buf),
            streaming_file: None,
            streamed: 0,
        }
    }

    /// Start a JSON array of snapshots at `streaming_file`
    pub fn enable_streaming<P: AsRef<Path>>(&mut self, streaming_file: P) -> Result<()> {
        let path = streaming_file.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("Failed to create streaming file {:?}", path))?;

        writeln!(file, "[")?;

        debug!("Enabled streaming to: {:?}", path);
        self.streaming_file = Some(path);
        Ok(())
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming_file.is_some()
    }

    /// Append one snapshot to the streaming file
    pub fn stream_snapshot(&mut self, snapshot: &RunSnapshot) -> Result<()> {
        let Some(path) = &self.streaming_file else {
            return Ok(());
        };
        let mut file = OpenOptions::new().append(true).open(path)?;

        if self.streamed > 0 {
            writeln!(file, ",")?;
        }
        write!(file, "{}", serde_json::to_string_pretty(snapshot)?)?;
        file.flush()?;

        self.streamed += 1;
        Ok(())
    }

    /// Close the snapshot stream and write the final results file
    pub fn finalize(&mut self, config: &RunConfig, summary: &RunSummary) -> Result<()> {
        if let Some(path) = self.streaming_file.take() {
            let mut file = OpenOptions::new().append(true).open(&path)?;
            writeln!(file, "\n]")?;
            file.flush()?;
            info!("Streamed {} snapshots to: {:?}", self.streamed, path);
        }

        if let Some(path) = &self.output_file {
            let results = FinalRunResults {
                metadata: RunMetadata {
                    version: crate::VERSION.to_string(),
                    timestamp: chrono::Utc::now(),
                    os: std::env::consts::OS.to_string(),
                    architecture: std::env::consts::ARCH.to_string(),
                    snapshots_streamed: self.streamed,
                },
                config,
                outcome: summary.outcome,
                timeline: &summary.timeline,
                summary: RunResultSummary::from(&summary.final_snapshot),
                final_snapshot: &summary.final_snapshot,
            };
            let json = serde_json::to_string_pretty(&results)?;
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write results to {:?}", path))?;
            info!("Results written to: {:?}", path);
        }
        Ok(())
    }
}
