use anyhow::Result;
use chat_rampup::{
    cli::Args,
    scheduler::{RunSnapshot, SnapshotObserver},
    Phase, RampUpRunner, RunConfig, RunOutcome, SutFactory,
};
use clap::Parser;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<RunSnapshot>>>);

impl SnapshotObserver for Recorder {
    fn on_snapshot(&mut self, snapshot: &RunSnapshot) {
        self.0.lock().push(snapshot.clone());
    }
}

/// Full run from command-line arguments against the loopback server.
#[tokio::test(start_paused = true)]
async fn dry_run_ramps_up_sustains_and_completes() -> Result<()> {
    let args = Args::try_parse_from([
        "chat-rampup",
        "--dry-run",
        "-u",
        "10",
        "--min-users-per-second",
        "2",
        "--max-users-per-second",
        "2",
        "-s",
        "3s",
        "--metrics-interval",
        "500ms",
    ])?;
    let config = RunConfig::from_args(&args)?;
    let clients = SutFactory::create(&config)?;

    let recorder = Recorder::default();
    let runner = RampUpRunner::new(config, clients)?;
    let summary = runner.run(Some(Box::new(recorder.clone()))).await?;

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.outcome.exit_code(), 0);

    let final_run = &summary.final_snapshot.run;
    assert_eq!(final_run.phase, Phase::Completed);
    assert_eq!(final_run.agents_spawned, 10);
    assert_eq!(final_run.rooms_allocated, 5);
    assert!(final_run.sustain_elapsed_secs.unwrap_or_default() >= 3.0);

    let counters = &summary.final_snapshot.metrics.counters;
    assert_eq!(counters.users_created, 10);
    assert_eq!(counters.rooms_created, 5);
    assert_eq!(counters.total_errors(), 0);
    assert!(counters.messages_sent > 0);

    let snapshots = recorder.0.lock();
    assert!(!snapshots.is_empty());
    for snapshot in snapshots.iter() {
        if snapshot.run.phase == Phase::RampingUp {
            assert!(snapshot.run.active <= snapshot.run.target);
        }
    }
    let sustaining = snapshots
        .iter()
        .position(|s| s.run.phase == Phase::Sustaining);
    if let Some(first) = sustaining {
        assert!(snapshots[first..]
            .iter()
            .all(|s| s.run.phase != Phase::RampingUp));
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn invalid_arguments_are_rejected() -> Result<()> {
    let args = Args::try_parse_from([
        "chat-rampup",
        "--min-users-per-second",
        "6",
        "--max-users-per-second",
        "3",
    ])?;
    assert!(RunConfig::from_args(&args).is_err());
    Ok(())
}
