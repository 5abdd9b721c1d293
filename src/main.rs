//! # Chat Ramp-Up Load Test - Main Entry Point
//!
//! 1. **Parse arguments** and install logging
//! 2. **Build the run configuration** and the chat service clients
//! 3. **Run** the ramp-up with the live table as snapshot observer
//! 4. **Write results** and exit with the outcome's exit code

use anyhow::{Context, Result};
use chat_rampup::{
    cli::Args,
    logging,
    report::{self, LiveReporter},
    RampUpRunner, ResultsManager, RunConfig, SutFactory,
};
use clap::Parser;
use parking_lot::Mutex;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Held until exit so the file writer flushes.
    let _log_guard = logging::init(args.verbose, args.log_file.as_deref())?;

    info!("Starting chat ramp-up load test v{}", chat_rampup::VERSION);

    let config = RunConfig::from_args(&args).context("Invalid configuration")?;
    let clients = SutFactory::create(&config).context("Failed to create chat service clients")?;

    let mut results_manager = ResultsManager::new(args.output_file.as_deref());
    if let Some(streaming_file) = &args.streaming_output {
        results_manager.enable_streaming(streaming_file)?;
    }
    let results_manager = Arc::new(Mutex::new(results_manager));

    println!("{}\n", report::render_banner(&config, clients.connector.name()));

    let runner = RampUpRunner::new(config.clone(), clients)?;
    let reporter = LiveReporter::new(args.quiet, results_manager.clone());
    let summary = match runner.run(Some(Box::new(reporter))).await {
        Ok(summary) => summary,
        Err(e) => {
            error!("Setup failed: {:#}", e);
            return Err(e);
        }
    };

    results_manager.lock().finalize(&config, &summary)?;
    println!("{}", report::render_summary(&summary));

    info!("Run finished: {:?}", summary.outcome);
    Ok(ExitCode::from(summary.outcome.exit_code()))
}
