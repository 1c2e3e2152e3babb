//! jobsync CLI - job-worker synchronization for a BPMN workflow engine.

mod config;
mod handler;
mod simulate;

use anyhow::Result;
use clap::{Parser, Subcommand};
use config::AppConfig;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "jobsync")]
#[command(about = "Job-worker synchronization for a BPMN workflow engine", long_about = None)]
struct Cli {
    /// Config file; defaults apply when omitted
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate the configuration
    Validate,
    /// Run the configured workers and bridge against the in-memory engine
    Simulate {
        /// Scenario file with jobs and broker envelopes (JSON)
        scenario: Option<PathBuf>,
        /// How long to wait for each job and for the bridge, in milliseconds
        #[arg(long, default_value = "2000")]
        settle_ms: u64,
        /// Keep serving after the scenario until Ctrl-C
        #[arg(long)]
        hold: bool,
    },
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref())?;
    init_logging(&config.logging.level);

    match cli.command {
        Commands::Validate => {
            println!("Configuration OK");
            println!("  Engine: {}", config.engine.address);
            if let Some(process_id) = &config.engine.process_id {
                println!("  Process: {}", process_id);
            }
            println!(
                "  Broker: {} (queue {}, prefetch {})",
                config.broker.uri, config.broker.queue, config.broker.prefetch
            );
            println!("  Workers ({})", config.workers.len());
            for worker in &config.workers {
                let message = worker
                    .message
                    .as_ref()
                    .map(|m| format!("{}/{}", m.name, m.correlation_key))
                    .unwrap_or_else(|| "-".to_string());
                let deferred = worker
                    .deferred
                    .as_ref()
                    .map(|d| format!("{}/{}", d.message.name, d.message.correlation_key))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "    {} | message {} | deferred {} | {:?}",
                    worker.task_type, message, deferred, worker.outcome
                );
            }
        }
        Commands::Simulate {
            scenario,
            settle_ms,
            hold,
        } => {
            let scenario = match scenario {
                Some(path) => simulate::Scenario::from_file(&path)?,
                None => simulate::Scenario::default(),
            };
            let settle = Duration::from_millis(settle_ms);

            let report = simulate::run(&config, scenario, settle, ctrl_c(), hold).await?;

            println!("Engine journal ({})", report.calls.len());
            for call in &report.calls {
                println!("  {}", serde_json::to_string(call)?);
            }
            println!("Workers");
            for (task_type, status) in &report.statuses {
                println!(
                    "  {} | {} | {} done | {} abandoned",
                    task_type, status.state, status.iterations, status.abandoned
                );
            }
            println!(
                "Bridge: {} received, {} published, {} failed, {} malformed",
                report.bridge.received,
                report.bridge.published,
                report.bridge.publish_failed,
                report.bridge.malformed
            );
            info!("Simulation finished");
        }
    }

    Ok(())
}
