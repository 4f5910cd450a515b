use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use perfsync_core::RunOutcome;
use perfsync_storage::PgStore;
use perfsync_sync::logging::{build_log_sinks, default_filter};
use perfsync_sync::{EtlConfig, Orchestrator, RunLoop};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "perfsync")]
#[command(about = "Scheduled marketing-performance upsert ETL")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run now, then keep running on the configured schedule (default).
    Run,
    /// Run a single pass and exit non-zero if it failed.
    Once {
        /// Print the run report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Create the target schema and table if absent.
    Provision,
    /// Compare source and target totals since START_DATE.
    Reconcile,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    let config = EtlConfig::from_env().context("loading configuration from environment")?;

    let sinks = build_log_sinks(&config.log_dir, default_filter())
        .with_context(|| format!("opening log sink in {}", config.log_dir.display()))?;
    // Scoped to main; the current-thread runtime keeps every task on this thread.
    let _log_guard = tracing::dispatcher::set_default(&sinks.dispatch);

    let orchestrator = Orchestrator::from_config(PgStore::new(config.connection.clone()), &config);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let run_loop = RunLoop::new(config.schedule, config.poll_interval);
            let stop = stop_on_signal();
            let stats = run_loop.run(|| orchestrator.run_once(), stop).await;
            info!(runs = stats.runs, failures = stats.failures, "perfsync stopped");
        }
        Commands::Once { json } => {
            let report = orchestrator.run_once().await;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("serializing run report")?
                );
            } else {
                println!(
                    "run complete: run_id={} extracted={} upserted={} elapsed={}ms",
                    report.run_id,
                    report.extracted,
                    report.upserted,
                    report.elapsed().num_milliseconds()
                );
            }
            if let RunOutcome::Failed { stage, message } = report.outcome {
                anyhow::bail!("run {} failed at {stage}: {message}", report.run_id);
            }
        }
        Commands::Provision => {
            orchestrator.provision().await.context("provisioning target")?;
            println!("target {} ready", config.target_table);
        }
        Commands::Reconcile => {
            let cmp = orchestrator.reconcile().await.context("comparing totals")?;
            println!(
                "source: cost={} conversions={} clicks={} impressions={}",
                cmp.source.cost, cmp.source.conversions, cmp.source.clicks, cmp.source.impressions
            );
            println!(
                "target: cost={} conversions={} clicks={} impressions={}",
                cmp.target.cost, cmp.target.conversions, cmp.target.clicks, cmp.target.impressions
            );
        }
    }

    Ok(())
}

/// Flips to `true` on Ctrl+C or SIGTERM.
fn stop_on_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("stop signal received; finishing current run");
        let _ = tx.send(true);
        // Keep the sender alive so the loop sees `true`, not a closed channel.
        tx.closed().await;
    });
    rx
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
