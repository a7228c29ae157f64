use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use cronkeep_core::config::CronkeepConfig;
use cronkeep_scheduler::{ExecEnv, Scheduler};
use serde::Serialize;
use tracing::info;

mod app;
mod http;

#[derive(Parser)]
#[command(name = "cronkeep", version, about = "Cron-style job scheduler with a file-backed queue")]
struct Cli {
    /// Config file (default: $CRONKEEP_CONFIG, then ~/.cronkeep/cronkeep.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the jobs that are due now
    Run {
        /// Run every enabled job regardless of its schedule
        #[arg(long)]
        force: bool,

        /// Evaluate schedules at this RFC 3339 instant instead of now
        #[arg(long)]
        at: Option<String>,
    },
    /// Force-run one job in the foreground
    Force {
        job_id: String,
    },
    /// Print the health report
    Health,
    /// Print scheduler statistics
    Stats,
    /// Print execution statistics for one job, or for every recorded job
    History {
        job_id: Option<String>,

        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// Export execution history to CSV
    ExportHistory {
        #[arg(long)]
        from: NaiveDate,

        #[arg(long)]
        to: NaiveDate,

        #[arg(long)]
        out: PathBuf,

        #[arg(long)]
        job: Option<String>,
    },
    /// Print queue statistics
    Queue {
        /// Delete every dead-lettered item
        #[arg(long)]
        clear_failed: bool,

        /// Move one dead-lettered item back to pending
        #[arg(long, value_name = "QUEUE_ID")]
        requeue: Option<String>,
    },
    /// Run the scheduler loop until Ctrl-C (queue mode only)
    Daemon {
        /// Seconds between scheduler runs
        #[arg(long, default_value_t = 60)]
        interval: u64,
    },
    /// Serve the health, statistics and webhook endpoints
    Serve,
    /// Print the crontab line that runs the scheduler every minute
    CronCommand,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "cronkeep=info,cronkeep_scheduler=info,tower_http=debug".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    let config = CronkeepConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        CronkeepConfig::default()
    });

    if let Commands::CronCommand = cli.command {
        let binary = std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "cronkeep".to_string());
        println!("{}", Scheduler::cron_command(&binary, cli.config.as_deref()));
        return Ok(());
    }

    let mut scheduler = Scheduler::new(config.scheduler.clone(), ExecEnv::system())
        .context("cannot initialise scheduler")?;

    match cli.command {
        Commands::Run { force, at } => {
            let at = at
                .map(|raw| DateTime::parse_from_rfc3339(&raw).map(|t| t.with_timezone(&Utc)))
                .transpose()
                .context("--at must be an RFC 3339 timestamp")?;
            let summary = scheduler.run(at, force).await?;
            for line in scheduler.verbose_output() {
                eprintln!("{line}");
            }
            print_json(&summary)?;
        }
        Commands::Force { job_id } => {
            let forced = scheduler.force_run(&job_id).await?;
            let message = if forced.success {
                "Job force-executed successfully"
            } else {
                "Job execution failed"
            };
            print_json(&serde_json::json!({
                "success": forced.success,
                "message": message,
                "output": forced.output,
            }))?;
            if !forced.success {
                anyhow::bail!("job {job_id} failed");
            }
        }
        Commands::Health => print_json(&scheduler.health_status().await?)?,
        Commands::Stats => print_json(&scheduler.statistics()?)?,
        Commands::History { job_id, days } => {
            let history = scheduler
                .history()
                .context("history is disabled in the configuration")?;
            let now = Utc::now();
            match job_id {
                Some(id) => print_json(&history.get_job_statistics(&id, days, now))?,
                None => {
                    let mut ids: Vec<String> = history.known_jobs().into_iter().collect();
                    ids.sort();
                    let per_job: serde_json::Map<String, serde_json::Value> = ids
                        .into_iter()
                        .map(|id| {
                            let stats = history.get_job_statistics(&id, days, now);
                            Ok((id, serde_json::to_value(stats)?))
                        })
                        .collect::<serde_json::Result<_>>()?;
                    print_json(&per_job)?;
                }
            }
        }
        Commands::ExportHistory { from, to, out, job } => {
            let history = scheduler
                .history()
                .context("history is disabled in the configuration")?;
            let entries = history.get_history_range(from, to, job.as_deref());
            history.export_csv(&entries, &out)?;
            info!(entries = entries.len(), path = %out.display(), "history exported");
        }
        Commands::Queue {
            clear_failed,
            requeue,
        } => {
            let queue = scheduler
                .queue()
                .context("queue mode is disabled in the configuration")?;
            if let Some(queue_id) = requeue {
                queue.requeue_failed(&queue_id).await?;
                info!(%queue_id, "item moved back to pending");
            }
            if clear_failed {
                let removed = queue.clear_failed().await?;
                info!(removed, "failed items cleared");
            }
            print_json(&queue.statistics())?;
        }
        Commands::Daemon { interval } => {
            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = shutdown_tx.send(true);
                }
            });
            scheduler
                .run_daemon(Duration::from_secs(interval.max(1)), shutdown_rx)
                .await?;
        }
        Commands::Serve => serve(config, scheduler).await?,
        Commands::CronCommand => {}
    }

    Ok(())
}

async fn serve(config: CronkeepConfig, scheduler: Scheduler) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let state = Arc::new(app::AppState::new(config, scheduler));
    let router = app::build_router(state);

    info!("cronkeep listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
