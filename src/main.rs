// =============================================================================
// CryptoRun — Main Entry Point
// =============================================================================
//
// Momentum/pre-movement scanner for USD-quoted crypto spot pairs. The CLI
// drives ad-hoc scans, the cadenced scheduler, and the GREEN-WALL
// verification suite.
//
// Exit codes: 0 success, 1 failed verification or gate-contract breach,
// 2 bad flags/config (clap's default).
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod artifacts;
mod config;
mod emergency;
mod facade;
mod factors;
mod gates;
mod indicators;
mod pit;
mod provider;
mod reconcile;
mod regime;
mod scan;
mod scheduler;
mod score;
mod telemetry;
mod types;
mod universe;
mod verify;

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::ScannerConfig;
use crate::scan::ScanMode;
use crate::scheduler::Scheduler;

/// Default config file next to the binary.
const CONFIG_PATH: &str = "cryptorun.json";

#[derive(Parser)]
#[command(name = "cryptorun", version, about = "Momentum scanner for USD crypto spot pairs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one ad-hoc hot scan.
    Scan {
        /// Restrict the preferred microstructure venue.
        #[arg(long)]
        exchange: Option<String>,
        /// Override the configured pair list (comma-separated, USD-quoted).
        #[arg(long)]
        pairs: Option<String>,
        /// Go through the pipeline without writing a progress record.
        #[arg(long)]
        dry_run: bool,
    },
    /// Scheduler control.
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
    /// GREEN-WALL verification suite.
    Verify {
        /// `all` or `postmerge`.
        suite: String,
        /// Iterations for randomized checks.
        #[arg(long, default_value_t = 20)]
        n: u32,
        /// Print every check, not only failures.
        #[arg(long)]
        progress: bool,
        /// Overall timeout in seconds.
        #[arg(long, default_value_t = 120)]
        timeout: u64,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List the cadenced jobs.
    List,
    /// Run one job immediately.
    Run {
        name: String,
        #[arg(long)]
        dry_run: bool,
    },
    /// Start the cadenced loops (blocks until ctrl-c).
    Start {
        /// Re-run unfinished jobs from the progress log first.
        #[arg(long)]
        resume: bool,
    },
    /// Show progress-log status.
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = ScannerConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config — using defaults");
        ScannerConfig::default()
    });

    // Environment overrides.
    if let Ok(pairs) = std::env::var("CRYPTORUN_SYMBOLS") {
        config.universe = pairs
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }

    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        return ExitCode::from(2);
    }

    // Optional backends are configured by env; this build keeps the cache
    // in-process and persists PIT events to files only.
    if std::env::var("REDIS_ADDR").is_ok() {
        warn!("REDIS_ADDR set — external cache backend not bundled, using in-process cache");
    }
    if std::env::var("PG_DSN").is_ok() {
        warn!("PG_DSN set — relational PIT backend not bundled, file store remains authoritative");
    }

    match run(cli, config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "fatal error");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli, mut config: ScannerConfig) -> anyhow::Result<ExitCode> {
    match cli.command {
        // ── Ad-hoc scan ─────────────────────────────────────────────────
        Command::Scan {
            exchange,
            pairs,
            dry_run,
        } => {
            if let Some(pairs) = pairs {
                config.universe = pairs
                    .split(',')
                    .map(|s| s.trim().to_uppercase())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            if let Some(exchange) = exchange {
                // Venue must parse and be exchange-native for microstructure.
                let venue: crate::types::Venue = exchange.parse()?;
                if !venue.is_exchange_native() {
                    error!(venue = %venue, "aggregators cannot serve microstructure");
                    return Ok(ExitCode::from(2));
                }
            }

            let state = AppState::new(config);
            spawn_status_api(&state);
            state.facade.hot_subscribe(&state.config.universe);

            let (_cancel_tx, cancel_rx) = watch::channel(false);
            let run_id = Scheduler::make_run_id(chrono::Utc::now());
            if dry_run {
                info!(run_id = %run_id, "dry run — pipeline executes, progress log untouched");
            }

            let summary = scan::run_scan(&state, ScanMode::Hot, &run_id, &cancel_rx).await?;
            info!(
                run_id = %summary.run_id,
                scanned = summary.scanned,
                admitted = summary.admitted,
                "ad-hoc scan finished"
            );
            Ok(ExitCode::SUCCESS)
        }

        // ── Scheduler ───────────────────────────────────────────────────
        Command::Schedule { action } => {
            let state = AppState::new(config);
            let (cancel_tx, cancel_rx) = watch::channel(false);
            let scheduler = Arc::new(Scheduler::new(state.clone(), cancel_rx));

            match action {
                ScheduleAction::List => {
                    for job in scheduler::list_jobs(&state) {
                        println!(
                            "{:<16} every {:>4} min  {}",
                            job.name, job.cadence_minutes, job.description
                        );
                    }
                    Ok(ExitCode::SUCCESS)
                }
                ScheduleAction::Run { name, dry_run } => {
                    spawn_status_api(&state);
                    state.facade.hot_subscribe(&state.config.universe);
                    scheduler.run_job(&name, dry_run).await?;
                    Ok(ExitCode::SUCCESS)
                }
                ScheduleAction::Start { resume } => {
                    spawn_status_api(&state);
                    state.facade.hot_subscribe(&state.config.universe);

                    let loops = scheduler.clone().run_forever(resume);
                    tokio::pin!(loops);

                    tokio::select! {
                        result = &mut loops => result?,
                        _ = tokio::signal::ctrl_c() => {
                            warn!("shutdown signal received — stopping scheduler");
                            let _ = cancel_tx.send(true);
                            // Let in-flight PIT writes and loops drain.
                            let _ = loops.await;
                        }
                    }
                    info!("scheduler stopped cleanly");
                    Ok(ExitCode::SUCCESS)
                }
                ScheduleAction::Status => {
                    let pending = scheduler.progress().pending_resume()?;
                    if pending.is_empty() {
                        println!("all recorded runs completed");
                    } else {
                        for record in pending {
                            println!(
                                "{:<16} {} {:?} at {}",
                                record.job, record.run_id, record.status, record.ts
                            );
                        }
                    }
                    Ok(ExitCode::SUCCESS)
                }
            }
        }

        // ── Verification ────────────────────────────────────────────────
        Command::Verify {
            suite,
            n,
            progress,
            timeout,
        } => {
            let suite = match suite.as_str() {
                "all" => verify::Suite::All,
                "postmerge" => verify::Suite::Postmerge,
                other => {
                    error!(suite = other, "unknown verify suite");
                    return Ok(ExitCode::from(2));
                }
            };

            let green = tokio::time::timeout(
                std::time::Duration::from_secs(timeout),
                verify::run(suite, n, progress),
            )
            .await
            .map_err(|_| anyhow::anyhow!("verification timed out after {timeout}s"))??;

            Ok(if green {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            })
        }
    }
}

/// Bind the read-only status API when `METRICS_ADDR` is set.
fn spawn_status_api(state: &Arc<AppState>) {
    let Ok(addr) = std::env::var("METRICS_ADDR") else {
        return;
    };
    let api_state = state.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => {
                info!(addr = %addr, "status API listening");
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "status API failed");
                }
            }
            Err(e) => error!(addr = %addr, error = %e, "failed to bind status API"),
        }
    });
}
