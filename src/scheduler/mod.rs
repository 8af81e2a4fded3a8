// =============================================================================
// Scheduler — cadenced jobs, run lifecycle, resumable progress log
// =============================================================================
//
// Three jobs:
//   scan.hot        every 15 minutes  — top-ADV universe, full pipeline
//   scan.warm       every 2 hours     — remaining universe, relaxed threshold
//   regime.refresh  every 4 hours     — detector run + regime.json
//
// Each run appends phase records to a JSON-lines progress log keyed by
// runId. A run that died mid-flight leaves a `started`/`failed` tail, which
// `pending_resume` surfaces so a restart re-runs the failed step instead of
// silently skipping it.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::app_state::AppState;
use crate::artifacts::ArtifactWriter;
use crate::scan::{compute_regime_inputs, run_scan, ScanMode, ScanSummary};

/// The three job names, as they appear in the CLI and the progress log.
pub const JOB_SCAN_HOT: &str = "scan.hot";
pub const JOB_SCAN_WARM: &str = "scan.warm";
pub const JOB_REGIME_REFRESH: &str = "regime.refresh";

/// Phase lifecycle states recorded in the progress log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Started,
    Completed,
    Failed,
}

/// One line of the progress log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub run_id: String,
    pub job: String,
    pub status: PhaseStatus,
    pub ts: DateTime<Utc>,
}

/// Append-only JSON-lines progress log.
pub struct ProgressLog {
    path: PathBuf,
}

impl ProgressLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn record(&self, run_id: &str, job: &str, status: PhaseStatus) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let record = PhaseRecord {
            run_id: run_id.to_string(),
            job: job.to_string(),
            status,
            ts: Utc::now(),
        };
        let line = serde_json::to_string(&record)?;
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        writeln!(file, "{line}").context("appending progress record")?;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<PhaseRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }

    /// Jobs whose newest record is not `Completed` — the restart worklist.
    pub fn pending_resume(&self) -> Result<Vec<PhaseRecord>> {
        let mut latest: HashMap<(String, String), PhaseRecord> = HashMap::new();
        for record in self.read_all()? {
            latest.insert((record.run_id.clone(), record.job.clone()), record);
        }
        Ok(latest
            .into_values()
            .filter(|r| r.status != PhaseStatus::Completed)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Job descriptions (CLI surface)
// ---------------------------------------------------------------------------

/// Static description of one cadenced job.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub name: &'static str,
    pub cadence_minutes: u64,
    pub description: &'static str,
}

pub fn list_jobs(state: &AppState) -> Vec<JobInfo> {
    vec![
        JobInfo {
            name: JOB_SCAN_HOT,
            cadence_minutes: state.config.hot_scan_minutes,
            description: "top-ADV universe, full pipeline with gates",
        },
        JobInfo {
            name: JOB_SCAN_WARM,
            cadence_minutes: state.config.warm_scan_minutes,
            description: "remaining universe on cached warm sources",
        },
        JobInfo {
            name: JOB_REGIME_REFRESH,
            cadence_minutes: state.config.regime_refresh_minutes,
            description: "regime detector run and weight-blend publication",
        },
    ]
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Drives the cadenced jobs until shutdown.
pub struct Scheduler {
    state: Arc<AppState>,
    progress: Arc<ProgressLog>,
    cancel: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(state: Arc<AppState>, cancel: watch::Receiver<bool>) -> Self {
        let progress_path = Path::new(&state.config.artifacts_dir).join("progress.jsonl");
        Self {
            state,
            progress: Arc::new(ProgressLog::new(progress_path)),
            cancel,
        }
    }

    pub fn progress(&self) -> Arc<ProgressLog> {
        self.progress.clone()
    }

    /// A run id from the wall clock: ISO-8601, filesystem-safe.
    pub fn make_run_id(now: DateTime<Utc>) -> String {
        now.format("%Y-%m-%dT%H-%M-%SZ").to_string()
    }

    /// Run one job by name. `dry_run` goes through the whole pipeline but
    /// logs instead of writing phase records.
    pub async fn run_job(&self, job: &str, dry_run: bool) -> Result<Option<ScanSummary>> {
        let run_id = Self::make_run_id(Utc::now());
        if !dry_run {
            self.progress.record(&run_id, job, PhaseStatus::Started)?;
        }

        let result = match job {
            JOB_SCAN_HOT => self.scan(ScanMode::Hot, &run_id).await.map(Some),
            JOB_SCAN_WARM => self.scan(ScanMode::Warm, &run_id).await.map(Some),
            JOB_REGIME_REFRESH => self.refresh_regime(&run_id).await.map(|_| None),
            other => anyhow::bail!("unknown job: {other}"),
        };

        if !dry_run {
            let status = if result.is_ok() {
                PhaseStatus::Completed
            } else {
                PhaseStatus::Failed
            };
            self.progress.record(&run_id, job, status)?;
        }
        result
    }

    async fn scan(&self, mode: ScanMode, run_id: &str) -> Result<ScanSummary> {
        run_scan(&self.state, mode, run_id, &self.cancel).await
    }

    /// Run the detector on its 4 h cadence and publish regime.json.
    async fn refresh_regime(&self, run_id: &str) -> Result<()> {
        let inputs = compute_regime_inputs(&self.state).await;
        let now = Utc::now();

        let snapshot = match self.state.regime.update(inputs, now) {
            Some(snapshot) => snapshot,
            None => {
                info!("regime boundary already evaluated — snapshot unchanged");
                self.state
                    .regime
                    .current()
                    .expect("update returned None, so a snapshot exists")
            }
        };

        let writer = ArtifactWriter::new(&self.state.config.artifacts_dir, run_id, now)?;
        let next_refresh =
            now + chrono::Duration::minutes(self.state.config.regime_refresh_minutes as i64);
        writer.write_regime(&snapshot, next_refresh)?;

        self.state
            .pit
            .append("regimes", snapshot.ts, "detector", &snapshot)?;
        self.state.increment_version();
        Ok(())
    }

    /// Re-run any jobs the progress log shows as unfinished, then start the
    /// cadenced loops. Blocks until the cancel signal flips.
    pub async fn run_forever(self: Arc<Self>, resume: bool) -> Result<()> {
        if resume {
            for record in self.progress.pending_resume()? {
                warn!(
                    run_id = %record.run_id,
                    job = %record.job,
                    "resuming unfinished job from progress log"
                );
                if let Err(e) = self.run_job(&record.job, false).await {
                    error!(job = %record.job, error = %e, "resumed job failed");
                }
            }
        }

        let jobs = [
            (JOB_SCAN_HOT, self.state.config.hot_scan_minutes),
            (JOB_SCAN_WARM, self.state.config.warm_scan_minutes),
            (JOB_REGIME_REFRESH, self.state.config.regime_refresh_minutes),
        ];

        let mut handles = Vec::new();
        for (job, minutes) in jobs {
            let scheduler = self.clone();
            let mut cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                let period = std::time::Duration::from_secs(minutes * 60);
                let mut ticker = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            info!(job, "cadence tick");
                            if let Err(e) = scheduler.run_job(job, false).await {
                                error!(job, error = %e, "job failed");
                                scheduler.state.push_error(
                                    format!("{job} failed: {e}"),
                                    None,
                                );
                            }
                        }
                        _ = cancel.changed() => {
                            if *cancel.borrow() {
                                info!(job, "scheduler loop stopping");
                                return;
                            }
                        }
                    }
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }
}
