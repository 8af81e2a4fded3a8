// =============================================================================
// Central Application State — CryptoRun scan engine
// =============================================================================
//
// Ties the subsystems together behind `Arc<AppState>`. Configuration is
// loaded once at startup and immutable afterwards; emergency controls are
// the only operator-mutable cell and live behind their own lock with an
// audit trail.
//
// Thread safety:
//   - Atomic counters for lock-free version tracking.
//   - parking_lot::RwLock for the small mutable collections.
//   - Subsystem engines manage their own interior mutability behind Arc.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::config::ScannerConfig;
use crate::emergency::EmergencyControls;
use crate::facade::{DataFacade, FacadeHealth};
use crate::gates::GateEngine;
use crate::pit::PitStore;
use crate::provider::SafetyLayer;
use crate::regime::{RegimeDetector, RegimeSnapshot};
use crate::telemetry::{StageSummary, Telemetry};

/// Maximum number of recent errors retained for the status API.
const MAX_RECENT_ERRORS: usize = 50;

/// A recorded error event for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub code: Option<String>,
    pub at: String,
}

/// Outcome summary of the most recent scan, for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct LastScan {
    pub run_id: String,
    pub mode: String,
    pub scanned: usize,
    pub admitted: usize,
    pub rejected: usize,
    pub duration_ms: u64,
}

/// Central application state shared across all async tasks.
pub struct AppState {
    /// Monotonically increasing version counter, bumped on every meaningful
    /// mutation.
    pub state_version: AtomicU64,

    /// Immutable after startup.
    pub config: ScannerConfig,

    pub safety: Arc<SafetyLayer>,
    pub facade: Arc<DataFacade>,
    pub regime: Arc<RegimeDetector>,
    pub gates: Arc<GateEngine>,
    pub emergency: Arc<EmergencyControls>,
    pub telemetry: Arc<Telemetry>,
    pub pit: Arc<PitStore>,

    pub recent_errors: RwLock<Vec<ErrorRecord>>,
    pub last_scan: RwLock<Option<LastScan>>,

    pub start_time: std::time::Instant,
}

impl AppState {
    /// Wire up every subsystem from the loaded configuration.
    pub fn new(config: ScannerConfig) -> Arc<Self> {
        let safety = SafetyLayer::new(&config);
        let facade = DataFacade::new(&config, safety.clone());
        let regime = Arc::new(RegimeDetector::new(config.weight_table.clone()));
        let emergency = Arc::new(EmergencyControls::new(config.depeg_tolerance_pct));
        let gates = Arc::new(GateEngine::new(config.gates.clone(), emergency.clone()));
        let pit = Arc::new(PitStore::new(&config.pit_dir));

        Arc::new(Self {
            state_version: AtomicU64::new(1),
            config,
            safety,
            facade,
            regime,
            gates,
            emergency,
            telemetry: Arc::new(Telemetry::new()),
            pit,
            recent_errors: RwLock::new(Vec::new()),
            last_scan: RwLock::new(None),
            start_time: std::time::Instant::now(),
        })
    }

    // ── Version management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Error log ───────────────────────────────────────────────────────

    pub fn push_error(&self, message: String, code: Option<String>) {
        let mut errors = self.recent_errors.write();
        errors.push(ErrorRecord {
            message,
            code,
            at: Utc::now().to_rfc3339(),
        });
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        drop(errors);
        self.increment_version();
    }

    pub fn record_scan(&self, scan: LastScan) {
        *self.last_scan.write() = Some(scan);
        self.increment_version();
    }

    // ── Snapshot builder ────────────────────────────────────────────────

    /// Serialisable snapshot for `GET /api/v1/state`.
    pub fn build_snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            universe: self.config.universe.clone(),
            facade: self.facade.health(),
            regime: self.regime.current(),
            telemetry: self.telemetry.summary(),
            last_scan: self.last_scan.read().clone(),
            recent_errors: self.recent_errors.read().clone(),
        }
    }
}

/// Full engine snapshot for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub universe: Vec<String>,
    pub facade: FacadeHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regime: Option<RegimeSnapshot>,
    pub telemetry: Vec<StageSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_scan: Option<LastScan>,
    pub recent_errors: Vec<ErrorRecord>,
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_counter_increments() {
        let state = AppState::new(ScannerConfig::default());
        let v0 = state.current_state_version();
        state.increment_version();
        assert_eq!(state.current_state_version(), v0 + 1);
    }

    #[test]
    fn error_ring_is_capped() {
        let state = AppState::new(ScannerConfig::default());
        for i in 0..60 {
            state.push_error(format!("error {i}"), None);
        }
        let errors = state.recent_errors.read();
        assert_eq!(errors.len(), MAX_RECENT_ERRORS);
        assert!(errors.first().unwrap().message.contains("10"));
    }

    #[test]
    fn snapshot_reflects_scan_record() {
        let state = AppState::new(ScannerConfig::default());
        state.record_scan(LastScan {
            run_id: "run-1".to_string(),
            mode: "hot".to_string(),
            scanned: 30,
            admitted: 3,
            rejected: 27,
            duration_ms: 1200,
        });
        let snapshot = state.build_snapshot();
        assert_eq!(snapshot.last_scan.unwrap().admitted, 3);
        assert_eq!(snapshot.facade.providers.len(), 6);
    }
}
