// =============================================================================
// Artifacts — timestamped, schema-versioned run outputs
// =============================================================================
//
// Every run writes under `artifacts/signals/{runId}/`. CSV files carry a
// `# schema_version=N` header line above the column header; JSON files
// carry a `schema_version` field. All writes are atomic (tmp + rename).
//
// Output is deterministic: rows arrive pre-sorted (composite desc, symbol
// asc) and floats are rendered with fixed precision, so identical inputs
// produce byte-identical files modulo the run timestamp.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::config::FactorWeights;
use crate::factors::FactorVector;
use crate::gates::GateOutcome;
use crate::regime::RegimeSnapshot;
use crate::types::{Artifact, ArtifactKind, ReasonCode, Venue};

/// Version stamped into every artifact this build writes.
pub const SCHEMA_VERSION: u32 = 1;

/// Column header of signals.csv / premove.csv / warm_signals.csv.
const SIGNALS_HEADER: &str =
    "timestamp,symbol,score,momentum_core,vadr,spread_bps,depth_usd,regime,fresh,venue,sources";

/// One row of a signals CSV.
#[derive(Debug, Clone, Serialize)]
pub struct SignalRow {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub score: f64,
    pub momentum_core: f64,
    pub vadr: f64,
    pub spread_bps: f64,
    pub depth_usd: f64,
    pub regime: String,
    pub fresh: bool,
    pub venue: Venue,
    /// Sources that served the symbol's data, pipe-separated in the CSV.
    pub sources: Vec<Venue>,
}

impl SignalRow {
    fn to_csv(&self) -> String {
        let sources = self
            .sources
            .iter()
            .map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join("|");
        format!(
            "{},{},{:.2},{:.2},{:.2},{:.1},{:.0},{},{},{},{}",
            self.timestamp.to_rfc3339(),
            self.symbol,
            self.score,
            self.momentum_core,
            self.vadr,
            self.spread_bps,
            self.depth_usd,
            self.regime,
            self.fresh,
            self.venue,
            sources
        )
    }
}

/// Per-symbol entry of explain.json.
#[derive(Debug, Clone, Serialize)]
pub struct ExplainEntry {
    pub symbol: String,
    pub composite: f64,
    pub factors: FactorVector,
    pub weights: FactorWeights,
    pub gate_outcome: GateOutcome,
    pub reasons: Vec<ReasonCode>,
    pub sources: Vec<Venue>,
    pub fallback: bool,
    pub stale: bool,
}

/// One entry of errors.json.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub symbol: Option<String>,
    pub code: ReasonCode,
    pub detail: String,
}

/// Writer for one run's artifact directory.
pub struct ArtifactWriter {
    run_id: String,
    dir: PathBuf,
    ts: DateTime<Utc>,
}

impl ArtifactWriter {
    /// Create the run directory `root/{run_id}` and the writer for it.
    pub fn new(root: impl AsRef<Path>, run_id: impl Into<String>, ts: DateTime<Utc>) -> Result<Self> {
        let run_id = run_id.into();
        let dir = root.as_ref().join(&run_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating artifact dir {}", dir.display()))?;
        Ok(Self { run_id, dir, ts })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_signals(&self, rows: &[SignalRow]) -> Result<Artifact> {
        self.write_csv("signals.csv", rows, ArtifactKind::Signals)
    }

    pub fn write_premove(&self, rows: &[SignalRow]) -> Result<Artifact> {
        self.write_csv("premove.csv", rows, ArtifactKind::Premove)
    }

    pub fn write_warm_signals(&self, rows: &[SignalRow]) -> Result<Artifact> {
        self.write_csv("warm_signals.csv", rows, ArtifactKind::Warm)
    }

    pub fn write_explain(&self, entries: &[ExplainEntry]) -> Result<Artifact> {
        let payload = serde_json::json!({
            "schema_version": SCHEMA_VERSION,
            "run_id": self.run_id,
            "symbols": entries,
        });
        self.write_json("explain.json", &payload, ArtifactKind::Explain)
    }

    pub fn write_regime(
        &self,
        snapshot: &RegimeSnapshot,
        next_refresh: DateTime<Utc>,
    ) -> Result<Artifact> {
        let payload = serde_json::json!({
            "schema_version": SCHEMA_VERSION,
            "run_id": self.run_id,
            "votes": {
                "realized_vol_7d": snapshot.realized_vol_7d,
                "pct_above_20ma": snapshot.pct_above_20ma,
                "breadth_thrust": snapshot.breadth_thrust,
            },
            "regime": snapshot.regime,
            "confidence": snapshot.confidence,
            "stable": snapshot.stable,
            "weights": snapshot.weights,
            "next_refresh": next_refresh.to_rfc3339(),
        });
        self.write_json("regime.json", &payload, ArtifactKind::Regime)
    }

    /// errors.json is written next to whatever partial artifacts exist.
    pub fn write_errors(&self, errors: &[ErrorEvent]) -> Result<PathBuf> {
        let payload = serde_json::json!({
            "schema_version": SCHEMA_VERSION,
            "run_id": self.run_id,
            "errors": errors,
        });
        let path = self.dir.join("errors.json");
        atomic_write(&path, &serde_json::to_string_pretty(&payload)?)?;
        info!(run_id = %self.run_id, count = errors.len(), "errors.json written");
        Ok(path)
    }

    fn write_csv(&self, name: &str, rows: &[SignalRow], kind: ArtifactKind) -> Result<Artifact> {
        let mut out = String::with_capacity(rows.len() * 96 + 128);
        out.push_str(&format!("# schema_version={SCHEMA_VERSION}\n"));
        out.push_str(SIGNALS_HEADER);
        out.push('\n');
        for row in rows {
            out.push_str(&row.to_csv());
            out.push('\n');
        }

        let path = self.dir.join(name);
        atomic_write(&path, &out)?;
        info!(run_id = %self.run_id, file = name, rows = rows.len(), "artifact written");
        Ok(self.artifact(kind, &path))
    }

    fn write_json(
        &self,
        name: &str,
        payload: &serde_json::Value,
        kind: ArtifactKind,
    ) -> Result<Artifact> {
        let path = self.dir.join(name);
        atomic_write(&path, &serde_json::to_string_pretty(payload)?)?;
        info!(run_id = %self.run_id, file = name, "artifact written");
        Ok(self.artifact(kind, &path))
    }

    fn artifact(&self, kind: ArtifactKind, path: &Path) -> Artifact {
        Artifact {
            run_id: self.run_id.clone(),
            kind,
            path: path.display().to_string(),
            ts: self.ts,
            schema_version: SCHEMA_VERSION,
        }
    }
}

/// Atomic write: tmp sibling, then rename.
fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)
        .with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn row(symbol: &str, score: f64) -> SignalRow {
        SignalRow {
            timestamp: ts(),
            symbol: symbol.to_string(),
            score,
            momentum_core: 71.3,
            vadr: 1.9,
            spread_bps: 12.0,
            depth_usd: 250_000.0,
            regime: "trending".to_string(),
            fresh: true,
            venue: Venue::Kraken,
            sources: vec![Venue::Kraken, Venue::Coingecko],
        }
    }

    #[test]
    fn signals_csv_has_spec_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path(), "2025-06-01T12:00:00Z", ts()).unwrap();
        let artifact = writer
            .write_signals(&[row("BTCUSD", 82.1), row("ETHUSD", 77.0)])
            .unwrap();

        let content = std::fs::read_to_string(&artifact.path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next().unwrap(), "# schema_version=1");
        assert_eq!(lines.next().unwrap(), SIGNALS_HEADER);
        let first = lines.next().unwrap();
        assert!(first.contains("BTCUSD"));
        assert!(first.contains("82.10"));
        assert!(first.contains("kraken|coingecko"));
        assert_eq!(artifact.kind, ArtifactKind::Signals);
        assert_eq!(artifact.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn identical_rows_produce_identical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![row("BTCUSD", 82.1), row("ETHUSD", 77.0)];

        let w1 = ArtifactWriter::new(dir.path(), "run-a", ts()).unwrap();
        let a1 = w1.write_signals(&rows).unwrap();
        let w2 = ArtifactWriter::new(dir.path(), "run-b", ts()).unwrap();
        let a2 = w2.write_signals(&rows).unwrap();

        let c1 = std::fs::read(&a1.path).unwrap();
        let c2 = std::fs::read(&a2.path).unwrap();
        assert_eq!(c1, c2);
    }

    #[test]
    fn errors_json_written_next_to_partials() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path(), "run-err", ts()).unwrap();
        let path = writer
            .write_errors(&[ErrorEvent {
                symbol: Some("BTCUSD".to_string()),
                code: ReasonCode::AggregatorBanned,
                detail: "L2 requested via coingecko".to_string(),
            }])
            .unwrap();

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(parsed["errors"].as_array().unwrap().len(), 1);
        assert_eq!(parsed["errors"][0]["code"], "AGGREGATOR_BANNED");
        assert_eq!(parsed["schema_version"], 1);
    }

    #[test]
    fn regime_json_carries_votes_and_weights() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path(), "run-regime", ts()).unwrap();

        let snapshot = RegimeSnapshot {
            ts: ts(),
            realized_vol_7d: 0.22,
            pct_above_20ma: 72.0,
            breadth_thrust: 0.81,
            regime: crate::regime::Regime::Trending,
            confidence: 1.0,
            weights: crate::config::ScannerConfig::default().weight_table
                [&crate::regime::Regime::Trending]
                .clone(),
            stable: true,
        };
        let artifact = writer
            .write_regime(&snapshot, ts() + chrono::Duration::hours(4))
            .unwrap();

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&artifact.path).unwrap()).unwrap();
        assert_eq!(parsed["regime"], "trending");
        assert_eq!(parsed["votes"]["realized_vol_7d"], 0.22);
        assert!((parsed["weights"]["momentum_core"].as_f64().unwrap() - 0.5).abs() < 1e-9);
        assert!(parsed["next_refresh"].as_str().unwrap().contains("16:00"));
    }

    #[test]
    fn explain_json_round_trips_reasons() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path(), "run-explain", ts()).unwrap();

        let entry = ExplainEntry {
            symbol: "SOLUSD".to_string(),
            composite: 74.9,
            factors: FactorVector {
                momentum_core: 70.0,
                technical_residual: 2.0,
                volume_residual: 1.0,
                quality_residual: 0.5,
                catalyst: 30.0,
                social: 3.0,
            },
            weights: crate::config::ScannerConfig::default().weight_table
                [&crate::regime::Regime::Trending]
                .clone(),
            gate_outcome: GateOutcome {
                symbol: "SOLUSD".to_string(),
                passed: false,
                reasons: vec![ReasonCode::ScoreThreshold],
                relaxations_applied: Vec::new(),
            },
            reasons: vec![ReasonCode::ScoreThreshold],
            sources: vec![Venue::Kraken],
            fallback: true,
            stale: false,
        };
        let artifact = writer.write_explain(&[entry]).unwrap();

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&artifact.path).unwrap()).unwrap();
        assert_eq!(parsed["symbols"][0]["reasons"][0], "SCORE_THRESHOLD");
        assert_eq!(parsed["symbols"][0]["fallback"], true);
        assert_eq!(parsed["symbols"][0]["sources"][0], "kraken");
    }
}
