// =============================================================================
// PIT Store — append-only persistence for snapshots and artifacts
// =============================================================================
//
// Filesystem layout: `data/pit/{entity}/YYYY/MM/DD/HH-MM-SS-source.json`.
// Writes are atomic (tmp + rename) and never overwrite: a second write for
// the same second gains a numeric suffix instead of clobbering.
//
// `PitBackend` is the seam a relational backend with identical semantics
// plugs into; the store always writes the file backend first, so a failing
// secondary backend can never lose an event.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::Serialize;
use tracing::{debug, warn};

/// Persistence seam. Implementations must be append-only: writing the same
/// `(entity, ts, source)` twice must keep both events.
pub trait PitBackend: Send + Sync {
    /// Persist one event, returning a locator (path, row id, ...).
    fn append(
        &self,
        entity: &str,
        ts: DateTime<Utc>,
        source: &str,
        payload: &serde_json::Value,
    ) -> Result<String>;
}

/// The filesystem backend.
pub struct FilePitStore {
    root: PathBuf,
}

impl FilePitStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dir_for(&self, entity: &str, ts: DateTime<Utc>) -> PathBuf {
        self.root
            .join(entity)
            .join(format!("{:04}", ts.year()))
            .join(format!("{:02}", ts.month()))
            .join(format!("{:02}", ts.day()))
    }

    fn file_name(ts: DateTime<Utc>, source: &str, suffix: u32) -> String {
        let base = format!(
            "{:02}-{:02}-{:02}-{}",
            ts.hour(),
            ts.minute(),
            ts.second(),
            source
        );
        if suffix == 0 {
            format!("{base}.json")
        } else {
            format!("{base}.{suffix}.json")
        }
    }

    /// All stored events for an entity on a given day, path-sorted (which
    /// is time-sorted given the layout).
    pub fn read_day(&self, entity: &str, ts: DateTime<Utc>) -> Result<Vec<serde_json::Value>> {
        let dir = self.dir_for(entity, ts);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)
            .with_context(|| format!("reading {}", dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        paths
            .iter()
            .map(|p| {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("reading {}", p.display()))?;
                serde_json::from_str(&content)
                    .with_context(|| format!("parsing {}", p.display()))
            })
            .collect()
    }
}

impl PitBackend for FilePitStore {
    fn append(
        &self,
        entity: &str,
        ts: DateTime<Utc>,
        source: &str,
        payload: &serde_json::Value,
    ) -> Result<String> {
        let dir = self.dir_for(entity, ts);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating {}", dir.display()))?;

        // Find a free slot instead of overwriting: append-only on disk.
        let mut suffix = 0;
        let path = loop {
            let candidate = dir.join(Self::file_name(ts, source, suffix));
            if !candidate.exists() {
                break candidate;
            }
            suffix += 1;
        };

        let content =
            serde_json::to_string_pretty(payload).context("serialising PIT payload")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &content)
            .with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("renaming into {}", path.display()))?;

        debug!(entity, path = %path.display(), "PIT event appended");
        Ok(path.display().to_string())
    }
}

/// The store the engine writes through: the file backend always, an
/// optional secondary backend best-effort.
pub struct PitStore {
    file: FilePitStore,
    secondary: Option<Box<dyn PitBackend>>,
}

impl PitStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            file: FilePitStore::new(root.as_ref().to_path_buf()),
            secondary: None,
        }
    }

    /// Attach a secondary backend (e.g. a relational store configured via
    /// `PG_DSN`). File writes remain authoritative.
    pub fn with_secondary(mut self, backend: Box<dyn PitBackend>) -> Self {
        self.secondary = Some(backend);
        self
    }

    /// Append a serialisable event. The file write must succeed; a failing
    /// secondary backend is logged and ignored.
    pub fn append<T: Serialize>(
        &self,
        entity: &str,
        ts: DateTime<Utc>,
        source: &str,
        event: &T,
    ) -> Result<String> {
        let payload = serde_json::to_value(event).context("serialising PIT event")?;
        let path = self.file.append(entity, ts, source, &payload)?;

        if let Some(secondary) = &self.secondary {
            if let Err(e) = secondary.append(entity, ts, source, &payload) {
                warn!(entity, error = %e, "secondary PIT backend failed — file write retained");
            }
        }
        Ok(path)
    }

    pub fn file_store(&self) -> &FilePitStore {
        &self.file
    }
}
