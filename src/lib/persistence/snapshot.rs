//! Full copy of the in-memory stats, used to warm-start after a restart.
//!
//! Written as `<path>.tmp`, then the current file is copied to `<path>.bak` and
//! the temporary file is renamed over it. A reader sees either the old or the
//! new document, never a partial one.

use std::{
    collections::{BTreeMap, HashSet},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::*;

use crate::{
    aggregation::{window_stats, WindowSpec, WindowStats},
    source::{Source, SourceId},
    stats::{
        ClassCounts, GlobalTotals, HistoryPoint, HistoryRing, SourceStatus, StatsRecord,
        StatsStore,
    },
};

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct SnapshotDocument {
    pub sources: BTreeMap<SourceId, SourceSnapshot>,
    #[serde(default)]
    pub global_total: GlobalTotals,
    #[serde(default)]
    pub window_stats: BTreeMap<String, WindowStats>,
    pub last_update: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct SourceSnapshot {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_of: Option<SourceId>,
    pub current_density: u64,
    #[serde(default)]
    pub current_class_density: ClassCounts,
    pub accumulated_flux: u64,
    #[serde(default)]
    pub accumulated_class_flux: ClassCounts,
    #[serde(default)]
    pub history: Vec<HistoryPoint>,
    #[serde(default)]
    pub history_truncated: bool,
    #[serde(default)]
    pub status: SourceStatus,
    #[serde(default)]
    pub last_update: Option<f64>,
}

impl SnapshotDocument {
    /// Copies every record out of the store. Mirrors are saved without history,
    /// they share their original's again on the first cycle after a restart.
    #[instrument(level = "debug", skip_all)]
    pub async fn capture(store: &StatsStore, windows: &[WindowSpec], now: f64) -> Self {
        let mut sources = BTreeMap::new();
        let mut global_points = vec![];

        for (id, record) in store.records().await {
            let record = record.read().await;
            let (history, history_truncated) = if record.mirror_of.is_some() {
                (vec![], false)
            } else {
                let history = record.history.read().await;
                (history.to_vec(), history.is_truncated())
            };

            if record.mirror_of.is_none() {
                global_points.extend_from_slice(&history);
            }

            sources.insert(
                id,
                SourceSnapshot {
                    name: record.name.clone(),
                    mirror_of: record.mirror_of.clone(),
                    current_density: record.current_density,
                    current_class_density: record.current_class_density,
                    accumulated_flux: record.accumulated_flux,
                    accumulated_class_flux: record.accumulated_class_flux,
                    history,
                    history_truncated,
                    status: record.status,
                    last_update: record.last_update,
                },
            );
        }

        Self {
            sources,
            global_total: store.global_totals().await,
            window_stats: window_stats(&global_points, windows, now),
            last_update: now,
        }
    }

    /// Loads the document into `store`. Must run before any worker starts.
    #[instrument(level = "debug", skip_all)]
    pub async fn replay(self, store: &StatsStore) -> usize {
        let capacity = store.history_capacity();
        let count = self.sources.len();

        for (id, snapshot) in self.sources {
            let mut record = StatsRecord::new(snapshot.name, capacity);
            record.mirror_of = snapshot.mirror_of;
            record.current_density = snapshot.current_density;
            record.current_class_density = snapshot.current_class_density;
            record.accumulated_flux = snapshot.accumulated_flux;
            record.accumulated_class_flux = snapshot.accumulated_class_flux;
            record.status = snapshot.status;
            record.last_update = snapshot.last_update;

            let history = sanitize_history(&id, snapshot.history);
            record.history = std::sync::Arc::new(tokio::sync::RwLock::new(
                HistoryRing::from_points(capacity, history, snapshot.history_truncated),
            ));

            store.insert(id, record).await;
        }

        info!("Replayed {count} sources from snapshot");
        count
    }
}

/// Drops points that would break the strictly increasing order of a ring.
fn sanitize_history(id: &str, history: Vec<HistoryPoint>) -> Vec<HistoryPoint> {
    let total = history.len();
    let mut last_ts = f64::NEG_INFINITY;
    let history: Vec<HistoryPoint> = history
        .into_iter()
        .filter(|point| {
            if point.ts > last_ts && point.is_consistent() {
                last_ts = point.ts;
                true
            } else {
                false
            }
        })
        .collect();

    if history.len() != total {
        warn!(
            "Discarded {} out of order or inconsistent points from the snapshot of {id:?}",
            total - history.len()
        );
    }

    history
}

/// Removes records of sources that are no longer configured. Durable rows stay.
#[instrument(level = "debug", skip_all)]
pub async fn reconcile(store: &StatsStore, sources: &[Source]) -> Vec<SourceId> {
    let valid: HashSet<SourceId> = sources.iter().map(|source| source.id.clone()).collect();
    let removed = store.retain(&valid).await;

    if !removed.is_empty() {
        info!("Removed stale sources from memory: {removed:?}");
    }

    removed
}

#[derive(Clone, Debug)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn temporary_path(&self) -> PathBuf {
        with_suffix(&self.path, "tmp")
    }

    pub fn backup_path(&self) -> PathBuf {
        with_suffix(&self.path, "bak")
    }

    #[instrument(level = "debug", skip_all, fields(path = ?self.path))]
    pub fn save(&self, document: &SnapshotDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create snapshot folder {parent:?}"))?;
        }

        let temporary = self.temporary_path();
        {
            let mut file = std::fs::File::create(&temporary)
                .with_context(|| format!("Failed to create {temporary:?}"))?;
            let content = serde_json::to_vec(document).context("Failed to serialize snapshot")?;
            file.write_all(&content)
                .with_context(|| format!("Failed to write {temporary:?}"))?;
            file.sync_all()
                .with_context(|| format!("Failed to sync {temporary:?}"))?;
        }

        if self.path.exists() {
            let backup = self.backup_path();
            if let Err(error) = std::fs::copy(&self.path, &backup) {
                warn!("Failed to rotate snapshot backup to {backup:?}: {error}");
            }
        }

        std::fs::rename(&temporary, &self.path)
            .with_context(|| format!("Failed to move {temporary:?} over {:?}", self.path))?;

        debug!("Snapshot saved with {} sources", document.sources.len());
        Ok(())
    }

    /// The snapshot, else its backup, else nothing.
    #[instrument(level = "debug", skip_all, fields(path = ?self.path))]
    pub fn load(&self) -> Option<SnapshotDocument> {
        for path in [self.path.clone(), self.backup_path()] {
            match read_document(&path) {
                Ok(document) => {
                    info!("Loaded snapshot from {path:?}");
                    return Some(document);
                }
                Err(error) => warn!("Snapshot {path:?} is unusable: {error:#}"),
            }
        }

        warn!("No usable snapshot, starting from empty state");
        None
    }
}

fn read_document(path: &Path) -> Result<SnapshotDocument> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {path:?}"))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {path:?}"))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}
