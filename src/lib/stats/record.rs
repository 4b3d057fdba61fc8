use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::source::SourceId;

use super::{
    history::HistoryRing,
    types::{ClassCounts, CycleCounts, HistoryPoint, SourceStatus},
};

pub type SharedHistory = Arc<RwLock<HistoryRing>>;

/// Running state of one source. Mutated only by its worker, or by replay before workers start.
///
/// Cloning is cheap, the history is shared behind its `Arc`.
#[derive(Clone, Debug)]
pub struct StatsRecord {
    pub name: String,
    pub mirror_of: Option<SourceId>,
    pub current_density: u64,
    pub current_class_density: ClassCounts,
    pub accumulated_flux: u64,
    pub accumulated_class_flux: ClassCounts,
    pub history: SharedHistory,
    pub status: SourceStatus,
    pub last_update: Option<f64>,
}

/// A consistent copy of a record's counters, without the history points.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct RecordSnapshot {
    pub id: SourceId,
    pub name: String,
    pub mirror_of: Option<SourceId>,
    pub current_density: u64,
    pub current_class_density: ClassCounts,
    pub accumulated_flux: u64,
    pub accumulated_class_flux: ClassCounts,
    pub status: SourceStatus,
    pub last_update: Option<f64>,
    pub history_len: usize,
    pub history_truncated: bool,
}

impl StatsRecord {
    pub fn new(name: impl Into<String>, history_capacity: usize) -> Self {
        Self {
            name: name.into(),
            mirror_of: None,
            current_density: 0,
            current_class_density: ClassCounts::default(),
            accumulated_flux: 0,
            accumulated_class_flux: ClassCounts::default(),
            history: Arc::new(RwLock::new(HistoryRing::new(history_capacity))),
            status: SourceStatus::Offline,
            last_update: None,
        }
    }

    /// Applies one detection cycle: current density, accumulated flux and a new history point.
    pub async fn publish(&mut self, ts: f64, cycle: CycleCounts) -> HistoryPoint {
        let point = HistoryPoint::new(ts, cycle.density, cycle.flux);

        self.history.write().await.push(point);

        self.current_density = point.density_total;
        self.current_class_density = cycle.density;
        self.accumulated_flux += point.flux_total;
        self.accumulated_class_flux += cycle.flux;
        self.status = SourceStatus::Online;
        self.last_update = Some(ts);

        point
    }

    /// Copies the counters of the mirrored record and shares its history.
    pub fn mirror(&mut self, original: &StatsRecord, now: f64) {
        self.current_density = original.current_density;
        self.current_class_density = original.current_class_density;
        self.accumulated_flux = original.accumulated_flux;
        self.accumulated_class_flux = original.accumulated_class_flux;
        self.history = original.history.clone();
        self.status = original.status;
        self.last_update = Some(now);
    }

    pub fn set_status(&mut self, status: SourceStatus) -> bool {
        let changed = self.status != status;
        self.status = status;
        changed
    }

    /// Zeroes counters and clears history. A mirror drops its reference to the
    /// shared history instead of clearing the original's.
    pub async fn reset(&mut self, history_capacity: usize) {
        self.current_density = 0;
        self.current_class_density = ClassCounts::default();
        self.accumulated_flux = 0;
        self.accumulated_class_flux = ClassCounts::default();

        if self.mirror_of.is_some() {
            self.history = Arc::new(RwLock::new(HistoryRing::new(history_capacity)));
        } else {
            self.history.write().await.clear();
        }
    }

    pub async fn snapshot(&self, id: &str) -> RecordSnapshot {
        let history = self.history.read().await;
        RecordSnapshot {
            id: id.to_string(),
            name: self.name.clone(),
            mirror_of: self.mirror_of.clone(),
            current_density: self.current_density,
            current_class_density: self.current_class_density,
            accumulated_flux: self.accumulated_flux,
            accumulated_class_flux: self.accumulated_class_flux,
            status: self.status,
            last_update: self.last_update,
            history_len: history.len(),
            history_truncated: history.is_truncated(),
        }
    }
}
