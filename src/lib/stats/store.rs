use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::*;

use crate::source::{Source, SourceId};

use super::record::{RecordSnapshot, StatsRecord};

pub type SharedRecord = Arc<RwLock<StatsRecord>>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct GlobalTotals {
    pub accumulated_flux: u64,
    pub cars: u64,
    pub motorcycles: u64,
    pub current_density: u64,
    pub current_cars: u64,
    pub current_motorcycles: u64,
}

/// Source id to stats record.
///
/// The map lock is only taken exclusively to add or remove a source. Each record
/// has its own lock, so one worker publishing never blocks readers of other sources.
#[derive(Debug)]
pub struct StatsStore {
    records: RwLock<HashMap<SourceId, SharedRecord>>,
    history_capacity: usize,
}

impl StatsStore {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            records: Default::default(),
            history_capacity,
        }
    }

    pub fn history_capacity(&self) -> usize {
        self.history_capacity
    }

    /// Returns the record for `source`, creating it on first reference.
    #[instrument(level = "debug", skip(self, source), fields(source_id = %source.id))]
    pub async fn ensure(&self, source: &Source) -> SharedRecord {
        if let Some(record) = self.get(&source.id).await {
            {
                let mut record = record.write().await;
                if record.name != source.name {
                    record.name = source.name.clone();
                }
                record.mirror_of = source.mirror_of.clone();
            }
            return record;
        }

        let mut records = self.records.write().await;
        records
            .entry(source.id.clone())
            .or_insert_with(|| {
                debug!("Creating stats record for {:?}", source.name);
                let mut record = StatsRecord::new(&source.name, self.history_capacity);
                record.mirror_of = source.mirror_of.clone();
                Arc::new(RwLock::new(record))
            })
            .clone()
    }

    /// Inserts a fully built record, replacing any previous one. Used by replay.
    pub async fn insert(&self, id: SourceId, record: StatsRecord) -> SharedRecord {
        let record = Arc::new(RwLock::new(record));
        self.records.write().await.insert(id, record.clone());
        record
    }

    pub async fn get(&self, id: &str) -> Option<SharedRecord> {
        self.records.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.records.read().await.contains_key(id)
    }

    pub async fn remove(&self, id: &str) -> bool {
        self.records.write().await.remove(id).is_some()
    }

    pub async fn ids(&self) -> Vec<SourceId> {
        let mut ids: Vec<SourceId> = self.records.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Every record, sorted by id. The map lock is released before returning.
    pub async fn records(&self) -> Vec<(SourceId, SharedRecord)> {
        let mut records: Vec<(SourceId, SharedRecord)> = self
            .records
            .read()
            .await
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect();
        records.sort_by(|a, b| a.0.cmp(&b.0));
        records
    }

    /// Drops every record whose id is not in `valid`, returning the removed ids.
    pub async fn retain(&self, valid: &HashSet<SourceId>) -> Vec<SourceId> {
        let mut records = self.records.write().await;
        let mut removed: Vec<SourceId> = records
            .keys()
            .filter(|id| !valid.contains(*id))
            .cloned()
            .collect();
        removed.sort();

        for id in &removed {
            records.remove(id);
        }

        removed
    }

    pub async fn snapshot(&self, id: &str) -> Option<RecordSnapshot> {
        let record = self.get(id).await?;
        let record = record.read().await;
        Some(record.snapshot(id).await)
    }

    pub async fn snapshots(&self) -> Vec<RecordSnapshot> {
        let mut snapshots = vec![];
        for (id, record) in self.records().await {
            snapshots.push(record.read().await.snapshot(&id).await);
        }
        snapshots
    }

    /// Sums across sources. Mirrors are skipped, their numbers are someone else's.
    pub async fn global_totals(&self) -> GlobalTotals {
        let mut totals = GlobalTotals::default();
        for (_, record) in self.records().await {
            let record = record.read().await;
            if record.mirror_of.is_some() {
                continue;
            }
            totals.accumulated_flux += record.accumulated_flux;
            totals.cars += record.accumulated_class_flux.cars;
            totals.motorcycles += record.accumulated_class_flux.motors;
            totals.current_density += record.current_density;
            totals.current_cars += record.current_class_density.cars;
            totals.current_motorcycles += record.current_class_density.motors;
        }
        totals
    }
}
