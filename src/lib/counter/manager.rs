use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use chrono::Weekday;
use tokio::sync::{Mutex, RwLock};
use tracing::*;

use crate::{
    aggregation::{self, window, Bucket, SeriesRequest, WindowStats},
    detection::SharedDetector,
    error::{Error, Result},
    frame::{DisplayBuffer, Frame, FrameSource},
    persistence::{reconcile, DurableStore, SnapshotFile, SnapshotFlusher, Snapshotter},
    prediction::Predictor,
    settings::Settings,
    source::{Source, SourceId},
    stats::{FluxTotals, GlobalTotals, HistoryPoint, RecordSnapshot, SharedRecord, StatsStore},
    worker::{now_secs, SourceWorker, WorkerConfig, WorkerContext, WorkerState},
};

use super::Scope;

const DAY: f64 = 86_400.0;

/// Owns the store, the workers and the persistence tasks, and answers every query.
#[derive(Debug)]
pub struct CounterManager {
    settings: Settings,
    store: Arc<StatsStore>,
    durable: DurableStore,
    predictor: Predictor,
    context: WorkerContext,
    snapshotter: Snapshotter,
    sources: RwLock<Vec<Source>>,
    workers: Mutex<HashMap<SourceId, SourceWorker>>,
    flusher: Mutex<Option<SnapshotFlusher>>,
}

impl CounterManager {
    pub async fn start(
        settings: Settings,
        frame_source: Arc<dyn FrameSource>,
        detector: SharedDetector,
    ) -> anyhow::Result<Self> {
        Self::start_with(settings, frame_source, detector, false).await
    }

    /// Opens the durable store, warm-starts from the snapshot unless `reset`,
    /// drops stale sources, then spawns one worker per source and the flusher.
    #[instrument(level = "debug", skip_all)]
    pub async fn start_with(
        settings: Settings,
        frame_source: Arc<dyn FrameSource>,
        detector: SharedDetector,
        reset: bool,
    ) -> anyhow::Result<Self> {
        let database_path = settings.database_path();
        let durable =
            tokio::task::spawn_blocking(move || DurableStore::open(&database_path)).await??;

        let store = Arc::new(StatsStore::new(settings.history_capacity));
        let snapshot_file = SnapshotFile::new(settings.snapshot_path());

        if reset {
            info!("Starting with empty counters, the snapshot is ignored");
        } else {
            let file = snapshot_file.clone();
            if let Some(document) = tokio::task::spawn_blocking(move || file.load()).await? {
                document.replay(&store).await;
            }
        }

        let removed = reconcile(&store, &settings.sources).await;

        for source in &settings.sources {
            store.ensure(source).await;
        }

        let snapshotter =
            Snapshotter::new(store.clone(), snapshot_file, settings.windows.clone());
        if !removed.is_empty() {
            if let Err(error) = snapshotter.write().await {
                error!("Failed to save snapshot after removing stale sources: {error:#}");
            }
        }

        let context = WorkerContext {
            store: store.clone(),
            durable: durable.clone(),
            frame_source,
            detector,
            display: Arc::new(DisplayBuffer::new(settings.display_source())),
            config: WorkerConfig::from_settings(&settings),
        };

        let manager = Self {
            predictor: Predictor::new(durable.clone()),
            flusher: Mutex::new(Some(SnapshotFlusher::spawn(
                snapshotter.clone(),
                settings.snapshot_interval(),
            ))),
            sources: RwLock::new(settings.sources.clone()),
            workers: Default::default(),
            settings,
            store,
            durable,
            context,
            snapshotter,
        };

        for source in manager.settings.sources.clone() {
            manager.spawn_worker(source).await;
        }

        info!(
            "Counting {} sources, data in {:?}",
            manager.settings.sources.len(),
            manager.settings.data_dir()
        );

        Ok(manager)
    }

    async fn spawn_worker(&self, source: Source) {
        let record = self.store.ensure(&source).await;
        let worker = SourceWorker::spawn(source.clone(), record, self.context.clone());
        self.workers.lock().await.insert(source.id, worker);
    }

    async fn record(&self, id: &str) -> Result<SharedRecord> {
        self.store
            .get(id)
            .await
            .ok_or_else(|| Error::NotFound(format!("Source {id:?} does not exist")))
    }

    /// Where a source's history is stored durably, mirrors read their original's.
    async fn durable_id(&self, id: &str) -> Result<SourceId> {
        let record = self.record(id).await?;
        let record = record.read().await;
        Ok(record.mirror_of.clone().unwrap_or_else(|| id.to_string()))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<StatsStore> {
        &self.store
    }

    pub fn durable(&self) -> &DurableStore {
        &self.durable
    }

    pub fn display(&self) -> &Arc<DisplayBuffer> {
        &self.context.display
    }

    pub fn latest_frame(&self) -> Option<Frame> {
        self.context.display.latest()
    }

    pub async fn set_display_source(&self, id: &str) -> Result<()> {
        self.record(id).await?;
        self.context.display.set_active(Some(id.to_string()));
        Ok(())
    }

    pub async fn sources(&self) -> Vec<Source> {
        self.sources.read().await.clone()
    }

    pub async fn worker_states(&self) -> BTreeMap<SourceId, WorkerState> {
        let mut states = BTreeMap::new();
        for (id, worker) in self.workers.lock().await.iter() {
            states.insert(id.clone(), worker.state().await);
        }
        states
    }

    pub async fn get_current(&self, id: &str) -> Result<RecordSnapshot> {
        self.store
            .snapshot(id)
            .await
            .ok_or_else(|| Error::NotFound(format!("Source {id:?} does not exist")))
    }

    pub async fn get_all_current(&self) -> Vec<RecordSnapshot> {
        self.store.snapshots().await
    }

    pub async fn get_global(&self) -> GlobalTotals {
        self.store.global_totals().await
    }

    pub async fn get_window_stats(&self, scope: &Scope) -> Result<BTreeMap<String, WindowStats>> {
        let windows = &self.settings.windows;
        let now = now_secs();
        let start = now - window::longest(windows) as f64;

        let points = self.points_since(scope, start).await?;
        Ok(aggregation::window_stats(&points, windows, now))
    }

    pub async fn get_series(&self, scope: &Scope, request: SeriesRequest) -> Result<Vec<Bucket>> {
        let series = request.resolve(now_secs())?;
        let points = self.points_since(scope, series.start).await?;
        Ok(aggregation::bucketize(&series, &points))
    }

    async fn points_since(&self, scope: &Scope, start: f64) -> Result<Vec<HistoryPoint>> {
        let points = match scope {
            Scope::Source(id) => {
                let record = self.record(id).await?;
                aggregation::points_since(&record, &self.durable, id, start).await?
            }
            Scope::Global => {
                aggregation::global_points_since(&self.store, &self.durable, start).await?
            }
        };
        Ok(points)
    }

    /// Raw points from the durable store, `end` inclusive.
    pub async fn get_history_range(
        &self,
        id: &str,
        start: Option<f64>,
        end: Option<f64>,
    ) -> Result<Vec<HistoryPoint>> {
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(Error::BadRequest(format!(
                    "Range starts at {start} after it ends at {end}"
                )));
            }
        }

        let durable_id = self.durable_id(id).await?;
        let points = self
            .durable
            .run(move |store| store.range(&durable_id, start, end))
            .await?;
        Ok(points)
    }

    pub async fn predict(&self, id: &str, weekday: Weekday, hour: u32) -> Result<f64> {
        if hour > 23 {
            return Err(Error::BadRequest(format!("Hour {hour} is out of range")));
        }
        let durable_id = self.durable_id(id).await?;
        Ok(self.predictor.predict(&durable_id, weekday, hour).await)
    }

    /// Durable flux over the last `days` days, across every source.
    pub async fn aggregate_since(&self, days: u32) -> Result<FluxTotals> {
        let start = now_secs() - days as f64 * DAY;
        let totals = self
            .durable
            .run(move |store| store.totals_since(start))
            .await?;
        Ok(totals)
    }

    /// Zeroes counters and clears the in-memory history. Durable rows are kept.
    /// A mirror follows its original, so only the original can be reset.
    #[instrument(level = "debug", skip(self))]
    pub async fn reset(&self, scope: &Scope) -> Result<()> {
        let capacity = self.store.history_capacity();
        let records = match scope {
            Scope::Source(id) => {
                let record = self.record(id).await?;
                if let Some(original) = record.read().await.mirror_of.clone() {
                    return Err(Error::BadRequest(format!(
                        "Source {id:?} mirrors {original:?}, reset the original instead"
                    )));
                }
                vec![(id.clone(), record)]
            }
            Scope::Global => self.store.records().await,
        };

        for (id, record) in records {
            record.write().await.reset(capacity).await;
            info!("Counters of {id:?} were reset");
        }

        self.flush_snapshot().await
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn clear_durable_history(&self) -> Result<usize> {
        let deleted = self.durable.run(|store| store.clear_all()).await?;
        Ok(deleted)
    }

    /// Re-derives accumulated flux from the durable store.
    #[instrument(level = "debug", skip(self))]
    pub async fn rebuild_totals(&self, id: &str) -> Result<FluxTotals> {
        let record = self.record(id).await?;
        if record.read().await.mirror_of.is_some() {
            return Err(Error::BadRequest(format!(
                "Source {id:?} is a mirror, rebuild its original instead"
            )));
        }

        let owned_id = id.to_string();
        let totals = self
            .durable
            .run(move |store| store.totals(&owned_id))
            .await?;

        {
            let mut record = record.write().await;
            record.accumulated_flux = totals.flux;
            record.accumulated_class_flux.cars = totals.cars;
            record.accumulated_class_flux.motors = totals.motors;
        }

        info!(
            "Rebuilt totals of {id:?} from {} durable points: {} vehicles",
            totals.points, totals.flux
        );
        Ok(totals)
    }

    #[instrument(level = "debug", skip(self), fields(source_id = %source.id))]
    pub async fn add_source(&self, source: Source) -> Result<()> {
        if source.id.trim().is_empty() {
            return Err(Error::BadRequest("Source id is empty".into()));
        }

        {
            let mut sources = self.sources.write().await;
            if sources.iter().any(|known| known.id == source.id) {
                return Err(Error::BadRequest(format!(
                    "Source {:?} already exists",
                    source.id
                )));
            }
            sources.push(source.clone());
        }

        self.spawn_worker(source).await;
        Ok(())
    }

    /// Stops the worker and forgets the record. Durable rows are kept.
    #[instrument(level = "debug", skip(self))]
    pub async fn remove_source(&self, id: &str) -> Result<()> {
        let worker = self.workers.lock().await.remove(id);
        let Some(worker) = worker else {
            return Err(Error::NotFound(format!("Source {id:?} does not exist")));
        };

        worker.stop().await;
        worker.join().await?;

        self.sources.write().await.retain(|source| source.id != id);
        self.store.remove(id).await;
        info!("Source {id:?} removed");

        self.flush_snapshot().await
    }

    pub async fn flush_snapshot(&self) -> Result<()> {
        self.snapshotter.write().await?;
        Ok(())
    }

    /// Stops every worker at its next loop boundary, then writes a final snapshot.
    #[instrument(level = "debug", skip(self))]
    pub async fn shutdown(self) -> Result<()> {
        let workers: Vec<SourceWorker> = self
            .workers
            .lock()
            .await
            .drain()
            .map(|(_, worker)| worker)
            .collect();

        for worker in &workers {
            worker.stop().await;
        }
        for worker in workers {
            let id = worker.source().id.clone();
            if let Err(error) = worker.join().await {
                error!("Worker for {id:?} did not stop cleanly: {error:#}");
            }
        }

        if let Some(flusher) = self.flusher.lock().await.take() {
            if let Err(error) = flusher.stop().await {
                warn!("{error:#}");
            }
        }

        self.flush_snapshot().await?;
        info!("Counters saved, shutdown complete");
        Ok(())
    }
}
