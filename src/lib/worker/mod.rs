pub mod flux;

use std::{collections::VecDeque, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use serde::Serialize;
use tokio::sync::{Notify, RwLock};
use tracing::*;

use crate::{
    detection::SharedDetector,
    frame::{self, DisplayBuffer, FrameSource},
    persistence::DurableStore,
    settings::Settings,
    source::Source,
    stats::{HistoryPoint, SharedRecord, SourceStatus, StatsStore},
};

pub use flux::FluxReducer;

/// Points waiting for the durable store are capped, oldest dropped first.
pub const MAX_PENDING_POINTS: usize = 10_000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    #[default]
    Idle,
    Acquiring,
    Detecting,
    Reducing,
    Publishing,
    Sleeping,
    Stopped,
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub process_interval: Duration,
    pub iou_threshold: f64,
    pub confidence_threshold: f32,
    pub acquisition_attempts: u32,
    pub acquisition_retry_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl WorkerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            process_interval: Duration::from_secs_f64(settings.process_interval_secs.max(0.0)),
            iou_threshold: settings.iou_threshold,
            confidence_threshold: settings.confidence_threshold,
            acquisition_attempts: settings.acquisition_attempts,
            acquisition_retry_delay: Duration::from_millis(settings.acquisition_retry_delay_ms),
        }
    }
}

/// Everything a worker shares with the rest of the process.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<StatsStore>,
    pub durable: DurableStore,
    pub frame_source: Arc<dyn FrameSource>,
    pub detector: SharedDetector,
    pub display: Arc<DisplayBuffer>,
    pub config: WorkerConfig,
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("durable", &self.durable)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// One task per source. It owns the only write access to the source's record.
#[derive(Debug)]
pub struct SourceWorker {
    source: Source,
    state: Arc<RwLock<WorkerState>>,
    terminated: Arc<RwLock<bool>>,
    wake: Arc<Notify>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl SourceWorker {
    #[instrument(level = "debug", skip(record, context), fields(source_id = %source.id))]
    pub fn spawn(source: Source, record: SharedRecord, context: WorkerContext) -> Self {
        let state = Arc::new(RwLock::new(WorkerState::Idle));
        let terminated = Arc::new(RwLock::new(false));
        let wake = Arc::new(Notify::new());

        debug!("Starting SourceWorker task...");

        let handle = Some(tokio::spawn({
            let source = source.clone();
            let state = state.clone();
            let terminated = terminated.clone();
            let wake = wake.clone();

            async move {
                debug!("SourceWorker task started!");
                let lifecycle = Lifecycle {
                    state: state.clone(),
                    terminated,
                    wake,
                };

                let result = if source.is_mirror() {
                    Self::mirror(&source, record, context, &lifecycle).await
                } else {
                    Self::detecting(&source, record, context, &lifecycle).await
                };

                match result {
                    Ok(_) => debug!("SourceWorker task ended with no errors"),
                    Err(error) => warn!("SourceWorker task ended with error: {error:#?}"),
                };

                *state.write().await = WorkerState::Stopped;
            }
            .in_current_span()
        }));

        Self {
            source,
            state,
            terminated,
            wake,
            handle,
        }
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }

    /// Requests a stop. It takes effect at the top of the next cycle; an
    /// in-flight acquisition or inference is left to finish.
    #[instrument(level = "debug", skip(self), fields(source_id = %self.source.id))]
    pub async fn stop(&self) {
        *self.terminated.write().await = true;
        self.wake.notify_one();
    }

    pub async fn join(mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        handle
            .await
            .map_err(|error| anyhow!("Worker for {:?} panicked: {error}", self.source.id))
    }

    #[instrument(level = "debug", skip_all, fields(source_id = %source.id))]
    async fn detecting(
        source: &Source,
        record: SharedRecord,
        context: WorkerContext,
        lifecycle: &Lifecycle,
    ) -> Result<()> {
        let config = &context.config;
        let mut reducer = FluxReducer::new(config.iou_threshold);
        let mut pending = VecDeque::new();
        let mut last_ts = {
            let record = record.read().await;
            let newest = record.history.read().await.newest().map(|point| point.ts);
            newest.or(record.last_update)
        };

        loop {
            if lifecycle.is_terminated().await {
                debug!("Ending worker for {:?}.", source.name);
                break;
            }

            lifecycle.set(WorkerState::Acquiring).await;
            let frame = match frame::acquire(
                context.frame_source.as_ref(),
                source,
                config.acquisition_attempts,
                config.acquisition_retry_delay,
            )
            .await
            {
                Ok(frame) => frame,
                Err(error) => {
                    warn!("[{}] Acquisition failed: {error:#}", source.name);
                    if record.write().await.set_status(SourceStatus::Offline) {
                        info!("[{}] Source is now Offline", source.name);
                    }
                    // Whatever is still queued may go through even while the camera is down
                    flush_pending(&context.durable, &source.id, &mut pending).await;
                    lifecycle.sleep(config.process_interval).await;
                    continue;
                }
            };

            lifecycle.set(WorkerState::Detecting).await;
            let detections = context
                .detector
                .detect_or_empty(&frame, config.confidence_threshold)
                .await;
            context.display.offer(&frame);

            lifecycle.set(WorkerState::Reducing).await;
            let cycle = reducer.reduce(&detections);

            lifecycle.set(WorkerState::Publishing).await;
            let ts = next_timestamp(now_secs(), last_ts);
            last_ts = Some(ts);

            let (point, came_online, accumulated) = {
                let mut record = record.write().await;
                let was_online = record.status == SourceStatus::Online;
                let point = record.publish(ts, cycle).await;
                (point, !was_online, record.accumulated_flux)
            };

            if came_online {
                info!("[{}] Source is now Online", source.name);
            }
            info!(
                "[{}] Count: {} (Total: {accumulated})",
                source.name, point.density_total
            );

            enqueue(&mut pending, point, &source.name);
            flush_pending(&context.durable, &source.id, &mut pending).await;

            lifecycle.sleep(config.process_interval).await;
        }

        // Last chance for anything the durable store refused earlier
        flush_pending(&context.durable, &source.id, &mut pending).await;
        if !pending.is_empty() {
            warn!(
                "[{}] Dropping {} points that never reached the durable store",
                source.name,
                pending.len()
            );
        }

        Ok(())
    }

    #[instrument(level = "debug", skip_all, fields(source_id = %source.id))]
    async fn mirror(
        source: &Source,
        record: SharedRecord,
        context: WorkerContext,
        lifecycle: &Lifecycle,
    ) -> Result<()> {
        let Some(original_id) = source.mirror_of.as_deref() else {
            return Err(anyhow!("Source {:?} is not a mirror", source.id));
        };

        loop {
            if lifecycle.is_terminated().await {
                debug!("Ending mirror for {:?}.", source.name);
                break;
            }

            lifecycle.set(WorkerState::Publishing).await;
            let original = mirrored_record(&context.store, original_id, &record).await;

            match original {
                Some(original) => {
                    // Copy out first so two records are never locked at once
                    let original = original.read().await.clone();
                    let previous = {
                        let mut record = record.write().await;
                        let previous = record.status;
                        record.mirror(&original, now_secs());
                        previous
                    };
                    if previous != original.status {
                        info!(
                            "[{}] Mirror of {original_id:?} is now {:?}",
                            source.name, original.status
                        );
                    }
                }
                None => {
                    if record.write().await.set_status(SourceStatus::Offline) {
                        warn!(
                            "[{}] Mirrored source {original_id:?} does not exist, marking Offline",
                            source.name
                        );
                    }
                }
            }

            lifecycle.sleep(context.config.process_interval).await;
        }

        Ok(())
    }
}

impl Drop for SourceWorker {
    fn drop(&mut self) {
        if self.handle.is_none() {
            return;
        }

        // The task notices at its next loop boundary
        match self.terminated.try_write() {
            Ok(mut terminated) => *terminated = true,
            Err(_) => {
                if let Some(handle) = self.handle.take() {
                    handle.abort();
                }
            }
        }
        self.wake.notify_one();
    }
}

struct Lifecycle {
    state: Arc<RwLock<WorkerState>>,
    terminated: Arc<RwLock<bool>>,
    wake: Arc<Notify>,
}

impl Lifecycle {
    async fn set(&self, state: WorkerState) {
        *self.state.write().await = state;
    }

    async fn is_terminated(&self) -> bool {
        *self.terminated.read().await
    }

    async fn sleep(&self, duration: Duration) {
        self.set(WorkerState::Sleeping).await;
        tokio::select! {
            _ = tokio::time::sleep(duration) => (),
            _ = self.wake.notified() => (),
        }
    }
}

async fn mirrored_record(
    store: &StatsStore,
    original_id: &str,
    own: &SharedRecord,
) -> Option<SharedRecord> {
    let original = store.get(original_id).await?;
    if Arc::ptr_eq(&original, own) {
        return None;
    }
    Some(original)
}

pub fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Keeps a source's timestamps strictly increasing even if the clock steps back.
pub fn next_timestamp(now: f64, previous: Option<f64>) -> f64 {
    match previous {
        Some(previous) if now <= previous => previous + 0.001,
        _ => now,
    }
}

fn enqueue(pending: &mut VecDeque<HistoryPoint>, point: HistoryPoint, name: &str) {
    pending.push_back(point);
    if pending.len() > MAX_PENDING_POINTS {
        pending.pop_front();
        warn!("[{name}] Durable queue full, dropped the oldest point");
    }
}

async fn flush_pending(durable: &DurableStore, source_id: &str, pending: &mut VecDeque<HistoryPoint>) {
    if pending.is_empty() {
        return;
    }

    let batch: Vec<HistoryPoint> = pending.iter().copied().collect();
    let count = batch.len();
    let owned_id = source_id.to_string();

    match durable
        .run(move |store| store.append_batch(&owned_id, &batch))
        .await
    {
        Ok(_) => {
            trace!("Persisted {count} points for {source_id:?}");
            pending.clear();
        }
        Err(error) => {
            error!("Failed to persist {count} points for {source_id:?}, retrying next cycle: {error:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        detection::{BoundingBox, Detection, Detector, VehicleClass},
        frame::Frame,
    };

    struct Camera {
        online: AtomicBool,
    }

    #[async_trait]
    impl FrameSource for Camera {
        async fn read_frame(&self, source: &Source) -> Result<Option<Frame>> {
            if self.online.load(Ordering::SeqCst) {
                Ok(Some(Frame::new(&source.id, 4, 4, vec![])))
            } else {
                Err(anyhow!("connection refused"))
            }
        }
    }

    /// Alternates between one parked car and the same car plus a passing motorcycle.
    struct Street {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Detector for Street {
        async fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let mut detections = vec![Detection::new(
                BoundingBox::new(0, 0, 50, 50),
                VehicleClass::Car,
                0.9,
            )];
            if call % 2 == 1 {
                detections.push(Detection::new(
                    BoundingBox::new(300, 300, 320, 340),
                    VehicleClass::Motorcycle,
                    0.7,
                ));
            }
            Ok(detections)
        }
    }

    fn context(store: Arc<StatsStore>, online: bool) -> (WorkerContext, Arc<Camera>) {
        let camera = Arc::new(Camera {
            online: AtomicBool::new(online),
        });
        let context = WorkerContext {
            store,
            durable: DurableStore::open_in_memory().unwrap(),
            frame_source: camera.clone(),
            detector: SharedDetector::new(Street {
                calls: AtomicUsize::new(0),
            }),
            display: Arc::new(DisplayBuffer::new(Some("cam".into()))),
            config: WorkerConfig {
                process_interval: Duration::from_millis(10),
                acquisition_attempts: 1,
                acquisition_retry_delay: Duration::ZERO,
                ..Default::default()
            },
        };
        (context, camera)
    }

    async fn wait_for<F>(mut condition: F)
    where
        F: FnMut() -> futures::future::BoxFuture<'static, bool>,
    {
        for _ in 0..500 {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    #[test]
    fn timestamps_are_strictly_increasing() {
        assert_eq!(next_timestamp(10.0, None), 10.0);
        assert_eq!(next_timestamp(10.0, Some(9.0)), 10.0);
        assert_eq!(next_timestamp(10.0, Some(10.0)), 10.001);
        assert_eq!(next_timestamp(5.0, Some(10.0)), 10.001);
    }

    #[test]
    fn pending_queue_is_bounded() {
        let mut pending = VecDeque::new();
        for i in 0..MAX_PENDING_POINTS + 5 {
            enqueue(&mut pending, HistoryPoint { ts: i as f64, ..Default::default() }, "cam");
        }
        assert_eq!(pending.len(), MAX_PENDING_POINTS);
        assert_eq!(pending.front().unwrap().ts, 5.0);
    }

    #[tokio::test]
    async fn publishes_cycles_and_persists_them() {
        let store = Arc::new(StatsStore::new(100));
        let source = Source::new("cam", "Cam", "replay://cam");
        let record = store.ensure(&source).await;
        let (context, _camera) = context(store.clone(), true);
        let durable = context.durable.clone();
        let display = context.display.clone();

        let worker = SourceWorker::spawn(source, record.clone(), context);

        wait_for(|| {
            let record = record.clone();
            Box::pin(async move { record.read().await.history.read().await.len() >= 4 })
        })
        .await;
        worker.stop().await;
        worker.join().await.unwrap();

        let record = record.read().await;
        let history = record.history.read().await.to_vec();
        assert!(history.windows(2).all(|pair| pair[0].ts < pair[1].ts));
        assert!(history.iter().all(HistoryPoint::is_consistent));

        // The parked car counts once, every second cycle adds a motorcycle
        assert_eq!(history[0].flux_total, 1);
        assert_eq!(history[1].flux_total, 1);
        assert_eq!(history[1].flux_motors, 1);
        assert_eq!(history[2].flux_total, 0);

        let expected: u64 = history.iter().map(|point| point.flux_total).sum();
        assert_eq!(record.accumulated_flux, expected);
        assert_eq!(record.status, SourceStatus::Online);

        let persisted = durable.range("cam", None, None).unwrap();
        assert_eq!(persisted, history);
        assert!(display.latest().is_some());
    }

    #[tokio::test]
    #[traced_test]
    async fn unreachable_source_goes_offline_and_recovers() {
        let store = Arc::new(StatsStore::new(100));
        let source = Source::new("cam", "Cam", "replay://cam");
        let record = store.ensure(&source).await;
        record.write().await.status = SourceStatus::Online;
        let (context, camera) = context(store.clone(), false);

        let worker = SourceWorker::spawn(source, record.clone(), context);

        wait_for(|| {
            let record = record.clone();
            Box::pin(async move { record.read().await.status == SourceStatus::Offline })
        })
        .await;
        assert_eq!(record.read().await.accumulated_flux, 0);

        camera.online.store(true, Ordering::SeqCst);
        wait_for(|| {
            let record = record.clone();
            Box::pin(async move { record.read().await.status == SourceStatus::Online })
        })
        .await;

        worker.stop().await;
        worker.join().await.unwrap();

        assert!(logs_contain("Source is now Offline"));
        assert!(logs_contain("Source is now Online"));
    }

    #[tokio::test]
    async fn one_failing_source_does_not_touch_another() {
        let store = Arc::new(StatsStore::new(100));
        let good = Source::new("good", "Good", "replay://good");
        let bad = Source::new("bad", "Bad", "replay://bad");
        let good_record = store.ensure(&good).await;
        let bad_record = store.ensure(&bad).await;

        let (good_context, _) = context(store.clone(), true);
        let (bad_context, _) = context(store.clone(), false);

        let good_worker = SourceWorker::spawn(good, good_record.clone(), good_context);
        let bad_worker = SourceWorker::spawn(bad, bad_record.clone(), bad_context);

        wait_for(|| {
            let record = good_record.clone();
            Box::pin(async move { record.read().await.history.read().await.len() >= 3 })
        })
        .await;

        good_worker.stop().await;
        bad_worker.stop().await;
        good_worker.join().await.unwrap();
        bad_worker.join().await.unwrap();

        assert!(good_record.read().await.accumulated_flux > 0);
        assert_eq!(bad_record.read().await.status, SourceStatus::Offline);
        assert!(bad_record.read().await.history.read().await.is_empty());
    }

    #[tokio::test]
    async fn mirror_follows_its_original() {
        let store = Arc::new(StatsStore::new(100));
        let main = Source::new("cam", "Main", "replay://cam");
        let copy = Source::new("cam-b", "Main (B)", "replay://cam").mirroring("cam");
        let main_record = store.ensure(&main).await;
        let copy_record = store.ensure(&copy).await;

        let (context, _) = context(store.clone(), true);
        let main_worker = SourceWorker::spawn(main, main_record.clone(), context.clone());
        let copy_worker = SourceWorker::spawn(copy, copy_record.clone(), context);

        wait_for(|| {
            let record = copy_record.clone();
            Box::pin(async move { record.read().await.accumulated_flux > 0 })
        })
        .await;

        main_worker.stop().await;
        copy_worker.stop().await;
        main_worker.join().await.unwrap();
        copy_worker.join().await.unwrap();

        let main_record = main_record.read().await;
        let copy_record = copy_record.read().await;
        assert!(Arc::ptr_eq(&main_record.history, &copy_record.history));
        assert_eq!(copy_record.status, SourceStatus::Online);
    }

    #[tokio::test]
    async fn mirror_of_missing_source_is_offline() {
        let store = Arc::new(StatsStore::new(100));
        let copy = Source::new("cam-b", "Orphan", "replay://cam").mirroring("nowhere");
        let record = store.ensure(&copy).await;
        record.write().await.status = SourceStatus::Online;

        let (context, _) = context(store.clone(), true);
        let worker = SourceWorker::spawn(copy, record.clone(), context);

        wait_for(|| {
            let record = record.clone();
            Box::pin(async move { record.read().await.status == SourceStatus::Offline })
        })
        .await;

        worker.stop().await;
        assert!(worker.join().await.is_ok());
    }

    #[tokio::test]
    async fn stop_ends_in_stopped_state() {
        let store = Arc::new(StatsStore::new(100));
        let source = Source::new("cam", "Cam", "replay://cam");
        let record = store.ensure(&source).await;
        let (mut context, _) = context(store, true);
        context.config.process_interval = Duration::from_secs(3600);

        let worker = SourceWorker::spawn(source, record.clone(), context);
        wait_for(|| {
            let record = record.clone();
            Box::pin(async move { record.read().await.history.read().await.len() == 1 })
        })
        .await;

        // Wakes the long sleep instead of waiting an hour
        worker.stop().await;
        let state = worker.state.clone();
        worker.join().await.unwrap();
        assert_eq!(*state.read().await, WorkerState::Stopped);
    }
}
