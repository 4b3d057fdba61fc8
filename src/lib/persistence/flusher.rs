use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::*;

use crate::{aggregation::WindowSpec, stats::StatsStore, worker::now_secs};

use super::snapshot::{SnapshotDocument, SnapshotFile};

pub const MIN_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);

/// Captures the store and writes it out, one write at a time.
#[derive(Clone, Debug)]
pub struct Snapshotter {
    store: Arc<StatsStore>,
    file: SnapshotFile,
    windows: Vec<WindowSpec>,
    writing: Arc<Mutex<()>>,
}

impl Snapshotter {
    pub fn new(store: Arc<StatsStore>, file: SnapshotFile, windows: Vec<WindowSpec>) -> Self {
        Self {
            store,
            file,
            windows,
            writing: Default::default(),
        }
    }

    pub fn file(&self) -> &SnapshotFile {
        &self.file
    }

    pub async fn write(&self) -> Result<()> {
        let _writing = self.writing.lock().await;

        let document = SnapshotDocument::capture(&self.store, &self.windows, now_secs()).await;
        let file = self.file.clone();

        tokio::task::spawn_blocking(move || file.save(&document))
            .await
            .context("Snapshot task failed")?
    }
}

/// Writes a snapshot every interval, and whenever asked to.
#[derive(Debug)]
pub struct SnapshotFlusher {
    snapshotter: Snapshotter,
    terminated: Arc<RwLock<bool>>,
    wake: Arc<Notify>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl SnapshotFlusher {
    /// `interval = None` disables periodic writes, leaving only `flush_now`.
    /// Shorter intervals are raised to one minute.
    #[instrument(level = "debug", skip(snapshotter))]
    pub fn spawn(snapshotter: Snapshotter, interval: Option<Duration>) -> Self {
        let terminated = Arc::new(RwLock::new(false));
        let wake = Arc::new(Notify::new());

        let handle = interval.map(|interval| {
            let interval = interval.max(MIN_SNAPSHOT_INTERVAL);
            debug!("Starting SnapshotFlusher task every {interval:?}...");

            tokio::spawn(
                Self::run(
                    snapshotter.clone(),
                    interval,
                    terminated.clone(),
                    wake.clone(),
                )
                .in_current_span(),
            )
        });

        Self {
            snapshotter,
            terminated,
            wake,
            handle,
        }
    }

    async fn run(
        snapshotter: Snapshotter,
        interval: Duration,
        terminated: Arc<RwLock<bool>>,
        wake: Arc<Notify>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => (),
                _ = wake.notified() => (),
            }

            if *terminated.read().await {
                debug!("SnapshotFlusher task ended");
                break;
            }

            if let Err(error) = snapshotter.write().await {
                error!("Failed to write snapshot, retrying at the next tick: {error:#}");
            }
        }
    }

    pub async fn flush_now(&self) -> Result<()> {
        self.snapshotter.write().await
    }

    pub async fn stop(mut self) -> Result<()> {
        *self.terminated.write().await = true;
        self.wake.notify_one();

        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        handle
            .await
            .map_err(|error| anyhow!("SnapshotFlusher task panicked: {error}"))
    }
}

impl Drop for SnapshotFlusher {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
