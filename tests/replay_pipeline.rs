use std::{path::Path, sync::Arc, time::Duration};

use vehicle_flow_counter::{
    aggregation::{Period, SeriesRequest},
    counter::{CounterManager, Scope},
    detection::SharedDetector,
    persistence::{SnapshotDocument, SnapshotFile},
    replay::{ReplayDetector, ReplayFrameSource},
    settings::Settings,
    source::Source,
    stats::SourceStatus,
};

/// A car arrives and stays parked, a motorcycle passes once, a pedestrian is
/// ignored and the last frame is too unsure to count.
const RECORDING: &str = r#"[{"box": [0, 0, 50, 50], "class_id": 2, "confidence": 0.9}]
[{"box": [1, 1, 51, 51], "class_id": 2, "confidence": 0.9}, {"box": [300, 300, 330, 360], "class_id": 3, "confidence": 0.6}]
[{"box": [0, 0, 50, 50], "class_id": 2, "confidence": 0.9}, {"box": [600, 10, 640, 40], "class_id": 0, "confidence": 0.9}]
[{"box": [2, 2, 52, 52], "class_id": 2, "confidence": 0.05}]"#;

fn write_recording(dir: &Path, name: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, RECORDING).unwrap();
    format!("replay://{}", path.display())
}

fn settings(dir: &Path) -> Settings {
    let endpoint = write_recording(dir, "avenue.jsonl");
    Settings {
        sources: vec![
            Source::new("avenue", "Avenue", &endpoint),
            Source::new("avenue-b", "Avenue (B)", &endpoint).mirroring("avenue"),
            Source::new("bridge", "Bridge", "replay:///no/such/recording.jsonl"),
        ],
        process_interval_secs: 0.01,
        acquisition_attempts: 1,
        acquisition_retry_delay_ms: 0,
        snapshot_interval_secs: 0,
        data_dir: Some(dir.join("data")),
        ..Default::default()
    }
}

async fn start(settings: Settings, looping: bool, reset: bool) -> CounterManager {
    CounterManager::start_with(
        settings,
        Arc::new(ReplayFrameSource::new(looping)),
        SharedDetector::new(ReplayDetector),
        reset,
    )
    .await
    .unwrap()
}

async fn wait_until_offline(manager: &CounterManager, id: &str) {
    for _ in 0..1000 {
        if manager.get_current(id).await.unwrap().status == SourceStatus::Offline {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{id} never went offline");
}

async fn wait_for_history(manager: &CounterManager, id: &str, len: usize) {
    for _ in 0..1000 {
        if manager.get_current(id).await.unwrap().history_len >= len {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{id} never reached {len} points");
}

#[tokio::test]
async fn recording_is_counted_once_per_vehicle() {
    let dir = tempfile::tempdir().unwrap();
    let manager = start(settings(dir.path()), false, false).await;

    // Without looping the source goes offline when the recording runs out
    wait_for_history(&manager, "avenue", 4).await;
    wait_until_offline(&manager, "avenue").await;

    let avenue = manager.get_current("avenue").await.unwrap();
    // Car on the first frame, motorcycle on the second; the rest are repeats,
    // unmapped classes or below the confidence threshold
    assert_eq!(avenue.accumulated_flux, 2);
    assert_eq!(avenue.accumulated_class_flux.cars, 1);
    assert_eq!(avenue.accumulated_class_flux.motors, 1);
    assert_eq!(avenue.history_len, 4);
    assert_eq!(avenue.current_density, 0);

    let bridge = manager.get_current("bridge").await.unwrap();
    assert_eq!(bridge.status, SourceStatus::Offline);
    assert_eq!(bridge.accumulated_flux, 0);

    // The mirror copies the counters but is left out of the global totals
    for _ in 0..1000 {
        if manager.get_current("avenue-b").await.unwrap().accumulated_flux == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let mirror = manager.get_current("avenue-b").await.unwrap();
    assert_eq!(mirror.accumulated_flux, 2);
    assert_eq!(mirror.mirror_of.as_deref(), Some("avenue"));
    let global = manager.get_global().await;
    assert_eq!(global.accumulated_flux, 2);
    assert_eq!(global.motorcycles, 1);

    let windows = manager.get_window_stats(&Scope::Global).await.unwrap();
    assert_eq!(windows["10s"].flux, 2);

    let buckets = manager
        .get_series(
            &Scope::Source("avenue".into()),
            SeriesRequest::Period(Period::ThirtyMinutes),
        )
        .await
        .unwrap();
    assert_eq!(buckets.len(), 30);
    assert_eq!(buckets.iter().map(|bucket| bucket.flux).sum::<u64>(), 2);

    let history = manager
        .get_history_range("avenue", None, None)
        .await
        .unwrap();
    assert_eq!(history.len(), 4);
    assert!(history.windows(2).all(|pair| pair[0].ts < pair[1].ts));
    assert_eq!(manager.aggregate_since(30).await.unwrap().flux, 2);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn restart_warm_starts_from_the_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());

    let manager = start(settings.clone(), false, false).await;
    wait_for_history(&manager, "avenue", 4).await;
    wait_until_offline(&manager, "avenue").await;
    manager.shutdown().await.unwrap();

    let file = SnapshotFile::new(settings.snapshot_path());
    let document: SnapshotDocument = file.load().unwrap();
    assert_eq!(document.sources["avenue"].accumulated_flux, 2);
    assert_eq!(document.sources["avenue"].history.len(), 4);
    assert_eq!(document.global_total.accumulated_flux, 2);

    // One source dropped from the configuration, the recording starts over
    let mut settings = settings;
    settings.sources.retain(|source| source.id != "bridge");
    let manager = start(settings.clone(), false, false).await;

    assert!(manager.get_current("bridge").await.is_err());
    let avenue = manager.get_current("avenue").await.unwrap();
    assert!(avenue.accumulated_flux >= 2);

    wait_for_history(&manager, "avenue", 8).await;
    wait_until_offline(&manager, "avenue").await;

    // The parked car from before the restart is new again to a fresh reducer
    let avenue = manager.get_current("avenue").await.unwrap();
    assert_eq!(avenue.accumulated_flux, 4);
    assert_eq!(manager.durable().range("avenue", None, None).unwrap().len(), 8);
    assert_eq!(manager.durable().range("bridge", None, None).unwrap().len(), 0);

    manager.shutdown().await.unwrap();

    // Reset on start ignores the snapshot but keeps the durable history
    let manager = start(settings, false, true).await;
    let avenue = manager.get_current("avenue").await.unwrap();
    assert!(avenue.accumulated_flux <= 2);
    assert!(manager.durable().range("avenue", None, None).unwrap().len() >= 8);
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn corrupt_snapshot_uses_the_backup() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());

    let manager = start(settings.clone(), false, false).await;
    wait_for_history(&manager, "avenue", 4).await;
    wait_until_offline(&manager, "avenue").await;
    manager.flush_snapshot().await.unwrap();
    manager.shutdown().await.unwrap();

    std::fs::write(settings.snapshot_path(), "{ truncated").unwrap();

    let manager = start(settings, false, false).await;
    let avenue = manager.get_current("avenue").await.unwrap();
    assert!(avenue.accumulated_flux >= 2);
    manager.shutdown().await.unwrap();
}
