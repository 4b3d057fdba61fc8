pub mod series;
pub mod window;

use anyhow::Result;
use tracing::*;

use crate::{
    persistence::DurableStore,
    stats::{HistoryPoint, SharedRecord, StatsStore},
};

pub use series::{bucketize, bucketize_in, Bucket, Period, ResolvedSeries, SeriesRequest};
pub use window::{window_stats, WindowSpec, WindowStats};

/// Points of one source with `ts >= start`, from memory while the ring still
/// reaches back that far, otherwise from the durable store.
#[instrument(level = "trace", skip(record, durable))]
pub async fn points_since(
    record: &SharedRecord,
    durable: &DurableStore,
    source_id: &str,
    start: f64,
) -> Result<Vec<HistoryPoint>> {
    let (history, durable_id) = {
        let record = record.read().await;
        let durable_id = record
            .mirror_of
            .clone()
            .unwrap_or_else(|| source_id.to_string());
        (record.history.clone(), durable_id)
    };

    {
        let history = history.read().await;
        if history.covers(start) {
            return Ok(history.since(start));
        }
    }

    trace!("Ring for {source_id:?} does not reach {start}, reading the durable store");
    durable
        .run(move |store| store.range(&durable_id, Some(start), None))
        .await
}

/// Points of every non-mirror source with `ts >= start`, in time order.
#[instrument(level = "trace", skip(store, durable))]
pub async fn global_points_since(
    store: &StatsStore,
    durable: &DurableStore,
    start: f64,
) -> Result<Vec<HistoryPoint>> {
    let mut points = vec![];

    for (source_id, record) in store.records().await {
        let history = {
            let record = record.read().await;
            if record.mirror_of.is_some() {
                continue;
            }
            record.history.clone()
        };

        let history = history.read().await;
        if !history.covers(start) {
            trace!("Ring for {source_id:?} does not reach {start}, reading the durable store");
            drop(history);
            return durable
                .run(move |store| store.range_all(Some(start), None))
                .await;
        }
        points.extend(history.since(start));
    }

    points.sort_by(|a, b| a.ts.total_cmp(&b.ts));
    Ok(points)
}
