use chrono::{Local, TimeZone, Weekday};
use tracing::*;

use crate::persistence::DurableStore;

/// Average flux a source has seen at a given weekday and hour.
#[derive(Clone, Debug)]
pub struct Predictor {
    durable: DurableStore,
}

impl Predictor {
    pub fn new(durable: DurableStore) -> Self {
        Self { durable }
    }

    /// Local-time prediction. Never fails: no data, or a store error, gives 0.
    pub async fn predict(&self, source_id: &str, weekday: Weekday, hour: u32) -> f64 {
        self.predict_in(Local, source_id, weekday, hour).await
    }

    #[instrument(level = "debug", skip(self, tz))]
    pub async fn predict_in<Tz>(&self, tz: Tz, source_id: &str, weekday: Weekday, hour: u32) -> f64
    where
        Tz: TimeZone + Send + 'static,
    {
        if hour > 23 {
            warn!("Asked to predict hour {hour}, which does not exist");
            return 0.0;
        }

        let owned_id = source_id.to_string();
        let days = match self
            .durable
            .run(move |store| store.flux_per_day_at(&owned_id, weekday, hour, &tz))
            .await
        {
            Ok(days) => days,
            Err(error) => {
                error!("Failed to read history for prediction of {source_id:?}: {error:#}");
                return 0.0;
            }
        };

        if days.is_empty() {
            return 0.0;
        }

        let total: u64 = days.values().sum();
        total as f64 / days.len() as f64
    }
}

/// Converts the `0 = Sunday` weekday convention used by dashboards.
pub fn weekday_from_sunday_index(index: u32) -> Option<Weekday> {
    match index {
        0 => Some(Weekday::Sun),
        1 => Some(Weekday::Mon),
        2 => Some(Weekday::Tue),
        3 => Some(Weekday::Wed),
        4 => Some(Weekday::Thu),
        5 => Some(Weekday::Fri),
        6 => Some(Weekday::Sat),
        _ => None,
    }
}
