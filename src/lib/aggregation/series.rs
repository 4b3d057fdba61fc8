use std::{fmt, str::FromStr};

use chrono::{DateTime, Local, TimeZone};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    stats::HistoryPoint,
};

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Period {
    #[default]
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "6h")]
    SixHours,
    #[serde(rename = "12h")]
    TwelveHours,
    #[serde(rename = "24h")]
    Today,
    #[serde(rename = "7d")]
    SevenDays,
    #[serde(rename = "30d")]
    ThirtyDays,
}

impl Period {
    pub const ALL: [Period; 7] = [
        Period::ThirtyMinutes,
        Period::OneHour,
        Period::SixHours,
        Period::TwelveHours,
        Period::Today,
        Period::SevenDays,
        Period::ThirtyDays,
    ];

    /// `(duration, bucket_width)` in seconds.
    pub fn layout(&self) -> (u64, u64) {
        match self {
            Period::ThirtyMinutes => (30 * MINUTE, MINUTE),
            Period::OneHour => (HOUR, 2 * MINUTE),
            Period::SixHours => (6 * HOUR, 15 * MINUTE),
            Period::TwelveHours => (12 * HOUR, 30 * MINUTE),
            Period::Today => (DAY, HOUR),
            Period::SevenDays => (7 * DAY, DAY),
            Period::ThirtyDays => (30 * DAY, DAY),
        }
    }

    /// `strftime` layout of the bucket labels.
    pub fn label_format(&self) -> &'static str {
        match self {
            Period::SevenDays => "%A, %d %b",
            Period::ThirtyDays => "%a, %d %b",
            _ => "%H:%M",
        }
    }

    /// The shortest period spanning at least `duration` seconds.
    pub fn covering(duration: u64) -> Option<Self> {
        Period::ALL
            .into_iter()
            .find(|period| period.layout().0 >= duration)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Period::ThirtyMinutes => "30m",
            Period::OneHour => "1h",
            Period::SixHours => "6h",
            Period::TwelveHours => "12h",
            Period::Today => "24h",
            Period::SevenDays => "7d",
            Period::ThirtyDays => "30d",
        }
    }

    /// Unknown names fall back to the default view instead of failing.
    pub fn parse_or_default(value: &str) -> Self {
        value.parse().unwrap_or_default()
    }
}

impl FromStr for Period {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        Period::ALL
            .into_iter()
            .find(|period| period.label() == value.trim())
            .ok_or_else(|| Error::BadRequest(format!("Unknown period {value:?}")))
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub enum SeriesRequest {
    Period(Period),
    /// The calendar day containing this timestamp, hour by hour.
    Day(f64),
    /// From `start`, laid out like the shortest period covering `duration`.
    Range { start: f64, duration: u64 },
}

/// A request pinned to concrete seconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResolvedSeries {
    pub start: f64,
    pub duration: u64,
    pub bucket_width: u64,
    pub label_format: &'static str,
}

impl ResolvedSeries {
    pub fn bucket_count(&self) -> usize {
        (self.duration / self.bucket_width) as usize
    }

    pub fn end(&self) -> f64 {
        self.start + self.duration as f64
    }
}

impl SeriesRequest {
    pub fn resolve(&self, now: f64) -> Result<ResolvedSeries> {
        self.resolve_in(now, &Local)
    }

    pub fn resolve_in<Tz: TimeZone>(&self, now: f64, tz: &Tz) -> Result<ResolvedSeries> {
        let resolved = match *self {
            SeriesRequest::Period(Period::Today) => ResolvedSeries::laid_out(
                local_midnight(now, tz).unwrap_or(now - DAY as f64),
                Period::Today,
            ),
            SeriesRequest::Period(period) => {
                ResolvedSeries::laid_out(now - period.layout().0 as f64, period)
            }
            SeriesRequest::Day(ts) => {
                ResolvedSeries::laid_out(local_midnight(ts, tz).unwrap_or(ts), Period::Today)
            }
            SeriesRequest::Range { start, duration } => {
                if duration == 0 || !start.is_finite() {
                    return Err(Error::BadRequest(format!(
                        "Range of {duration}s from {start} is empty"
                    )));
                }
                let period = Period::covering(duration).ok_or_else(|| {
                    Error::BadRequest(format!(
                        "Range of {duration}s is longer than {}s",
                        Period::ThirtyDays.layout().0
                    ))
                })?;
                ResolvedSeries::laid_out(start, period)
            }
        };

        Ok(resolved)
    }
}

impl ResolvedSeries {
    fn laid_out(start: f64, period: Period) -> Self {
        let (duration, bucket_width) = period.layout();
        Self {
            start,
            duration,
            bucket_width,
            label_format: period.label_format(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Bucket {
    pub ts: f64,
    pub label: String,
    pub flux: u64,
    pub cars: u64,
    pub motors: u64,
}

pub fn bucketize(series: &ResolvedSeries, points: &[HistoryPoint]) -> Vec<Bucket> {
    bucketize_in(series, points, &Local)
}

/// Exactly `duration / bucket_width` buckets, zero where there is no data.
pub fn bucketize_in<Tz: TimeZone>(
    series: &ResolvedSeries,
    points: &[HistoryPoint],
    tz: &Tz,
) -> Vec<Bucket>
where
    Tz::Offset: fmt::Display,
{
    let width = series.bucket_width as f64;
    let format = series.label_format;

    let mut buckets: Vec<Bucket> = (0..series.bucket_count())
        .map(|index| {
            let ts = series.start + index as f64 * width;
            Bucket {
                ts,
                label: label_at(ts, format, tz),
                flux: 0,
                cars: 0,
                motors: 0,
            }
        })
        .collect();

    let end = series.end();
    for point in points {
        if point.ts < series.start || point.ts >= end {
            continue;
        }

        let index = ((point.ts - series.start) / width).floor() as usize;
        let Some(bucket) = buckets.get_mut(index) else {
            continue;
        };
        bucket.flux += point.flux_total;
        bucket.cars += point.flux_cars;
        bucket.motors += point.flux_motors;
    }

    buckets
}

/// Seconds since the epoch as a date in `tz`.
pub fn to_datetime<Tz: TimeZone>(ts: f64, tz: &Tz) -> Option<DateTime<Tz>> {
    let secs = ts.floor();
    let nanos = ((ts - secs) * 1e9) as u32;
    DateTime::from_timestamp(secs as i64, nanos).map(|utc| utc.with_timezone(tz))
}

/// Start of the local calendar day containing `ts`.
pub fn local_midnight<Tz: TimeZone>(ts: f64, tz: &Tz) -> Option<f64> {
    let date = to_datetime(ts, tz)?.date_naive();
    let midnight = tz
        .from_local_datetime(&date.and_hms_opt(0, 0, 0)?)
        .earliest()?;
    Some(midnight.timestamp() as f64)
}

fn label_at<Tz: TimeZone>(ts: f64, format: &str, tz: &Tz) -> String
where
    Tz::Offset: fmt::Display,
{
    to_datetime(ts, tz)
        .map(|datetime| datetime.format(format).to_string())
        .unwrap_or_default()
}
