use std::{collections::BTreeMap, fmt, str::FromStr};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

use crate::stats::HistoryPoint;

/// A trailing time span such as `30m`, keeping the text it was written as.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct WindowSpec {
    pub label: String,
    pub seconds: u64,
}

impl WindowSpec {
    pub fn new(label: impl Into<String>, seconds: u64) -> Self {
        Self {
            label: label.into(),
            seconds,
        }
    }

    pub fn defaults() -> Vec<WindowSpec> {
        vec![
            Self::new("10s", 10),
            Self::new("30m", 30 * 60),
            Self::new("1h", 60 * 60),
            Self::new("5h", 5 * 60 * 60),
            Self::new("24h", 24 * 60 * 60),
        ]
    }
}

impl FromStr for WindowSpec {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        let split = value
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| anyhow!("Window {value:?} has no unit, expected one of s, m, h, d"))?;
        let (amount, unit) = value.split_at(split);

        let amount: u64 = amount
            .parse()
            .with_context(|| format!("Window {value:?} does not start with a number"))?;
        let multiplier = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 60 * 60,
            "d" => 24 * 60 * 60,
            _ => return Err(anyhow!("Unknown unit {unit:?} in window {value:?}")),
        };

        if amount == 0 {
            return Err(anyhow!("Window {value:?} is empty"));
        }

        let seconds = amount
            .checked_mul(multiplier)
            .ok_or_else(|| anyhow!("Window {value:?} is too long"))?;

        Ok(Self::new(value, seconds))
    }
}

impl TryFrom<String> for WindowSpec {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WindowSpec> for String {
    fn from(window: WindowSpec) -> Self {
        window.label
    }
}

impl fmt::Display for WindowSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct WindowStats {
    pub flux: u64,
    pub cars: u64,
    pub motors: u64,
    pub avg_density: u64,
}

/// Flux over each trailing window ending at `now`, a point counts when `ts >= now - window`.
pub fn window_stats(
    points: &[HistoryPoint],
    windows: &[WindowSpec],
    now: f64,
) -> BTreeMap<String, WindowStats> {
    windows
        .iter()
        .map(|window| {
            let start = now - window.seconds as f64;
            let mut stats = WindowStats::default();
            let mut density_sum = 0;
            let mut count = 0;

            for point in points.iter().filter(|point| point.ts >= start) {
                stats.flux += point.flux_total;
                stats.cars += point.flux_cars;
                stats.motors += point.flux_motors;
                density_sum += point.density_total;
                count += 1;
            }

            if count > 0 {
                stats.avg_density = (density_sum as f64 / count as f64).round() as u64;
            }

            (window.label.clone(), stats)
        })
        .collect()
}

/// The longest of `windows`, which decides how far back a query has to read.
pub fn longest(windows: &[WindowSpec]) -> u64 {
    windows
        .iter()
        .map(|window| window.seconds)
        .max()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(ts: f64, flux: u64, density: u64) -> HistoryPoint {
        HistoryPoint {
            ts,
            density_total: density,
            density_cars: density,
            density_motors: 0,
            flux_total: flux,
            flux_cars: flux,
            flux_motors: 0,
        }
    }

    #[test]
    fn parses_labels() {
        assert_eq!("10s".parse::<WindowSpec>().unwrap().seconds, 10);
        assert_eq!("30m".parse::<WindowSpec>().unwrap().seconds, 1800);
        assert_eq!("24h".parse::<WindowSpec>().unwrap().seconds, 86400);
        assert_eq!("7d".parse::<WindowSpec>().unwrap().seconds, 604800);

        assert!("".parse::<WindowSpec>().is_err());
        assert!("30".parse::<WindowSpec>().is_err());
        assert!("m".parse::<WindowSpec>().is_err());
        assert!("5w".parse::<WindowSpec>().is_err());
        assert!("0h".parse::<WindowSpec>().is_err());
        assert!("213503982334602d".parse::<WindowSpec>().is_err());
        assert!("99999999999999999999s".parse::<WindowSpec>().is_err());
    }

    #[test]
    fn serializes_as_the_label() {
        let json = serde_json::to_string(&WindowSpec::defaults()).unwrap();
        assert_eq!(json, r#"["10s","30m","1h","5h","24h"]"#);

        let parsed: Vec<WindowSpec> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, WindowSpec::defaults());
    }

    #[test]
    fn only_points_inside_the_window_count() {
        let now = 100_000.0;
        let points = [point(now - 3600.0, 5, 4), point(now - 600.0, 3, 2)];

        let stats = window_stats(&points, &WindowSpec::defaults(), now);

        assert_eq!(stats["30m"].flux, 3);
        assert_eq!(stats["30m"].avg_density, 2);
        assert_eq!(stats["1h"].flux, 8);
        assert_eq!(stats["1h"].avg_density, 3);
        assert_eq!(stats["10s"], WindowStats::default());
    }

    #[test]
    fn window_start_is_inclusive() {
        let now = 1000.0;
        let stats = window_stats(&[point(990.0, 1, 1)], &[WindowSpec::new("10s", 10)], now);
        assert_eq!(stats["10s"].flux, 1);
    }
}
