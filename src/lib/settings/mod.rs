pub mod manager;

use std::path::PathBuf;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::{aggregation::WindowSpec, source::Source, source::SourceId};

pub const SNAPSHOT_FILE_NAME: &str = "traffic_stats.json";
pub const DATABASE_FILE_NAME: &str = "traffic_data.db";

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub sources: Vec<Source>,
    pub process_interval_secs: f64,
    pub history_capacity: usize,
    /// `0` turns periodic snapshots off.
    pub snapshot_interval_secs: u64,
    pub iou_threshold: f64,
    pub confidence_threshold: f32,
    pub acquisition_attempts: u32,
    pub acquisition_retry_delay_ms: u64,
    pub data_dir: Option<PathBuf>,
    pub windows: Vec<WindowSpec>,
    pub display_source: Option<SourceId>,
    /// Start recordings over once they run out.
    pub replay_loop: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sources: vec![],
            process_interval_secs: 2.0,
            history_capacity: 600_000,
            snapshot_interval_secs: 60,
            iou_threshold: 0.5,
            confidence_threshold: 0.10,
            acquisition_attempts: 10,
            acquisition_retry_delay_ms: 50,
            data_dir: None,
            windows: WindowSpec::defaults(),
            display_source: None,
            replay_loop: true,
        }
    }
}

impl Settings {
    pub fn data_dir(&self) -> PathBuf {
        if let Some(data_dir) = &self.data_dir {
            return data_dir.clone();
        }

        ProjectDirs::from("com", "Vehicle Flow", env!("CARGO_PKG_NAME"))
            .map(|project| project.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("./data"))
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir().join(SNAPSHOT_FILE_NAME)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join(DATABASE_FILE_NAME)
    }

    /// The source shown in the display buffer, the first configured one by default.
    pub fn display_source(&self) -> Option<SourceId> {
        self.display_source
            .clone()
            .or_else(|| self.sources.first().map(|source| source.id.clone()))
    }

    pub fn snapshot_interval(&self) -> Option<std::time::Duration> {
        (self.snapshot_interval_secs > 0)
            .then(|| std::time::Duration::from_secs(self.snapshot_interval_secs))
    }
}
