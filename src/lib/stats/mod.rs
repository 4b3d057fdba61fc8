pub mod history;
pub mod record;
pub mod store;
pub mod types;

pub use history::HistoryRing;
pub use record::{RecordSnapshot, SharedHistory, StatsRecord};
pub use store::{GlobalTotals, SharedRecord, StatsStore};
pub use types::{ClassCounts, CycleCounts, FluxTotals, HistoryPoint, SourceStatus};
