pub mod durable;
pub mod flusher;
pub mod snapshot;

pub use durable::DurableStore;
pub use flusher::{SnapshotFlusher, Snapshotter, MIN_SNAPSHOT_INTERVAL};
pub use snapshot::{reconcile, SnapshotDocument, SnapshotFile, SourceSnapshot};
