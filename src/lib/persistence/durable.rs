//! Append-only history of every point ever published, in SQLite.
//!
//! The ring buffers in memory are bounded; this table is what long-range views
//! and prediction read. Rows are keyed by `(source_id, timestamp)` and written
//! with `INSERT OR IGNORE`, so replaying a batch after a failed flush is harmless.
//!
//! Writes go through a single connection, reads through a small pool. With WAL
//! a long scan for one source never holds up another source's appends.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{anyhow, Context, Result};
use chrono::{Datelike, NaiveDate, TimeZone, Timelike, Weekday};
use rusqlite::{params, params_from_iter, types::Value, Connection};
use tracing::*;

use crate::{
    aggregation::series::to_datetime,
    stats::{FluxTotals, HistoryPoint},
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS traffic_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_id TEXT NOT NULL,
        timestamp REAL NOT NULL,
        density_total INTEGER NOT NULL DEFAULT 0,
        density_cars INTEGER NOT NULL DEFAULT 0,
        density_motors INTEGER NOT NULL DEFAULT 0,
        flux_total INTEGER NOT NULL DEFAULT 0,
        flux_cars INTEGER NOT NULL DEFAULT 0,
        flux_motors INTEGER NOT NULL DEFAULT 0
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_source_timestamp
        ON traffic_history (source_id, timestamp);
";

const READ_POOL_SIZE: usize = 4;

const POINT_COLUMNS: &str =
    "timestamp, density_total, density_cars, density_motors, flux_total, flux_cars, flux_motors";

#[derive(Clone)]
pub struct DurableStore {
    writer: Arc<Mutex<Connection>>,
    readers: Arc<ReadPool>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStore")
            .field("path", &self.path)
            .field("readers", &self.readers.len())
            .finish()
    }
}

/// Query-only connections handed out round-robin.
struct ReadPool {
    connections: Vec<Arc<Mutex<Connection>>>,
    next: AtomicUsize,
}

impl ReadPool {
    fn open(path: &Path, size: usize) -> Result<Self> {
        let mut connections = Vec::with_capacity(size);
        for _ in 0..size.max(1) {
            let conn = Connection::open(path)
                .with_context(|| format!("Failed to open reader for {path:?}"))?;
            conn.pragma_update(None, "query_only", true)?;
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            connections.push(Arc::new(Mutex::new(conn)));
        }

        Ok(Self {
            connections,
            next: AtomicUsize::new(0),
        })
    }

    /// An in-memory database is private to its connection, so readers share the writer.
    fn shared(writer: Arc<Mutex<Connection>>) -> Self {
        Self {
            connections: vec![writer],
            next: AtomicUsize::new(0),
        }
    }

    fn len(&self) -> usize {
        self.connections.len()
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        let conn = self.connections[index]
            .lock()
            .map_err(|_| anyhow!("Durable store reader lock poisoned"))?;
        f(&conn)
    }
}

impl DurableStore {
    #[instrument(level = "debug")]
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database folder {parent:?}"))?;
        }

        let conn =
            Connection::open(path).with_context(|| format!("Failed to open database {path:?}"))?;

        let journal_mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            warn!("Database {path:?} is not in WAL mode ({journal_mode}), readers may block writers");
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)
            .context("Failed to create traffic_history schema")?;

        let store = Self {
            writer: Arc::new(Mutex::new(conn)),
            readers: Arc::new(ReadPool::open(path, READ_POOL_SIZE)?),
            path: Some(path.to_path_buf()),
        };

        info!("Durable store initialized at {path:?}");

        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)
            .context("Failed to create traffic_history schema")?;

        let writer = Arc::new(Mutex::new(conn));
        Ok(Self {
            readers: Arc::new(ReadPool::shared(writer.clone())),
            writer,
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn with_writer<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self
            .writer
            .lock()
            .map_err(|_| anyhow!("Durable store writer lock poisoned"))?;
        f(&mut conn)
    }

    /// Runs `f` on the blocking pool, keeping SQLite I/O off the async workers.
    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&DurableStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .context("Durable store task failed")?
    }

    /// Appends points for one source in a single transaction. Returns how many rows were new.
    pub fn append_batch(&self, source_id: &str, points: &[HistoryPoint]) -> Result<usize> {
        if points.is_empty() {
            return Ok(0);
        }

        self.with_writer(|conn| {
            let transaction = conn.transaction()?;
            let mut inserted = 0;
            {
                let mut statement = transaction.prepare_cached(&format!(
                    "INSERT OR IGNORE INTO traffic_history (source_id, {POINT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ))?;

                for point in points {
                    inserted += statement.execute(params![
                        source_id,
                        point.ts,
                        point.density_total as i64,
                        point.density_cars as i64,
                        point.density_motors as i64,
                        point.flux_total as i64,
                        point.flux_cars as i64,
                        point.flux_motors as i64,
                    ])?;
                }
            }
            transaction
                .commit()
                .with_context(|| format!("Failed to commit batch for {source_id:?}"))?;
            Ok(inserted)
        })
    }

    /// Calls `visit` for each point in ascending time order. `end` is inclusive.
    /// `source_id = None` scans every source.
    pub fn visit_range<F>(
        &self,
        source_id: Option<&str>,
        start: Option<f64>,
        end: Option<f64>,
        mut visit: F,
    ) -> Result<usize>
    where
        F: FnMut(HistoryPoint),
    {
        let (condition, values) = range_condition(source_id, start, end);
        let sql = format!(
            "SELECT {POINT_COLUMNS} FROM traffic_history{condition} ORDER BY timestamp ASC"
        );

        self.readers.with_conn(|conn| {
            let mut statement = conn.prepare_cached(&sql)?;
            let mut rows = statement.query(params_from_iter(values))?;
            let mut visited = 0;
            while let Some(row) = rows.next()? {
                visit(HistoryPoint {
                    ts: row.get(0)?,
                    density_total: row.get::<_, i64>(1)?.max(0) as u64,
                    density_cars: row.get::<_, i64>(2)?.max(0) as u64,
                    density_motors: row.get::<_, i64>(3)?.max(0) as u64,
                    flux_total: row.get::<_, i64>(4)?.max(0) as u64,
                    flux_cars: row.get::<_, i64>(5)?.max(0) as u64,
                    flux_motors: row.get::<_, i64>(6)?.max(0) as u64,
                });
                visited += 1;
            }
            Ok(visited)
        })
    }

    pub fn range(
        &self,
        source_id: &str,
        start: Option<f64>,
        end: Option<f64>,
    ) -> Result<Vec<HistoryPoint>> {
        let mut points = vec![];
        self.visit_range(Some(source_id), start, end, |point| points.push(point))?;
        Ok(points)
    }

    pub fn range_all(&self, start: Option<f64>, end: Option<f64>) -> Result<Vec<HistoryPoint>> {
        let mut points = vec![];
        self.visit_range(None, start, end, |point| points.push(point))?;
        Ok(points)
    }

    pub fn totals(&self, source_id: &str) -> Result<FluxTotals> {
        self.sum_flux(Some(source_id), None)
    }

    /// Flux summed over every source since `start`.
    pub fn totals_since(&self, start: f64) -> Result<FluxTotals> {
        self.sum_flux(None, Some(start))
    }

    fn sum_flux(&self, source_id: Option<&str>, start: Option<f64>) -> Result<FluxTotals> {
        let (condition, values) = range_condition(source_id, start, None);
        let sql = format!(
            "SELECT COALESCE(SUM(flux_total), 0), COALESCE(SUM(flux_cars), 0),
                    COALESCE(SUM(flux_motors), 0), COUNT(*)
             FROM traffic_history{condition}"
        );

        self.readers.with_conn(|conn| {
            let totals = conn.query_row(&sql, params_from_iter(values), |row| {
                Ok(FluxTotals {
                    flux: row.get::<_, i64>(0)?.max(0) as u64,
                    cars: row.get::<_, i64>(1)?.max(0) as u64,
                    motors: row.get::<_, i64>(2)?.max(0) as u64,
                    points: row.get::<_, i64>(3)?.max(0) as u64,
                })
            })?;
            Ok(totals)
        })
    }

    /// Sum of `flux_total` per local calendar day, over the rows of `source_id`
    /// that fall on `weekday` at `hour` in `tz`. Days without rows are absent.
    pub fn flux_per_day_at<Tz: TimeZone>(
        &self,
        source_id: &str,
        weekday: Weekday,
        hour: u32,
        tz: &Tz,
    ) -> Result<BTreeMap<NaiveDate, u64>> {
        let mut days = BTreeMap::new();

        self.visit_range(Some(source_id), None, None, |point| {
            let Some(datetime) = to_datetime(point.ts, tz) else {
                return;
            };
            if datetime.weekday() != weekday || datetime.hour() != hour {
                return;
            }
            *days.entry(datetime.date_naive()).or_insert(0) += point.flux_total;
        })?;

        Ok(days)
    }

    pub fn count(&self) -> Result<u64> {
        self.readers.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM traffic_history", [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
    }

    /// Deletes every row. The only operation that removes durable history.
    #[instrument(level = "debug", skip(self))]
    pub fn clear_all(&self) -> Result<usize> {
        self.with_writer(|conn| {
            let deleted = conn
                .execute("DELETE FROM traffic_history", [])
                .context("Failed to clear traffic_history")?;
            warn!("Cleared {deleted} rows from the durable store");
            Ok(deleted)
        })
    }
}

fn range_condition(
    source_id: Option<&str>,
    start: Option<f64>,
    end: Option<f64>,
) -> (String, Vec<Value>) {
    let mut clauses = vec![];
    let mut values = vec![];

    if let Some(source_id) = source_id {
        values.push(Value::Text(source_id.to_string()));
        clauses.push(format!("source_id = ?{}", values.len()));
    }
    if let Some(start) = start {
        values.push(Value::Real(start));
        clauses.push(format!("timestamp >= ?{}", values.len()));
    }
    if let Some(end) = end {
        values.push(Value::Real(end));
        clauses.push(format!("timestamp <= ?{}", values.len()));
    }

    if clauses.is_empty() {
        return (String::new(), values);
    }

    (format!(" WHERE {}", clauses.join(" AND ")), values)
}
