//! Historical store for consumed indicators.
//!
//! A batch is written as one multi-row INSERT inside one transaction:
//! either every row lands or none does.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use pulse_metrics::IndicatorKind;
use rusqlite::types::Value;
use rusqlite::{Connection, InterruptHandle, params_from_iter};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{IngestError, Result};
use crate::message::MonitorLogRecord;

/// Rows per INSERT statement, keeping bound parameters well under SQLite's limit.
const ROWS_PER_STATEMENT: usize = 500;

/// Busy timeout for statements that carry no deadline of their own.
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS monitor_log (
    id             INTEGER PRIMARY KEY,
    timestamp      INTEGER NOT NULL,
    indicator_type TEXT    NOT NULL,
    source_ip      INTEGER NOT NULL,
    payload        TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_monitor_log_type_ts ON monitor_log (indicator_type, timestamp);
";

/// Bounds on one batch insert.
#[derive(Debug, Clone)]
pub struct InsertLimits {
    /// Longest the insert may run before it is rolled back.
    pub timeout: Duration,
    /// Cancelling rolls back an insert that has not committed yet.
    pub cancel: CancellationToken,
}

impl InsertLimits {
    /// Limits with `timeout` and a fresh, uncancelled token.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cancel: CancellationToken::new(),
        }
    }
}

/// Persists monitor log records.
pub trait MonitorLogStore: Send + Sync {
    /// Inserts every record in one transaction within `limits`.
    ///
    /// The future resolves with the final outcome: `Ok` once every row is
    /// committed, `Err` only if none was. Past the timeout, or once the
    /// token is cancelled, an uncommitted insert is rolled back.
    ///
    /// # Errors
    ///
    /// Returns `Store` if any row fails, `Timeout` past the deadline and
    /// `Cancelled` when cancelled.
    fn insert_batch<'a>(
        &'a self,
        records: &'a [MonitorLogRecord],
        limits: &'a InsertLimits,
    ) -> BoxFuture<'a, Result<usize>>;

    /// Number of stored records.
    ///
    /// # Errors
    ///
    /// Returns `Store` if the store cannot be read.
    fn count(&self) -> BoxFuture<'_, Result<u64>>;

    /// Up to `limit` records, newest first.
    ///
    /// # Errors
    ///
    /// Returns `Store` if the store cannot be read.
    fn recent(&self, limit: usize) -> BoxFuture<'_, Result<Vec<MonitorLogRecord>>>;
}

/// A SQLite-backed [`MonitorLogStore`].
///
/// Statements run on the blocking pool so async workers never wait on disk.
/// An insert enforces its own deadline and always reports whether it
/// committed, even after its caller stopped waiting.
#[derive(Clone)]
pub struct SqliteLogStore {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
}

impl SqliteLogStore {
    /// Opens (or creates) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns `Store` if the file cannot be opened or the schema applied.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns `Store` if the schema cannot be applied.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        Ok(Self {
            interrupt: Arc::new(conn.get_interrupt_handle()),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || op(&mut *conn.lock()))
            .await
            .map_err(|e| IngestError::Store {
                reason: format!("store task failed: {e}"),
            })?
    }
}

/// Cancellation state shared by an insert future and its blocking task.
#[derive(Debug, Default)]
struct InsertControl {
    abandoned: AtomicBool,
    holding_conn: AtomicBool,
}

impl InsertControl {
    /// Marks the insert abandoned and interrupts it if it is running.
    fn abandon(&self, interrupt: &InterruptHandle) {
        self.abandoned.store(true, Ordering::SeqCst);
        if self.holding_conn.load(Ordering::SeqCst) {
            interrupt.interrupt();
        }
    }
}

/// Interrupts an unfinished insert when its future is dropped.
struct AbandonOnDrop<'a> {
    control: &'a InsertControl,
    interrupt: &'a InterruptHandle,
    armed: bool,
}

impl Drop for AbandonOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.control.abandon(self.interrupt);
        }
    }
}

struct Deadline<'a> {
    at: Instant,
    limit: Duration,
    control: &'a InsertControl,
}

impl Deadline<'_> {
    fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    fn check(&self) -> Result<()> {
        if self.control.abandoned.load(Ordering::SeqCst) {
            return Err(IngestError::Cancelled {
                operation: "persist",
            });
        }
        if self.remaining().is_zero() {
            return Err(IngestError::timeout("persist", self.limit));
        }
        Ok(())
    }
}

/// Runs the insert on the calling thread. Any error leaves nothing committed.
fn insert_within(
    conn: &Mutex<Connection>,
    records: &[MonitorLogRecord],
    deadline: &Deadline<'_>,
) -> Result<usize> {
    let mut conn = conn
        .try_lock_for(deadline.remaining())
        .ok_or_else(|| IngestError::timeout("persist", deadline.limit))?;
    deadline.control.holding_conn.store(true, Ordering::SeqCst);

    let outcome = insert_all(&mut conn, records, deadline);

    if let Err(e) = conn.busy_timeout(DEFAULT_BUSY_TIMEOUT) {
        warn!(error = %e, "failed to restore busy timeout");
    }
    deadline.control.holding_conn.store(false, Ordering::SeqCst);
    outcome
}

fn insert_all(
    conn: &mut Connection,
    records: &[MonitorLogRecord],
    deadline: &Deadline<'_>,
) -> Result<usize> {
    deadline.check()?;
    conn.busy_timeout(deadline.remaining())?;
    let tx = conn.transaction()?;
    for chunk in records.chunks(ROWS_PER_STATEMENT) {
        deadline.check()?;
        let placeholders = vec!["(?, ?, ?, ?, ?)"; chunk.len()].join(", ");
        let sql = format!(
            "INSERT INTO monitor_log (id, timestamp, indicator_type, source_ip, payload) VALUES {placeholders}"
        );
        let values = chunk.iter().flat_map(|r| {
            [
                Value::Integer(r.id),
                Value::Integer(r.timestamp),
                Value::Text(r.indicator_type.as_str().to_string()),
                Value::Integer(i64::from(r.source_ip)),
                Value::Text(r.payload.clone()),
            ]
        });
        tx.execute(&sql, params_from_iter(values))?;
    }
    // Dropping the transaction on any error above rolls it back.
    deadline.check()?;
    tx.commit()?;
    Ok(records.len())
}

fn read_recent(conn: &Connection, limit: usize) -> Result<Vec<MonitorLogRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, timestamp, indicator_type, source_ip, payload
         FROM monitor_log ORDER BY timestamp DESC, id DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map([i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(id, timestamp, kind, source_ip, payload)| {
            let indicator_type = kind.parse::<IndicatorKind>().map_err(|e| IngestError::Store {
                reason: e.to_string(),
            })?;
            let source_ip = u32::try_from(source_ip).map_err(|_| IngestError::Store {
                reason: format!("source_ip {source_ip} out of range in row {id}"),
            })?;
            Ok(MonitorLogRecord {
                id,
                timestamp,
                indicator_type,
                source_ip,
                payload,
            })
        })
        .collect()
}

impl MonitorLogStore for SqliteLogStore {
    fn insert_batch<'a>(
        &'a self,
        records: &'a [MonitorLogRecord],
        limits: &'a InsertLimits,
    ) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            let control = Arc::new(InsertControl::default());
            let mut guard = AbandonOnDrop {
                control: &control,
                interrupt: &self.interrupt,
                armed: true,
            };

            let conn = Arc::clone(&self.conn);
            let owned = records.to_vec();
            let task_control = Arc::clone(&control);
            let at = Instant::now() + limits.timeout;
            let limit = limits.timeout;
            let mut task = tokio::task::spawn_blocking(move || {
                let deadline = Deadline {
                    at,
                    limit,
                    control: &task_control,
                };
                insert_within(&conn, &owned, &deadline)
            });

            // On cancel, keep waiting: the task reports whether it committed.
            let joined = tokio::select! {
                joined = &mut task => joined,
                () = limits.cancel.cancelled() => {
                    control.abandon(&self.interrupt);
                    task.await
                }
            };
            guard.armed = false;

            joined.map_err(|e| IngestError::Store {
                reason: format!("store task failed: {e}"),
            })?
        })
    }

    fn count(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(self.blocking(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM monitor_log", [], |row| row.get(0))?;
            Ok(u64::try_from(n).unwrap_or(0))
        }))
    }

    fn recent(&self, limit: usize) -> BoxFuture<'_, Result<Vec<MonitorLogRecord>>> {
        Box::pin(self.blocking(move |conn| read_recent(conn, limit)))
    }
}

impl std::fmt::Debug for SqliteLogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLogStore").finish_non_exhaustive()
    }
}

/// An in-process [`MonitorLogStore`] with failure and latency injection.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    records: Mutex<Vec<MonitorLogRecord>>,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
    attempts: AtomicU64,
}

impl MemoryLogStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every insert fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delays every insert by `delay`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Number of `insert_batch` calls, successful or not.
    #[must_use]
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// A copy of every stored record, in insertion order.
    #[must_use]
    pub fn records(&self) -> Vec<MonitorLogRecord> {
        self.records.lock().clone()
    }
}

impl MonitorLogStore for MemoryLogStore {
    fn insert_batch<'a>(
        &'a self,
        records: &'a [MonitorLogRecord],
        limits: &'a InsertLimits,
    ) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let delay = *self.delay.lock();
            if let Some(delay) = delay {
                tokio::select! {
                    biased;
                    () = limits.cancel.cancelled() => {
                        return Err(IngestError::Cancelled { operation: "persist" });
                    }
                    () = tokio::time::sleep(delay) => {}
                    () = tokio::time::sleep(limits.timeout) => {
                        return Err(IngestError::timeout("persist", limits.timeout));
                    }
                }
            }
            if limits.cancel.is_cancelled() {
                return Err(IngestError::Cancelled {
                    operation: "persist",
                });
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(IngestError::Store {
                    reason: "memory store set to fail".to_string(),
                });
            }

            let mut stored = self.records.lock();
            if let Some(dup) = records
                .iter()
                .find(|r| stored.iter().any(|s| s.id == r.id))
            {
                return Err(IngestError::Store {
                    reason: format!("duplicate id {}", dup.id),
                });
            }
            stored.extend_from_slice(records);
            Ok(records.len())
        })
    }

    fn count(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move { Ok(self.records.lock().len() as u64) })
    }

    fn recent(&self, limit: usize) -> BoxFuture<'_, Result<Vec<MonitorLogRecord>>> {
        Box::pin(async move {
            let mut records = self.records.lock().clone();
            records.sort_by(|a, b| (b.timestamp, b.id).cmp(&(a.timestamp, a.id)));
            records.truncate(limit);
            Ok(records)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> InsertLimits {
        InsertLimits::new(Duration::from_secs(5))
    }

    fn record(id: i64, timestamp: i64) -> MonitorLogRecord {
        MonitorLogRecord {
            id,
            timestamp,
            indicator_type: IndicatorKind::Qps,
            source_ip: 0x0A00_0001,
            payload: r#"{"type":"qps","data":{"qps":"1"}}"#.to_string(),
        }
    }

    #[tokio::test]
    async fn sqlite_inserts_and_reads_back() {
        let store = SqliteLogStore::open_in_memory().unwrap();
        let inserted = store
            .insert_batch(&[record(1, 100), record(2, 200)], &limits())
            .await
            .unwrap();

        assert_eq!(inserted, 2);
        assert_eq!(store.count().await.unwrap(), 2);
        let recent = store.recent(1).await.unwrap();
        assert_eq!(recent, vec![record(2, 200)]);
    }

    #[tokio::test]
    async fn sqlite_batch_is_all_or_nothing() {
        let store = SqliteLogStore::open_in_memory().unwrap();
        store.insert_batch(&[record(5, 1)], &limits()).await.unwrap();

        let err = store
            .insert_batch(&[record(6, 2), record(7, 3), record(5, 4)], &limits())
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::Store { .. }));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sqlite_rollback_spans_statements() {
        let store = SqliteLogStore::open_in_memory().unwrap();
        let mut batch: Vec<_> = (1..=ROWS_PER_STATEMENT as i64 + 10)
            .map(|id| record(id, id))
            .collect();
        // Duplicate lands in the second statement.
        batch.push(record(1, 0));

        assert!(store.insert_batch(&batch, &limits()).await.is_err());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sqlite_persists_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.db");
        {
            let store = SqliteLogStore::open(&path).unwrap();
            store.insert_batch(&[record(1, 1)], &limits()).await.unwrap();
        }
        let reopened = SqliteLogStore::open(&path).unwrap();
        assert_eq!(reopened.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn memory_store_failure_stores_nothing() {
        let store = MemoryLogStore::new();
        store.set_failing(true);
        assert!(store.insert_batch(&[record(1, 1), record(2, 2)], &limits()).await.is_err());
        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(store.attempts(), 1);
    }

    #[tokio::test]
    async fn memory_store_rejects_duplicate_ids() {
        let store = MemoryLogStore::new();
        store.insert_batch(&[record(1, 1)], &limits()).await.unwrap();
        assert!(store.insert_batch(&[record(2, 2), record(1, 3)], &limits()).await.is_err());
        assert_eq!(store.records(), vec![record(1, 1)]);
    }

    #[tokio::test]
    async fn sqlite_insert_past_timeout_commits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.db");
        let store = SqliteLogStore::open(&path).unwrap();
        let blocker = Connection::open(&path).unwrap();
        blocker.execute_batch("BEGIN EXCLUSIVE").unwrap();

        let started = Instant::now();
        let outcome = store
            .insert_batch(&[record(1, 1)], &InsertLimits::new(Duration::from_millis(100)))
            .await;
        assert!(outcome.is_err());
        assert!(started.elapsed() < DEFAULT_BUSY_TIMEOUT);

        // Nothing lands once the lock is released.
        blocker.execute_batch("COMMIT").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.count().await.unwrap(), 0);

        store.insert_batch(&[record(1, 1)], &limits()).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sqlite_cancelled_insert_commits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.db");
        let store = SqliteLogStore::open(&path).unwrap();
        let blocker = Connection::open(&path).unwrap();
        blocker.execute_batch("BEGIN EXCLUSIVE").unwrap();

        let limits = limits();
        let release = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            limits.cancel.cancel();
            tokio::time::sleep(Duration::from_millis(50)).await;
            blocker.execute_batch("COMMIT").unwrap();
        };
        let batch = [record(1, 1)];
        let (outcome, ()) = tokio::join!(store.insert_batch(&batch, &limits), release);

        assert!(outcome.is_err());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn memory_store_honours_timeout_and_cancel() {
        let store = MemoryLogStore::new();
        store.set_delay(Some(Duration::from_secs(10)));

        let err = store
            .insert_batch(&[record(1, 1)], &InsertLimits::new(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Timeout { .. }));

        let limits = limits();
        limits.cancel.cancel();
        let err = store.insert_batch(&[record(2, 2)], &limits).await.unwrap_err();
        assert!(matches!(err, IngestError::Cancelled { .. }));

        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(store.attempts(), 2);
    }
}
