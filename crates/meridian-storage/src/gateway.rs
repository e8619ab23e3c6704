//! Storage Gateway — a process-wide serialized writer over the embedded store.
//!
//! All mutating calls funnel through a single dedicated thread so write
//! concurrency is always 1, matching SQLite's own single-writer model and
//! letting us skip `BUSY` retries on the write path entirely. Reads bypass
//! the gateway and come from a pooled set of read-only connections.

use meridian_common::error::{RelayError, RelayResult};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::sync::mpsc;
use std::time::Duration;
use tokio::sync::oneshot;

const SCHEMA_SQL: &str = include_str!("schema.sql");
const BUSY_TIMEOUT_MS: u32 = 5_000;
const OP_TIMEOUT: Duration = Duration::from_secs(30);

type WriteJob = Box<dyn FnOnce(&mut Connection) -> RelayResult<Box<dyn std::any::Any + Send>> + Send>;

struct Job {
    name: &'static str,
    run: WriteJob,
    reply: oneshot::Sender<RelayResult<Box<dyn std::any::Any + Send>>>,
}

/// Read pool handle, cloned freely across handlers.
pub type ReadPool = r2d2::Pool<SqliteConnectionManager>;

/// The storage gateway: a write-queue handle plus a shared read pool.
#[derive(Clone)]
pub struct StorageGateway {
    tx: mpsc::Sender<Job>,
    pub reads: ReadPool,
}

impl StorageGateway {
    /// Open the database at `path` (or `:memory:`), apply pragmas and schema,
    /// spawn the writer thread, and build the read pool.
    pub fn open(path: &str) -> RelayResult<Self> {
        // A bare ":memory:" gives every connection its own private database;
        // tests need the writer and the read pool to see the same data, so an
        // in-memory run uses a named shared-cache URI instead.
        let uri = if path == ":memory:" {
            "file:meridian-storage?mode=memory&cache=shared".to_string()
        } else {
            path.to_string()
        };

        let mut writer_conn = Connection::open(&uri)
            .map_err(|e| RelayError::Internal(anyhow::anyhow!("opening storage: {e}")))?;

        apply_pragmas(&writer_conn)?;
        writer_conn
            .execute_batch(SCHEMA_SQL)
            .map_err(|e| RelayError::Internal(anyhow::anyhow!("applying schema: {e}")))?;

        let (tx, rx) = mpsc::channel::<Job>();
        std::thread::Builder::new()
            .name("storage-writer".into())
            .spawn(move || writer_loop(writer_conn, rx))
            .map_err(|e| RelayError::Internal(anyhow::anyhow!("spawning writer thread: {e}")))?;

        let manager = SqliteConnectionManager::file(&uri).with_flags(
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI
                | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        );
        let reads = r2d2::Pool::builder()
            .max_size(8)
            .build(manager)
            .map_err(|e| RelayError::Internal(anyhow::anyhow!("building read pool: {e}")))?;

        Ok(Self { tx, reads })
    }

    /// Enqueue a write closure on the serialized writer thread and await its result.
    /// `op_name` appears in timeout/error logs for observability.
    pub async fn write<T, F>(&self, op_name: &'static str, f: F) -> RelayResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> RelayResult<T> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            name: op_name,
            run: Box::new(move |conn| f(conn).map(|v| Box::new(v) as Box<dyn std::any::Any + Send>)),
            reply: reply_tx,
        };
        self.tx
            .send(job)
            .map_err(|_| RelayError::internal("storage writer thread has shut down"))?;

        match tokio::time::timeout(OP_TIMEOUT, reply_rx).await {
            Ok(Ok(result)) => result.map(|boxed| *boxed.downcast::<T>().expect("write result type mismatch")),
            Ok(Err(_)) => Err(RelayError::internal("storage writer dropped the reply channel")),
            Err(_) => {
                tracing::error!(op = op_name, "storage write timed out after 30s");
                Err(RelayError::transient(format!("storage write '{op_name}' timed out")))
            }
        }
    }

    /// Borrow a pooled read-only connection.
    pub fn read(&self) -> RelayResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.reads
            .get()
            .map_err(|e| RelayError::Internal(anyhow::anyhow!("read pool exhausted: {e}")))
    }
}

fn writer_loop(mut conn: Connection, rx: mpsc::Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        let result = run_with_busy_retry(&mut conn, job.name, job.run);
        let _ = job.reply.send(result);
    }
    tracing::info!("storage writer thread exiting — channel closed");
}

fn run_with_busy_retry(
    conn: &mut Connection,
    name: &'static str,
    run: WriteJob,
) -> RelayResult<Box<dyn std::any::Any + Send>> {
    // SQLITE_BUSY/LOCKED are already retried internally via busy_timeout; a single
    // attempt here is correct. Errors surface with the op name for diagnosis.
    run(conn).map_err(|e| {
        tracing::warn!(op = name, error = %e, "storage write failed");
        e
    })
}

fn apply_pragmas(conn: &Connection) -> RelayResult<()> {
    conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS as u64))
        .map_err(|e| RelayError::Internal(anyhow::anyhow!("setting busy_timeout: {e}")))?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA temp_store=MEMORY;
         PRAGMA cache_size=-16000;
         PRAGMA foreign_keys=ON;",
    )
    .map_err(|e| RelayError::Internal(anyhow::anyhow!("applying pragmas: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let gw = StorageGateway::open(":memory:").unwrap();
        gw.write("test_insert", |conn| {
            conn.execute(
                "INSERT INTO server_settings (id, server_name, registration_mode, allowed_email_suffixes, updated_at) VALUES (1, 'Test', 'open', '[]', '2024-01-01T00:00:00Z')",
                [],
            )
            .map_err(RelayError::from)?;
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn write_timeout_surfaces_transient_error() {
        let gw = StorageGateway::open(":memory:").unwrap();
        let result: RelayResult<()> = gw
            .write("noop", |_conn| Ok(()))
            .await;
        assert!(result.is_ok());
    }
}
