//! Relational storage for the orchestration core.
//!
//! Five tables hold all coordination state: `queue_entries`, `worker_jobs`,
//! `barriers`, `barrier_jobs` and `supervisor_runs`. Each table has one
//! data-access type (`JobQueue`, `WorkerJobs`, `Barriers`, `Runs`) borrowed
//! from a [`Store`]. Every state transition that must be atomic is a single
//! conditional statement whose affected-row count decides the outcome.

pub mod barriers;
pub mod models;
pub mod queue;
pub mod runs;
pub mod worker_jobs;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::clock::{Clock, SystemClock};

pub use barriers::Barriers;
pub use models::*;
pub use queue::JobQueue;
pub use runs::Runs;
pub use worker_jobs::WorkerJobs;

/// Queue job type for fanned-out worker jobs.
pub const WORKER_JOB_TYPE: &str = "worker";
/// Queue job type that starts a queued supervisor run.
pub const SUPERVISOR_JOB_TYPE: &str = "supervisor";

/// Tunables that affect how the store talks to SQLite and hands out leases.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// How long a statement waits on a locked database before failing.
    pub busy_timeout: Duration,
    /// Lease length granted by a claim.
    pub lease_ttl: chrono::Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
            lease_ttl: chrono::Duration::seconds(300),
        }
    }
}

/// Async-safe handle to the store.
///
/// Wraps `Store` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads. One handle is one connection;
/// separate processes (or separate handles in tests) coordinate only
/// through the database file.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<std::sync::Mutex<Store>>,
}

impl StoreHandle {
    pub fn new(store: Store) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Store) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store
                .lock()
                .map_err(|e| anyhow::anyhow!("Store lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("Store task panicked")?
    }

    /// Acquire the store synchronously. Only for startup, shutdown and
    /// tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, Store>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("Store lock poisoned: {}", e))
    }
}

pub struct Store {
    conn: Connection,
    clock: Arc<dyn Clock>,
    lease_ttl: chrono::Duration,
}

impl Store {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn open(path: &Path, options: &StoreOptions) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {}", path.display()))?;
        let store = Self {
            conn,
            clock: Arc::new(SystemClock),
            lease_ttl: options.lease_ttl,
        };
        store.init(options)?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let options = StoreOptions::default();
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self {
            conn,
            clock: Arc::new(SystemClock),
            lease_ttl: options.lease_ttl,
        };
        store.init(&options)?;
        Ok(store)
    }

    /// Replace the time source used for leases, schedules and deadlines.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_lease_ttl(mut self, lease_ttl: chrono::Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    pub fn queue(&self) -> JobQueue<'_> {
        JobQueue::new(self)
    }

    pub fn worker_jobs(&self) -> WorkerJobs<'_> {
        WorkerJobs::new(self)
    }

    pub fn barriers(&self) -> Barriers<'_> {
        Barriers::new(self)
    }

    pub fn runs(&self) -> Runs<'_> {
        Runs::new(self)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn lease_ttl(&self) -> chrono::Duration {
        self.lease_ttl
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Begin a write transaction that takes the database write lock up front,
    /// so two processes never deadlock upgrading read locks.
    pub(crate) fn immediate(&self) -> Result<Transaction<'_>> {
        Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("Failed to begin immediate transaction")
    }

    fn init(&self, options: &StoreOptions) -> Result<()> {
        self.conn
            .busy_timeout(options.busy_timeout)
            .context("Failed to set busy timeout")?;
        // journal_mode reports the resulting mode as a row; in-memory stays "memory".
        let _mode: String = self
            .conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .context("Failed to enable WAL journal")?;
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA synchronous = NORMAL;")
            .context("Failed to set connection pragmas")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS queue_entries (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_type TEXT NOT NULL,
                    payload TEXT NOT NULL DEFAULT 'null',
                    scheduled_for INTEGER NOT NULL,
                    dedupe_key TEXT UNIQUE,
                    status TEXT NOT NULL DEFAULT 'pending'
                        CHECK (status IN ('pending', 'leased', 'done', 'failed')),
                    attempts INTEGER NOT NULL DEFAULT 0,
                    lease_owner TEXT,
                    lease_expires_at INTEGER,
                    last_error TEXT,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    CHECK (status <> 'leased'
                           OR (lease_owner IS NOT NULL AND lease_expires_at IS NOT NULL))
                );

                CREATE TABLE IF NOT EXISTS supervisor_runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    status TEXT NOT NULL DEFAULT 'queued'
                        CHECK (status IN ('queued', 'running', 'waiting', 'success', 'failed', 'cancelled')),
                    waiting_on_barrier_id INTEGER,
                    input TEXT NOT NULL DEFAULT 'null',
                    history TEXT NOT NULL DEFAULT '[]',
                    result TEXT,
                    error TEXT,
                    trace_id TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    completed_at INTEGER,
                    CHECK ((status = 'waiting') = (waiting_on_barrier_id IS NOT NULL))
                );

                CREATE TABLE IF NOT EXISTS worker_jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES supervisor_runs(id) ON DELETE CASCADE,
                    tool_call_id TEXT NOT NULL,
                    job_type TEXT NOT NULL,
                    payload TEXT NOT NULL DEFAULT 'null',
                    status TEXT NOT NULL DEFAULT 'created'
                        CHECK (status IN ('created', 'queued', 'completed', 'failed', 'timeout')),
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS barriers (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES supervisor_runs(id) ON DELETE CASCADE,
                    expected_count INTEGER NOT NULL CHECK (expected_count > 0),
                    completed_count INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL DEFAULT 'waiting'
                        CHECK (status IN ('waiting', 'resuming', 'completed', 'failed')),
                    deadline_at INTEGER,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    CHECK (completed_count >= 0 AND completed_count <= expected_count)
                );

                CREATE TABLE IF NOT EXISTS barrier_jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    barrier_id INTEGER NOT NULL REFERENCES barriers(id) ON DELETE CASCADE,
                    job_id INTEGER NOT NULL REFERENCES worker_jobs(id),
                    tool_call_id TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'created'
                        CHECK (status IN ('created', 'queued', 'completed', 'failed', 'timeout')),
                    result TEXT,
                    error TEXT,
                    attempt_count INTEGER NOT NULL DEFAULT 0,
                    completed_at INTEGER,
                    UNIQUE (barrier_id, job_id),
                    UNIQUE (barrier_id, tool_call_id)
                );

                CREATE INDEX IF NOT EXISTS idx_queue_claim ON queue_entries(status, scheduled_for);
                CREATE INDEX IF NOT EXISTS idx_runs_status ON supervisor_runs(status);
                CREATE INDEX IF NOT EXISTS idx_worker_jobs_run ON worker_jobs(run_id);
                CREATE INDEX IF NOT EXISTS idx_barriers_deadline ON barriers(status, deadline_at);
                CREATE INDEX IF NOT EXISTS idx_barrier_jobs_job ON barrier_jobs(job_id);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_barriers_active_run
                    ON barriers(run_id) WHERE status IN ('waiting', 'resuming');
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }
}

/// Parse a JSON text column, naming the column in the error.
pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(raw: &str, column: &str) -> Result<T> {
    serde_json::from_str(raw).with_context(|| format!("Invalid JSON in column '{}'", column))
}

/// Parse a status text column through its `FromStr` impl.
pub(crate) fn parse_status<T: std::str::FromStr<Err = String>>(raw: &str) -> Result<T> {
    raw.parse::<T>().map_err(|e| anyhow::anyhow!(e))
}
