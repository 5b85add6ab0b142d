//! Barriers: fan-in bookkeeping for one batch of worker jobs.
//!
//! Registration is phase 2 of the two-phase pattern. Worker jobs already
//! exist as inert `created` rows; [`register_in`] inserts the barrier and its
//! join rows, flips everything to `queued` and enqueues the queue entries,
//! all inside the caller's transaction. Nothing is claimable before the
//! barrier that will count it exists.
//!
//! Completion reports and the timeout sweep race for the same
//! `waiting → resuming` flip. Whoever gets the affected row owns the resume.

use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::{
    Barrier, BarrierJob, BarrierStatus, CompletionRecord, JobStatus, TimedOut, WorkerOutcome,
    WorkerTask,
};
use super::queue::insert_entry;
use super::{Store, parse_status};
use crate::clock::{from_millis, to_millis};
use crate::errors::BarrierError;

/// Error recorded against a job that had not reported by the deadline.
pub const TIMEOUT_ERROR: &str = "Worker did not report before the barrier deadline";

const BARRIER_COLUMNS: &str =
    "id, run_id, expected_count, completed_count, status, deadline_at, created_at, updated_at";

const BARRIER_JOB_COLUMNS: &str =
    "id, barrier_id, job_id, tool_call_id, status, result, error, attempt_count, completed_at";

pub struct Barriers<'a> {
    store: &'a Store,
}

// ── Row mapping ───────────────────────────────────────────────────────

struct BarrierRow {
    id: i64,
    run_id: i64,
    expected_count: u32,
    completed_count: u32,
    status: String,
    deadline_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl BarrierRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            expected_count: row.get(2)?,
            completed_count: row.get(3)?,
            status: row.get(4)?,
            deadline_at: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_barrier(self) -> Result<Barrier> {
        Ok(Barrier {
            id: self.id,
            run_id: self.run_id,
            expected_count: self.expected_count,
            completed_count: self.completed_count,
            status: parse_status(&self.status)?,
            deadline_at: self.deadline_at.map(from_millis),
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        })
    }
}

struct BarrierJobRow {
    id: i64,
    barrier_id: i64,
    job_id: i64,
    tool_call_id: String,
    status: String,
    result: Option<String>,
    error: Option<String>,
    attempt_count: u32,
    completed_at: Option<i64>,
}

impl BarrierJobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            barrier_id: row.get(1)?,
            job_id: row.get(2)?,
            tool_call_id: row.get(3)?,
            status: row.get(4)?,
            result: row.get(5)?,
            error: row.get(6)?,
            attempt_count: row.get(7)?,
            completed_at: row.get(8)?,
        })
    }

    fn into_job(self) -> Result<BarrierJob> {
        Ok(BarrierJob {
            id: self.id,
            barrier_id: self.barrier_id,
            job_id: self.job_id,
            tool_call_id: self.tool_call_id,
            status: parse_status(&self.status)?,
            result: self.result,
            error: self.error,
            attempt_count: self.attempt_count,
            completed_at: self.completed_at.map(from_millis),
        })
    }
}

// ── Registration (phase 2) ────────────────────────────────────────────

struct PendingJob {
    id: i64,
    tool_call_id: String,
    job_type: String,
    payload: String,
}

/// Create a barrier over `job_ids` and activate the batch. Must run inside
/// an IMMEDIATE transaction; returns the new barrier id.
pub(crate) fn register_in(
    conn: &Connection,
    run_id: i64,
    job_ids: &[i64],
    deadline_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<i64> {
    if job_ids.is_empty() {
        return Err(BarrierError::EmptyBatch { run_id }.into());
    }

    let active: Option<i64> = conn
        .query_row(
            "SELECT id FROM barriers WHERE run_id = ?1 AND status IN ('waiting', 'resuming')",
            params![run_id],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to check for an active barrier")?;
    if active.is_some() {
        return Err(BarrierError::ActiveBarrierExists { run_id }.into());
    }

    let mut jobs = Vec::with_capacity(job_ids.len());
    let mut seen = HashSet::new();
    for &job_id in job_ids {
        let row: Option<(i64, String, String, String, String)> = conn
            .query_row(
                "SELECT run_id, status, tool_call_id, job_type, payload FROM worker_jobs WHERE id = ?1",
                params![job_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()
            .context("Failed to load worker job for registration")?;
        let Some((job_run_id, status, tool_call_id, job_type, payload)) = row else {
            return Err(BarrierError::JobNotCreated { job_id }.into());
        };
        if job_run_id != run_id {
            return Err(BarrierError::JobRunMismatch {
                job_id,
                expected: run_id,
                actual: job_run_id,
            }
            .into());
        }
        if parse_status::<JobStatus>(&status)? != JobStatus::Created {
            return Err(BarrierError::JobNotCreated { job_id }.into());
        }
        if !seen.insert(tool_call_id.clone()) {
            return Err(BarrierError::DuplicateToolCall { tool_call_id }.into());
        }
        jobs.push(PendingJob {
            id: job_id,
            tool_call_id,
            job_type,
            payload,
        });
    }

    let now_ms = to_millis(now);
    conn.execute(
        "INSERT INTO barriers (run_id, expected_count, completed_count, status, deadline_at, created_at, updated_at)
         VALUES (?1, ?2, 0, 'waiting', ?3, ?4, ?4)",
        params![run_id, jobs.len() as i64, deadline_at.map(to_millis), now_ms],
    )
    .context("Failed to insert barrier")?;
    let barrier_id = conn.last_insert_rowid();

    for job in &jobs {
        conn.execute(
            "INSERT INTO barrier_jobs (barrier_id, job_id, tool_call_id, status)
             VALUES (?1, ?2, ?3, 'created')",
            params![barrier_id, job.id, job.tool_call_id],
        )
        .context("Failed to insert barrier job")?;
    }

    // The whole batch becomes visible together.
    for job in &jobs {
        let flipped = conn
            .execute(
                "UPDATE worker_jobs SET status = 'queued', updated_at = ?2
                 WHERE id = ?1 AND status = 'created'",
                params![job.id, now_ms],
            )
            .context("Failed to activate worker job")?;
        if flipped != 1 {
            return Err(BarrierError::JobNotCreated { job_id: job.id }.into());
        }
    }
    conn.execute(
        "UPDATE barrier_jobs SET status = 'queued' WHERE barrier_id = ?1 AND status = 'created'",
        params![barrier_id],
    )
    .context("Failed to activate barrier jobs")?;

    for job in jobs {
        let task = WorkerTask {
            run_id,
            barrier_id,
            job_id: job.id,
            tool_call_id: job.tool_call_id,
            payload: serde_json::from_str(&job.payload)
                .context("Invalid JSON in column 'worker_jobs.payload'")?,
        };
        let payload = serde_json::to_value(&task).context("Failed to serialize worker task")?;
        insert_entry(
            conn,
            now,
            &job.job_type,
            &payload,
            now,
            Some(&format!("worker-job:{}", job.id)),
        )?;
    }

    Ok(barrier_id)
}

/// Close a barrier that is being resumed.
pub(crate) fn close_in(
    conn: &Connection,
    barrier_id: i64,
    status: BarrierStatus,
    now: DateTime<Utc>,
) -> Result<bool> {
    if !status.is_terminal() {
        anyhow::bail!("Cannot close barrier {} as {}", barrier_id, status);
    }
    let changed = conn
        .execute(
            "UPDATE barriers SET status = ?2, updated_at = ?3 WHERE id = ?1 AND status = 'resuming'",
            params![barrier_id, status.as_str(), to_millis(now)],
        )
        .context("Failed to close barrier")?;
    Ok(changed == 1)
}

impl<'a> Barriers<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Phase 2 of registration as its own transaction.
    pub fn register(
        &self,
        run_id: i64,
        job_ids: &[i64],
        deadline_at: Option<DateTime<Utc>>,
    ) -> Result<Barrier> {
        let tx = self.store.immediate()?;
        let id = register_in(&tx, run_id, job_ids, deadline_at, self.store.now())?;
        tx.commit().context("Failed to commit barrier registration")?;
        tracing::info!(run_id, barrier_id = id, jobs = job_ids.len(), "Registered barrier");
        self.get(id)?.context("Barrier not found after insert")
    }

    // ── Completion ────────────────────────────────────────────────────

    /// Record one worker's outcome against the barrier that owns `job_id`.
    ///
    /// A report for a job that is already terminal is `Duplicate` and
    /// changes nothing except the attempt counter.
    pub fn record_completion(&self, job_id: i64, outcome: &WorkerOutcome) -> Result<CompletionRecord> {
        let now = self.store.now();
        let now_ms = to_millis(now);
        let tx = self.store.immediate()?;

        let located: Option<(i64, i64)> = tx
            .query_row(
                "SELECT id, barrier_id FROM barrier_jobs WHERE job_id = ?1 ORDER BY id DESC LIMIT 1",
                params![job_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to locate barrier job")?;
        let Some((barrier_job_id, barrier_id)) = located else {
            return Err(BarrierError::NotRegistered { job_id }.into());
        };

        tx.execute(
            "UPDATE barrier_jobs SET attempt_count = attempt_count + 1 WHERE id = ?1",
            params![barrier_job_id],
        )
        .context("Failed to bump attempt count")?;

        let (status, result, error) = match outcome {
            WorkerOutcome::Success { result } => (JobStatus::Completed, result.as_deref(), None),
            WorkerOutcome::Failed { error } => (JobStatus::Failed, None, Some(error.as_str())),
        };
        let recorded = tx
            .execute(
                "UPDATE barrier_jobs SET status = ?2, result = ?3, error = ?4, completed_at = ?5
                 WHERE id = ?1 AND status IN ('created', 'queued')",
                params![barrier_job_id, status.as_str(), result, error, now_ms],
            )
            .context("Failed to record barrier job outcome")?;
        if recorded == 0 {
            tx.commit().context("Failed to commit duplicate report")?;
            tracing::debug!(job_id, barrier_id, "Duplicate completion report");
            return Ok(CompletionRecord::Duplicate);
        }
        tx.execute(
            "UPDATE worker_jobs SET status = ?2, updated_at = ?3 WHERE id = ?1 AND status = 'queued'",
            params![job_id, status.as_str(), now_ms],
        )
        .context("Failed to update worker job status")?;

        let counted: Option<(u32, u32)> = tx
            .query_row(
                "UPDATE barriers SET completed_count = completed_count + 1, updated_at = ?2
                 WHERE id = ?1 AND status = 'waiting' AND completed_count < expected_count
                 RETURNING completed_count, expected_count",
                params![barrier_id, now_ms],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to increment barrier count")?;

        let record = match counted {
            Some((completed, expected)) if completed == expected => {
                let claimed = tx
                    .query_row(
                        "UPDATE barriers SET status = 'resuming', updated_at = ?2
                         WHERE id = ?1 AND status = 'waiting'
                         RETURNING run_id",
                        params![barrier_id, now_ms],
                        |row| row.get::<_, i64>(0),
                    )
                    .optional()
                    .context("Failed to claim barrier resume")?;
                match claimed {
                    Some(run_id) => CompletionRecord::Won { barrier_id, run_id },
                    None => CompletionRecord::Lost { completed, expected },
                }
            }
            Some((completed, expected)) => CompletionRecord::Counted { completed, expected },
            None => {
                let (completed, expected): (u32, u32) = tx
                    .query_row(
                        "SELECT completed_count, expected_count FROM barriers WHERE id = ?1",
                        params![barrier_id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .context("Failed to read barrier counts")?;
                CompletionRecord::Lost { completed, expected }
            }
        };
        tx.commit().context("Failed to commit completion report")?;
        tracing::debug!(job_id, barrier_id, ?record, "Recorded completion");
        Ok(record)
    }

    // ── Timeouts ──────────────────────────────────────────────────────

    /// Waiting barriers whose deadline is at or before `now`.
    pub fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        let mut stmt = self
            .store
            .conn()
            .prepare(
                "SELECT id FROM barriers
                 WHERE status = 'waiting' AND deadline_at IS NOT NULL AND deadline_at <= ?1
                 ORDER BY deadline_at, id",
            )
            .context("Failed to prepare expire_due")?;
        let ids = stmt
            .query_map(params![to_millis(now)], |row| row.get(0))
            .context("Failed to query expired barriers")?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("Failed to read expired barrier id")?;
        Ok(ids)
    }

    /// Claim the resume of an expired barrier and time out every job that
    /// has not reported. `None` when the barrier is no longer waiting or
    /// its deadline has not passed.
    pub fn claim_timed_out(&self, barrier_id: i64) -> Result<Option<TimedOut>> {
        let now_ms = to_millis(self.store.now());
        let tx = self.store.immediate()?;
        let claimed: Option<i64> = tx
            .query_row(
                "UPDATE barriers SET status = 'resuming', updated_at = ?2
                 WHERE id = ?1 AND status = 'waiting'
                   AND deadline_at IS NOT NULL AND deadline_at <= ?2
                 RETURNING run_id",
                params![barrier_id, now_ms],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to claim timed-out barrier")?;
        let Some(run_id) = claimed else {
            return Ok(None);
        };

        let timed_out = tx
            .execute(
                "UPDATE barrier_jobs SET status = 'timeout', error = ?2, completed_at = ?3
                 WHERE barrier_id = ?1 AND status IN ('created', 'queued')",
                params![barrier_id, TIMEOUT_ERROR, now_ms],
            )
            .context("Failed to time out barrier jobs")?;
        tx.execute(
            "UPDATE worker_jobs SET status = 'timeout', updated_at = ?2
             WHERE status = 'queued'
               AND id IN (SELECT job_id FROM barrier_jobs WHERE barrier_id = ?1 AND status = 'timeout')",
            params![barrier_id, now_ms],
        )
        .context("Failed to time out worker jobs")?;
        // Entries nobody picked up yet would only produce duplicate reports.
        tx.execute(
            "UPDATE queue_entries SET status = 'failed', last_error = ?2, updated_at = ?3
             WHERE status = 'pending'
               AND dedupe_key IN (SELECT 'worker-job:' || job_id FROM barrier_jobs
                                  WHERE barrier_id = ?1 AND status = 'timeout')",
            params![barrier_id, TIMEOUT_ERROR, now_ms],
        )
        .context("Failed to retire queue entries of timed-out jobs")?;
        tx.commit().context("Failed to commit barrier timeout")?;

        tracing::warn!(barrier_id, run_id, timed_out, "Barrier deadline passed");
        Ok(Some(TimedOut {
            barrier_id,
            run_id,
            timed_out: timed_out as u32,
        }))
    }

    // ── Stalled resumes ───────────────────────────────────────────────

    /// `resuming` barriers untouched since `cutoff`. Their claimant died
    /// between winning the claim and closing the barrier.
    pub fn stalled_resumes(&self, cutoff: DateTime<Utc>) -> Result<Vec<i64>> {
        let mut stmt = self
            .store
            .conn()
            .prepare(
                "SELECT id FROM barriers
                 WHERE status = 'resuming' AND updated_at <= ?1
                 ORDER BY updated_at, id",
            )
            .context("Failed to prepare stalled_resumes")?;
        let ids = stmt
            .query_map(params![to_millis(cutoff)], |row| row.get(0))
            .context("Failed to query stalled resumes")?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("Failed to read stalled barrier id")?;
        Ok(ids)
    }

    /// Take over a stalled resume. Touching `updated_at` makes this the
    /// same single-winner flip as the original claim; returns the run id
    /// for the winner.
    pub fn reclaim_resume(&self, barrier_id: i64, cutoff: DateTime<Utc>) -> Result<Option<i64>> {
        let run_id = self
            .store
            .conn()
            .query_row(
                "UPDATE barriers SET updated_at = ?2
                 WHERE id = ?1 AND status = 'resuming' AND updated_at <= ?3
                 RETURNING run_id",
                params![barrier_id, to_millis(self.store.now()), to_millis(cutoff)],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to reclaim stalled resume")?;
        if let Some(run_id) = run_id {
            tracing::warn!(barrier_id, run_id, "Reclaimed stalled barrier resume");
        }
        Ok(run_id)
    }

    /// Move a `resuming` barrier to a terminal status.
    pub fn close(&self, barrier_id: i64, status: BarrierStatus) -> Result<bool> {
        close_in(self.store.conn(), barrier_id, status, self.store.now())
    }

    // ── Lookups ───────────────────────────────────────────────────────

    pub fn get(&self, id: i64) -> Result<Option<Barrier>> {
        let sql = format!("SELECT {BARRIER_COLUMNS} FROM barriers WHERE id = ?1");
        let row = self
            .store
            .conn()
            .query_row(&sql, params![id], BarrierRow::from_row)
            .optional()
            .context("Failed to query barrier")?;
        row.map(BarrierRow::into_barrier).transpose()
    }

    /// The run's waiting or resuming barrier, if any.
    pub fn active_for_run(&self, run_id: i64) -> Result<Option<Barrier>> {
        let sql = format!(
            "SELECT {BARRIER_COLUMNS} FROM barriers
             WHERE run_id = ?1 AND status IN ('waiting', 'resuming')"
        );
        let row = self
            .store
            .conn()
            .query_row(&sql, params![run_id], BarrierRow::from_row)
            .optional()
            .context("Failed to query active barrier")?;
        row.map(BarrierRow::into_barrier).transpose()
    }

    pub fn list_for_run(&self, run_id: i64) -> Result<Vec<Barrier>> {
        let sql = format!("SELECT {BARRIER_COLUMNS} FROM barriers WHERE run_id = ?1 ORDER BY id");
        let mut stmt = self
            .store
            .conn()
            .prepare(&sql)
            .context("Failed to prepare list barriers")?;
        let rows = stmt
            .query_map(params![run_id], BarrierRow::from_row)
            .context("Failed to query barriers")?;
        let mut barriers = Vec::new();
        for row in rows {
            barriers.push(row.context("Failed to read barrier row")?.into_barrier()?);
        }
        Ok(barriers)
    }

    /// Join rows in registration order.
    pub fn jobs(&self, barrier_id: i64) -> Result<Vec<BarrierJob>> {
        let sql =
            format!("SELECT {BARRIER_JOB_COLUMNS} FROM barrier_jobs WHERE barrier_id = ?1 ORDER BY id");
        let mut stmt = self
            .store
            .conn()
            .prepare(&sql)
            .context("Failed to prepare barrier jobs")?;
        let rows = stmt
            .query_map(params![barrier_id], BarrierJobRow::from_row)
            .context("Failed to query barrier jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.context("Failed to read barrier job row")?.into_job()?);
        }
        Ok(jobs)
    }

    pub fn find_job_by_tool_call(
        &self,
        barrier_id: i64,
        tool_call_id: &str,
    ) -> Result<Option<BarrierJob>> {
        let sql = format!(
            "SELECT {BARRIER_JOB_COLUMNS} FROM barrier_jobs WHERE barrier_id = ?1 AND tool_call_id = ?2"
        );
        let row = self
            .store
            .conn()
            .query_row(&sql, params![barrier_id, tool_call_id], BarrierJobRow::from_row)
            .optional()
            .context("Failed to query barrier job by tool call")?;
        row.map(BarrierJobRow::into_job).transpose()
    }

    pub fn find_job_by_worker_job(&self, job_id: i64) -> Result<Option<BarrierJob>> {
        let sql = format!(
            "SELECT {BARRIER_JOB_COLUMNS} FROM barrier_jobs WHERE job_id = ?1 ORDER BY id DESC LIMIT 1"
        );
        let row = self
            .store
            .conn()
            .query_row(&sql, params![job_id], BarrierJobRow::from_row)
            .optional()
            .context("Failed to query barrier job by worker job")?;
        row.map(BarrierJobRow::into_job).transpose()
    }
}
