//! Worker job rows: one per fanned-out sub-task.
//!
//! A job is born `created` and stays invisible to workers (it has no queue
//! entry) until barrier registration activates the whole batch at once.

use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, Row, params};

use super::models::{JobStatus, SpawnRequest, WorkerJob};
use super::{Store, parse_json, parse_status};
use crate::clock::{from_millis, to_millis};

const JOB_COLUMNS: &str =
    "id, run_id, tool_call_id, job_type, payload, status, created_at, updated_at";

pub struct WorkerJobs<'a> {
    store: &'a Store,
}

struct WorkerJobRow {
    id: i64,
    run_id: i64,
    tool_call_id: String,
    job_type: String,
    payload: String,
    status: String,
    created_at: i64,
    updated_at: i64,
}

impl WorkerJobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            tool_call_id: row.get(2)?,
            job_type: row.get(3)?,
            payload: row.get(4)?,
            status: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_job(self) -> Result<WorkerJob> {
        Ok(WorkerJob {
            id: self.id,
            run_id: self.run_id,
            tool_call_id: self.tool_call_id,
            job_type: self.job_type,
            payload: parse_json(&self.payload, "worker_jobs.payload")?,
            status: parse_status(&self.status)?,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        })
    }
}

impl<'a> WorkerJobs<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Phase 1 of registration: record a spawn request as an inert job.
    pub fn create(&self, run_id: i64, spawn: &SpawnRequest) -> Result<WorkerJob> {
        let payload =
            serde_json::to_string(&spawn.payload).context("Failed to serialize job payload")?;
        let now = to_millis(self.store.now());
        self.store
            .conn()
            .execute(
                "INSERT INTO worker_jobs (run_id, tool_call_id, job_type, payload, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'created', ?5, ?5)",
                params![run_id, spawn.tool_call_id, spawn.job_type, payload, now],
            )
            .context("Failed to insert worker job")?;
        let id = self.store.conn().last_insert_rowid();
        tracing::debug!(run_id, job_id = id, tool_call_id = %spawn.tool_call_id, "Created worker job");
        self.get(id)?.context("Worker job not found after insert")
    }

    pub fn get(&self, id: i64) -> Result<Option<WorkerJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM worker_jobs WHERE id = ?1");
        let row = self
            .store
            .conn()
            .query_row(&sql, params![id], WorkerJobRow::from_row)
            .optional()
            .context("Failed to query worker job")?;
        row.map(WorkerJobRow::into_job).transpose()
    }

    pub fn list_for_run(&self, run_id: i64) -> Result<Vec<WorkerJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM worker_jobs WHERE run_id = ?1 ORDER BY id");
        let mut stmt = self
            .store
            .conn()
            .prepare(&sql)
            .context("Failed to prepare list_for_run")?;
        let rows = stmt
            .query_map(params![run_id], WorkerJobRow::from_row)
            .context("Failed to query worker jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.context("Failed to read worker job row")?.into_job()?);
        }
        Ok(jobs)
    }

    pub fn count_with_status(&self, run_id: i64, status: JobStatus) -> Result<u64> {
        let count: i64 = self
            .store
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM worker_jobs WHERE run_id = ?1 AND status = ?2",
                params![run_id, status.as_str()],
                |row| row.get(0),
            )
            .context("Failed to count worker jobs")?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_create_is_inert_and_unqueued() -> Result<()> {
        let store = Store::open_in_memory()?;
        let run = store.runs().create(&json!({"goal": "t"}), "trace-1")?;
        let job = store
            .worker_jobs()
            .create(run.id, &SpawnRequest::new("call_1", json!({"cmd": "echo hi"})))?;

        assert_eq!(job.status, JobStatus::Created);
        assert_eq!(job.tool_call_id, "call_1");
        assert_eq!(job.payload["cmd"], "echo hi");
        // Only the supervisor start entry exists; nothing a worker could claim.
        let worker_types = vec![crate::store::WORKER_JOB_TYPE.to_string()];
        assert!(store
            .queue()
            .claim_next_job_of_types("w", &worker_types)?
            .is_none());
        Ok(())
    }

    #[test]
    fn test_list_and_count_for_run() -> Result<()> {
        let store = Store::open_in_memory()?;
        let run = store.runs().create(&json!(null), "trace-1")?;
        let jobs = store.worker_jobs();
        jobs.create(run.id, &SpawnRequest::new("a", json!(1)))?;
        jobs.create(run.id, &SpawnRequest::new("b", json!(2)))?;

        let listed = jobs.list_for_run(run.id)?;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].tool_call_id, "a");
        assert_eq!(jobs.count_with_status(run.id, JobStatus::Created)?, 2);
        assert_eq!(jobs.count_with_status(run.id, JobStatus::Queued)?, 0);
        Ok(())
    }
}
