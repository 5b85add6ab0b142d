//! Supervisor run state machine.
//!
//! ```text
//! queued ──start──▶ running ──suspend──▶ waiting
//!                    ▲   │                  │
//!                    │   └─finish/fail─▶ success | failed
//!                    └────────resume────────┘
//! any non-terminal ──cancel──▶ cancelled
//! ```
//!
//! Every arrow is one `UPDATE ... WHERE status = <from>`. When the guard
//! does not match, the transition reports `Transition::Skipped` and nothing
//! (status or history) is written.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::barriers::{close_in, register_in};
use super::models::{Barrier, BarrierStatus, HistoryEntry, RunStatus, SupervisorRun, Transition};
use super::queue::insert_entry;
use super::{SUPERVISOR_JOB_TYPE, Store, parse_json, parse_status};
use crate::clock::{from_millis, to_millis};

const RUN_COLUMNS: &str = "id, status, waiting_on_barrier_id, input, history, result, error, \
                           trace_id, created_at, updated_at, completed_at";

pub struct Runs<'a> {
    store: &'a Store,
}

struct RunRow {
    id: i64,
    status: String,
    waiting_on_barrier_id: Option<i64>,
    input: String,
    history: String,
    result: Option<String>,
    error: Option<String>,
    trace_id: String,
    created_at: i64,
    updated_at: i64,
    completed_at: Option<i64>,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            waiting_on_barrier_id: row.get(2)?,
            input: row.get(3)?,
            history: row.get(4)?,
            result: row.get(5)?,
            error: row.get(6)?,
            trace_id: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
            completed_at: row.get(10)?,
        })
    }

    fn into_run(self) -> Result<SupervisorRun> {
        Ok(SupervisorRun {
            id: self.id,
            status: parse_status(&self.status)?,
            waiting_on_barrier_id: self.waiting_on_barrier_id,
            input: parse_json(&self.input, "supervisor_runs.input")?,
            history: parse_json(&self.history, "supervisor_runs.history")?,
            result: self
                .result
                .as_deref()
                .map(|raw| parse_json(raw, "supervisor_runs.result"))
                .transpose()?,
            error: self.error,
            trace_id: self.trace_id,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
            completed_at: self.completed_at.map(from_millis),
        })
    }
}

fn transition(changed: usize) -> Transition {
    if changed == 1 {
        Transition::Applied
    } else {
        Transition::Skipped
    }
}

/// Append entries to a run's history, one `json_insert` per entry so the
/// array is never rewritten from application memory.
fn push_history(conn: &Connection, id: i64, entries: &[HistoryEntry]) -> Result<()> {
    for entry in entries {
        let json = serde_json::to_string(entry).context("Failed to serialize history entry")?;
        conn.execute(
            "UPDATE supervisor_runs SET history = json_insert(history, '$[#]', json(?2))
             WHERE id = ?1",
            params![id, json],
        )
        .context("Failed to append history")?;
    }
    Ok(())
}

/// running → waiting on `barrier_id`.
fn mark_waiting(
    conn: &Connection,
    id: i64,
    barrier_id: i64,
    now: DateTime<Utc>,
) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE supervisor_runs
             SET status = 'waiting', waiting_on_barrier_id = ?2, updated_at = ?3
             WHERE id = ?1 AND status = 'running'",
            params![id, barrier_id, to_millis(now)],
        )
        .context("Failed to mark run waiting")?;
    Ok(changed == 1)
}

/// waiting → running, only if the run is still waiting on this barrier.
fn mark_resumed(
    conn: &Connection,
    id: i64,
    barrier_id: i64,
    now: DateTime<Utc>,
) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE supervisor_runs
             SET status = 'running', waiting_on_barrier_id = NULL, updated_at = ?3
             WHERE id = ?1 AND status = 'waiting' AND waiting_on_barrier_id = ?2",
            params![id, barrier_id, to_millis(now)],
        )
        .context("Failed to mark run resumed")?;
    Ok(changed == 1)
}

impl<'a> Runs<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Insert a `queued` run and the queue entry that will start it.
    pub fn create(&self, input: &serde_json::Value, trace_id: &str) -> Result<SupervisorRun> {
        let input_json = serde_json::to_string(input).context("Failed to serialize run input")?;
        let now = self.store.now();
        let tx = self.store.immediate()?;
        tx.execute(
            "INSERT INTO supervisor_runs (status, input, history, trace_id, created_at, updated_at)
             VALUES ('queued', ?1, '[]', ?2, ?3, ?3)",
            params![input_json, trace_id, to_millis(now)],
        )
        .context("Failed to insert supervisor run")?;
        let id = tx.last_insert_rowid();
        insert_entry(
            &tx,
            now,
            SUPERVISOR_JOB_TYPE,
            &serde_json::json!({ "run_id": id }),
            now,
            Some(&format!("supervisor-run:{}", id)),
        )?;
        tx.commit().context("Failed to commit run creation")?;
        tracing::info!(run_id = id, trace_id, "Queued supervisor run");
        self.get(id)?.context("Supervisor run not found after insert")
    }

    pub fn get(&self, id: i64) -> Result<Option<SupervisorRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM supervisor_runs WHERE id = ?1");
        let row = self
            .store
            .conn()
            .query_row(&sql, params![id], RunRow::from_row)
            .optional()
            .context("Failed to query supervisor run")?;
        row.map(RunRow::into_run).transpose()
    }

    /// Runs, newest first, optionally filtered by status.
    pub fn list(&self, status: Option<RunStatus>, limit: u32) -> Result<Vec<SupervisorRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM supervisor_runs
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY id DESC LIMIT ?2"
        );
        let mut stmt = self
            .store
            .conn()
            .prepare(&sql)
            .context("Failed to prepare list runs")?;
        let rows = stmt
            .query_map(
                params![status.map(|s| s.as_str()), limit],
                RunRow::from_row,
            )
            .context("Failed to query supervisor runs")?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read supervisor run row")?.into_run()?);
        }
        Ok(runs)
    }

    /// queued → running.
    pub fn start(&self, id: i64) -> Result<Transition> {
        let changed = self
            .store
            .conn()
            .execute(
                "UPDATE supervisor_runs SET status = 'running', updated_at = ?2
                 WHERE id = ?1 AND status = 'queued'",
                params![id, to_millis(self.store.now())],
            )
            .context("Failed to start supervisor run")?;
        Ok(transition(changed))
    }

    /// running → waiting: register `job_ids` as a new barrier (phase 2) and
    /// park the run on it, persisting the turn's history, all in one
    /// transaction. `None` when the run is no longer running; the
    /// registration is rolled back and the jobs stay inert.
    pub fn suspend(
        &self,
        id: i64,
        job_ids: &[i64],
        entries: &[HistoryEntry],
        deadline_at: Option<DateTime<Utc>>,
    ) -> Result<Option<Barrier>> {
        let now = self.store.now();
        let tx = self.store.immediate()?;
        let barrier_id = register_in(&tx, id, job_ids, deadline_at, now)?;
        if !mark_waiting(&tx, id, barrier_id, now)? {
            tracing::debug!(run_id = id, "Run left running before suspend; discarding batch");
            return Ok(None);
        }
        push_history(&tx, id, entries)?;
        tx.commit().context("Failed to commit run suspension")?;
        tracing::info!(run_id = id, barrier_id, jobs = job_ids.len(), "Run waiting on barrier");
        self.store.barriers().get(barrier_id)
    }

    /// waiting → running for the holder of a barrier's resume claim.
    ///
    /// The barrier is closed as `close_as` either way. The run only moves,
    /// and `entries` are only appended, when it is still waiting on exactly
    /// this barrier; otherwise the result is `Skipped` and the run is
    /// untouched.
    pub fn resume(
        &self,
        id: i64,
        barrier_id: i64,
        entries: &[HistoryEntry],
        close_as: BarrierStatus,
    ) -> Result<Transition> {
        let now = self.store.now();
        let tx = self.store.immediate()?;
        if !close_in(&tx, barrier_id, close_as, now)? {
            tracing::warn!(run_id = id, barrier_id, "Barrier was not resuming when closed");
        }
        let resumed = mark_resumed(&tx, id, barrier_id, now)?;
        if resumed {
            push_history(&tx, id, entries)?;
        }
        tx.commit().context("Failed to commit run resume")?;
        Ok(if resumed {
            Transition::Applied
        } else {
            Transition::Skipped
        })
    }

    /// Append history while the run is executing a turn.
    pub fn append_history(&self, id: i64, entries: &[HistoryEntry]) -> Result<Transition> {
        let tx = self.store.immediate()?;
        let changed = tx
            .execute(
                "UPDATE supervisor_runs SET updated_at = ?2 WHERE id = ?1 AND status = 'running'",
                params![id, to_millis(self.store.now())],
            )
            .context("Failed to touch supervisor run")?;
        if changed == 1 {
            push_history(&tx, id, entries)?;
        }
        tx.commit().context("Failed to commit history append")?;
        Ok(transition(changed))
    }

    /// running → success, appending the final turn's entries.
    pub fn finish(
        &self,
        id: i64,
        result: &serde_json::Value,
        entries: &[HistoryEntry],
    ) -> Result<Transition> {
        let result = serde_json::to_string(result).context("Failed to serialize run result")?;
        let now = to_millis(self.store.now());
        let tx = self.store.immediate()?;
        let changed = tx
            .execute(
                "UPDATE supervisor_runs
                 SET status = 'success', result = ?2, completed_at = ?3, updated_at = ?3
                 WHERE id = ?1 AND status = 'running'",
                params![id, result, now],
            )
            .context("Failed to finish supervisor run")?;
        if changed == 1 {
            push_history(&tx, id, entries)?;
        }
        tx.commit().context("Failed to commit run finish")?;
        Ok(transition(changed))
    }

    /// running → failed with the error recorded.
    pub fn fail(&self, id: i64, error: &str, entries: &[HistoryEntry]) -> Result<Transition> {
        let now = to_millis(self.store.now());
        let tx = self.store.immediate()?;
        let changed = tx
            .execute(
                "UPDATE supervisor_runs
                 SET status = 'failed', error = ?2, completed_at = ?3, updated_at = ?3
                 WHERE id = ?1 AND status = 'running'",
                params![id, error, now],
            )
            .context("Failed to fail supervisor run")?;
        if changed == 1 {
            push_history(&tx, id, entries)?;
        }
        tx.commit().context("Failed to commit run failure")?;
        Ok(transition(changed))
    }

    /// Any non-terminal state → cancelled. A barrier the run was waiting on
    /// is left alone; its eventual resume finds the run not waiting and skips.
    pub fn cancel(&self, id: i64) -> Result<Transition> {
        let now = to_millis(self.store.now());
        let changed = self
            .store
            .conn()
            .execute(
                "UPDATE supervisor_runs
                 SET status = 'cancelled', waiting_on_barrier_id = NULL,
                     completed_at = ?2, updated_at = ?2
                 WHERE id = ?1 AND status IN ('queued', 'running', 'waiting')",
                params![id, now],
            )
            .context("Failed to cancel supervisor run")?;
        if changed == 1 {
            tracing::info!(run_id = id, "Cancelled supervisor run");
        }
        Ok(transition(changed))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::models::{JobStatus, Role, SpawnRequest, ToolResultStatus, WorkerOutcome};

    fn message(text: &str) -> HistoryEntry {
        HistoryEntry::Message {
            role: Role::Assistant,
            content: json!(text),
        }
    }

    #[test]
    fn test_create_queues_run_and_start_entry() -> Result<()> {
        let store = Store::open_in_memory()?;
        let run = store.runs().create(&json!({"goal": "ship it"}), "trace-9")?;
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.trace_id, "trace-9");
        assert!(run.history.is_empty());
        assert_eq!(run.input["goal"], "ship it");

        let entry = store
            .queue()
            .find_by_dedupe_key(&format!("supervisor-run:{}", run.id))?
            .expect("start entry");
        assert_eq!(entry.job_type, SUPERVISOR_JOB_TYPE);
        assert_eq!(entry.payload["run_id"], run.id);
        Ok(())
    }

    #[test]
    fn test_start_only_from_queued() -> Result<()> {
        let store = Store::open_in_memory()?;
        let run = store.runs().create(&json!(null), "t")?;
        assert_eq!(store.runs().start(run.id)?, Transition::Applied);
        assert_eq!(store.runs().start(run.id)?, Transition::Skipped);
        assert_eq!(
            store.runs().get(run.id)?.unwrap().status,
            RunStatus::Running
        );
        Ok(())
    }

    #[test]
    fn test_history_appends_in_order() -> Result<()> {
        let store = Store::open_in_memory()?;
        let runs = store.runs();
        let run = runs.create(&json!(null), "t")?;
        runs.start(run.id)?;
        runs.append_history(run.id, &[message("one"), message("two")])?;
        runs.append_history(
            run.id,
            &[HistoryEntry::ToolResult {
                tool_call_id: "c1".into(),
                status: ToolResultStatus::Success,
                content: "ok".into(),
            }],
        )?;

        let history = runs.get(run.id)?.unwrap().history;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0], message("one"));
        assert_eq!(history[1], message("two"));
        assert_eq!(history[2].tool_call_id(), Some("c1"));
        Ok(())
    }

    #[test]
    fn test_append_history_refused_when_not_running() -> Result<()> {
        let store = Store::open_in_memory()?;
        let runs = store.runs();
        let run = runs.create(&json!(null), "t")?;
        assert_eq!(
            runs.append_history(run.id, &[message("early")])?,
            Transition::Skipped
        );
        assert!(runs.get(run.id)?.unwrap().history.is_empty());
        Ok(())
    }

    #[test]
    fn test_finish_and_fail_are_terminal() -> Result<()> {
        let store = Store::open_in_memory()?;
        let runs = store.runs();

        let ok = runs.create(&json!(null), "t")?;
        runs.start(ok.id)?;
        assert!(runs.finish(ok.id, &json!({"answer": 42}), &[message("done")])?.applied());
        let ok = runs.get(ok.id)?.unwrap();
        assert_eq!(ok.status, RunStatus::Success);
        assert_eq!(ok.result, Some(json!({"answer": 42})));
        assert!(ok.completed_at.is_some());
        assert_eq!(ok.history.len(), 1);
        assert_eq!(runs.fail(ok.id, "late", &[])?, Transition::Skipped);

        let bad = runs.create(&json!(null), "t")?;
        runs.start(bad.id)?;
        assert!(runs.fail(bad.id, "engine exploded", &[])?.applied());
        let bad = runs.get(bad.id)?.unwrap();
        assert_eq!(bad.status, RunStatus::Failed);
        assert_eq!(bad.error.as_deref(), Some("engine exploded"));
        Ok(())
    }

    #[test]
    fn test_cancel_from_any_non_terminal_state() -> Result<()> {
        let store = Store::open_in_memory()?;
        let runs = store.runs();

        let queued = runs.create(&json!(null), "t")?;
        assert!(runs.cancel(queued.id)?.applied());
        assert_eq!(runs.cancel(queued.id)?, Transition::Skipped);
        assert_eq!(runs.start(queued.id)?, Transition::Skipped);

        let finished = runs.create(&json!(null), "t")?;
        runs.start(finished.id)?;
        runs.finish(finished.id, &json!(null), &[])?;
        assert_eq!(runs.cancel(finished.id)?, Transition::Skipped);
        assert_eq!(
            runs.get(finished.id)?.unwrap().status,
            RunStatus::Success
        );
        Ok(())
    }

    fn spawn_jobs(store: &Store, run_id: i64, n: usize) -> Result<Vec<i64>> {
        (0..n)
            .map(|i| {
                store
                    .worker_jobs()
                    .create(run_id, &SpawnRequest::new(format!("call_{i}"), json!(i)))
                    .map(|job| job.id)
            })
            .collect()
    }

    #[test]
    fn test_suspend_parks_run_on_barrier() -> Result<()> {
        let store = Store::open_in_memory()?;
        let runs = store.runs();
        let run = runs.create(&json!(null), "t")?;
        runs.start(run.id)?;
        let jobs = spawn_jobs(&store, run.id, 2)?;

        let barrier = runs
            .suspend(run.id, &jobs, &[message("spawning")], None)?
            .expect("suspended");
        let run = runs.get(run.id)?.unwrap();
        assert_eq!(run.status, RunStatus::Waiting);
        assert_eq!(run.waiting_on_barrier_id, Some(barrier.id));
        assert_eq!(run.history, vec![message("spawning")]);
        Ok(())
    }

    #[test]
    fn test_suspend_of_cancelled_run_rolls_back_registration() -> Result<()> {
        let store = Store::open_in_memory()?;
        let runs = store.runs();
        let run = runs.create(&json!(null), "t")?;
        runs.start(run.id)?;
        let jobs = spawn_jobs(&store, run.id, 2)?;
        runs.cancel(run.id)?;

        assert!(runs.suspend(run.id, &jobs, &[], None)?.is_none());
        assert!(store.barriers().active_for_run(run.id)?.is_none());
        assert_eq!(
            store.worker_jobs().count_with_status(run.id, JobStatus::Created)?,
            2
        );
        Ok(())
    }

    #[test]
    fn test_resume_requires_matching_waiting_barrier() -> Result<()> {
        let store = Store::open_in_memory()?;
        let runs = store.runs();
        let run = runs.create(&json!(null), "t")?;
        runs.start(run.id)?;
        let jobs = spawn_jobs(&store, run.id, 1)?;
        let barrier = runs.suspend(run.id, &jobs, &[], None)?.unwrap();

        let result = HistoryEntry::ToolResult {
            tool_call_id: "call_0".into(),
            status: ToolResultStatus::Success,
            content: "ok".into(),
        };
        assert_eq!(
            runs.resume(run.id, barrier.id + 1, &[result.clone()], BarrierStatus::Completed)?,
            Transition::Skipped
        );
        assert_eq!(runs.get(run.id)?.unwrap().status, RunStatus::Waiting);

        store
            .barriers()
            .record_completion(jobs[0], &WorkerOutcome::Success { result: None })?;
        assert!(runs
            .resume(run.id, barrier.id, &[result.clone()], BarrierStatus::Completed)?
            .applied());
        let resumed = runs.get(run.id)?.unwrap();
        assert_eq!(resumed.status, RunStatus::Running);
        assert_eq!(resumed.waiting_on_barrier_id, None);
        assert_eq!(resumed.history, vec![result.clone()]);
        assert_eq!(
            store.barriers().get(barrier.id)?.unwrap().status,
            BarrierStatus::Completed
        );

        // Second resume is a no-op on both status and history.
        assert_eq!(
            runs.resume(run.id, barrier.id, &[result], BarrierStatus::Completed)?,
            Transition::Skipped
        );
        assert_eq!(runs.get(run.id)?.unwrap().history.len(), 1);
        Ok(())
    }

    #[test]
    fn test_list_filters_by_status() -> Result<()> {
        let store = Store::open_in_memory()?;
        let runs = store.runs();
        let a = runs.create(&json!(null), "t")?;
        let b = runs.create(&json!(null), "t")?;
        runs.start(b.id)?;

        let all = runs.list(None, 10)?;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, b.id);

        let queued = runs.list(Some(RunStatus::Queued), 10)?;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, a.id);
        Ok(())
    }
}
