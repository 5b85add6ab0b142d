//! Resume coordinator: the glue between worker completions, barriers, the
//! run state machine and the execution engine.
//!
//! Every path that can end a turn goes through [`Coordinator::apply_turn`],
//! so a run started from the queue and a run resumed from a barrier handle
//! `Finished`, `Failed` and `Suspended` identically.

pub mod sweeper;

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{ExecutionEngine, RunContext, Turn, TurnOutcome};
use crate::errors::{BarrierError, CoordinatorError, RunError};
use crate::store::barriers::TIMEOUT_ERROR;
use crate::store::{
    Barrier, BarrierJob, BarrierStatus, CompletionRecord, HistoryEntry, JobStatus, Role, SpawnRequest,
    StoreHandle, SupervisorRun, ToolResultStatus, Transition, WorkerOutcome,
};

pub use sweeper::{SweepOutcome, spawn_sweeper};

type CoordResult<T> = std::result::Result<T, CoordinatorError>;

/// What to do when a barrier resolves with failed or timed-out jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Inject worker errors as ordinary tool errors and continue.
    #[default]
    Continue,
    /// Fail the run instead of continuing.
    FailRun,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::FailRun => "fail_run",
        }
    }
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "continue" => Ok(Self::Continue),
            "fail_run" => Ok(Self::FailRun),
            _ => Err(format!("Invalid failure policy: {}", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Identity recorded in `RunContext::owner`.
    pub owner: String,
    /// Barrier deadline measured from suspension; `None` waits forever.
    pub barrier_timeout: Option<chrono::Duration>,
    pub failure_policy: FailurePolicy,
    /// How long a barrier may sit in `resuming` before the sweep assumes
    /// its claimant died and resumes it.
    pub resume_grace: chrono::Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            owner: "relay".to_string(),
            barrier_timeout: Some(chrono::Duration::hours(1)),
            failure_policy: FailurePolicy::Continue,
            resume_grace: chrono::Duration::seconds(60),
        }
    }
}

/// Where a run ended up after the coordinator drove it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunProgress {
    /// Parked on a new barrier.
    Suspended { barrier_id: i64 },
    Finished,
    Failed { error: String },
    /// The run was not in the state this step required; nothing changed.
    Skipped,
}

/// A worker's report for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub run_id: i64,
    pub job_id: i64,
    pub worker_id: String,
    pub outcome: WorkerOutcome,
}

/// How a completion report was absorbed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionAck {
    /// Counted; other jobs are still outstanding.
    Accepted { completed: u32, expected: u32 },
    /// The job already had an outcome.
    Duplicate,
    /// This report completed the barrier and drove the resume.
    Resumed { progress: RunProgress },
    /// The barrier was already resolved by someone else.
    Skipped,
}

/// A run with its most recent barrier, for inspection.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run: SupervisorRun,
    pub barrier: Option<Barrier>,
    pub jobs: Vec<BarrierJob>,
}

pub struct Coordinator {
    store: StoreHandle,
    engine: Arc<dyn ExecutionEngine>,
    settings: CoordinatorSettings,
}

impl Coordinator {
    pub fn new(
        store: StoreHandle,
        engine: Arc<dyn ExecutionEngine>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            store,
            engine,
            settings,
        }
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    // ── Runs ──────────────────────────────────────────────────────────

    /// Queue a new supervisor run. A worker pool serving the `supervisor`
    /// job type starts it.
    pub async fn create_run(&self, input: Value) -> CoordResult<SupervisorRun> {
        let trace_id = uuid::Uuid::new_v4().to_string();
        let run = self
            .store
            .call(move |store| store.runs().create(&input, &trace_id))
            .await?;
        Ok(run)
    }

    pub async fn get_run(&self, run_id: i64) -> CoordResult<SupervisorRun> {
        self.store
            .call(move |store| store.runs().get(run_id))
            .await?
            .ok_or(CoordinatorError::Run(RunError::NotFound { id: run_id }))
    }

    pub async fn snapshot(&self, run_id: i64) -> CoordResult<RunSnapshot> {
        let snapshot = self
            .store
            .call(move |store| {
                let Some(run) = store.runs().get(run_id)? else {
                    return Ok(None);
                };
                let barrier = store.barriers().list_for_run(run_id)?.pop();
                let jobs = match &barrier {
                    Some(barrier) => store.barriers().jobs(barrier.id)?,
                    None => Vec::new(),
                };
                Ok(Some(RunSnapshot { run, barrier, jobs }))
            })
            .await?;
        snapshot.ok_or(CoordinatorError::Run(RunError::NotFound { id: run_id }))
    }

    /// queued → running, then the first engine turn.
    pub async fn start_run(&self, run_id: i64) -> CoordResult<RunProgress> {
        let run = self.get_run(run_id).await?;
        let seed = if run.history.is_empty() {
            vec![HistoryEntry::Message {
                role: Role::User,
                content: run.input.clone(),
            }]
        } else {
            Vec::new()
        };

        let started = {
            let seed = seed.clone();
            self.store
                .call(move |store| {
                    let runs = store.runs();
                    if !runs.start(run_id)?.applied() {
                        return Ok(Transition::Skipped);
                    }
                    runs.append_history(run_id, &seed)
                })
                .await?
        };
        if !started.applied() {
            tracing::debug!(run_id, status = %run.status, "Run not queued; skipping start");
            return Ok(RunProgress::Skipped);
        }

        let mut history = run.history;
        history.extend(seed);
        let ctx = self.context(run_id, run.trace_id);
        tracing::info!(run_id, trace_id = %ctx.trace_id, "Starting supervisor run");
        let turn = self.engine.run_turn(&ctx, &history).await;
        self.apply_turn(&ctx, turn).await
    }

    /// Cancel a run in any non-terminal state. Outstanding jobs keep
    /// running; their results are dropped when the barrier resolves.
    pub async fn cancel_run(&self, run_id: i64) -> CoordResult<Transition> {
        self.get_run(run_id).await?;
        let transition = self
            .store
            .call(move |store| store.runs().cancel(run_id))
            .await?;
        Ok(transition)
    }

    // ── Completion and resume ─────────────────────────────────────────

    /// Feed one worker report into its barrier; drive the resume if this
    /// report won the claim.
    pub async fn report_completion(&self, report: CompletionReport) -> CoordResult<CompletionAck> {
        let CompletionReport {
            run_id,
            job_id,
            worker_id,
            outcome,
        } = report;

        let record = self
            .store
            .call(move |store| {
                match store.worker_jobs().get(job_id)? {
                    Some(job) if job.run_id == run_id => {}
                    _ => return Ok(None),
                }
                match store.barriers().record_completion(job_id, &outcome) {
                    Ok(record) => Ok(Some(record)),
                    Err(e) if matches!(
                        e.downcast_ref::<BarrierError>(),
                        Some(BarrierError::NotRegistered { .. })
                    ) =>
                    {
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            })
            .await?;
        let Some(record) = record else {
            return Err(CoordinatorError::JobNotFound { run_id, job_id });
        };

        tracing::debug!(run_id, job_id, worker_id = %worker_id, ?record, "Completion reported");
        match record {
            CompletionRecord::Counted {
                completed,
                expected,
            } => Ok(CompletionAck::Accepted {
                completed,
                expected,
            }),
            CompletionRecord::Duplicate => Ok(CompletionAck::Duplicate),
            CompletionRecord::Lost { .. } => Ok(CompletionAck::Skipped),
            CompletionRecord::Won { barrier_id, run_id } => {
                let progress = self.resume(barrier_id, run_id).await?;
                Ok(CompletionAck::Resumed { progress })
            }
        }
    }

    /// Resume a run whose barrier this caller claimed (`resuming`).
    ///
    /// Builds one tool result per job, moves the run back to running with
    /// those results appended and closes the barrier, then hands the
    /// history to the engine's continuation.
    pub async fn resume(&self, barrier_id: i64, run_id: i64) -> CoordResult<RunProgress> {
        let jobs = self
            .store
            .call(move |store| store.barriers().jobs(barrier_id))
            .await?;
        let injected = tool_results(&jobs);
        let unsuccessful = jobs
            .iter()
            .filter(|job| job.status != JobStatus::Completed)
            .count();
        let close_as = if unsuccessful == 0 {
            BarrierStatus::Completed
        } else {
            BarrierStatus::Failed
        };

        let resumed = {
            let injected = injected.clone();
            self.store
                .call(move |store| {
                    let runs = store.runs();
                    let transition = runs.resume(run_id, barrier_id, &injected, close_as)?;
                    Ok((transition, runs.get(run_id)?))
                })
                .await?
        };
        let (transition, run) = resumed;
        let Some(run) = run.filter(|_| transition.applied()) else {
            tracing::debug!(run_id, barrier_id, "Run not waiting on barrier; resume skipped");
            return Ok(RunProgress::Skipped);
        };
        tracing::info!(
            run_id,
            barrier_id,
            results = injected.len(),
            unsuccessful,
            "Resuming supervisor run"
        );

        if unsuccessful > 0 && self.settings.failure_policy == FailurePolicy::FailRun {
            let error = format!(
                "{} of {} worker jobs did not succeed",
                unsuccessful,
                jobs.len()
            );
            return self.fail_run(run_id, error, Vec::new()).await;
        }

        let ctx = self.context(run_id, run.trace_id);
        let turn = self
            .engine
            .run_continuation(&ctx, &run.history, &injected)
            .await;
        self.apply_turn(&ctx, turn).await
    }

    /// Persist what a turn produced and act on its outcome.
    async fn apply_turn(
        &self,
        ctx: &RunContext,
        turn: anyhow::Result<Turn>,
    ) -> CoordResult<RunProgress> {
        let run_id = ctx.run_id;
        let turn = match turn {
            Ok(turn) => turn,
            Err(source) => {
                let error = format!("{:#}", source);
                tracing::error!(run_id, trace_id = %ctx.trace_id, error = %error, "Engine call failed");
                self.store
                    .call(move |store| store.runs().fail(run_id, &error, &[]))
                    .await?;
                return Err(CoordinatorError::Continuation { run_id, source });
            }
        };

        match turn.outcome {
            TurnOutcome::Finished { result } => {
                let messages = turn.messages;
                let transition = self
                    .store
                    .call(move |store| store.runs().finish(run_id, &result, &messages))
                    .await?;
                if transition.applied() {
                    tracing::info!(run_id, trace_id = %ctx.trace_id, "Supervisor run finished");
                    Ok(RunProgress::Finished)
                } else {
                    Ok(RunProgress::Skipped)
                }
            }
            TurnOutcome::Failed { error } => self.fail_run(run_id, error, turn.messages).await,
            TurnOutcome::Suspended { spawns } => self.suspend(ctx, turn.messages, spawns).await,
        }
    }

    /// running → waiting on a fresh barrier over `spawns`.
    async fn suspend(
        &self,
        ctx: &RunContext,
        messages: Vec<HistoryEntry>,
        spawns: Vec<SpawnRequest>,
    ) -> CoordResult<RunProgress> {
        let run_id = ctx.run_id;
        if let Err(e) = validate_spawns(run_id, &spawns) {
            return self.fail_run(run_id, e.to_string(), messages).await;
        }

        let mut entries = messages;
        entries.extend(spawns.iter().map(|spawn| HistoryEntry::SpawnRequested {
            tool_call_id: spawn.tool_call_id.clone(),
            job_type: spawn.job_type.clone(),
            payload: spawn.payload.clone(),
        }));
        let timeout = self.settings.barrier_timeout;

        let barrier = self
            .store
            .call(move |store| {
                // Phase 1: inert rows, invisible to workers.
                let mut job_ids = Vec::with_capacity(spawns.len());
                for spawn in &spawns {
                    job_ids.push(store.worker_jobs().create(run_id, spawn)?.id);
                }
                let deadline = timeout.map(|t| store.now() + t);
                // Phase 2 and running → waiting commit together.
                store.runs().suspend(run_id, &job_ids, &entries, deadline)
            })
            .await
            .map_err(classify)?;

        match barrier {
            Some(barrier) => {
                tracing::info!(
                    run_id,
                    trace_id = %ctx.trace_id,
                    barrier_id = barrier.id,
                    jobs = barrier.expected_count,
                    "Supervisor run suspended"
                );
                Ok(RunProgress::Suspended {
                    barrier_id: barrier.id,
                })
            }
            None => Ok(RunProgress::Skipped),
        }
    }

    async fn fail_run(
        &self,
        run_id: i64,
        error: String,
        messages: Vec<HistoryEntry>,
    ) -> CoordResult<RunProgress> {
        let recorded = error.clone();
        let transition = self
            .store
            .call(move |store| store.runs().fail(run_id, &recorded, &messages))
            .await?;
        if transition.applied() {
            tracing::warn!(run_id, error = %error, "Supervisor run failed");
            Ok(RunProgress::Failed { error })
        } else {
            Ok(RunProgress::Skipped)
        }
    }

    fn context(&self, run_id: i64, trace_id: String) -> RunContext {
        RunContext {
            run_id,
            trace_id,
            owner: self.settings.owner.clone(),
        }
    }
}

/// One tool result per job, in registration order.
fn tool_results(jobs: &[BarrierJob]) -> Vec<HistoryEntry> {
    jobs.iter()
        .map(|job| {
            let (status, content) = match job.status {
                JobStatus::Completed => (
                    ToolResultStatus::Success,
                    job.result.clone().unwrap_or_default(),
                ),
                JobStatus::Failed => (
                    ToolResultStatus::Failed,
                    job.error.clone().unwrap_or_default(),
                ),
                JobStatus::Timeout | JobStatus::Created | JobStatus::Queued => (
                    ToolResultStatus::Timeout,
                    job.error
                        .clone()
                        .unwrap_or_else(|| TIMEOUT_ERROR.to_string()),
                ),
            };
            HistoryEntry::ToolResult {
                tool_call_id: job.tool_call_id.clone(),
                status,
                content,
            }
        })
        .collect()
}

fn validate_spawns(run_id: i64, spawns: &[SpawnRequest]) -> std::result::Result<(), BarrierError> {
    if spawns.is_empty() {
        return Err(BarrierError::EmptyBatch { run_id });
    }
    let mut seen = std::collections::HashSet::new();
    for spawn in spawns {
        if !seen.insert(spawn.tool_call_id.as_str()) {
            return Err(BarrierError::DuplicateToolCall {
                tool_call_id: spawn.tool_call_id.clone(),
            });
        }
    }
    Ok(())
}

/// Recover a typed barrier error from the store's `anyhow` chain.
fn classify(err: anyhow::Error) -> CoordinatorError {
    match err.downcast::<BarrierError>() {
        Ok(barrier) => CoordinatorError::Barrier(barrier),
        Err(other) => CoordinatorError::Store(other),
    }
}
