//! Typed error hierarchy for relay.
//!
//! One enum per subsystem:
//! - `BarrierError`: batch registration and completion bookkeeping
//! - `RunError`: supervisor run lookups
//! - `WorkerError`: queue-driven job execution
//! - `CoordinatorError`: the resume path, including the one fatal case
//!
//! The store layer itself returns `anyhow::Result`; these types are wrapped
//! into it and recovered with `downcast_ref` where a caller needs to match.

use thiserror::Error;

/// Errors from two-phase barrier registration and completion reporting.
#[derive(Debug, Error)]
pub enum BarrierError {
    #[error("Cannot register a barrier with no worker jobs for run {run_id}")]
    EmptyBatch { run_id: i64 },

    #[error("Duplicate tool_call_id '{tool_call_id}' in one spawn batch")]
    DuplicateToolCall { tool_call_id: String },

    #[error("Run {run_id} already has an active barrier")]
    ActiveBarrierExists { run_id: i64 },

    #[error("Worker job {job_id} is not in the created state")]
    JobNotCreated { job_id: i64 },

    #[error("Worker job {job_id} belongs to run {actual}, not run {expected}")]
    JobRunMismatch {
        job_id: i64,
        expected: i64,
        actual: i64,
    },

    #[error("Worker job {job_id} is not registered with any barrier")]
    NotRegistered { job_id: i64 },
}

/// Errors from the supervisor run state machine.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Supervisor run {id} not found")]
    NotFound { id: i64 },
}

/// Errors from executing a claimed queue entry.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("No job definition registered for job type '{0}'")]
    UnknownJobType(String),

    #[error("Lease on queue entry {entry_id} lost by {owner}")]
    LeaseLost { entry_id: i64, owner: String },

    #[error("Invalid payload for queue entry {entry_id}: {message}")]
    InvalidPayload { entry_id: i64, message: String },

    /// The outcome was recorded, but the continuation it drove failed and
    /// the run is now failed. Re-running the job cannot change that.
    #[error("Completion for job {job_id} was recorded but run {run_id} failed: {message}")]
    RunFailed {
        run_id: i64,
        job_id: i64,
        message: String,
    },
}

/// Errors from the resume coordinator.
///
/// Only `Continuation` is fatal to a run; everything else is either a
/// lookup failure at the boundary or a store failure.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Run(#[from] RunError),

    #[error("Worker job {job_id} not found for run {run_id}")]
    JobNotFound { run_id: i64, job_id: i64 },

    #[error("Engine call for run {run_id} failed: {source}")]
    Continuation {
        run_id: i64,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Barrier(#[from] BarrierError),

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl CoordinatorError {
    /// Whether this error ended the run it was raised for.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(self, CoordinatorError::Continuation { .. })
    }
}
