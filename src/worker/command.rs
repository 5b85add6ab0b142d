use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{JobContext, JobHandler};
use crate::errors::WorkerError;
use crate::process::{CommandSpec, run_piped};
use crate::store::WorkerTask;

/// Runs a worker task as a child process.
///
/// The task's `payload` is written to stdin as JSON. The trimmed stdout is
/// the result summary; a non-zero exit fails the attempt with the last
/// stderr line.
pub struct CommandJob {
    command: CommandSpec,
    timeout: Option<Duration>,
}

impl CommandJob {
    pub fn new(command: CommandSpec, timeout: Option<Duration>) -> Self {
        Self { command, timeout }
    }
}

#[async_trait]
impl JobHandler for CommandJob {
    async fn run(&self, ctx: &JobContext, payload: &serde_json::Value) -> Result<Option<String>> {
        let task: WorkerTask =
            serde_json::from_value(payload.clone()).map_err(|e| WorkerError::InvalidPayload {
                entry_id: ctx.entry_id,
                message: e.to_string(),
            })?;
        let input = serde_json::to_vec(&task.payload).context("Failed to encode task payload")?;
        let envs = [
            ("RELAY_RUN_ID", task.run_id.to_string()),
            ("RELAY_JOB_ID", task.job_id.to_string()),
            ("RELAY_TOOL_CALL_ID", task.tool_call_id.clone()),
            ("RELAY_ATTEMPT", ctx.attempts.to_string()),
        ];
        let output = run_piped(&self.command, &envs, input, self.timeout)
            .await
            .with_context(|| format!("Worker job {} did not run", task.job_id))?;
        if !output.success() {
            anyhow::bail!(
                "'{}' failed for job {}: {}",
                self.command.display(),
                task.job_id,
                output.failure_summary()
            );
        }
        let summary = output.stdout.trim();
        Ok((!summary.is_empty()).then(|| summary.to_string()))
    }
}
