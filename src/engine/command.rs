use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use super::{ExecutionEngine, RunContext, Turn};
use crate::process::{CommandSpec, run_piped};
use crate::store::HistoryEntry;

#[derive(Debug, Clone)]
pub struct CommandEngineConfig {
    pub command: CommandSpec,
    /// Upper bound on one turn; `None` waits forever.
    pub turn_timeout: Option<Duration>,
}

/// Runs each turn as a child process.
///
/// The child receives an [`EngineRequest`] as JSON on stdin and must print
/// one JSON [`Turn`] on stdout. A non-zero exit or unparseable output is an
/// engine error, which the coordinator treats as fatal to the run.
pub struct CommandEngine {
    config: CommandEngineConfig,
}

#[derive(Debug, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
enum EngineRequest<'a> {
    Turn {
        context: &'a RunContext,
        history: &'a [HistoryEntry],
    },
    Continuation {
        context: &'a RunContext,
        history: &'a [HistoryEntry],
        injected: &'a [HistoryEntry],
    },
}

impl CommandEngine {
    pub fn new(config: CommandEngineConfig) -> Self {
        Self { config }
    }

    async fn invoke(&self, ctx: &RunContext, request: &EngineRequest<'_>) -> Result<Turn> {
        let input = serde_json::to_vec(request).context("Failed to serialize engine request")?;
        let envs = [
            ("RELAY_RUN_ID", ctx.run_id.to_string()),
            ("RELAY_TRACE_ID", ctx.trace_id.clone()),
        ];
        let output = run_piped(&self.config.command, &envs, input, self.config.turn_timeout)
            .await
            .with_context(|| format!("Engine turn for run {} failed to run", ctx.run_id))?;
        if !output.success() {
            anyhow::bail!(
                "Engine '{}' failed for run {}: {}",
                self.config.command.display(),
                ctx.run_id,
                output.failure_summary()
            );
        }
        parse_turn(&output.stdout)
            .with_context(|| format!("Engine returned an invalid turn for run {}", ctx.run_id))
    }
}

/// The last non-empty stdout line is the turn; anything before it is
/// engine chatter.
fn parse_turn(stdout: &str) -> Result<Turn> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .context("Engine produced no output")?;
    serde_json::from_str(line).context("Failed to parse engine turn JSON")
}

#[async_trait]
impl ExecutionEngine for CommandEngine {
    async fn run_turn(&self, ctx: &RunContext, history: &[HistoryEntry]) -> Result<Turn> {
        tracing::debug!(run_id = ctx.run_id, trace_id = %ctx.trace_id, "Invoking engine turn");
        self.invoke(ctx, &EngineRequest::Turn { context: ctx, history })
            .await
    }

    async fn run_continuation(
        &self,
        ctx: &RunContext,
        history: &[HistoryEntry],
        injected: &[HistoryEntry],
    ) -> Result<Turn> {
        tracing::debug!(
            run_id = ctx.run_id,
            trace_id = %ctx.trace_id,
            injected = injected.len(),
            "Invoking engine continuation"
        );
        self.invoke(
            ctx,
            &EngineRequest::Continuation {
                context: ctx,
                history,
                injected,
            },
        )
        .await
    }
}
