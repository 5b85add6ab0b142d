//! Execution engine contract.
//!
//! The engine decides what a supervisor does on each turn; relay only
//! persists what it returns and acts on the outcome. A turn never throws
//! to suspend: it returns [`TurnOutcome::Suspended`] with the spawn batch.
//!
//! Real implementation: [`CommandEngine`]. Tests supply their own doubles.

pub mod command;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::store::{HistoryEntry, SpawnRequest};

pub use command::{CommandEngine, CommandEngineConfig};

/// Correlation passed explicitly to every engine call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: i64,
    pub trace_id: String,
    /// Identity of the process driving this turn.
    pub owner: String,
}

/// What one engine turn produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Entries to append to the run's history, in order.
    #[serde(default)]
    pub messages: Vec<HistoryEntry>,
    pub outcome: TurnOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnOutcome {
    Finished {
        #[serde(default)]
        result: serde_json::Value,
    },
    /// The engine gave up; the run fails with this error.
    Failed { error: String },
    Suspended { spawns: Vec<SpawnRequest> },
}

impl Turn {
    pub fn finished(messages: Vec<HistoryEntry>, result: serde_json::Value) -> Self {
        Self {
            messages,
            outcome: TurnOutcome::Finished { result },
        }
    }

    pub fn suspended(messages: Vec<HistoryEntry>, spawns: Vec<SpawnRequest>) -> Self {
        Self {
            messages,
            outcome: TurnOutcome::Suspended { spawns },
        }
    }
}

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// First turn of a run. `history` is the persisted history, seeded with
    /// the run input.
    async fn run_turn(&self, ctx: &RunContext, history: &[HistoryEntry]) -> Result<Turn>;

    /// Continue after a barrier resolved. `history` already ends with
    /// `injected`, one tool result per spawned job.
    async fn run_continuation(
        &self,
        ctx: &RunContext,
        history: &[HistoryEntry],
        injected: &[HistoryEntry],
    ) -> Result<Turn>;
}
