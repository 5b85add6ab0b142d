use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Job queue ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Leased,
    Done,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Leased => "leased",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "leased" => Ok(Self::Leased),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid queue status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub scheduled_for: DateTime<Utc>,
    pub dedupe_key: Option<String>,
    pub status: QueueStatus,
    pub attempts: u32,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of an enqueue. A dedupe-key collision is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Inserted(i64),
    Duplicate,
}

impl Enqueued {
    pub fn id(&self) -> Option<i64> {
        match self {
            Self::Inserted(id) => Some(*id),
            Self::Duplicate => None,
        }
    }
}

// ── Worker jobs and barriers ──────────────────────────────────────────

/// Status shared by `worker_jobs` and `barrier_jobs`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Queued,
    Completed,
    Failed,
    Timeout,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "queued" => Ok(Self::Queued),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerJob {
    pub id: i64,
    pub run_id: i64,
    pub tool_call_id: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BarrierStatus {
    Waiting,
    Resuming,
    Completed,
    Failed,
}

impl BarrierStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Resuming => "resuming",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for BarrierStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BarrierStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "resuming" => Ok(Self::Resuming),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid barrier status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Barrier {
    pub id: i64,
    pub run_id: i64,
    pub expected_count: u32,
    pub completed_count: u32,
    pub status: BarrierStatus,
    pub deadline_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarrierJob {
    pub id: i64,
    pub barrier_id: i64,
    pub job_id: i64,
    pub tool_call_id: String,
    pub status: JobStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub attempt_count: u32,
    pub completed_at: Option<DateTime<Utc>>,
}

/// What a worker reports back for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerOutcome {
    Success { result: Option<String> },
    Failed { error: String },
}

/// Queue payload for one activated worker job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerTask {
    pub run_id: i64,
    pub barrier_id: i64,
    pub job_id: i64,
    pub tool_call_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// A barrier whose deadline passed and whose resume claim this caller won.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedOut {
    pub barrier_id: i64,
    pub run_id: i64,
    /// Jobs that had not reported and were marked `timeout`.
    pub timed_out: u32,
}

/// Result of feeding one completion report into a barrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionRecord {
    /// Counted; the barrier is still waiting on others.
    Counted { completed: u32, expected: u32 },
    /// Counted, the barrier is full, and this caller won the resume claim.
    Won { barrier_id: i64, run_id: i64 },
    /// Counted and full, but another caller already claimed the resume.
    Lost { completed: u32, expected: u32 },
    /// The job was already terminal (redelivery, or it timed out first).
    Duplicate,
}

// ── Supervisor runs ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Waiting,
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "waiting" => Ok(Self::Waiting),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorRun {
    pub id: i64,
    pub status: RunStatus,
    pub waiting_on_barrier_id: Option<i64>,
    pub input: serde_json::Value,
    pub history: Vec<HistoryEntry>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub trace_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Outcome of a guarded state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The run was not in the required state; nothing was written.
    Skipped,
}

impl Transition {
    pub fn applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

// ── Turn history ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolResultStatus {
    Success,
    Failed,
    Timeout,
}

/// One persisted step of a supervisor run. The ordered list is enough to
/// continue the run without replaying earlier side effects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEntry {
    Message {
        role: Role,
        content: serde_json::Value,
    },
    SpawnRequested {
        tool_call_id: String,
        job_type: String,
        payload: serde_json::Value,
    },
    ToolResult {
        tool_call_id: String,
        status: ToolResultStatus,
        content: String,
    },
}

impl HistoryEntry {
    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            Self::SpawnRequested { tool_call_id, .. } | Self::ToolResult { tool_call_id, .. } => {
                Some(tool_call_id)
            }
            Self::Message { .. } => None,
        }
    }
}

/// One worker the engine asked for in a turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpawnRequest {
    /// Caller-chosen token mapping the eventual result back to the turn.
    pub tool_call_id: String,
    #[serde(default = "default_worker_job_type")]
    pub job_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

fn default_worker_job_type() -> String {
    crate::store::WORKER_JOB_TYPE.to_string()
}

impl SpawnRequest {
    pub fn new(tool_call_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            job_type: default_worker_job_type(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in [
            QueueStatus::Pending,
            QueueStatus::Leased,
            QueueStatus::Done,
            QueueStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<QueueStatus>().unwrap(), status);
        }
        for status in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Waiting,
            RunStatus::Success,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<BarrierStatus>().is_err());
        assert!("leased".parse::<JobStatus>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Waiting.is_terminal());
        assert!(JobStatus::Timeout.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(BarrierStatus::Failed.is_terminal());
        assert!(!BarrierStatus::Resuming.is_terminal());
    }

    #[test]
    fn history_entry_is_tagged_by_kind() {
        let entry = HistoryEntry::ToolResult {
            tool_call_id: "call_a".into(),
            status: ToolResultStatus::Timeout,
            content: "timed out".into(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["kind"], "tool_result");
        assert_eq!(json["status"], "timeout");
        assert_eq!(entry.tool_call_id(), Some("call_a"));
    }

    #[test]
    fn spawn_request_defaults_job_type() {
        let spawn: SpawnRequest =
            serde_json::from_str(r#"{"tool_call_id": "call_1", "payload": {"cmd": "ls"}}"#)
                .unwrap();
        assert_eq!(spawn.job_type, crate::store::WORKER_JOB_TYPE);
        assert_eq!(spawn.payload["cmd"], "ls");
    }

    #[test]
    fn worker_outcome_uses_status_tag() {
        let outcome: WorkerOutcome =
            serde_json::from_str(r#"{"status": "failed", "error": "boom"}"#).unwrap();
        assert_eq!(
            outcome,
            WorkerOutcome::Failed {
                error: "boom".into()
            }
        );
    }
}
