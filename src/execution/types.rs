//! Type definitions for executions and their tasks.
//!
//! These types form the shared vocabulary between the coordinator, the
//! dispatcher (which reports terminal transitions), and the persistence
//! sink. All of them serialize for reporting and audit records.

use std::fmt;

use serde::Serialize;

use crate::protocol::Outcome;
use crate::registry::Paw;

/// Unique identifier for an execution. UUID v4 strings, readable in logs.
pub type ExecutionId = String;

/// Unique identifier for a task.
pub type TaskId = String;

/// Why a task failed. Recorded as data; task failures never abort the
/// execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    /// `send` failed because the agent had no live connection. Distinct
    /// from a timeout on an agent that accepted the task but went silent.
    AgentUnreachable,
    /// The agent's liveness timed out while the task was outstanding.
    AgentDisconnected,
    /// The execution was cancelled while the task was in flight.
    Cancelled,
    /// The agent reported it could not execute the command at all.
    ExecutionFailed,
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailReason::AgentUnreachable => "agent_unreachable",
            FailReason::AgentDisconnected => "agent_disconnected",
            FailReason::Cancelled => "cancelled",
            FailReason::ExecutionFailed => "execution_failed",
        };
        f.write_str(name)
    }
}

/// Lifecycle status of a task. Set to a terminal value exactly once;
/// a late or duplicate result for an already-terminal task is discarded.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Sent to the agent, awaiting a result.
    Dispatched,
    /// The agent reported an outcome.
    Completed,
    /// Failed locally or reported unexecutable.
    Failed(FailReason),
    /// No result arrived within the task's deadline.
    TimedOut,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Dispatched)
    }
}

/// Outcome reported for a task, attached to exactly one task.
#[derive(Clone, Debug, Serialize)]
pub struct TaskResult {
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// ISO 8601 timestamp when the result arrived.
    pub reported_at: String,
}

/// One technique invocation assigned to one agent within one phase of one
/// execution.
#[derive(Clone, Debug, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub execution_id: ExecutionId,
    pub phase_index: usize,
    pub technique_id: String,
    pub agent_paw: Paw,
    pub command: String,
    pub executor: String,
    /// Safety verdict for the technique, fixed when the execution started.
    pub safe: bool,
    pub status: TaskStatus,
    /// ISO 8601 timestamp when the task was dispatched.
    pub dispatched_at: String,
    pub result: Option<TaskResult>,
}

/// Lifecycle status of an execution. Transitions are monotone and acyclic:
/// pending -> running -> {completed, cancelled, failed}; the three
/// right-hand states are terminal.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed(String),
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Cancelled | ExecutionStatus::Failed(_)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Pending => f.write_str("pending"),
            ExecutionStatus::Running => f.write_str("running"),
            ExecutionStatus::Completed => f.write_str("completed"),
            ExecutionStatus::Cancelled => f.write_str("cancelled"),
            ExecutionStatus::Failed(reason) => write!(f, "failed({reason})"),
        }
    }
}

/// One run of a scenario against a set of target agents.
#[derive(Clone, Debug, Serialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub scenario_id: String,
    pub status: ExecutionStatus,
    pub safe_mode: bool,
    /// Index of the phase currently (or last) in flight. Only increases
    /// while running and never reaches `phase_count`.
    pub current_phase_index: usize,
    pub phase_count: usize,
    pub target_agents: Vec<Paw>,
    /// ISO 8601 creation timestamp.
    pub created_at: String,
    /// ISO 8601 timestamp of the terminal transition.
    pub completed_at: Option<String>,
    /// Posture score over reported outcomes. `None` means undefined (no
    /// countable outcomes), which is distinct from a score of zero.
    pub score: Option<f64>,
}
