//! Wire envelope for the per-agent duplex channel.
//!
//! Every message is one JSON object per line, tagged with `type` and carrying
//! its fields under `payload`, so each line is self-describing on both sides
//! of the connection. Agents speak [`AgentMessage`]; the control plane
//! replies with [`ServerMessage`].

use serde::{Deserialize, Serialize};

/// Outcome an agent reports for one executed technique.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The technique was prevented from running by a control.
    Blocked,
    /// The technique ran but a control observed and flagged it.
    Detected,
    /// The technique ran to completion unobserved.
    Success,
    /// The technique could not be executed at all (missing interpreter,
    /// malformed command). Not counted for or against the posture score.
    ExecutionFailed,
}

/// Messages sent from an agent to the control plane.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Establishes (or refreshes) the agent's connection and inventory.
    Register {
        paw: String,
        hostname: String,
        platform: String,
        executors: Vec<String>,
    },

    /// Periodic liveness signal.
    Heartbeat { paw: String },

    /// Result for one previously dispatched task.
    TaskResult {
        task_id: String,
        outcome: Outcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
}

/// Messages sent from the control plane to an agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    /// One technique invocation for the agent to run.
    Task {
        id: String,
        execution_id: String,
        technique_id: String,
        command: String,
        executor: String,
        timeout_secs: u64,
    },

    /// Registration acknowledgment. Agents may ignore it; it exists so an
    /// agent can synchronize on its channel being installed.
    Ack { paw: String },
}
