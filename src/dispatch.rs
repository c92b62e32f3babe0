//! Task dispatch and result correlation.
//!
//! [`TaskDispatcher`] sends task envelopes to agents through the registry
//! and matches asynchronous result messages back to outstanding tasks. It
//! wraps a `HashMap` of outstanding tasks behind `Arc<Mutex<..>>`; the
//! remove-if-present on that map is the single arbitration point for a
//! task's terminal transition, so whichever event arrives first -- result,
//! timeout, agent disconnect, or execution cancel -- wins, and the losers
//! are no-ops. Duplicate or late results fall into the "not outstanding"
//! case and are silently discarded.
//!
//! Terminal transitions are reported as [`TaskCompletion`]s on the owning
//! execution's channel, so the coordinator can wait for phase completion
//! event-driven instead of polling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::execution::types::{ExecutionId, FailReason, TaskId, TaskResult, TaskStatus};
use crate::protocol::{Outcome, ServerMessage};
use crate::registry::{ConnectionRegistry, Paw};

/// The dispatchable fields of a task, handed over by the coordinator.
#[derive(Clone, Debug)]
pub struct TaskAssignment {
    pub task_id: TaskId,
    pub execution_id: ExecutionId,
    pub agent_paw: Paw,
    pub technique_id: String,
    pub command: String,
    pub executor: String,
    pub timeout_secs: u64,
}

/// One terminal transition, delivered to the owning execution's channel.
/// `status` is always terminal.
#[derive(Clone, Debug)]
pub struct TaskCompletion {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub result: Option<TaskResult>,
}

/// A dispatched task awaiting its result.
struct Outstanding {
    agent_paw: Paw,
    execution_id: ExecutionId,
    completion_tx: UnboundedSender<TaskCompletion>,
    timer_cancel: CancellationToken,
}

/// Dispatcher / correlator. Cheap to clone; all clones share the same
/// outstanding map.
#[derive(Clone)]
pub struct TaskDispatcher {
    registry: ConnectionRegistry,
    outstanding: Arc<Mutex<HashMap<TaskId, Outstanding>>>,
}

impl TaskDispatcher {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self {
            registry,
            outstanding: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Send one task to its agent and start its timeout timer.
    ///
    /// When the agent has no live connection the task is reported terminal
    /// `Failed(AgentUnreachable)` immediately and never becomes outstanding;
    /// there is no retry. The outstanding entry is installed before the send
    /// so a result racing the dispatch cannot be dropped as unknown.
    pub fn dispatch(&self, assignment: TaskAssignment, completion_tx: UnboundedSender<TaskCompletion>) {
        let timer_cancel = CancellationToken::new();
        {
            let mut outstanding = self.outstanding.lock().unwrap();
            outstanding.insert(
                assignment.task_id.clone(),
                Outstanding {
                    agent_paw: assignment.agent_paw.clone(),
                    execution_id: assignment.execution_id.clone(),
                    completion_tx: completion_tx.clone(),
                    timer_cancel: timer_cancel.clone(),
                },
            );
        }

        let message = ServerMessage::Task {
            id: assignment.task_id.clone(),
            execution_id: assignment.execution_id.clone(),
            technique_id: assignment.technique_id.clone(),
            command: assignment.command.clone(),
            executor: assignment.executor.clone(),
            timeout_secs: assignment.timeout_secs,
        };

        if let Err(error) = self.registry.send(&assignment.agent_paw, message) {
            tracing::info!(
                task_id = %assignment.task_id,
                paw = %assignment.agent_paw,
                %error,
                "dispatch failed, agent unreachable"
            );
            // Still-present check: an offline drain may have raced us and
            // already reported this task.
            let was_outstanding = self
                .outstanding
                .lock()
                .unwrap()
                .remove(&assignment.task_id)
                .is_some();
            if was_outstanding {
                let _ = completion_tx.send(TaskCompletion {
                    task_id: assignment.task_id,
                    status: TaskStatus::Failed(FailReason::AgentUnreachable),
                    result: None,
                });
            }
            return;
        }

        tracing::debug!(
            task_id = %assignment.task_id,
            paw = %assignment.agent_paw,
            technique_id = %assignment.technique_id,
            "task dispatched"
        );

        let dispatcher = self.clone();
        let task_id = assignment.task_id;
        let timeout = Duration::from_secs(assignment.timeout_secs);
        tokio::spawn(async move {
            tokio::select! {
                _ = timer_cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => dispatcher.on_timeout(&task_id),
            }
        });
    }

    /// Correlate one inbound result with its outstanding task.
    ///
    /// Unknown or already-terminal task ids are duplicate deliveries and
    /// are discarded without effect. A result arriving from a paw other
    /// than the one the task was dispatched to is discarded the same way.
    pub fn on_result(&self, paw: &str, task_id: &str, outcome: Outcome, output: Option<String>) {
        let entry = {
            let mut outstanding = self.outstanding.lock().unwrap();
            match outstanding.get(task_id) {
                Some(entry) if entry.agent_paw == paw => {}
                Some(_) => {
                    tracing::debug!(task_id = %task_id, paw = %paw, "result paw mismatch, discarding");
                    return;
                }
                None => {
                    tracing::debug!(task_id = %task_id, paw = %paw, "duplicate or unknown result, discarding");
                    return;
                }
            }
            outstanding.remove(task_id)
        };
        let Some(entry) = entry else { return };

        entry.timer_cancel.cancel();
        let status = match outcome {
            Outcome::ExecutionFailed => TaskStatus::Failed(FailReason::ExecutionFailed),
            _ => TaskStatus::Completed,
        };
        let result = TaskResult {
            outcome,
            output,
            reported_at: Utc::now().to_rfc3339(),
        };
        let _ = entry.completion_tx.send(TaskCompletion {
            task_id: task_id.to_string(),
            status,
            result: Some(result),
        });
    }

    /// Timer expiry for one task. A no-op when a result already won.
    fn on_timeout(&self, task_id: &str) {
        let entry = self.outstanding.lock().unwrap().remove(task_id);
        let Some(entry) = entry else { return };

        tracing::info!(task_id = %task_id, paw = %entry.agent_paw, "task timed out");
        let _ = entry.completion_tx.send(TaskCompletion {
            task_id: task_id.to_string(),
            status: TaskStatus::TimedOut,
            result: None,
        });
    }

    /// Fail every outstanding task assigned to `paw`, without waiting for
    /// the per-task timeouts. Driven by liveness Offline events.
    pub fn on_agent_offline(&self, paw: &str) {
        self.drain_where(FailReason::AgentDisconnected, |entry| entry.agent_paw == paw);
    }

    /// Fail every outstanding task of one execution. Driven by cancel.
    pub fn cancel_for_execution(&self, execution_id: &str) {
        self.drain_where(FailReason::Cancelled, |entry| {
            entry.execution_id == execution_id
        });
    }

    fn drain_where(&self, reason: FailReason, predicate: impl Fn(&Outstanding) -> bool) {
        let drained: Vec<(TaskId, Outstanding)> = {
            let mut outstanding = self.outstanding.lock().unwrap();
            let ids: Vec<TaskId> = outstanding
                .iter()
                .filter(|(_, entry)| predicate(entry))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| outstanding.remove(&id).map(|entry| (id, entry)))
                .collect()
        };
        for (task_id, entry) in drained {
            entry.timer_cancel.cancel();
            tracing::info!(task_id = %task_id, paw = %entry.agent_paw, %reason, "outstanding task failed");
            let _ = entry.completion_tx.send(TaskCompletion {
                task_id,
                status: TaskStatus::Failed(reason),
                result: None,
            });
        }
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{self, UnboundedReceiver};
    use uuid::Uuid;

    fn assignment(task_id: &str, paw: &str, timeout_secs: u64) -> TaskAssignment {
        TaskAssignment {
            task_id: task_id.to_string(),
            execution_id: "x-1".to_string(),
            agent_paw: paw.to_string(),
            technique_id: "T1082".to_string(),
            command: "uname -a".to_string(),
            executor: "sh".to_string(),
            timeout_secs,
        }
    }

    /// Registry with one connected fake agent; returns the agent's inbound
    /// message stream.
    fn connected_registry(paw: &str) -> (ConnectionRegistry, UnboundedReceiver<ServerMessage>) {
        let (registry, _events) = ConnectionRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(paw, Uuid::new_v4(), tx, CancellationToken::new());
        (registry, rx)
    }

    #[tokio::test]
    async fn dispatch_to_unconnected_agent_fails_immediately() {
        let (registry, _events) = ConnectionRegistry::new();
        let dispatcher = TaskDispatcher::new(registry);
        let (completion_tx, mut completions) = mpsc::unbounded_channel();

        dispatcher.dispatch(assignment("t-1", "ghost", 300), completion_tx);

        let completion = completions.recv().await.unwrap();
        assert_eq!(completion.task_id, "t-1");
        assert_eq!(
            completion.status,
            TaskStatus::Failed(FailReason::AgentUnreachable)
        );
        assert_eq!(dispatcher.outstanding_count(), 0);
    }

    #[tokio::test]
    async fn result_completes_outstanding_task() {
        let (registry, mut agent_rx) = connected_registry("a1");
        let dispatcher = TaskDispatcher::new(registry);
        let (completion_tx, mut completions) = mpsc::unbounded_channel();

        dispatcher.dispatch(assignment("t-1", "a1", 300), completion_tx);
        assert!(matches!(
            agent_rx.recv().await,
            Some(ServerMessage::Task { .. })
        ));

        dispatcher.on_result("a1", "t-1", Outcome::Blocked, Some("denied".into()));

        let completion = completions.recv().await.unwrap();
        assert_eq!(completion.status, TaskStatus::Completed);
        assert_eq!(completion.result.unwrap().outcome, Outcome::Blocked);
        assert_eq!(dispatcher.outstanding_count(), 0);
    }

    #[tokio::test]
    async fn execution_failed_outcome_maps_to_failed_status() {
        let (registry, _agent_rx) = connected_registry("a1");
        let dispatcher = TaskDispatcher::new(registry);
        let (completion_tx, mut completions) = mpsc::unbounded_channel();

        dispatcher.dispatch(assignment("t-1", "a1", 300), completion_tx);
        dispatcher.on_result("a1", "t-1", Outcome::ExecutionFailed, None);

        let completion = completions.recv().await.unwrap();
        assert_eq!(
            completion.status,
            TaskStatus::Failed(FailReason::ExecutionFailed)
        );
    }

    #[tokio::test]
    async fn duplicate_result_is_discarded() {
        let (registry, _agent_rx) = connected_registry("a1");
        let dispatcher = TaskDispatcher::new(registry);
        let (completion_tx, mut completions) = mpsc::unbounded_channel();

        dispatcher.dispatch(assignment("t-1", "a1", 300), completion_tx);
        dispatcher.on_result("a1", "t-1", Outcome::Success, None);
        dispatcher.on_result("a1", "t-1", Outcome::Blocked, None);

        let first = completions.recv().await.unwrap();
        assert_eq!(first.result.unwrap().outcome, Outcome::Success);
        assert!(completions.try_recv().is_err());
    }

    #[tokio::test]
    async fn result_from_wrong_paw_is_discarded() {
        let (registry, _agent_rx) = connected_registry("a1");
        let dispatcher = TaskDispatcher::new(registry);
        let (completion_tx, mut completions) = mpsc::unbounded_channel();

        dispatcher.dispatch(assignment("t-1", "a1", 300), completion_tx);
        dispatcher.on_result("impostor", "t-1", Outcome::Success, None);

        assert!(completions.try_recv().is_err());
        assert_eq!(dispatcher.outstanding_count(), 1);
    }

    #[tokio::test]
    async fn timeout_fires_when_no_result_arrives() {
        let (registry, _agent_rx) = connected_registry("a1");
        let dispatcher = TaskDispatcher::new(registry);
        let (completion_tx, mut completions) = mpsc::unbounded_channel();

        dispatcher.dispatch(assignment("t-1", "a1", 0), completion_tx);

        let completion = completions.recv().await.unwrap();
        assert_eq!(completion.status, TaskStatus::TimedOut);
        assert!(completion.result.is_none());

        // A result after the timeout is a late duplicate.
        dispatcher.on_result("a1", "t-1", Outcome::Success, None);
        assert!(completions.try_recv().is_err());
    }

    #[tokio::test]
    async fn agent_offline_fails_only_that_agents_tasks() {
        let (registry, _a1_rx) = connected_registry("a1");
        let (a2_tx, _a2_rx) = mpsc::unbounded_channel();
        registry.register("a2", Uuid::new_v4(), a2_tx, CancellationToken::new());
        let dispatcher = TaskDispatcher::new(registry);
        let (completion_tx, mut completions) = mpsc::unbounded_channel();

        dispatcher.dispatch(assignment("t-1", "a1", 300), completion_tx.clone());
        dispatcher.dispatch(assignment("t-2", "a2", 300), completion_tx);

        dispatcher.on_agent_offline("a1");

        let completion = completions.recv().await.unwrap();
        assert_eq!(completion.task_id, "t-1");
        assert_eq!(
            completion.status,
            TaskStatus::Failed(FailReason::AgentDisconnected)
        );
        assert!(completions.try_recv().is_err());
        assert_eq!(dispatcher.outstanding_count(), 1);
    }

    #[tokio::test]
    async fn cancel_for_execution_drains_outstanding() {
        let (registry, _agent_rx) = connected_registry("a1");
        let dispatcher = TaskDispatcher::new(registry);
        let (completion_tx, mut completions) = mpsc::unbounded_channel();

        dispatcher.dispatch(assignment("t-1", "a1", 300), completion_tx.clone());
        dispatcher.dispatch(assignment("t-2", "a1", 300), completion_tx);

        dispatcher.cancel_for_execution("x-1");

        let mut statuses = vec![
            completions.recv().await.unwrap().status,
            completions.recv().await.unwrap().status,
        ];
        statuses.dedup();
        assert_eq!(statuses, vec![TaskStatus::Failed(FailReason::Cancelled)]);
        assert_eq!(dispatcher.outstanding_count(), 0);
    }
}
