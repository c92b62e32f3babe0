//! Execution coordinator: drives one attack execution through its phases.
//!
//! [`ExecutionCoordinator`] is the single owner of Execution and Task state
//! for the lifetime of a run. Each started execution gets its own run loop
//! task and its own completion channel; the dispatcher reports every task's
//! terminal transition on that channel, so waiting for a phase is a plain
//! event-driven receive -- never a poll.
//!
//! **State machine:** pending -> running -> {completed, cancelled, failed}.
//! `failed` is reachable only from start-time validation
//! (no_runnable_techniques); once running, task-level failures are data and
//! the only exits are completed and cancelled.
//!
//! **Phase ordering:** phase N+1's tasks are never created before every task
//! of phase N is terminal. Within a phase, tasks run concurrently across
//! agents and techniques with no ordering guarantee.
//!
//! **Cancellation model:** each run holds a child of the coordinator's root
//! token. `cancel` fires the child only when the execution is running; the
//! run loop observes it, drains the in-flight phase through the dispatcher
//! (those tasks fail with reason `cancelled`), and never starts another
//! phase. Cancelling the root cascades to every in-flight run on shutdown.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog::{SafetyClassifier, ScenarioStore, Technique};
use crate::dispatch::{TaskAssignment, TaskCompletion, TaskDispatcher};
use crate::error::ExecutionError;
use crate::liveness::{AgentStatus, LivenessTracker};
use crate::persist::PersistenceSink;
use crate::registry::Paw;

use super::score::posture_score;
use super::types::{Execution, ExecutionId, ExecutionStatus, Task, TaskId, TaskStatus};

/// A technique admitted into the execution plan, with its safety verdict
/// fixed at start time. Catalog changes do not affect in-flight runs.
#[derive(Clone)]
struct PlannedTechnique {
    technique: Technique,
    safe: bool,
}

/// Book-keeping for one execution: the shared record, its task set, and the
/// token that cancels its run loop.
struct ExecutionHandle {
    record: Arc<Mutex<Execution>>,
    tasks: Arc<Mutex<HashMap<TaskId, Task>>>,
    cancel: CancellationToken,
}

/// Coordinator for all executions. Designed to be wrapped in `Arc` and
/// shared between the wire layer and any embedding API surface.
pub struct ExecutionCoordinator {
    executions: Arc<Mutex<HashMap<ExecutionId, ExecutionHandle>>>,
    dispatcher: TaskDispatcher,
    liveness: LivenessTracker,
    store: Arc<dyn ScenarioStore>,
    classifier: Arc<dyn SafetyClassifier>,
    sink: Arc<dyn PersistenceSink>,
    default_task_timeout_secs: u64,
    root_cancel: CancellationToken,
}

/// Everything a run loop needs, cloned out of the coordinator so the loop
/// owns its context outright.
struct RunContext {
    execution_id: ExecutionId,
    record: Arc<Mutex<Execution>>,
    tasks: Arc<Mutex<HashMap<TaskId, Task>>>,
    cancel: CancellationToken,
    plan: Vec<Vec<PlannedTechnique>>,
    targets: Vec<Paw>,
    dispatcher: TaskDispatcher,
    sink: Arc<dyn PersistenceSink>,
    default_task_timeout_secs: u64,
}

impl ExecutionCoordinator {
    pub fn new(
        dispatcher: TaskDispatcher,
        liveness: LivenessTracker,
        store: Arc<dyn ScenarioStore>,
        classifier: Arc<dyn SafetyClassifier>,
        sink: Arc<dyn PersistenceSink>,
        default_task_timeout_secs: u64,
        root_cancel: CancellationToken,
    ) -> Self {
        Self {
            executions: Arc::new(Mutex::new(HashMap::new())),
            dispatcher,
            liveness,
            store,
            classifier,
            sink,
            default_task_timeout_secs,
            root_cancel,
        }
    }

    /// Start an execution of `scenario_id` against `target_paws`.
    ///
    /// Validates the scenario and targets, fixes the safety-filtered plan,
    /// then spawns the run loop and returns the execution id immediately.
    /// A plan with zero runnable tasks across all phases fails the
    /// execution at creation with `no_runnable_techniques`; the failed
    /// record remains queryable under the id carried in the error.
    pub fn start(
        &self,
        scenario_id: &str,
        target_paws: Vec<Paw>,
        safe_mode: bool,
    ) -> Result<ExecutionId, ExecutionError> {
        let Some(scenario) = self.store.scenario(scenario_id) else {
            return Err(ExecutionError::ScenarioNotFound {
                scenario_id: scenario_id.to_string(),
            });
        };
        if target_paws.is_empty() {
            return Err(ExecutionError::NoTargets);
        }
        for paw in &target_paws {
            let online = self
                .liveness
                .agent(paw)
                .is_some_and(|agent| agent.status == AgentStatus::Online);
            if !online {
                tracing::warn!(paw = %paw, "target agent not online at execution start");
            }
        }

        // Resolve the plan; safety verdicts are fixed here, once.
        let mut plan: Vec<Vec<PlannedTechnique>> = Vec::with_capacity(scenario.phases.len());
        for phase in &scenario.phases {
            let mut planned = Vec::new();
            for technique_id in &phase.techniques {
                let Some(technique) = self.store.technique(technique_id) else {
                    tracing::warn!(
                        technique_id = %technique_id,
                        scenario_id = %scenario.id,
                        "technique missing from catalog, skipping"
                    );
                    continue;
                };
                let safe = self.classifier.is_safe(&technique);
                if safe_mode && !safe {
                    tracing::info!(
                        technique_id = %technique_id,
                        "safe mode: destructive technique excluded"
                    );
                    continue;
                }
                planned.push(PlannedTechnique { technique, safe });
            }
            plan.push(planned);
        }

        let execution_id: ExecutionId = Uuid::new_v4().to_string();
        let mut execution = Execution {
            id: execution_id.clone(),
            scenario_id: scenario.id.clone(),
            status: ExecutionStatus::Pending,
            safe_mode,
            current_phase_index: 0,
            phase_count: scenario.phases.len(),
            target_agents: target_paws.clone(),
            created_at: Utc::now().to_rfc3339(),
            completed_at: None,
            score: None,
        };

        let runnable: usize = plan.iter().map(|phase| phase.len()).sum();
        if runnable == 0 {
            execution.status = ExecutionStatus::Failed("no_runnable_techniques".to_string());
            execution.completed_at = Some(Utc::now().to_rfc3339());
            tracing::warn!(
                execution_id = %execution_id,
                scenario_id = %scenario.id,
                "no runnable techniques, execution failed at start"
            );
            self.sink.save_execution(&execution);
            self.executions.lock().unwrap().insert(
                execution_id.clone(),
                ExecutionHandle {
                    record: Arc::new(Mutex::new(execution)),
                    tasks: Arc::new(Mutex::new(HashMap::new())),
                    cancel: CancellationToken::new(),
                },
            );
            return Err(ExecutionError::NoRunnableTechniques { execution_id });
        }

        self.sink.save_execution(&execution);
        let record = Arc::new(Mutex::new(execution));
        let tasks = Arc::new(Mutex::new(HashMap::new()));
        let cancel = self.root_cancel.child_token();
        self.executions.lock().unwrap().insert(
            execution_id.clone(),
            ExecutionHandle {
                record: record.clone(),
                tasks: tasks.clone(),
                cancel: cancel.clone(),
            },
        );

        tracing::info!(
            execution_id = %execution_id,
            scenario_id = %scenario.id,
            targets = target_paws.len(),
            phases = plan.len(),
            safe_mode,
            "execution started"
        );

        tokio::spawn(run_execution(RunContext {
            execution_id: execution_id.clone(),
            record,
            tasks,
            cancel,
            plan,
            targets: target_paws,
            dispatcher: self.dispatcher.clone(),
            sink: self.sink.clone(),
            default_task_timeout_secs: self.default_task_timeout_secs,
        }));

        Ok(execution_id)
    }

    /// Request cancellation of a running execution.
    ///
    /// Cancelling an execution that is not running is a no-op reported as
    /// [`ExecutionError::InvalidTransition`]; no state changes.
    pub fn cancel(&self, execution_id: &str) -> Result<(), ExecutionError> {
        let executions = self.executions.lock().unwrap();
        let Some(handle) = executions.get(execution_id) else {
            return Err(ExecutionError::NotFound {
                execution_id: execution_id.to_string(),
            });
        };
        let record = handle.record.lock().unwrap();
        if record.status != ExecutionStatus::Running {
            return Err(ExecutionError::InvalidTransition {
                execution_id: execution_id.to_string(),
                status: record.status.clone(),
            });
        }
        tracing::info!(execution_id = %execution_id, "cancellation requested");
        handle.cancel.cancel();
        Ok(())
    }

    /// Snapshot of one execution record.
    pub fn execution(&self, execution_id: &str) -> Option<Execution> {
        let executions = self.executions.lock().unwrap();
        executions
            .get(execution_id)
            .map(|handle| handle.record.lock().unwrap().clone())
    }

    /// Snapshots of all execution records.
    pub fn executions(&self) -> Vec<Execution> {
        let executions = self.executions.lock().unwrap();
        executions
            .values()
            .map(|handle| handle.record.lock().unwrap().clone())
            .collect()
    }

    /// Snapshots of one execution's tasks, ordered by phase then dispatch
    /// time, for reporting. Returns `None` for an unknown execution.
    pub fn tasks(&self, execution_id: &str) -> Option<Vec<Task>> {
        let executions = self.executions.lock().unwrap();
        let handle = executions.get(execution_id)?;
        let tasks = handle.tasks.lock().unwrap();
        let mut all: Vec<Task> = tasks.values().cloned().collect();
        all.sort_by(|a, b| {
            (a.phase_index, &a.dispatched_at, &a.id).cmp(&(b.phase_index, &b.dispatched_at, &b.id))
        });
        Some(all)
    }
}

/// The run loop for one execution. Owns its context; communicates with the
/// rest of the system only through the dispatcher and the completion
/// channel.
async fn run_execution(ctx: RunContext) {
    set_status(&ctx, ExecutionStatus::Running);
    let (completion_tx, mut completion_rx) = mpsc::unbounded_channel::<TaskCompletion>();

    for (phase_index, phase) in ctx.plan.iter().enumerate() {
        // Cancelled between phases: nothing outstanding, stop here.
        if ctx.cancel.is_cancelled() {
            finish(&ctx, ExecutionStatus::Cancelled);
            return;
        }

        {
            let mut record = ctx.record.lock().unwrap();
            record.current_phase_index = phase_index;
        }
        save_record(&ctx);
        tracing::info!(
            execution_id = %ctx.execution_id,
            phase_index,
            techniques = phase.len(),
            "phase started"
        );

        // One task per (technique x target agent), dispatched concurrently.
        let mut open: HashSet<TaskId> = HashSet::new();
        for planned in phase {
            for paw in &ctx.targets {
                let task = Task {
                    id: Uuid::new_v4().to_string(),
                    execution_id: ctx.execution_id.clone(),
                    phase_index,
                    technique_id: planned.technique.id.clone(),
                    agent_paw: paw.clone(),
                    command: planned.technique.command.clone(),
                    executor: planned.technique.executor.clone(),
                    safe: planned.safe,
                    status: TaskStatus::Dispatched,
                    dispatched_at: Utc::now().to_rfc3339(),
                    result: None,
                };
                let assignment = TaskAssignment {
                    task_id: task.id.clone(),
                    execution_id: task.execution_id.clone(),
                    agent_paw: task.agent_paw.clone(),
                    technique_id: task.technique_id.clone(),
                    command: task.command.clone(),
                    executor: task.executor.clone(),
                    timeout_secs: planned
                        .technique
                        .timeout_secs
                        .unwrap_or(ctx.default_task_timeout_secs),
                };
                ctx.sink.save_task(&task);
                open.insert(task.id.clone());
                ctx.tasks.lock().unwrap().insert(task.id.clone(), task);
                ctx.dispatcher.dispatch(assignment, completion_tx.clone());
            }
        }

        // Event-driven wait: the phase is complete when every task it
        // created is terminal.
        while !open.is_empty() {
            tokio::select! {
                Some(completion) = completion_rx.recv() => {
                    open.remove(&completion.task_id);
                    apply_completion(&ctx, completion);
                }
                _ = ctx.cancel.cancelled() => {
                    ctx.dispatcher.cancel_for_execution(&ctx.execution_id);
                    // Every open task either already has a completion queued
                    // or was just drained above, so this terminates.
                    while !open.is_empty() {
                        match completion_rx.recv().await {
                            Some(completion) => {
                                open.remove(&completion.task_id);
                                apply_completion(&ctx, completion);
                            }
                            None => break,
                        }
                    }
                    finish(&ctx, ExecutionStatus::Cancelled);
                    return;
                }
            }
        }
        tracing::info!(execution_id = %ctx.execution_id, phase_index, "phase complete");
    }

    finish(&ctx, ExecutionStatus::Completed);
}

/// Apply one terminal transition to the owned task record. Completions are
/// the only writer of task status, and an already-terminal task is left
/// untouched.
fn apply_completion(ctx: &RunContext, completion: TaskCompletion) {
    let snapshot = {
        let mut tasks = ctx.tasks.lock().unwrap();
        let Some(task) = tasks.get_mut(&completion.task_id) else {
            return;
        };
        if task.status.is_terminal() {
            return;
        }
        task.status = completion.status;
        task.result = completion.result;
        task.clone()
    };
    tracing::debug!(
        execution_id = %ctx.execution_id,
        task_id = %snapshot.id,
        status = ?snapshot.status,
        "task terminal"
    );
    ctx.sink.save_task(&snapshot);
}

fn set_status(ctx: &RunContext, status: ExecutionStatus) {
    {
        let mut record = ctx.record.lock().unwrap();
        record.status = status;
    }
    save_record(ctx);
}

/// Terminal transition: stamp `completed_at`, compute the score over the
/// task set, persist.
fn finish(ctx: &RunContext, status: ExecutionStatus) {
    let snapshot = {
        let all: Vec<Task> = {
            let tasks = ctx.tasks.lock().unwrap();
            tasks.values().cloned().collect()
        };
        let mut record = ctx.record.lock().unwrap();
        record.status = status;
        record.completed_at = Some(Utc::now().to_rfc3339());
        record.score = posture_score(&all);
        record.clone()
    };
    tracing::info!(
        execution_id = %snapshot.id,
        status = %snapshot.status,
        score = ?snapshot.score,
        "execution finished"
    );
    ctx.sink.save_execution(&snapshot);
}

fn save_record(ctx: &RunContext) {
    let snapshot = ctx.record.lock().unwrap().clone();
    ctx.sink.save_execution(&snapshot);
}
