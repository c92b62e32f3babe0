//! Best-effort persistence of execution state transitions.
//!
//! The coordinator calls the sink at every state transition; sink failures
//! are logged and never roll back in-memory state. Durability here is an
//! audit trail, not part of the state machine's correctness contract.
//!
//! [`JsonlSink`] appends one self-describing JSON line per saved record.
//! Uses synchronous `std::fs` since writes are small and append-only -- no
//! async complexity needed.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;

use crate::execution::types::{Execution, Task};

/// Returns the current UTC time as an ISO 8601 string with milliseconds.
fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Durability sink for execution and task records.
pub trait PersistenceSink: Send + Sync {
    fn save_execution(&self, execution: &Execution);
    fn save_task(&self, task: &Task);
}

/// One audit line, tagged with `record_type` so each line is
/// self-describing for replay.
#[derive(Debug, Serialize)]
#[serde(tag = "record_type", rename_all = "snake_case")]
enum AuditRecord<'a> {
    Execution {
        saved_at: String,
        execution: &'a Execution,
    },
    Task {
        saved_at: String,
        task: &'a Task,
    },
}

/// Append-only JSONL audit sink.
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlSink {
    pub fn new(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    fn write_record(&self, record: &AuditRecord<'_>) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(error) => {
                tracing::warn!(%error, "failed to encode audit record");
                return;
            }
        };
        let mut file = self.file.lock().unwrap();
        if let Err(error) = writeln!(file, "{line}") {
            tracing::warn!(path = %self.path.display(), %error, "audit write failed");
        }
    }
}

impl PersistenceSink for JsonlSink {
    fn save_execution(&self, execution: &Execution) {
        self.write_record(&AuditRecord::Execution {
            saved_at: now_iso(),
            execution,
        });
    }

    fn save_task(&self, task: &Task) {
        self.write_record(&AuditRecord::Task {
            saved_at: now_iso(),
            task,
        });
    }
}

/// Sink that drops every record. Used in tests and when auditing is
/// disabled.
pub struct NullSink;

impl PersistenceSink for NullSink {
    fn save_execution(&self, _execution: &Execution) {}
    fn save_task(&self, _task: &Task) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::types::{ExecutionStatus, TaskStatus};

    #[test]
    fn jsonl_sink_appends_tagged_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = JsonlSink::new(&path).unwrap();

        let execution = Execution {
            id: "x-1".into(),
            scenario_id: "s-1".into(),
            status: ExecutionStatus::Running,
            safe_mode: true,
            current_phase_index: 0,
            phase_count: 2,
            target_agents: vec!["a1".into()],
            created_at: now_iso(),
            completed_at: None,
            score: None,
        };
        sink.save_execution(&execution);

        let task = Task {
            id: "t-1".into(),
            execution_id: "x-1".into(),
            phase_index: 0,
            technique_id: "T1082".into(),
            agent_paw: "a1".into(),
            command: "uname -a".into(),
            executor: "sh".into(),
            safe: true,
            status: TaskStatus::Dispatched,
            dispatched_at: now_iso(),
            result: None,
        };
        sink.save_task(&task);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["record_type"], "execution");
        assert_eq!(first["execution"]["id"], "x-1");

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["record_type"], "task");
        assert_eq!(second["task"]["technique_id"], "T1082");
    }
}
