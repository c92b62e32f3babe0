use serde::Deserialize;
use std::path::PathBuf;

/// The TOML file structure for adversim.toml.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    pub server: Option<ServerSection>,
    pub agents: Option<AgentsSection>,
    pub execution: Option<ExecutionSection>,
    pub safety: Option<SafetySection>,
}

#[derive(Debug, Deserialize)]
pub struct ServerSection {
    pub bind: Option<String>,
    pub audit_log: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AgentsSection {
    pub heartbeat_interval_secs: Option<u64>,
    /// An agent is offline after `heartbeat_interval_secs * multiplier`
    /// without a heartbeat.
    pub liveness_timeout_multiplier: Option<u32>,
    pub sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ExecutionSection {
    pub default_task_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct SafetySection {
    /// If specified, fully replaces the default destructive-pattern list.
    pub destructive_patterns: Option<Vec<PatternEntry>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatternEntry {
    pub pattern: String,
    pub reason: String,
}

/// Fully-resolved runtime configuration. All fields have values.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind: String,
    pub heartbeat_interval_secs: u64,
    pub liveness_timeout_multiplier: u32,
    pub sweep_interval_secs: u64,
    pub default_task_timeout_secs: u64,
    pub audit_log_path: PathBuf,
    pub destructive_patterns: Vec<(String, String)>,
}

impl AppConfig {
    /// Age of the last heartbeat beyond which an agent counts as offline.
    pub fn offline_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            (self.heartbeat_interval_secs * u64::from(self.liveness_timeout_multiplier)) as i64,
        )
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Partial config used during merge. All fields are Option so that
/// missing fields don't override lower-priority values.
#[derive(Debug, Clone, Default)]
pub struct PartialConfig {
    pub bind: Option<String>,
    pub heartbeat_interval_secs: Option<u64>,
    pub liveness_timeout_multiplier: Option<u32>,
    pub sweep_interval_secs: Option<u64>,
    pub default_task_timeout_secs: Option<u64>,
    pub audit_log_path: Option<PathBuf>,
    pub destructive_patterns: Option<Vec<(String, String)>>,
}

impl ConfigFile {
    pub fn to_partial(self) -> PartialConfig {
        let server = self.server;
        let agents = self.agents;
        let execution = self.execution;
        let safety = self.safety;
        PartialConfig {
            bind: server.as_ref().and_then(|s| s.bind.clone()),
            heartbeat_interval_secs: agents.as_ref().and_then(|a| a.heartbeat_interval_secs),
            liveness_timeout_multiplier: agents
                .as_ref()
                .and_then(|a| a.liveness_timeout_multiplier),
            sweep_interval_secs: agents.as_ref().and_then(|a| a.sweep_interval_secs),
            default_task_timeout_secs: execution
                .as_ref()
                .and_then(|e| e.default_task_timeout_secs),
            audit_log_path: server
                .as_ref()
                .and_then(|s| s.audit_log.as_ref().map(PathBuf::from)),
            destructive_patterns: safety.and_then(|s| s.destructive_patterns).map(|entries| {
                entries
                    .into_iter()
                    .map(|entry| (entry.pattern, entry.reason))
                    .collect()
            }),
        }
    }
}
