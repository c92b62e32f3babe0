use super::schema::{AppConfig, PartialConfig};
use crate::catalog::defaults::default_destructive_patterns;
use std::path::PathBuf;

impl PartialConfig {
    /// Merge self with a lower-priority fallback.
    /// Self's non-None values take precedence.
    /// For destructive_patterns: REPLACE semantics (if self has Some, use it entirely).
    pub fn with_fallback(self, fallback: PartialConfig) -> PartialConfig {
        PartialConfig {
            bind: self.bind.or(fallback.bind),
            heartbeat_interval_secs: self
                .heartbeat_interval_secs
                .or(fallback.heartbeat_interval_secs),
            liveness_timeout_multiplier: self
                .liveness_timeout_multiplier
                .or(fallback.liveness_timeout_multiplier),
            sweep_interval_secs: self.sweep_interval_secs.or(fallback.sweep_interval_secs),
            default_task_timeout_secs: self
                .default_task_timeout_secs
                .or(fallback.default_task_timeout_secs),
            audit_log_path: self.audit_log_path.or(fallback.audit_log_path),
            destructive_patterns: self.destructive_patterns.or(fallback.destructive_patterns),
        }
    }

    /// Convert to AppConfig, filling any remaining gaps with defaults.
    pub fn finalize(self) -> AppConfig {
        AppConfig {
            bind: self.bind.unwrap_or_else(|| "127.0.0.1:8765".to_string()),
            heartbeat_interval_secs: self.heartbeat_interval_secs.unwrap_or(30),
            liveness_timeout_multiplier: self.liveness_timeout_multiplier.unwrap_or(2),
            sweep_interval_secs: self.sweep_interval_secs.unwrap_or(60),
            default_task_timeout_secs: self.default_task_timeout_secs.unwrap_or(300),
            audit_log_path: self
                .audit_log_path
                .unwrap_or_else(|| PathBuf::from("./adversim-audit.jsonl")),
            destructive_patterns: self
                .destructive_patterns
                .unwrap_or_else(default_destructive_patterns),
        }
    }
}
