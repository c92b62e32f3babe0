use std::path::PathBuf;

use crate::execution::types::ExecutionStatus;

/// Errors related to the connection registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("agent '{paw}' has no live connection")]
    NotConnected { paw: String },
}

/// Errors related to the scenario catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read scenario fixture at {path}: {message}")]
    FixtureError { path: PathBuf, message: String },
}

/// Errors related to the execution coordinator state machine.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("scenario not found: {scenario_id}")]
    ScenarioNotFound { scenario_id: String },

    #[error("execution requires at least one target agent")]
    NoTargets,

    #[error("no runnable techniques remain for execution {execution_id}")]
    NoRunnableTechniques { execution_id: String },

    #[error("execution not found: {execution_id}")]
    NotFound { execution_id: String },

    #[error("cannot cancel execution {execution_id} in status {status}")]
    InvalidTransition {
        execution_id: String,
        status: ExecutionStatus,
    },
}
