//! Scenario and technique catalog.
//!
//! The catalog itself (threat-intel import, normalization, authoring) is an
//! offline concern; the control plane only consumes it through the
//! [`ScenarioStore`] trait. [`InMemoryScenarioStore`] is the shipped
//! implementation, populated programmatically or from a TOML fixture file.

pub mod defaults;
pub mod safety;

pub use safety::{PatternSafetyClassifier, SafetyClassifier};

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

/// One MITRE ATT&CK-style adversary action: an executable command plus
/// metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Technique {
    /// Technique identifier (e.g., "T1082").
    pub id: String,
    pub name: String,
    /// The command handed to the agent's executor verbatim.
    pub command: String,
    /// Command interpreter the agent must run this with (e.g., "sh", "psh").
    pub executor: String,
    /// Per-technique result deadline. Falls back to the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Ordered group of techniques executed concurrently within one execution
/// step. Holds technique ids; the store resolves them to [`Technique`]s.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Phase {
    pub techniques: Vec<String>,
}

/// An ordered sequence of phases run against a set of target agents.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    pub name: String,
    pub phases: Vec<Phase>,
}

/// Read access to the scenario/technique catalog.
pub trait ScenarioStore: Send + Sync {
    fn scenario(&self, id: &str) -> Option<Scenario>;
    fn technique(&self, id: &str) -> Option<Technique>;
}

/// TOML fixture file shape: `[[scenarios]]` and `[[techniques]]` tables.
#[derive(Debug, Default, Deserialize)]
pub struct FixtureFile {
    #[serde(default)]
    pub scenarios: Vec<Scenario>,
    #[serde(default)]
    pub techniques: Vec<Technique>,
}

/// In-memory catalog. Scenarios and techniques are keyed by id; inserting a
/// duplicate id replaces the prior entry.
#[derive(Debug, Default)]
pub struct InMemoryScenarioStore {
    scenarios: HashMap<String, Scenario>,
    techniques: HashMap<String, Technique>,
}

impl InMemoryScenarioStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a catalog from a TOML fixture file.
    pub fn load_fixture(path: &Path) -> Result<Self, CatalogError> {
        let contents = std::fs::read_to_string(path).map_err(|e| CatalogError::FixtureError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let fixture: FixtureFile =
            toml::from_str(&contents).map_err(|e| CatalogError::FixtureError {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        let mut store = Self::new();
        for technique in fixture.techniques {
            store.insert_technique(technique);
        }
        for scenario in fixture.scenarios {
            store.insert_scenario(scenario);
        }
        tracing::info!(
            path = %path.display(),
            scenarios = store.scenarios.len(),
            techniques = store.techniques.len(),
            "catalog loaded"
        );
        Ok(store)
    }

    pub fn insert_scenario(&mut self, scenario: Scenario) {
        self.scenarios.insert(scenario.id.clone(), scenario);
    }

    pub fn insert_technique(&mut self, technique: Technique) {
        self.techniques.insert(technique.id.clone(), technique);
    }

    /// All techniques, ordered by id for stable listings.
    pub fn techniques(&self) -> Vec<Technique> {
        let mut all: Vec<Technique> = self.techniques.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

impl ScenarioStore for InMemoryScenarioStore {
    fn scenario(&self, id: &str) -> Option<Scenario> {
        self.scenarios.get(id).cloned()
    }

    fn technique(&self, id: &str) -> Option<Technique> {
        self.techniques.get(id).cloned()
    }
}
