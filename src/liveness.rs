//! Agent liveness tracking.
//!
//! [`LivenessTracker`] owns the Agent records and derives online/offline
//! status from two inputs: heartbeat messages arriving on agent channels,
//! and connectivity events from the [`ConnectionRegistry`]. A periodic sweep
//! marks agents offline once their last heartbeat is older than the timeout
//! threshold (a small multiple of the expected heartbeat interval) and
//! evicts any connection still installed for them.
//!
//! Offline transitions are emitted as [`LivenessEvent`]s. The dispatcher
//! consumes them to fail that agent's outstanding tasks immediately, which
//! keeps failure detection latency bounded by the sweep interval instead of
//! the (much larger) per-task timeout.
//!
//! Agent records are never deleted, only marked offline. All mutation goes
//! through this tracker; everything else sees cloned [`AgentInfo`] snapshots.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::registry::{ConnectionRegistry, Paw};

/// Whether an agent is currently believed reachable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Offline,
}

/// Emitted when an agent transitions online -> offline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LivenessEvent {
    Offline { paw: Paw },
}

/// Internal record. Callers see [`AgentInfo`] snapshots.
struct AgentRecord {
    hostname: String,
    platform: String,
    executors: Vec<String>,
    status: AgentStatus,
    last_seen: DateTime<Utc>,
}

/// Read-only view of an agent record, returned by status queries.
#[derive(Clone, Debug, Serialize)]
pub struct AgentInfo {
    pub paw: Paw,
    pub hostname: String,
    pub platform: String,
    /// Command interpreters the agent declared it can run.
    pub executors: Vec<String>,
    pub status: AgentStatus,
    /// ISO 8601 timestamp of the last heartbeat or registration.
    pub last_seen: String,
}

/// Tracker for agent records and their online/offline status. Cheap to
/// clone; all clones share the same map and event channel.
#[derive(Clone)]
pub struct LivenessTracker {
    agents: Arc<Mutex<HashMap<Paw, AgentRecord>>>,
    registry: ConnectionRegistry,
    event_tx: UnboundedSender<LivenessEvent>,
    /// Age of `last_seen` beyond which an agent counts as offline.
    offline_after: Duration,
    sweep_interval: std::time::Duration,
}

impl LivenessTracker {
    /// Create a tracker and the receiving end of its event stream.
    pub fn new(
        registry: ConnectionRegistry,
        offline_after: Duration,
        sweep_interval: std::time::Duration,
    ) -> (Self, UnboundedReceiver<LivenessEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                agents: Arc::new(Mutex::new(HashMap::new())),
                registry,
                event_tx,
                offline_after,
                sweep_interval,
            },
            event_rx,
        )
    }

    /// Create or refresh an agent record from a register message.
    pub fn upsert_agent(&self, paw: &str, hostname: &str, platform: &str, executors: Vec<String>) {
        let mut agents = self.agents.lock().unwrap();
        let record = AgentRecord {
            hostname: hostname.to_string(),
            platform: platform.to_string(),
            executors,
            status: AgentStatus::Online,
            last_seen: Utc::now(),
        };
        if agents.insert(paw.to_string(), record).is_none() {
            tracing::info!(paw = %paw, platform = %platform, "new agent registered");
        }
    }

    /// Refresh `last_seen` for a connectivity event. Records are created
    /// only by `upsert_agent` (which carries the inventory); a connect for
    /// an unknown paw is logged and ignored.
    pub fn mark_online(&self, paw: &str) {
        let mut agents = self.agents.lock().unwrap();
        match agents.get_mut(paw) {
            Some(record) => {
                record.status = AgentStatus::Online;
                record.last_seen = Utc::now();
            }
            None => tracing::debug!(paw = %paw, "connect event for unknown agent"),
        }
    }

    /// Process one heartbeat: refresh `last_seen` and ensure Online.
    pub fn heartbeat(&self, paw: &str) {
        let mut agents = self.agents.lock().unwrap();
        match agents.get_mut(paw) {
            Some(record) => {
                record.last_seen = Utc::now();
                record.status = AgentStatus::Online;
            }
            None => tracing::debug!(paw = %paw, "heartbeat from unknown agent, ignoring"),
        }
    }

    /// Mark an agent offline. Idempotent: only an Online -> Offline
    /// transition emits [`LivenessEvent::Offline`].
    pub fn mark_offline(&self, paw: &str) {
        let transitioned = {
            let mut agents = self.agents.lock().unwrap();
            match agents.get_mut(paw) {
                Some(record) if record.status == AgentStatus::Online => {
                    record.status = AgentStatus::Offline;
                    true
                }
                _ => false,
            }
        };
        if transitioned {
            tracing::info!(paw = %paw, "agent offline");
            let _ = self.event_tx.send(LivenessEvent::Offline {
                paw: paw.to_string(),
            });
        }
    }

    /// One sweep pass at time `now`: every Online agent whose `last_seen`
    /// is older than the timeout threshold is marked offline and its
    /// connection (if still installed) evicted. Returns the swept paws.
    ///
    /// Takes `now` as a parameter so the threshold logic is testable
    /// without waiting out real heartbeat intervals.
    pub fn sweep_once(&self, now: DateTime<Utc>) -> Vec<Paw> {
        let stale: Vec<Paw> = {
            let agents = self.agents.lock().unwrap();
            agents
                .iter()
                .filter(|(_, record)| {
                    record.status == AgentStatus::Online
                        && now - record.last_seen > self.offline_after
                })
                .map(|(paw, _)| paw.clone())
                .collect()
        };
        for paw in &stale {
            tracing::info!(paw = %paw, "agent missed heartbeat deadline");
            self.mark_offline(paw);
            self.registry.evict(paw);
        }
        stale
    }

    /// Run the periodic sweep until cancelled.
    pub async fn run_sweeper(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_once(Utc::now());
                }
            }
        }
    }

    /// Snapshot of one agent record. Returns `None` if never registered.
    pub fn agent(&self, paw: &str) -> Option<AgentInfo> {
        let agents = self.agents.lock().unwrap();
        agents.get(paw).map(|record| snapshot(paw, record))
    }

    /// Snapshots of all agent records.
    pub fn agents(&self) -> Vec<AgentInfo> {
        let agents = self.agents.lock().unwrap();
        agents
            .iter()
            .map(|(paw, record)| snapshot(paw, record))
            .collect()
    }
}

fn snapshot(paw: &str, record: &AgentRecord) -> AgentInfo {
    AgentInfo {
        paw: paw.to_string(),
        hostname: record.hostname.clone(),
        platform: record.platform.clone(),
        executors: record.executors.clone(),
        status: record.status,
        last_seen: record.last_seen.to_rfc3339(),
    }
}
