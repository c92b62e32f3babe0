//! Control-plane wiring and lifecycle.
//!
//! [`ControlPlane`] explicitly constructs the registry, liveness tracker,
//! dispatcher, and coordinator, and wires their event streams together --
//! there is no ambient global state, so the whole core can be stood up in a
//! test without a socket in sight.
//!
//! Cross-component communication is one-way notifications over channels:
//! registry connectivity events flow into the liveness tracker, liveness
//! offline events flow into the dispatcher (failing that agent's
//! outstanding tasks early). No component reaches into another's locked
//! state, which keeps lock scopes local and ordering hazards out.
//!
//! **Lifecycle:** `start` spawns the event routers and the liveness
//! sweeper under a root [`CancellationToken`]; `shutdown` cancels the root,
//! which cascades to every connection writer, task timer, and execution
//! run loop.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use crate::catalog::{SafetyClassifier, ScenarioStore};
use crate::config::AppConfig;
use crate::dispatch::TaskDispatcher;
use crate::execution::ExecutionCoordinator;
use crate::liveness::{LivenessEvent, LivenessTracker};
use crate::persist::PersistenceSink;
use crate::registry::{ConnectionRegistry, RegistryEvent};

/// The assembled core: one registry, one liveness tracker, one dispatcher,
/// one coordinator, one root cancellation token.
pub struct ControlPlane {
    registry: ConnectionRegistry,
    liveness: LivenessTracker,
    dispatcher: TaskDispatcher,
    coordinator: Arc<ExecutionCoordinator>,
    root_cancel: CancellationToken,
}

impl ControlPlane {
    /// Construct the components, wire their event streams, and spawn the
    /// background tasks (event routers + liveness sweeper).
    pub fn start(
        config: &AppConfig,
        store: Arc<dyn ScenarioStore>,
        classifier: Arc<dyn SafetyClassifier>,
        sink: Arc<dyn PersistenceSink>,
    ) -> Self {
        let root_cancel = CancellationToken::new();

        let (registry, registry_events) = ConnectionRegistry::new();
        let (liveness, liveness_events) = LivenessTracker::new(
            registry.clone(),
            config.offline_after(),
            config.sweep_interval(),
        );
        let dispatcher = TaskDispatcher::new(registry.clone());
        let coordinator = Arc::new(ExecutionCoordinator::new(
            dispatcher.clone(),
            liveness.clone(),
            store,
            classifier,
            sink,
            config.default_task_timeout_secs,
            root_cancel.child_token(),
        ));

        tokio::spawn(route_registry_events(
            liveness.clone(),
            registry_events,
            root_cancel.child_token(),
        ));
        tokio::spawn(route_liveness_events(
            dispatcher.clone(),
            liveness_events,
            root_cancel.child_token(),
        ));
        tokio::spawn(liveness.clone().run_sweeper(root_cancel.child_token()));

        Self {
            registry,
            liveness,
            dispatcher,
            coordinator,
            root_cancel,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn liveness(&self) -> &LivenessTracker {
        &self.liveness
    }

    pub fn dispatcher(&self) -> &TaskDispatcher {
        &self.dispatcher
    }

    pub fn coordinator(&self) -> &ExecutionCoordinator {
        &self.coordinator
    }

    /// Child of the root token, for tasks that must stop on shutdown.
    pub fn child_token(&self) -> CancellationToken {
        self.root_cancel.child_token()
    }

    /// Cancel the root token. Cascades shutdown to connection writers,
    /// task timers, execution run loops, and the background routers.
    pub fn shutdown(&self) {
        tracing::info!("control plane shutting down");
        self.root_cancel.cancel();
    }
}

/// Registry connectivity -> liveness status.
async fn route_registry_events(
    liveness: LivenessTracker,
    mut events: UnboundedReceiver<RegistryEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(RegistryEvent::Connected { paw }) => liveness.mark_online(&paw),
                Some(RegistryEvent::Disconnected { paw }) => liveness.mark_offline(&paw),
                None => break,
            }
        }
    }
}

/// Liveness offline -> fail the agent's outstanding tasks ahead of their
/// own timeouts.
async fn route_liveness_events(
    dispatcher: TaskDispatcher,
    mut events: UnboundedReceiver<LivenessEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(LivenessEvent::Offline { paw }) => dispatcher.on_agent_offline(&paw),
                None => break,
            }
        }
    }
}
