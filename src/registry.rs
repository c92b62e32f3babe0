//! Connection registry: one live duplex channel per agent identity.
//!
//! [`ConnectionRegistry`] is the single source of truth for "is this agent
//! reachable right now". It wraps a `HashMap` behind `Arc<Mutex<..>>` so that
//! register/send/unregister for a given paw are totally ordered -- a reconnect
//! racing an in-flight send can never observe a half-installed entry or
//! deliver on a closed channel. No await point is reached while the lock is
//! held; outbound delivery goes through an unbounded sender, which never
//! blocks.
//!
//! **Supersede-on-reconnect:** registering a paw that already has a live
//! connection closes the old channel first (its cancellation token is
//! cancelled, which tears down the old writer task and with it the socket).
//! This is the primary path for agents that restart or roam, not an edge
//! case.
//!
//! **Stale-close guard:** `unregister` takes the connection id of the channel
//! being torn down and is a no-op when that id no longer matches the
//! installed entry, so the delayed teardown of a superseded connection cannot
//! evict its replacement.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::RegistryError;
use crate::protocol::ServerMessage;

/// Unique identifier of an agent.
pub type Paw = String;

/// Connectivity transitions emitted by the registry. Consumed by the
/// liveness tracker; the registry itself keeps no status state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryEvent {
    Connected { paw: Paw },
    Disconnected { paw: Paw },
}

/// One installed channel: the outbound sender handed to the connection's
/// writer task, plus the identity and cancellation token of that connection.
struct ConnectionEntry {
    conn_id: Uuid,
    outbound: UnboundedSender<ServerMessage>,
    cancel: CancellationToken,
}

/// Registry of live agent connections. Cheap to clone; all clones share the
/// same map and event channel.
#[derive(Clone)]
pub struct ConnectionRegistry {
    connections: Arc<Mutex<HashMap<Paw, ConnectionEntry>>>,
    event_tx: UnboundedSender<RegistryEvent>,
}

impl ConnectionRegistry {
    /// Create a registry and the receiving end of its event stream.
    pub fn new() -> (Self, UnboundedReceiver<RegistryEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                connections: Arc::new(Mutex::new(HashMap::new())),
                event_tx,
            },
            event_rx,
        )
    }

    /// Install `outbound` as the current connection for `paw`.
    ///
    /// An existing connection for the same paw is closed first: its token is
    /// cancelled and its entry replaced under the same lock acquisition, so
    /// there is no instant at which two channels are installed. Emits
    /// [`RegistryEvent::Connected`].
    pub fn register(
        &self,
        paw: &str,
        conn_id: Uuid,
        outbound: UnboundedSender<ServerMessage>,
        cancel: CancellationToken,
    ) {
        let entry = ConnectionEntry {
            conn_id,
            outbound,
            cancel,
        };
        {
            let mut connections = self.connections.lock().unwrap();
            if let Some(prev) = connections.insert(paw.to_string(), entry) {
                prev.cancel.cancel();
                tracing::info!(
                    paw = %paw,
                    superseded = %prev.conn_id,
                    conn = %conn_id,
                    "connection superseded by reconnect"
                );
            }
        }
        let _ = self.event_tx.send(RegistryEvent::Connected {
            paw: paw.to_string(),
        });
    }

    /// Deliver one message to the currently registered channel for `paw`.
    ///
    /// Fails with [`RegistryError::NotConnected`] when no live connection
    /// exists. The registry never retries; retry policy (there is none --
    /// unreachable agents fail the task) lives in the dispatcher. A send
    /// whose writer task has already died evicts the dead entry.
    pub fn send(&self, paw: &str, message: ServerMessage) -> Result<(), RegistryError> {
        {
            let mut connections = self.connections.lock().unwrap();
            let Some(entry) = connections.get(paw) else {
                return Err(RegistryError::NotConnected {
                    paw: paw.to_string(),
                });
            };
            if entry.outbound.send(message).is_ok() {
                return Ok(());
            }
            // Writer task is gone but nothing unregistered it yet.
            if let Some(entry) = connections.remove(paw) {
                entry.cancel.cancel();
            }
        }
        tracing::warn!(paw = %paw, "evicted dead connection during send");
        let _ = self.event_tx.send(RegistryEvent::Disconnected {
            paw: paw.to_string(),
        });
        Err(RegistryError::NotConnected {
            paw: paw.to_string(),
        })
    }

    /// Remove the connection identified by (`paw`, `conn_id`).
    ///
    /// Called when a channel closes or errors. Returns `false` without
    /// touching the map when `conn_id` does not match the installed entry
    /// (the close belongs to an already-superseded connection). Emits
    /// [`RegistryEvent::Disconnected`] when the active connection was
    /// removed.
    pub fn unregister(&self, paw: &str, conn_id: Uuid) -> bool {
        let removed = {
            let mut connections = self.connections.lock().unwrap();
            let is_active = connections
                .get(paw)
                .is_some_and(|entry| entry.conn_id == conn_id);
            if is_active {
                connections.remove(paw)
            } else {
                None
            }
        };
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                let _ = self.event_tx.send(RegistryEvent::Disconnected {
                    paw: paw.to_string(),
                });
                true
            }
            None => {
                tracing::debug!(paw = %paw, conn = %conn_id, "stale unregister ignored");
                false
            }
        }
    }

    /// Authoritative eviction used by the liveness sweep: removes whatever
    /// connection is installed for `paw`, regardless of connection identity.
    pub fn evict(&self, paw: &str) -> bool {
        let removed = self.connections.lock().unwrap().remove(paw);
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                let _ = self.event_tx.send(RegistryEvent::Disconnected {
                    paw: paw.to_string(),
                });
                true
            }
            None => false,
        }
    }

    pub fn is_connected(&self, paw: &str) -> bool {
        self.connections.lock().unwrap().contains_key(paw)
    }

    pub fn connected_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(paw: &str) -> ServerMessage {
        ServerMessage::Ack {
            paw: paw.to_string(),
        }
    }

    #[test]
    fn send_to_unknown_paw_is_not_connected() {
        let (registry, _events) = ConnectionRegistry::new();
        let result = registry.send("ghost", ack("ghost"));
        assert!(matches!(result, Err(RegistryError::NotConnected { .. })));
    }

    #[test]
    fn register_then_send_delivers() {
        let (registry, _events) = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("a1", Uuid::new_v4(), tx, CancellationToken::new());

        registry.send("a1", ack("a1")).unwrap();
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Ack { .. })));
    }

    #[test]
    fn reconnect_supersedes_and_closes_prior_channel() {
        let (registry, _events) = ConnectionRegistry::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let cancel1 = CancellationToken::new();
        registry.register("a1", Uuid::new_v4(), tx1, cancel1.clone());

        let (tx2, mut rx2) = mpsc::unbounded_channel();
        registry.register("a1", Uuid::new_v4(), tx2, CancellationToken::new());

        // Prior connection was told to shut down; new one receives sends.
        assert!(cancel1.is_cancelled());
        registry.send("a1", ack("a1")).unwrap();
        assert!(rx1.try_recv().is_err());
        assert!(matches!(rx2.try_recv(), Ok(ServerMessage::Ack { .. })));
        assert_eq!(registry.connected_count(), 1);
    }

    #[test]
    fn stale_unregister_does_not_evict_replacement() {
        let (registry, _events) = ConnectionRegistry::new();
        let old_conn = Uuid::new_v4();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        registry.register("a1", old_conn, tx1, CancellationToken::new());

        let new_conn = Uuid::new_v4();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        registry.register("a1", new_conn, tx2, CancellationToken::new());

        // The superseded connection's teardown arrives late.
        assert!(!registry.unregister("a1", old_conn));
        assert!(registry.is_connected("a1"));

        assert!(registry.unregister("a1", new_conn));
        assert!(!registry.is_connected("a1"));
    }

    #[test]
    fn unregister_emits_disconnected_once() {
        let (registry, mut events) = ConnectionRegistry::new();
        let conn = Uuid::new_v4();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register("a1", conn, tx, CancellationToken::new());
        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::Connected { paw: "a1".into() }
        );

        assert!(registry.unregister("a1", conn));
        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::Disconnected { paw: "a1".into() }
        );

        // Second close of the same connection is stale: no event.
        assert!(!registry.unregister("a1", conn));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn send_on_dead_channel_evicts_entry() {
        let (registry, mut events) = ConnectionRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register("a1", Uuid::new_v4(), tx, CancellationToken::new());
        let _ = events.try_recv();
        drop(rx); // writer task died without unregistering

        let result = registry.send("a1", ack("a1"));
        assert!(matches!(result, Err(RegistryError::NotConnected { .. })));
        assert!(!registry.is_connected("a1"));
        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::Disconnected { paw: "a1".into() }
        );
    }
}
