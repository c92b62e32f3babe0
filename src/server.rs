//! TCP wire layer: line-delimited JSON envelopes, one duplex connection per
//! agent.
//!
//! Each accepted connection gets a reader loop (this task) and a spawned
//! writer task that drains an mpsc receiver into the socket's write half.
//! The first line must be a `register` envelope; the sender side of the
//! writer's channel is then installed in the registry as the agent's
//! connection. When the registry supersedes the connection (the agent
//! reconnected elsewhere) its cancellation token fires, which tears down
//! both halves here.
//!
//! Malformed lines after registration are logged and skipped; an agent is
//! not disconnected for one line of garbage.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::control::ControlPlane;
use crate::protocol::{AgentMessage, ServerMessage};

/// Bind and serve until the control plane shuts down.
pub async fn run_server(bind: &str, plane: Arc<ControlPlane>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    serve_on(listener, plane).await
}

/// Accept loop over an already-bound listener. Split out so tests can bind
/// to an ephemeral port and learn the address first.
pub async fn serve_on(listener: TcpListener, plane: Arc<ControlPlane>) -> anyhow::Result<()> {
    let local = listener.local_addr()?;
    tracing::info!(addr = %local, "listening for agent connections");
    let cancel = plane.child_token();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tokio::spawn(handle_agent(stream, addr, plane.clone()));
                }
                Err(error) => tracing::warn!(%error, "accept failed"),
            }
        }
    }
    Ok(())
}

/// One agent session: registration handshake, then the inbound message
/// loop until the socket closes or the connection is superseded.
async fn handle_agent(stream: TcpStream, addr: SocketAddr, plane: Arc<ControlPlane>) {
    let (read_half, write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // The first line on a new connection must be a register envelope.
    let first = match lines.next_line().await {
        Ok(Some(line)) => line,
        Ok(None) | Err(_) => {
            tracing::debug!(addr = %addr, "connection closed before registration");
            return;
        }
    };
    let (paw, hostname, platform, executors) = match serde_json::from_str::<AgentMessage>(&first) {
        Ok(AgentMessage::Register {
            paw,
            hostname,
            platform,
            executors,
        }) => (paw, hostname, platform, executors),
        Ok(other) => {
            tracing::warn!(addr = %addr, message = ?other, "expected register first, dropping connection");
            return;
        }
        Err(error) => {
            tracing::warn!(addr = %addr, %error, "unparseable registration, dropping connection");
            return;
        }
    };

    let conn_id = Uuid::new_v4();
    let conn_cancel = plane.child_token();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_outbound(write_half, outbound_rx, conn_cancel.clone()));

    plane
        .liveness()
        .upsert_agent(&paw, &hostname, &platform, executors);
    plane
        .registry()
        .register(&paw, conn_id, outbound_tx, conn_cancel.clone());
    let _ = plane
        .registry()
        .send(&paw, ServerMessage::Ack { paw: paw.clone() });
    tracing::info!(paw = %paw, addr = %addr, conn = %conn_id, "agent connected");

    loop {
        tokio::select! {
            // Fires when this connection was superseded by a reconnect, or
            // on control-plane shutdown.
            _ = conn_cancel.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_line(&plane, &paw, &line),
                Ok(None) => break,
                Err(error) => {
                    tracing::debug!(paw = %paw, %error, "read error");
                    break;
                }
            }
        }
    }

    plane.registry().unregister(&paw, conn_id);
    tracing::info!(paw = %paw, conn = %conn_id, "agent session ended");
}

/// Route one inbound line from a registered agent.
fn handle_line(plane: &ControlPlane, session_paw: &str, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    match serde_json::from_str::<AgentMessage>(line) {
        Ok(AgentMessage::Heartbeat { paw }) => plane.liveness().heartbeat(&paw),
        Ok(AgentMessage::TaskResult {
            task_id,
            outcome,
            output,
        }) => {
            // Correlate under the session's identity, not the payload's.
            plane
                .dispatcher()
                .on_result(session_paw, &task_id, outcome, output);
        }
        Ok(AgentMessage::Register {
            paw,
            hostname,
            platform,
            executors,
        }) => {
            // Re-register on the same channel refreshes the inventory only.
            if paw != session_paw {
                tracing::warn!(session = %session_paw, paw = %paw, "register paw mismatch, ignoring");
                return;
            }
            plane
                .liveness()
                .upsert_agent(&paw, &hostname, &platform, executors);
        }
        Err(error) => {
            tracing::warn!(paw = %session_paw, %error, "skipping malformed message");
        }
    }
}

/// Writer task: owns the socket's write half, drains the outbound channel.
/// Exits on cancellation (supersede/shutdown), channel closure, or write
/// failure; dropping the write half closes the socket's send side.
async fn write_outbound(
    mut write_half: OwnedWriteHalf,
    mut outbound: UnboundedReceiver<ServerMessage>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = outbound.recv() => {
                let Some(message) = message else { break };
                let mut line = match serde_json::to_string(&message) {
                    Ok(line) => line,
                    Err(error) => {
                        tracing::warn!(%error, "failed to encode outbound message");
                        continue;
                    }
                };
                line.push('\n');
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        }
    }
}
