//! Wire-protocol round trips over real TCP sockets.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use adversim::catalog::{InMemoryScenarioStore, PatternSafetyClassifier, Phase, Scenario, Technique};
use adversim::config::AppConfig;
use adversim::control::ControlPlane;
use adversim::execution::types::ExecutionStatus;
use adversim::persist::NullSink;
use adversim::protocol::{AgentMessage, Outcome, ServerMessage};
use adversim::server;

// ─── Harness ─────────────────────────────────────────────────────────

fn test_config() -> AppConfig {
    AppConfig {
        bind: "127.0.0.1:0".into(),
        heartbeat_interval_secs: 30,
        liveness_timeout_multiplier: 2,
        sweep_interval_secs: 3600,
        default_task_timeout_secs: 3600,
        audit_log_path: "unused.jsonl".into(),
        destructive_patterns: adversim::catalog::defaults::default_destructive_patterns(),
    }
}

fn test_catalog() -> InMemoryScenarioStore {
    let mut store = InMemoryScenarioStore::new();
    store.insert_technique(Technique {
        id: "T1082".into(),
        name: "System Information Discovery".into(),
        command: "uname -a".into(),
        executor: "sh".into(),
        timeout_secs: None,
    });
    store.insert_scenario(Scenario {
        id: "single".into(),
        name: "single".into(),
        phases: vec![Phase {
            techniques: vec!["T1082".into()],
        }],
    });
    store
}

/// Stand up a control plane serving on an ephemeral port.
async fn start_server() -> (Arc<ControlPlane>, std::net::SocketAddr) {
    let config = test_config();
    let classifier = PatternSafetyClassifier::new(&config.destructive_patterns).unwrap();
    let plane = Arc::new(ControlPlane::start(
        &config,
        Arc::new(test_catalog()),
        Arc::new(classifier),
        Arc::new(NullSink),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve_on(listener, plane.clone()));
    (plane, addr)
}

struct WireClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write_half: OwnedWriteHalf,
}

impl WireClient {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        Self {
            lines: BufReader::new(read_half).lines(),
            write_half,
        }
    }

    async fn send(&mut self, message: &AgentMessage) {
        let mut line = serde_json::to_string(message).unwrap();
        line.push('\n');
        self.write_half.write_all(line.as_bytes()).await.unwrap();
    }

    async fn send_raw(&mut self, line: &str) {
        self.write_half
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> Option<ServerMessage> {
        let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("timed out waiting for a server message")
            .unwrap()?;
        Some(serde_json::from_str(&line).unwrap())
    }

    async fn register(&mut self, paw: &str) {
        self.send(&AgentMessage::Register {
            paw: paw.into(),
            hostname: "web-01".into(),
            platform: "linux".into(),
            executors: vec!["sh".into()],
        })
        .await;
        match self.recv().await {
            Some(ServerMessage::Ack { paw: acked }) => assert_eq!(acked, paw),
            other => panic!("expected ack, got {other:?}"),
        }
    }
}

async fn await_connected(plane: &ControlPlane, paw: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !plane.registry().is_connected(paw) {
        assert!(Instant::now() < deadline, "agent never registered");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn await_terminal(plane: &ControlPlane, execution_id: &str) -> ExecutionStatus {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let execution = plane.coordinator().execution(execution_id).unwrap();
        if execution.status.is_terminal() {
            return execution.status;
        }
        assert!(Instant::now() < deadline, "execution never terminal");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================
// Register / task / task_result round trip
// ============================================================

#[tokio::test]
async fn full_round_trip_over_the_wire() {
    let (plane, addr) = start_server().await;
    let mut agent = WireClient::connect(addr).await;
    agent.register("a1").await;
    await_connected(&plane, "a1").await;

    let id = plane
        .coordinator()
        .start("single", vec!["a1".into()], true)
        .unwrap();

    let (task_id, command) = match agent.recv().await {
        Some(ServerMessage::Task { id, command, .. }) => (id, command),
        other => panic!("expected task, got {other:?}"),
    };
    assert_eq!(command, "uname -a");

    agent
        .send(&AgentMessage::TaskResult {
            task_id,
            outcome: Outcome::Blocked,
            output: Some("denied by policy".into()),
        })
        .await;

    assert_eq!(await_terminal(&plane, &id).await, ExecutionStatus::Completed);
    let execution = plane.coordinator().execution(&id).unwrap();
    assert_eq!(execution.score, Some(100.0));
}

// ============================================================
// Reconnect supersedes the prior connection
// ============================================================

#[tokio::test]
async fn reconnect_supersedes_and_new_channel_receives_tasks() {
    let (plane, addr) = start_server().await;
    let mut first = WireClient::connect(addr).await;
    first.register("a1").await;
    await_connected(&plane, "a1").await;

    let mut second = WireClient::connect(addr).await;
    second.register("a1").await;

    // The superseded connection is closed by the server.
    let eof = tokio::time::timeout(Duration::from_secs(5), first.lines.next_line())
        .await
        .expect("superseded connection was not closed")
        .unwrap();
    assert!(eof.is_none());
    assert!(plane.registry().is_connected("a1"));

    let id = plane
        .coordinator()
        .start("single", vec!["a1".into()], true)
        .unwrap();
    let task_id = match second.recv().await {
        Some(ServerMessage::Task { id, .. }) => id,
        other => panic!("expected task on the new connection, got {other:?}"),
    };
    second
        .send(&AgentMessage::TaskResult {
            task_id,
            outcome: Outcome::Detected,
            output: None,
        })
        .await;
    assert_eq!(await_terminal(&plane, &id).await, ExecutionStatus::Completed);
}

// ============================================================
// Session resilience
// ============================================================

#[tokio::test]
async fn malformed_lines_do_not_kill_the_session() {
    let (plane, addr) = start_server().await;
    let mut agent = WireClient::connect(addr).await;
    agent.register("a1").await;
    await_connected(&plane, "a1").await;

    agent.send_raw("this is not json").await;
    agent
        .send(&AgentMessage::Heartbeat { paw: "a1".into() })
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(plane.registry().is_connected("a1"));
}

#[tokio::test]
async fn connection_without_register_is_dropped() {
    let (_plane, addr) = start_server().await;
    let mut agent = WireClient::connect(addr).await;
    agent
        .send(&AgentMessage::Heartbeat { paw: "a1".into() })
        .await;

    let eof = tokio::time::timeout(Duration::from_secs(5), agent.lines.next_line())
        .await
        .expect("connection was not dropped")
        .unwrap();
    assert!(eof.is_none());
}

// ============================================================
// Socket close feeds the liveness/dispatch shortcut
// ============================================================

#[tokio::test]
async fn socket_close_fails_outstanding_task() {
    let (plane, addr) = start_server().await;
    let mut agent = WireClient::connect(addr).await;
    agent.register("a1").await;
    await_connected(&plane, "a1").await;

    let id = plane
        .coordinator()
        .start("single", vec!["a1".into()], true)
        .unwrap();
    // Wait for the task to land, then vanish without answering.
    assert!(matches!(agent.recv().await, Some(ServerMessage::Task { .. })));
    drop(agent);

    // Far below the one-hour task timeout.
    assert_eq!(await_terminal(&plane, &id).await, ExecutionStatus::Completed);
    let tasks = plane.coordinator().tasks(&id).unwrap();
    assert_eq!(
        tasks[0].status,
        adversim::execution::types::TaskStatus::Failed(
            adversim::execution::types::FailReason::AgentDisconnected
        )
    );
}
