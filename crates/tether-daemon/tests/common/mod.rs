//! Shared harness for daemon integration tests: in-process daemons on
//! scratch control directories, plus a scripted mock agent behind a real
//! session endpoint.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};

use tether_daemon::daemon;
use tether_daemon::DaemonClient;
use tether_endpoint::{AgentError, RewindOutcome, SessionAgent, SessionEndpoint, TurnEnd};
use tether_wire::{ControlDir, DeliveryMode};

pub fn scratch_dir(tag: &str) -> ControlDir {
    let dir = std::env::temp_dir().join(format!("tether-{tag}-{}", rand::random::<u64>()));
    let cd = ControlDir::new(dir);
    cd.ensure().unwrap();
    cd
}

/// Grab a free TCP port by binding to 0 and letting it go again.
pub fn pick_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub struct TestDaemon {
    pub dir: ControlDir,
    pub port: u16,
    task: tokio::task::JoinHandle<()>,
}

impl TestDaemon {
    pub async fn start(tag: &str) -> Self {
        let dir = scratch_dir(tag);
        Self::start_in(dir).await
    }

    pub async fn start_in(dir: ControlDir) -> Self {
        let port = pick_port();
        let run_dir = dir.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = daemon::run(run_dir, Some(port)).await {
                panic!("daemon exited fatally: {e}");
            }
        });

        // Wait for the control socket to come up.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !dir.daemon_sock().exists() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "daemon socket never appeared"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        Self { dir, port, task }
    }

    pub async fn client(&self) -> DaemonClient {
        DaemonClient::connect(&self.dir).await.unwrap()
    }

    /// Hard stop without the kill handshake.
    pub fn abort(&self) {
        self.task.abort();
    }

    pub async fn kill(self) {
        let mut client = self.client().await;
        let resp = client
            .request(&tether_wire::DaemonRequest::Kill)
            .await
            .unwrap();
        assert!(resp.success);
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
        let _ = std::fs::remove_dir_all(self.dir.root());
    }
}

pub struct MockAgent {
    pub idle: AtomicBool,
    pub at_root: AtomicBool,
    pub name: std::sync::Mutex<Option<String>>,
    pub last_message: Mutex<Option<String>>,
    pub delivered: Mutex<Vec<(String, DeliveryMode)>>,
    pub turn_tx: broadcast::Sender<TurnEnd>,
}

impl MockAgent {
    pub fn new() -> Arc<Self> {
        let (turn_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            idle: AtomicBool::new(true),
            at_root: AtomicBool::new(true),
            name: std::sync::Mutex::new(None),
            last_message: Mutex::new(None),
            delivered: Mutex::new(Vec::new()),
            turn_tx,
        })
    }
}

#[async_trait]
impl SessionAgent for MockAgent {
    async fn deliver(&self, message: String, mode: DeliveryMode) -> Result<(), AgentError> {
        self.delivered.lock().await.push((message, mode));
        Ok(())
    }

    async fn abort(&self) {}

    async fn rewind_to_root(&self) -> Result<RewindOutcome, AgentError> {
        let already = self.at_root.swap(true, Ordering::SeqCst);
        Ok(RewindOutcome {
            already_at_root: already,
        })
    }

    async fn summarize(&self) -> Result<String, AgentError> {
        Err(AgentError::NoModel)
    }

    async fn last_assistant_message(&self) -> Option<String> {
        self.last_message.lock().await.clone()
    }

    fn is_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }

    fn session_name(&self) -> Option<String> {
        self.name.lock().unwrap().clone()
    }

    fn turn_events(&self) -> broadcast::Receiver<TurnEnd> {
        self.turn_tx.subscribe()
    }
}

pub async fn start_endpoint(dir: &ControlDir, session_id: &str) -> (Arc<MockAgent>, SessionEndpoint) {
    let agent = MockAgent::new();
    let endpoint = SessionEndpoint::bind(dir.clone(), session_id, agent.clone())
        .await
        .unwrap();
    (agent, endpoint)
}

/// Poll `list_sessions` until `session_id` is present (or absent).
pub async fn wait_for_session(client: &mut DaemonClient, session_id: &str, present: bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let resp = client
            .request(&tether_wire::DaemonRequest::ListSessions)
            .await
            .unwrap();
        let sessions = resp.data.unwrap()["sessions"].clone();
        let found = sessions
            .as_array()
            .unwrap()
            .iter()
            .any(|s| s["sessionId"] == session_id);
        if found == present {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session {session_id} never became {}",
            if present { "visible" } else { "absent" }
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Read events until one matches, within the timeout.
pub async fn wait_for_event(
    client: &mut DaemonClient,
    kind: &str,
    timeout: Duration,
) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .unwrap_or_else(|| panic!("timed out waiting for {kind} event"));
        let event = tokio::time::timeout(remaining, client.next_event())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {kind} event"))
            .unwrap();
        if event.event == kind {
            return serde_json::json!({
                "event": event.event,
                "data": event.data.unwrap_or(serde_json::Value::Null),
            });
        }
    }
}
