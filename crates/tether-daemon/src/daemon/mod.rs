//! Daemon core — shared state, event fan-out, and the run loop.
//!
//! One daemon per host aggregates every local session endpoint, keeps one
//! federation link per peer host, and serves the control plane on
//! `daemon.sock`. State lives behind a single `Arc<RwLock<_>>`; every
//! task takes the lock briefly and never across I/O.

pub mod audit;
pub mod config;
pub mod control;
pub mod federation;
pub mod ratelimit;
pub mod relay;
pub mod tailscale;
pub mod watcher;

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tracing::{info, warn};

use tether_wire::{ControlDir, Event, PeerMessage, SessionInfo, SessionRecord};

use audit::AuditLog;
use config::DaemonConfig;
use ratelimit::RateLimiter;

pub type SharedState = Arc<RwLock<DaemonState>>;

/// Rate-limiter key for clients of the local control socket.
pub const LOCAL_REQUESTER: &str = "local";

/// Messages handed to a peer link task for transmission.
#[derive(Debug)]
pub enum LinkMsg {
    Frame(PeerMessage),
    /// Close the link and do not reconnect.
    Shutdown,
}

pub type LinkSender = mpsc::UnboundedSender<LinkMsg>;

/// One locally discovered session.
#[derive(Debug, Clone)]
pub struct LocalSessionEntry {
    pub info: SessionInfo,
    pub socket_path: PathBuf,
    pub verified_at: Instant,
}

/// One known peer host. Keyed by host string — at most one TCP link per
/// host, whichever side dialed.
#[derive(Debug)]
pub struct PeerEntry {
    pub host: String,
    pub port: u16,
    pub sessions: HashMap<String, SessionInfo>,
    /// Whether the transport is currently open.
    pub open: bool,
    pub last_seen: Instant,
    /// Set by `remove_peer`; suppresses reconnects.
    pub removed: bool,
    /// The retry budget is exhausted; only `add_peer` revives this entry.
    pub gave_up: bool,
    /// A connector task currently owns this entry's dial loop.
    pub connecting: bool,
    pub last_error: Option<String>,
    pub link: Option<LinkSender>,
    /// Generation of the live link, so a replaced link's teardown can
    /// tell it no longer owns the entry.
    pub link_gen: u64,
}

impl PeerEntry {
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            sessions: HashMap::new(),
            open: false,
            last_seen: Instant::now(),
            removed: false,
            gave_up: false,
            connecting: false,
            last_error: None,
            link: None,
            link_gen: 0,
        }
    }
}

pub struct DaemonState {
    pub control_dir: ControlDir,
    pub config: DaemonConfig,
    pub hostname: String,
    pub port: u16,
    pub started_at: Instant,
    pub last_activity: Instant,
    pub local_sessions: HashMap<String, LocalSessionEntry>,
    pub peers: HashMap<String, PeerEntry>,
    /// Outstanding remote relays keyed by wire request id.
    pub pending_relays: HashMap<String, oneshot::Sender<Value>>,
    pub limiter: RateLimiter,
    pub audit: AuditLog,
    subscribers: HashMap<u64, mpsc::UnboundedSender<Event>>,
    next_subscriber: u64,
    next_link_gen: u64,
    shutdown_tx: watch::Sender<bool>,
}

impl DaemonState {
    pub fn new(
        control_dir: ControlDir,
        config: DaemonConfig,
        port: u16,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".into());
        let audit = AuditLog::new(&control_dir);
        Self {
            control_dir,
            config,
            hostname,
            port,
            started_at: Instant::now(),
            last_activity: Instant::now(),
            local_sessions: HashMap::new(),
            peers: HashMap::new(),
            pending_relays: HashMap::new(),
            limiter: RateLimiter::new(),
            audit,
            subscribers: HashMap::new(),
            next_subscriber: 0,
            next_link_gen: 0,
            shutdown_tx,
        }
    }

    /// Note activity for the auto-shutdown timer.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn next_link_gen(&mut self) -> u64 {
        self.next_link_gen += 1;
        self.next_link_gen
    }

    // ── Event fan-out ────────────────────────────────────────────

    pub fn subscribe(&mut self) -> (u64, mpsc::UnboundedReceiver<Event>) {
        let id = self.next_subscriber;
        self.next_subscriber += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&mut self, id: u64) {
        self.subscribers.remove(&id);
    }

    /// Best-effort broadcast: a failed write silently drops the
    /// subscriber, then the remaining ones hear about it as an `error`
    /// event. Events are never retried, replayed, or coalesced.
    pub fn broadcast_event(&mut self, event: Event) {
        let mut dropped = Vec::new();
        for (&id, tx) in &self.subscribers {
            if tx.send(event.clone()).is_err() {
                dropped.push(id);
            }
        }
        for id in &dropped {
            self.subscribers.remove(id);
        }
        if !dropped.is_empty() {
            let notice = Event::new(
                "error",
                Some(serde_json::json!({
                    "message": format!("dropped {} unresponsive subscriber(s)", dropped.len())
                })),
            );
            self.subscribers.retain(|_, tx| tx.send(notice.clone()).is_ok());
        }
    }

    /// Send a frame to every open, live peer link.
    pub fn push_to_peers(&self, msg: &PeerMessage) {
        for entry in self.peers.values() {
            if !entry.open {
                continue;
            }
            if let Some(link) = &entry.link {
                let _ = link.send(LinkMsg::Frame(msg.clone()));
            }
        }
    }

    // ── Session bookkeeping ──────────────────────────────────────

    pub fn session_snapshot(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.local_sessions.values().map(|e| e.info.clone()).collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    /// Union of the local table and every connected peer's table.
    pub fn session_records(&self) -> Vec<SessionRecord> {
        let mut records: Vec<SessionRecord> = self
            .local_sessions
            .values()
            .map(|entry| SessionRecord {
                info: entry.info.clone(),
                host: self.hostname.clone(),
                is_remote: false,
            })
            .collect();
        for peer in self.peers.values() {
            if !peer.open {
                continue;
            }
            for info in peer.sessions.values() {
                records.push(SessionRecord {
                    info: info.clone(),
                    host: peer.host.clone(),
                    is_remote: true,
                });
            }
        }
        records.sort_by(|a, b| a.info.session_id.cmp(&b.info.session_id));
        records
    }

    /// Record that `owner_host` advertised `session`. The newest
    /// advertisement wins a session-id conflict, so the id is stripped
    /// from every other peer first.
    pub fn claim_remote_session(&mut self, owner_host: &str, session: SessionInfo) {
        let id = session.session_id.clone();
        for peer in self.peers.values_mut() {
            if peer.host != owner_host {
                peer.sessions.remove(&id);
            }
        }
        if let Some(entry) = self.peers.get_mut(owner_host) {
            entry.sessions.insert(id, session);
        }
    }

    /// The connected peer currently advertising `session_id`, if any.
    pub fn peer_for_session(&self, session_id: &str) -> Option<&PeerEntry> {
        self.peers
            .values()
            .find(|peer| peer.sessions.contains_key(session_id))
    }

    pub fn connected_peer_count(&self) -> usize {
        self.peers.values().filter(|p| p.open).count()
    }
}

/// Build a `session_added`/`session_removed` event payload.
pub fn session_event(kind: &str, info: &SessionInfo, host: &str, is_remote: bool) -> Event {
    Event::new(
        kind,
        Some(serde_json::json!({
            "sessionId": info.session_id,
            "name": info.name,
            "aliases": info.aliases,
            "host": host,
            "isRemote": is_remote,
        })),
    )
}

/// Build a `peer_connected`/`peer_disconnected`/`peer_gave_up` event.
pub fn peer_event(kind: &str, host: &str) -> Event {
    Event::new(kind, Some(serde_json::json!({ "host": host })))
}

#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("failed to bind federation port {port}: {source}")]
    BindPort {
        port: u16,
        source: std::io::Error,
    },
    #[error("failed to bind control socket {path}: {source}")]
    BindControl {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to write pid file: {0}")]
    PidFile(std::io::Error),
    #[error("control directory unavailable: {0}")]
    ControlDir(std::io::Error),
    #[error("failed to install signal handler: {0}")]
    Signal(std::io::Error),
}

/// Run the daemon until a shutdown request or fatal error.
///
/// Binds everything before spawning anything, so port conflicts and a
/// missing control directory fail fast with a nonzero exit.
pub async fn run(control_dir: ControlDir, port_override: Option<u16>) -> Result<(), FatalError> {
    control_dir.ensure().map_err(FatalError::ControlDir)?;

    let mut config = DaemonConfig::load(&control_dir);
    if let Some(port) = port_override {
        config.port = port;
    }
    let port = config.port;

    // Bind the federation listener first — fail fast on port conflicts.
    let tcp_listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|source| FatalError::BindPort { port, source })?;

    // Replace a stale control socket from a crashed predecessor.
    let sock_path = control_dir.daemon_sock();
    match std::fs::remove_file(&sock_path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            return Err(FatalError::BindControl {
                path: sock_path.display().to_string(),
                source: e,
            });
        }
        _ => {}
    }
    let unix_listener = UnixListener::bind(&sock_path).map_err(|source| FatalError::BindControl {
        path: sock_path.display().to_string(),
        source,
    })?;
    set_mode_0600(&sock_path).map_err(|source| FatalError::BindControl {
        path: sock_path.display().to_string(),
        source,
    })?;

    let pid = std::process::id();
    std::fs::write(control_dir.daemon_pid(), format!("{pid}\n")).map_err(FatalError::PidFile)?;

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let peers = config.peers.clone();
    let state: SharedState = Arc::new(RwLock::new(DaemonState::new(
        control_dir.clone(),
        config,
        port,
        shutdown_tx,
    )));

    info!(pid, port, dir = %control_dir.root().display(), "tether daemon up");

    let mut tasks = vec![
        watcher::spawn(Arc::clone(&state)),
        federation::spawn_listener(Arc::clone(&state), tcp_listener),
        control::spawn(Arc::clone(&state), unix_listener),
        spawn_auto_shutdown(Arc::clone(&state)),
    ];

    // Reconnect to every persisted peer.
    for addr in peers {
        let (host, peer_port) = config::parse_peer_addr(&addr);
        tasks.push(federation::spawn_connector(
            Arc::clone(&state),
            host,
            peer_port,
        ));
    }

    // Park until a shutdown request or a termination signal.
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(FatalError::Signal)?;
    tokio::select! {
        _ = shutdown_rx.changed() => info!("shutdown requested"),
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        _ = sigterm.recv() => info!("terminated"),
    }

    for task in &tasks {
        task.abort();
    }
    {
        // Close live peer links so remotes see the loss promptly.
        let st = state.read().await;
        for entry in st.peers.values() {
            if let Some(link) = &entry.link {
                let _ = link.send(LinkMsg::Shutdown);
            }
        }
    }
    let _ = std::fs::remove_file(&sock_path);
    let _ = std::fs::remove_file(control_dir.daemon_pid());
    info!("tether daemon down");
    Ok(())
}

fn set_mode_0600(path: &std::path::Path) -> std::io::Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    std::fs::set_permissions(path, perms)
}

/// Exit on prolonged idleness: no local sessions, no connected peers,
/// and nothing touched the daemon for the configured timeout.
fn auto_shutdown_due(st: &DaemonState) -> bool {
    st.local_sessions.is_empty()
        && st.connected_peer_count() == 0
        && st.last_activity.elapsed() >= st.config.auto_shutdown()
}

fn spawn_auto_shutdown(state: SharedState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(5));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            let st = state.read().await;
            if auto_shutdown_due(&st) {
                warn!(
                    idle_secs = st.last_activity.elapsed().as_secs(),
                    "idle with nothing attached, exiting"
                );
                st.request_shutdown();
                return;
            }
        }
    })
}
