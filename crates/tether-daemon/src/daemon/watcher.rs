//! Discovery watcher — keeps the local-session table in step with the
//! control directory.
//!
//! Scans on startup and then on a 1 s cadence. A detected change is
//! rechecked after a short debounce so the rename-then-unlink pattern of
//! a rebinding endpoint does not produce a remove/add flap. A session
//! enters the table only after a successful liveness probe; nodes whose
//! probe fails are left on disk untouched — the daemon never unlinks
//! another process's endpoint node.

use std::path::Path;
use std::time::{Duration, Instant};

use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use tether_wire::{names, PeerMessage, SessionInfo};

use super::{session_event, LocalSessionEntry, SharedState};

/// A probe counts as alive iff connect completes within this window.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(300);

/// Settle time after a directory change before rechecking existence.
const DEBOUNCE: Duration = Duration::from_millis(50);

/// Scan cadence, and how often a tabled session is re-probed.
const SCAN_INTERVAL: Duration = Duration::from_secs(1);
const REPROBE_INTERVAL: Duration = Duration::from_secs(10);

pub fn spawn(state: SharedState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        scan(&state).await;
        let mut tick = tokio::time::interval(SCAN_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            scan(&state).await;
        }
    })
}

/// A probe counts as alive iff a connect completes in time. No bytes are
/// sent; the stream is dropped immediately.
pub async fn probe(path: &Path) -> bool {
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, UnixStream::connect(path)).await,
        Ok(Ok(_))
    )
}

/// One reconciliation pass: directory contents vs the session table.
async fn scan(state: &SharedState) {
    let (control_dir, known): (_, Vec<String>) = {
        let st = state.read().await;
        (
            st.control_dir.clone(),
            st.local_sessions.keys().cloned().collect(),
        )
    };

    let mut on_disk = control_dir.sessions();
    let changed = on_disk.iter().any(|id| !known.contains(id))
        || known.iter().any(|id| !on_disk.contains(id));
    if changed {
        // Absorb rename-then-unlink before acting.
        tokio::time::sleep(DEBOUNCE).await;
        on_disk = control_dir.sessions();
    }

    // Removals: node gone from the directory.
    for id in &known {
        if !on_disk.contains(id) {
            remove_session(state, id).await;
        }
    }

    // Additions: fresh nodes that answer a probe.
    for id in &on_disk {
        if known.contains(id) {
            continue;
        }
        let sock = control_dir.endpoint_sock(id);
        if !probe(&sock).await {
            debug!(session_id = %id, "endpoint node not answering, skipping");
            continue;
        }
        let name = match names::load_or_assign(&control_dir, id) {
            Ok(name) => name,
            Err(e) => {
                warn!(session_id = %id, "name assignment failed: {e}");
                continue;
            }
        };
        let info = SessionInfo {
            session_id: id.clone(),
            name,
            aliases: control_dir.aliases_for(id),
        };
        add_session(state, info, sock).await;
    }

    // Existing entries: periodic re-probe and alias refresh.
    refresh_known(state, &on_disk).await;
}

async fn add_session(state: &SharedState, info: SessionInfo, sock: std::path::PathBuf) {
    let mut st = state.write().await;
    info!(session_id = %info.session_id, name = %info.name, "session discovered");
    st.local_sessions.insert(
        info.session_id.clone(),
        LocalSessionEntry {
            info: info.clone(),
            socket_path: sock,
            verified_at: Instant::now(),
        },
    );
    st.touch();
    st.push_to_peers(&PeerMessage::SessionAdded {
        session: info.clone(),
    });
    let host = st.hostname.clone();
    st.broadcast_event(session_event("session_added", &info, &host, false));
}

async fn remove_session(state: &SharedState, id: &str) {
    let mut st = state.write().await;
    let Some(entry) = st.local_sessions.remove(id) else {
        return;
    };
    info!(session_id = %id, "session gone");
    st.touch();
    st.push_to_peers(&PeerMessage::SessionRemoved {
        session_id: id.to_owned(),
    });
    let host = st.hostname.clone();
    st.broadcast_event(session_event("session_removed", &entry.info, &host, false));
}

/// Re-probe stale table entries and pick up alias changes.
async fn refresh_known(state: &SharedState, on_disk: &[String]) {
    let stale: Vec<(String, std::path::PathBuf)> = {
        let st = state.read().await;
        st.local_sessions
            .values()
            .filter(|entry| entry.verified_at.elapsed() >= REPROBE_INTERVAL)
            .map(|entry| (entry.info.session_id.clone(), entry.socket_path.clone()))
            .collect()
    };
    for (id, sock) in stale {
        if probe(&sock).await {
            let mut st = state.write().await;
            if let Some(entry) = st.local_sessions.get_mut(&id) {
                entry.verified_at = Instant::now();
            }
        } else {
            warn!(session_id = %id, "endpoint stopped answering");
            remove_session(state, &id).await;
        }
    }

    // Aliases are rebuildable from a directory scan; refresh them so
    // list_sessions and peer snapshots stay truthful after a rename.
    let mut st = state.write().await;
    for id in on_disk {
        let aliases = st.control_dir.aliases_for(id);
        if let Some(entry) = st.local_sessions.get_mut(id) {
            if entry.info.aliases != aliases {
                entry.info.aliases = aliases;
            }
        }
    }
}
