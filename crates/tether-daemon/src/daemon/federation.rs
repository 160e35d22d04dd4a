//! Peer federation — the TCP listener, outbound connectors, and the
//! shared link loop both directions run after the hello exchange.
//!
//! One link per peer host, whichever side dialed. Outbound links get
//! exactly one reconnect attempt 3 s after a failure, then the entry is
//! marked gave-up until a fresh `add_peer`. Inbound links never
//! reconnect — the remote side owns that. A duplicate inbound hello for
//! a host with a live link replaces the older socket.

use std::time::Duration;

use futures::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use tether_wire::{
    codec::CodecError, frames::ErrorFrame, ErrorKind, Event, LineCodec, PeerMessage, SessionInfo,
    validate_id,
};

use super::{peer_event, relay, session_event, LinkMsg, LinkSender, PeerEntry, SharedState};

/// How long a dial may take before it counts as failed.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for the remote hello before dropping the socket.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay before the single reconnect attempt.
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Dead-peer cutoff: no inbound frame for this many heartbeat intervals.
const DEAD_PEER_MULTIPLIER: u32 = 3;

/// Why a link loop returned.
enum LinkOutcome {
    /// Socket closed, faulted, or went silent — reconnect policy applies.
    Lost,
    /// Shutdown or replacement was requested — never reconnect.
    ShutdownRequested,
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

pub fn spawn_listener(state: SharedState, listener: TcpListener) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Ok((stream, addr)) = listener.accept().await else {
                return;
            };
            debug!(%addr, "inbound peer connection");
            let state = state.clone();
            tokio::spawn(async move {
                handle_inbound(state, stream, addr).await;
            });
        }
    })
}

async fn handle_inbound(state: SharedState, stream: TcpStream, addr: std::net::SocketAddr) {
    let limiter_key = addr.ip().to_string();
    let mut framed = Framed::new(stream, LineCodec);

    let hello = match exchange_hello(&state, &mut framed).await {
        Ok(hello) => hello,
        Err(e) => {
            warn!(%addr, "inbound hello failed: {e}");
            return;
        }
    };
    if hello.host.is_empty() {
        warn!(%addr, "inbound hello with empty host, dropping");
        return;
    }

    let (link_tx, link_rx) = mpsc::unbounded_channel();
    let gen = install_link(
        &state,
        &hello.host,
        hello.port,
        hello.sessions,
        link_tx.clone(),
    )
    .await;
    info!(host = %hello.host, %addr, "peer link up (inbound)");

    let _ = link_loop(&state, &mut framed, &hello.host, &limiter_key, link_tx, link_rx, gen).await;
    teardown_link(&state, &hello.host, gen).await;
    // Inbound links are never reconnected from this side.
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Spawn the dial loop for one peer host. A no-op if a connector already
/// owns the entry or the link is up.
pub fn spawn_connector(state: SharedState, host: String, port: u16) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        {
            let mut st = state.write().await;
            let entry = st
                .peers
                .entry(host.clone())
                .or_insert_with(|| PeerEntry::new(host.clone(), port));
            if entry.connecting || entry.open {
                return;
            }
            entry.connecting = true;
            entry.removed = false;
            entry.gave_up = false;
            entry.last_error = None;
            entry.port = port;
        }

        connector_loop(&state, &host, port).await;

        if let Some(entry) = state.write().await.peers.get_mut(&host) {
            entry.connecting = false;
        }
    })
}

/// Dial, run, and apply the single-retry reconnect policy.
async fn connector_loop(state: &SharedState, host: &str, port: u16) {
    // Whether the next failed dial exhausts the budget.
    let mut final_attempt = false;
    loop {
        match run_outbound(state, host, port).await {
            Ok(LinkOutcome::ShutdownRequested) => return,
            Ok(LinkOutcome::Lost) => {
                // One attempt follows a loss; success re-arms it.
                final_attempt = true;
            }
            Err(e) => {
                warn!(host, port, "peer dial failed: {e}");
                {
                    let mut st = state.write().await;
                    if let Some(entry) = st.peers.get_mut(host) {
                        entry.last_error = Some(e);
                    }
                }
                if final_attempt {
                    give_up(state, host).await;
                    return;
                }
                final_attempt = true;
            }
        }

        {
            let st = state.read().await;
            match st.peers.get(host) {
                None => return,
                Some(entry) if entry.removed => return,
                _ => {}
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn give_up(state: &SharedState, host: &str) {
    let mut st = state.write().await;
    if let Some(entry) = st.peers.get_mut(host) {
        entry.gave_up = true;
    }
    info!(host, "peer retry budget exhausted");
    st.broadcast_event(peer_event("peer_gave_up", host));
}

/// One outbound connection: dial, hello, link loop, teardown.
async fn run_outbound(state: &SharedState, host: &str, port: u16) -> Result<LinkOutcome, String> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| format!("connect to {host}:{port} timed out"))?
        .map_err(|e| e.to_string())?;
    let limiter_key = stream
        .peer_addr()
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|_| host.to_owned());
    let mut framed = Framed::new(stream, LineCodec);

    let hello = exchange_hello(state, &mut framed).await?;

    let (link_tx, link_rx) = mpsc::unbounded_channel();
    // The entry stays keyed by the host we dialed, whatever the remote
    // calls itself.
    let gen = install_link(state, host, port, hello.sessions, link_tx.clone()).await;
    info!(host, port, "peer link up (outbound)");

    let outcome = link_loop(state, &mut framed, host, &limiter_key, link_tx, link_rx, gen).await;
    teardown_link(state, host, gen).await;
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Hello exchange
// ---------------------------------------------------------------------------

struct RemoteHello {
    host: String,
    port: u16,
    sessions: Vec<SessionInfo>,
}

/// Send our hello, then require the remote's as the first inbound frame.
async fn exchange_hello(
    state: &SharedState,
    framed: &mut Framed<TcpStream, LineCodec>,
) -> Result<RemoteHello, String> {
    let ours = {
        let st = state.read().await;
        PeerMessage::Hello {
            host: st.hostname.clone(),
            port: st.port,
            sessions: st.session_snapshot(),
        }
    };
    let json = serde_json::to_string(&ours).map_err(|e| e.to_string())?;
    framed.send(json).await.map_err(|e| e.to_string())?;

    let first = tokio::time::timeout(HELLO_TIMEOUT, framed.next())
        .await
        .map_err(|_| "no hello within timeout".to_owned())?;
    let line = match first {
        Some(Ok(line)) => line,
        Some(Err(e)) => return Err(e.to_string()),
        None => return Err("closed before hello".to_owned()),
    };
    match serde_json::from_str::<PeerMessage>(&line) {
        Ok(PeerMessage::Hello { host, port, sessions }) => {
            Ok(RemoteHello { host, port, sessions })
        }
        Ok(other) => Err(format!("first frame must be hello, got {other:?}")),
        Err(e) => Err(format!("invalid hello: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Link lifecycle
// ---------------------------------------------------------------------------

/// Register a freshly established link on the peer entry, replacing any
/// older socket for the same host, and commit its session snapshot.
async fn install_link(
    state: &SharedState,
    host: &str,
    port: u16,
    sessions: Vec<SessionInfo>,
    link_tx: LinkSender,
) -> u64 {
    let mut st = state.write().await;
    let gen = st.next_link_gen();
    let entry = st
        .peers
        .entry(host.to_owned())
        .or_insert_with(|| PeerEntry::new(host.to_owned(), port));
    let was_open = entry.open;
    if let Some(older) = entry.link.take() {
        // Duplicate-connection rule: the older socket goes away quietly.
        let _ = older.send(LinkMsg::Shutdown);
    }
    entry.open = true;
    entry.gave_up = false;
    entry.last_error = None;
    entry.port = port;
    entry.link = Some(link_tx);
    entry.link_gen = gen;
    entry.last_seen = std::time::Instant::now();
    // The hello snapshot supersedes whatever the last link advertised.
    entry.sessions.clear();
    st.touch();

    if !was_open {
        st.broadcast_event(peer_event("peer_connected", host));
    }
    for info in sessions {
        if validate_id(&info.session_id).is_err() {
            warn!(host, session_id = %info.session_id, "rejecting unsafe session id in hello");
            continue;
        }
        st.claim_remote_session(host, info.clone());
        st.broadcast_event(session_event("session_added", &info, host, true));
    }
    gen
}

/// Undo `install_link` — unless a newer link already owns the entry.
async fn teardown_link(state: &SharedState, host: &str, gen: u64) {
    let mut st = state.write().await;
    let Some(entry) = st.peers.get_mut(host) else {
        return;
    };
    if entry.link_gen != gen {
        return;
    }
    entry.open = false;
    entry.link = None;
    // The table keeps the last-known sessions: a relay targeting one of
    // them reports a disconnected peer rather than an unknown session.
    let mut removed: Vec<SessionInfo> = entry.sessions.values().cloned().collect();
    removed.sort_by(|a, b| a.session_id.cmp(&b.session_id));
    st.touch();
    st.broadcast_event(peer_event("peer_disconnected", host));
    for info in removed {
        st.broadcast_event(session_event("session_removed", &info, host, true));
    }
    info!(host, "peer link down");
}

/// The established-link loop: inbound frames, outbound queue, heartbeat,
/// and the silent-peer cutoff.
async fn link_loop(
    state: &SharedState,
    framed: &mut Framed<TcpStream, LineCodec>,
    host: &str,
    limiter_key: &str,
    link_tx: LinkSender,
    mut link_rx: mpsc::UnboundedReceiver<LinkMsg>,
    gen: u64,
) -> LinkOutcome {
    let heartbeat = {
        let st = state.read().await;
        st.config.heartbeat()
    };
    let mut hb = tokio::time::interval(heartbeat);
    hb.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    hb.tick().await; // skip the immediate first tick

    let mut last_inbound = tokio::time::Instant::now();

    loop {
        let dead_deadline = last_inbound + heartbeat * DEAD_PEER_MULTIPLIER;
        tokio::select! {
            frame = framed.next() => {
                let line = match frame {
                    Some(Ok(line)) => line,
                    Some(Err(CodecError::FrameTooLong)) => {
                        let err = ErrorFrame { error: ErrorKind::SizeExceeded.to_string() };
                        if let Ok(json) = serde_json::to_string(&err) {
                            let _ = framed.send(json).await;
                        }
                        return LinkOutcome::Lost;
                    }
                    Some(Err(e)) => {
                        warn!(host, "peer read error: {e}");
                        return LinkOutcome::Lost;
                    }
                    None => return LinkOutcome::Lost,
                };
                last_inbound = tokio::time::Instant::now();
                match serde_json::from_str::<PeerMessage>(&line) {
                    Ok(msg) => handle_peer_frame(state, host, limiter_key, &link_tx, gen, msg).await,
                    Err(e) => {
                        warn!(host, "malformed peer frame: {e}");
                        let mut st = state.write().await;
                        st.broadcast_event(Event::new(
                            "error",
                            Some(serde_json::json!({
                                "message": format!("malformed frame from peer {host}: {e}")
                            })),
                        ));
                    }
                }
            }

            msg = link_rx.recv() => {
                match msg {
                    Some(LinkMsg::Frame(frame)) => {
                        let Ok(json) = serde_json::to_string(&frame) else { continue };
                        if framed.send(json).await.is_err() {
                            return LinkOutcome::Lost;
                        }
                    }
                    Some(LinkMsg::Shutdown) | None => return LinkOutcome::ShutdownRequested,
                }
            }

            _ = hb.tick() => {
                let Ok(json) = serde_json::to_string(&PeerMessage::Heartbeat) else { continue };
                if framed.send(json).await.is_err() {
                    return LinkOutcome::Lost;
                }
            }

            _ = tokio::time::sleep_until(dead_deadline) => {
                warn!(host, "no frames for {}x heartbeat, closing link", DEAD_PEER_MULTIPLIER);
                return LinkOutcome::Lost;
            }
        }
    }
}

/// Apply one inbound frame from an established peer link.
async fn handle_peer_frame(
    state: &SharedState,
    host: &str,
    limiter_key: &str,
    link_tx: &LinkSender,
    gen: u64,
    msg: PeerMessage,
) {
    {
        let mut st = state.write().await;
        st.touch();
        if let Some(entry) = st.peers.get_mut(host) {
            entry.last_seen = std::time::Instant::now();
        }
    }

    match msg {
        PeerMessage::Hello { sessions, .. } => rehello(state, host, gen, sessions).await,
        PeerMessage::Heartbeat => {}

        PeerMessage::SessionAdded { session } => {
            if validate_id(&session.session_id).is_err() {
                warn!(host, session_id = %session.session_id, "rejecting unsafe session id");
                return;
            }
            let mut st = state.write().await;
            st.claim_remote_session(host, session.clone());
            st.broadcast_event(session_event("session_added", &session, host, true));
        }

        PeerMessage::SessionRemoved { session_id } => {
            let mut st = state.write().await;
            let removed = st
                .peers
                .get_mut(host)
                .and_then(|entry| entry.sessions.remove(&session_id));
            if let Some(info) = removed {
                st.broadcast_event(session_event("session_removed", &info, host, true));
            }
        }

        PeerMessage::Rpc { target_session_id, request_id, command } => {
            let state = state.clone();
            let limiter_key = limiter_key.to_owned();
            let link_tx = link_tx.clone();
            tokio::spawn(async move {
                relay::handle_peer_rpc(
                    &state,
                    &limiter_key,
                    &target_session_id,
                    request_id,
                    command,
                    link_tx,
                )
                .await;
            });
        }

        PeerMessage::RpcResponse { request_id, response } => {
            let waiter = {
                let mut st = state.write().await;
                st.pending_relays.remove(&request_id)
            };
            match waiter {
                Some(tx) => {
                    let _ = tx.send(response);
                }
                // Late or never-ours: dropped without side effect.
                None => debug!(host, %request_id, "dropping unmatched rpc_response"),
            }
        }
    }
}

/// A repeated hello is a snapshot refresh: diff it against the table.
async fn rehello(state: &SharedState, host: &str, gen: u64, sessions: Vec<SessionInfo>) {
    let mut st = state.write().await;
    let Some(entry) = st.peers.get_mut(host) else {
        return;
    };
    if entry.link_gen != gen {
        return;
    }
    let mut old = std::mem::take(&mut entry.sessions);
    let mut added = Vec::new();
    for info in sessions {
        if validate_id(&info.session_id).is_err() {
            continue;
        }
        if old.remove(&info.session_id).is_none() {
            added.push(info.clone());
        }
        entry.sessions.insert(info.session_id.clone(), info);
    }
    let removed: Vec<SessionInfo> = old.into_values().collect();
    for info in added {
        let info2 = info.clone();
        st.claim_remote_session(host, info);
        st.broadcast_event(session_event("session_added", &info2, host, true));
    }
    for info in removed {
        st.broadcast_event(session_event("session_removed", &info, host, true));
    }
}
