//! The relay path — route an RPC to a local endpoint or across a peer
//! link, meter it, audit it, and bound it with a per-command deadline.
//!
//! A target in the local-session table never traverses the peer
//! protocol. Remote legs are correlated by a daemon-generated wire id;
//! a late `rpc_response` finds no pending entry and is dropped.

use std::time::Duration;

use futures::SinkExt;
use serde_json::Value;
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use tether_wire::{ControlDir, ErrorKind, LineCodec, PeerMessage, Response, validate_id};

use super::{LinkMsg, LinkSender, SharedState};

/// Deadline for one relayed command, by command kind.
pub fn relay_timeout(command: &Value) -> Duration {
    match command.get("type").and_then(|t| t.as_str()) {
        Some("get_message") | Some("clear") => Duration::from_secs(15),
        Some("get_summary") => Duration::from_secs(60),
        Some("send") => Duration::from_secs(300),
        _ => Duration::from_secs(10),
    }
}

fn command_action(command: &Value) -> String {
    command
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("unknown")
        .to_owned()
}

/// Where a relay target was found.
enum Route {
    Local(String),
    Peer {
        host: String,
        open: bool,
        link: Option<LinkSender>,
    },
    Nowhere,
}

/// Serve one `relay` request from the control plane.
pub async fn handle_relay(
    state: &SharedState,
    origin: &str,
    target_session_id: String,
    rpc_command: Value,
    request_id: String,
    fire_and_forget: bool,
) -> Response {
    let action = command_action(&rpc_command);

    // Authorize and meter first; a rate-limit rejection never turns into
    // any other error kind downstream.
    {
        let mut st = state.write().await;
        st.touch();
        if !st.limiter.check(origin) {
            let message = ErrorKind::RateLimited.to_string();
            st.audit
                .record(origin, &action, &target_session_id, Some(&message));
            return Response::fail("relay", message);
        }
    }

    if validate_id(&target_session_id).is_err() {
        let message = ErrorKind::Parse("invalid target session id".into()).to_string();
        let st = state.read().await;
        st.audit
            .record(origin, &action, &target_session_id, Some(&message));
        return Response::fail("relay", message);
    }

    let deadline = relay_timeout(&rpc_command);
    let (route, control_dir) = {
        let st = state.read().await;
        (resolve_route(&st, &target_session_id), st.control_dir.clone())
    };

    match route {
        Route::Local(session_id) => {
            if fire_and_forget {
                // Ack now; delivery failures are logged, not surfaced.
                let command = rpc_command.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        call_local_endpoint(&control_dir, &session_id, &command, deadline).await
                    {
                        warn!(%session_id, "fire-and-forget relay failed: {e}");
                    }
                });
                return Response::ok(
                    "relay",
                    Some(serde_json::json!({ "requestId": request_id })),
                );
            }
            match call_local_endpoint(&control_dir, &session_id, &rpc_command, deadline).await {
                Ok(inner) => {
                    let st = state.read().await;
                    st.audit.record(origin, &action, &target_session_id, None);
                    Response::ok(
                        "relay",
                        Some(serde_json::json!({ "requestId": request_id, "response": inner })),
                    )
                }
                Err(kind) => {
                    let message = kind.to_string();
                    let st = state.read().await;
                    st.audit
                        .record(origin, &action, &target_session_id, Some(&message));
                    Response::fail("relay", message)
                }
            }
        }

        Route::Peer { host, open: false, .. } => {
            let message = ErrorKind::PeerUnreachable.to_string();
            let st = state.read().await;
            st.audit
                .record(origin, &action, &target_session_id, Some(&message));
            debug!(%host, %target_session_id, "relay to disconnected peer refused");
            Response::fail("relay", message)
        }

        Route::Peer { host, open: true, link } => {
            let Some(link) = link else {
                let message = ErrorKind::Transport("peer link unavailable".into()).to_string();
                let st = state.read().await;
                st.audit
                    .record(origin, &action, &target_session_id, Some(&message));
                return Response::fail("relay", message);
            };

            // Wire ids are daemon-generated so they are unique for this
            // process lifetime whatever clients put in `requestId`.
            let wire_id = uuid::Uuid::new_v4().to_string();
            let rpc = PeerMessage::Rpc {
                target_session_id: target_session_id.clone(),
                request_id: wire_id.clone(),
                command: rpc_command,
            };

            if fire_and_forget {
                // No pending entry: the eventual response is unmatched
                // and dropped.
                let _ = link.send(LinkMsg::Frame(rpc));
                return Response::ok(
                    "relay",
                    Some(serde_json::json!({ "requestId": request_id })),
                );
            }

            let (tx, rx) = oneshot::channel();
            {
                let mut st = state.write().await;
                st.pending_relays.insert(wire_id.clone(), tx);
            }
            if link.send(LinkMsg::Frame(rpc)).is_err() {
                let mut st = state.write().await;
                st.pending_relays.remove(&wire_id);
                let message = ErrorKind::Transport("peer link closed".into()).to_string();
                st.audit
                    .record(origin, &action, &target_session_id, Some(&message));
                return Response::fail("relay", message);
            }

            match tokio::time::timeout(deadline, rx).await {
                Ok(Ok(inner)) => {
                    let st = state.read().await;
                    st.audit.record(origin, &action, &target_session_id, None);
                    Response::ok(
                        "relay",
                        Some(serde_json::json!({ "requestId": request_id, "response": inner })),
                    )
                }
                Ok(Err(_)) => {
                    let mut st = state.write().await;
                    st.pending_relays.remove(&wire_id);
                    let message = ErrorKind::Transport("peer link closed".into()).to_string();
                    st.audit
                        .record(origin, &action, &target_session_id, Some(&message));
                    Response::fail("relay", message)
                }
                Err(_) => {
                    let mut st = state.write().await;
                    st.pending_relays.remove(&wire_id);
                    let message = ErrorKind::Timeout {
                        ms: deadline.as_millis() as u64,
                    }
                    .to_string();
                    st.audit
                        .record(origin, &action, &target_session_id, Some(&message));
                    Response::fail("relay", message)
                }
            }
        }

        Route::Nowhere => {
            let message = ErrorKind::NotFound.to_string();
            let st = state.read().await;
            st.audit
                .record(origin, &action, &target_session_id, Some(&message));
            Response::fail("relay", message)
        }
    }
}

/// Serve one `rpc` frame received over a peer link: execute against the
/// local session and push the `rpc_response` back on the same link.
pub async fn handle_peer_rpc(
    state: &SharedState,
    limiter_key: &str,
    target_session_id: &str,
    request_id: String,
    command: Value,
    link_tx: LinkSender,
) {
    let action = command_action(&command);

    let metered = {
        let mut st = state.write().await;
        st.touch();
        st.limiter.check(limiter_key)
    };
    let inner = if !metered {
        let message = ErrorKind::RateLimited.to_string();
        let st = state.read().await;
        st.audit
            .record(limiter_key, &action, target_session_id, Some(&message));
        fail_value(&action, &message)
    } else if validate_id(target_session_id).is_err() {
        fail_value(&action, &ErrorKind::Parse("invalid target session id".into()).to_string())
    } else {
        let (route, control_dir) = {
            let st = state.read().await;
            (resolve_route(&st, target_session_id), st.control_dir.clone())
        };
        match route {
            Route::Local(session_id) => {
                let deadline = relay_timeout(&command);
                match call_local_endpoint(&control_dir, &session_id, &command, deadline).await {
                    Ok(inner) => {
                        let st = state.read().await;
                        st.audit.record(limiter_key, &action, target_session_id, None);
                        inner
                    }
                    Err(kind) => {
                        let message = kind.to_string();
                        let st = state.read().await;
                        st.audit
                            .record(limiter_key, &action, target_session_id, Some(&message));
                        fail_value(&action, &message)
                    }
                }
            }
            // Peer-originated RPCs are never re-forwarded.
            _ => {
                let message = ErrorKind::NotFound.to_string();
                let st = state.read().await;
                st.audit
                    .record(limiter_key, &action, target_session_id, Some(&message));
                fail_value(&action, &message)
            }
        }
    };

    let _ = link_tx.send(LinkMsg::Frame(PeerMessage::RpcResponse {
        request_id,
        response: inner,
    }));
}

fn fail_value(action: &str, message: &str) -> Value {
    serde_json::to_value(Response::fail(action, message)).unwrap_or(Value::Null)
}

/// Find the target: local table first (an alias is reread from disk),
/// then connected peers' tables.
fn resolve_route(st: &super::DaemonState, target: &str) -> Route {
    if st.local_sessions.contains_key(target) {
        return Route::Local(target.to_owned());
    }
    // Names resolve afresh on every relay; a stale alias never redirects.
    if let Some(resolved) = st.control_dir.resolve(target) {
        if st.local_sessions.contains_key(&resolved) {
            return Route::Local(resolved);
        }
    }
    if let Some(peer) = st.peer_for_session(target) {
        return Route::Peer {
            host: peer.host.clone(),
            open: peer.open,
            link: peer.link.clone(),
        };
    }
    Route::Nowhere
}

/// Open a fresh connection to a local endpoint, write one command frame,
/// and return its one response frame verbatim.
pub async fn call_local_endpoint(
    control_dir: &ControlDir,
    session_id: &str,
    command: &Value,
    deadline: Duration,
) -> Result<Value, ErrorKind> {
    let exchange = async {
        let sock = control_dir.endpoint_sock(session_id);
        let stream = UnixStream::connect(&sock)
            .await
            .map_err(|e| ErrorKind::Transport(e.to_string()))?;
        let mut framed = Framed::new(stream, LineCodec);
        let json =
            serde_json::to_string(command).map_err(|e| ErrorKind::Transport(e.to_string()))?;
        framed
            .send(json)
            .await
            .map_err(|e| ErrorKind::Transport(e.to_string()))?;
        match framed.next().await {
            Some(Ok(line)) => serde_json::from_str(&line)
                .map_err(|e| ErrorKind::Transport(format!("invalid endpoint response: {e}"))),
            Some(Err(e)) => Err(ErrorKind::Transport(e.to_string())),
            None => Err(ErrorKind::Transport("endpoint closed the connection".into())),
        }
    };
    match tokio::time::timeout(deadline, exchange).await {
        Ok(result) => result,
        Err(_) => Err(ErrorKind::Timeout {
            ms: deadline.as_millis() as u64,
        }),
    }
}
