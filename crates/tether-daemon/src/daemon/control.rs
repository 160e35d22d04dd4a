//! Control plane — the daemon's own Unix-socket listener.
//!
//! Serves status, peer administration, session listing, relay, and the
//! long-lived event stream to local clients. Per-connection FIFO: one
//! response per request, in request order; a `subscribe` upgrade
//! interleaves event frames with later responses on the same socket.

use std::time::Duration;

use futures::SinkExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use tether_wire::{
    codec::CodecError, frames::ErrorFrame, DaemonRequest, ErrorKind, Event, LineCodec, Response,
};

use super::config::parse_peer_addr;
use super::{federation, relay, tailscale, SharedState, LOCAL_REQUESTER};

/// How long `add_peer` waits for the link to open.
const ADD_PEER_DEADLINE: Duration = Duration::from_secs(10);
const ADD_PEER_POLL: Duration = Duration::from_millis(100);

pub fn spawn(state: SharedState, listener: UnixListener) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let state = state.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_client(state, stream).await {
                    debug!("control client error: {e}");
                }
            });
        }
    })
}

async fn handle_client(
    state: SharedState,
    stream: UnixStream,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut framed = Framed::new(stream, LineCodec);
    let mut event_rx: Option<mpsc::UnboundedReceiver<Event>> = None;
    let mut subscriber_id: Option<u64> = None;

    loop {
        tokio::select! {
            frame = framed.next() => {
                let line = match frame {
                    Some(Ok(line)) => line,
                    Some(Err(CodecError::FrameTooLong)) => {
                        let err = ErrorFrame { error: ErrorKind::SizeExceeded.to_string() };
                        let _ = framed.send(serde_json::to_string(&err)?).await;
                        break;
                    }
                    Some(Err(e)) => {
                        debug!("control read error: {e}");
                        break;
                    }
                    None => break,
                };

                state.write().await.touch();

                let request: DaemonRequest = match serde_json::from_str(&line) {
                    Ok(request) => request,
                    Err(e) => {
                        let command = serde_json::from_str::<serde_json::Value>(&line)
                            .ok()
                            .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(String::from))
                            .unwrap_or_else(|| "unknown".into());
                        let resp =
                            Response::fail(command, ErrorKind::Parse(e.to_string()).to_string());
                        framed.send(resp.to_json()?).await?;
                        continue;
                    }
                };

                let resp = match request {
                    DaemonRequest::Subscribe => {
                        if event_rx.is_none() {
                            let (id, rx) = state.write().await.subscribe();
                            subscriber_id = Some(id);
                            event_rx = Some(rx);
                        }
                        Response::ok("subscribe", None)
                    }
                    DaemonRequest::Kill => {
                        let resp = Response::ok("kill", None);
                        framed.send(resp.to_json()?).await?;
                        info!("kill acknowledged");
                        state.read().await.request_shutdown();
                        continue;
                    }
                    other => handle_request(&state, other).await,
                };
                framed.send(resp.to_json()?).await?;
            }

            event = async {
                match event_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => None,
                }
            }, if event_rx.is_some() => {
                match event {
                    Some(event) => framed.send(event.to_json()?).await?,
                    None => break,
                }
            }
        }
    }

    if let Some(id) = subscriber_id {
        state.write().await.unsubscribe(id);
    }
    Ok(())
}

/// Dispatch one parsed request. `subscribe` and `kill` are handled by the
/// connection loop; everything else lands here.
async fn handle_request(state: &SharedState, request: DaemonRequest) -> Response {
    match request {
        DaemonRequest::Status => {
            let st = state.read().await;
            let peers: Vec<serde_json::Value> = st
                .peers
                .values()
                .map(|peer| {
                    serde_json::json!({
                        "host": peer.host,
                        "port": peer.port,
                        "transport": if peer.open { "open" } else { "closed" },
                        "sessions": peer.sessions.len(),
                        "lastSeenSecs": peer.last_seen.elapsed().as_secs(),
                        "gaveUp": peer.gave_up,
                    })
                })
                .collect();
            Response::ok(
                "status",
                Some(serde_json::json!({
                    "pid": std::process::id(),
                    "uptimeSecs": st.started_at.elapsed().as_secs(),
                    "port": st.port,
                    "host": st.hostname,
                    "localSessions": st.local_sessions.len(),
                    "connectedPeers": st.connected_peer_count(),
                    "peers": peers,
                })),
            )
        }

        DaemonRequest::AddPeer { host, port } => handle_add_peer(state, host, port).await,

        DaemonRequest::RemovePeer { host } => handle_remove_peer(state, host).await,

        DaemonRequest::ListSessions => {
            let st = state.read().await;
            let sessions = st.session_records();
            match serde_json::to_value(&sessions) {
                Ok(value) => {
                    Response::ok("list_sessions", Some(serde_json::json!({ "sessions": value })))
                }
                Err(e) => Response::fail("list_sessions", e.to_string()),
            }
        }

        DaemonRequest::ListTailscale => match tailscale::list().await {
            Ok(hosts) => match serde_json::to_value(&hosts) {
                Ok(value) => {
                    Response::ok("list_tailscale", Some(serde_json::json!({ "hosts": value })))
                }
                Err(e) => Response::fail("list_tailscale", e.to_string()),
            },
            Err(e) => Response::fail("list_tailscale", e),
        },

        DaemonRequest::Relay {
            target_session_id,
            rpc_command,
            request_id,
            fire_and_forget,
        } => {
            relay::handle_relay(
                state,
                LOCAL_REQUESTER,
                target_session_id,
                rpc_command,
                request_id,
                fire_and_forget,
            )
            .await
        }

        DaemonRequest::StartDaemon => Response::ok("start-daemon", None),

        // Unreachable: the connection loop intercepts these.
        DaemonRequest::Subscribe => Response::ok("subscribe", None),
        DaemonRequest::Kill => Response::ok("kill", None),
    }
}

/// Begin an outbound connection and poll for it to open.
async fn handle_add_peer(state: &SharedState, host_raw: String, port: Option<u16>) -> Response {
    let (host, parsed_port) = parse_peer_addr(&host_raw);
    let port = port.unwrap_or(parsed_port);

    {
        let st = state.read().await;
        if st.peers.get(&host).is_some_and(|p| p.open) {
            return Response::fail("add_peer", format!("peer {host} is already connected"));
        }
        if host == st.hostname {
            return Response::fail("add_peer", "refusing to peer with self");
        }
    }

    federation::spawn_connector(state.clone(), host.clone(), port);

    let deadline = tokio::time::Instant::now() + ADD_PEER_DEADLINE;
    loop {
        tokio::time::sleep(ADD_PEER_POLL).await;
        let (open, gave_up, last_error) = {
            let st = state.read().await;
            match st.peers.get(&host) {
                Some(entry) => (entry.open, entry.gave_up, entry.last_error.clone()),
                None => (false, true, Some("peer entry vanished".to_owned())),
            }
        };
        if open {
            let mut st = state.write().await;
            st.config.add_peer_addr(&host, port);
            if let Err(e) = st.config.save(&st.control_dir) {
                warn!("config save failed: {e}");
            }
            return Response::ok(
                "add_peer",
                Some(serde_json::json!({ "host": host, "port": port })),
            );
        }
        if gave_up {
            let reason = last_error.unwrap_or_else(|| "connection failed".to_owned());
            return Response::fail("add_peer", reason);
        }
        if tokio::time::Instant::now() >= deadline {
            return Response::fail(
                "add_peer",
                format!("timed out waiting for {host}:{port} to connect"),
            );
        }
    }
}

/// Drop a peer entirely: live socket, pending reconnect, sessions,
/// config entry.
async fn handle_remove_peer(state: &SharedState, host_raw: String) -> Response {
    let (host, _) = parse_peer_addr(&host_raw);
    let mut st = state.write().await;
    let Some(mut entry) = st.peers.remove(&host) else {
        return Response::fail("remove_peer", format!("unknown peer {host}"));
    };
    if let Some(link) = entry.link.take() {
        let _ = link.send(super::LinkMsg::Shutdown);
    }
    let was_open = entry.open;
    let mut sessions: Vec<_> = entry.sessions.into_values().collect();
    sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));

    st.config.remove_peer_addr(&host);
    if let Err(e) = st.config.save(&st.control_dir) {
        warn!("config save failed: {e}");
    }
    st.touch();
    if was_open {
        st.broadcast_event(super::peer_event("peer_disconnected", &host));
    }
    for info in sessions {
        st.broadcast_event(super::session_event("session_removed", &info, &host, true));
    }
    info!(%host, "peer removed");
    Response::ok("remove_peer", Some(serde_json::json!({ "host": host })))
}
