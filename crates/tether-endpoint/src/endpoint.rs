//! Session endpoint server — one Unix-socket listener per agent session.
//!
//! Accepts any number of clients; each connection is a newline-delimited
//! JSON stream of request/response/event frames capped at 8 KiB. Per-
//! connection failures stay on that connection: a malformed frame gets a
//! parse-error response and the stream continues, an oversized frame gets
//! one error frame and the connection closes. Agent failures become
//! `success:false` responses, never a crash.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use futures::SinkExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, Mutex};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use tether_wire::{
    codec::CodecError, frames::ErrorFrame, frames::SessionEventKind, frames::WaitUntil,
    ControlDir, ErrorKind, Event, LineCodec, Response, SessionCommand, validate_id,
};

use crate::agent::{AgentError, SessionAgent};

/// How often the endpoint re-asserts its alias link, absent any traffic.
const ALIAS_SYNC_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("invalid session id: {0}")]
    InvalidId(#[from] tether_wire::IdError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A bound, serving session endpoint. Dropping it abandons the tasks;
/// call [`SessionEndpoint::shutdown`] for a clean exit that removes the
/// on-disk node and alias links.
pub struct SessionEndpoint {
    session_id: String,
    control_dir: ControlDir,
    socket_path: PathBuf,
    owned_alias: Arc<Mutex<Option<String>>>,
    shutdown_tx: broadcast::Sender<()>,
    accept_task: tokio::task::JoinHandle<()>,
    alias_task: tokio::task::JoinHandle<()>,
}

impl SessionEndpoint {
    /// Bind `<controlDir>/<sessionId>.sock` and start serving.
    ///
    /// A stale node left by a crashed predecessor is removed first; the
    /// fresh socket is chmod 0600.
    pub async fn bind(
        control_dir: ControlDir,
        session_id: impl Into<String>,
        agent: Arc<dyn SessionAgent>,
    ) -> Result<Self, EndpointError> {
        let session_id = session_id.into();
        validate_id(&session_id)?;
        control_dir.ensure()?;

        let socket_path = control_dir.endpoint_sock(&session_id);
        match std::fs::remove_file(&socket_path) {
            Ok(()) => debug!(%session_id, "removed stale endpoint node"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(&socket_path)?;
        let mut perms = std::fs::metadata(&socket_path)?.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(&socket_path, perms)?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let owned_alias = Arc::new(Mutex::new(None));

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&agent),
            control_dir.clone(),
            session_id.clone(),
            Arc::clone(&owned_alias),
            shutdown_tx.subscribe(),
        ));
        let alias_task = tokio::spawn(alias_maintenance(
            Arc::clone(&agent),
            control_dir.clone(),
            session_id.clone(),
            Arc::clone(&owned_alias),
            shutdown_tx.subscribe(),
        ));

        info!(%session_id, path = %socket_path.display(), "session endpoint listening");
        Ok(Self {
            session_id,
            control_dir,
            socket_path,
            owned_alias,
            shutdown_tx,
            accept_task,
            alias_task,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }

    /// Stop serving and remove the on-disk node plus any alias link this
    /// endpoint created.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        self.accept_task.abort();
        self.alias_task.abort();

        if let Some(alias) = self.owned_alias.lock().await.take() {
            if self.control_dir.read_alias(&alias).as_deref() == Some(self.session_id.as_str()) {
                let _ = self.control_dir.remove_alias(&alias);
            }
        }
        let _ = std::fs::remove_file(&self.socket_path);
        info!(session_id = %self.session_id, "session endpoint shut down");
    }
}

async fn accept_loop(
    listener: UnixListener,
    agent: Arc<dyn SessionAgent>,
    control_dir: ControlDir,
    session_id: String,
    owned_alias: Arc<Mutex<Option<String>>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { return };
                let agent = Arc::clone(&agent);
                let control_dir = control_dir.clone();
                let session_id = session_id.clone();
                let owned_alias = Arc::clone(&owned_alias);
                tokio::spawn(async move {
                    if let Err(e) =
                        handle_client(stream, agent, control_dir, session_id, owned_alias).await
                    {
                        debug!("endpoint client error: {e}");
                    }
                });
            }
            _ = shutdown_rx.recv() => return,
        }
    }
}

/// Serve one client connection until it closes or faults.
async fn handle_client(
    stream: UnixStream,
    agent: Arc<dyn SessionAgent>,
    control_dir: ControlDir,
    session_id: String,
    owned_alias: Arc<Mutex<Option<String>>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut framed = Framed::new(stream, LineCodec);
    // One-shot turn-end subscriptions pending on this connection.
    let mut subscriptions: Vec<String> = Vec::new();
    let mut turn_rx = agent.turn_events();
    let mut turn_open = true;

    loop {
        tokio::select! {
            frame = framed.next() => {
                let line = match frame {
                    Some(Ok(line)) => line,
                    Some(Err(CodecError::FrameTooLong)) => {
                        let err = ErrorFrame { error: ErrorKind::SizeExceeded.to_string() };
                        let _ = framed.send(serde_json::to_string(&err)?).await;
                        return Ok(());
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                };

                // Alias links are re-asserted on every accepted request.
                reconcile_alias(&control_dir, &session_id, agent.as_ref(), &owned_alias).await;

                let cmd: SessionCommand = match serde_json::from_str(&line) {
                    Ok(cmd) => cmd,
                    Err(e) => {
                        let command = serde_json::from_str::<serde_json::Value>(&line)
                            .ok()
                            .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(String::from))
                            .unwrap_or_else(|| "unknown".into());
                        let resp = Response::fail(command, ErrorKind::Parse(e.to_string()).to_string());
                        framed.send(resp.to_json()?).await?;
                        continue;
                    }
                };

                let resp = match cmd {
                    SessionCommand::Subscribe { event: SessionEventKind::TurnEnd, id } => {
                        let sub_id = uuid::Uuid::new_v4().to_string();
                        subscriptions.push(sub_id.clone());
                        Response::ok("subscribe", Some(serde_json::json!({ "subscriptionId": sub_id })))
                            .with_id(id)
                    }
                    other => dispatch(other, agent.as_ref()).await,
                };
                framed.send(resp.to_json()?).await?;
            }

            turn = turn_rx.recv(), if turn_open => {
                match turn {
                    Ok(turn) => {
                        // Every pending subscription fires once, then all
                        // are spent.
                        for sub_id in subscriptions.drain(..) {
                            let mut event = Event::new(
                                "turn_end",
                                Some(serde_json::json!({ "message": turn.message })),
                            );
                            event.subscription_id = Some(sub_id);
                            framed.send(event.to_json()?).await?;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "turn-end stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => turn_open = false,
                }
            }
        }
    }
}

/// Run one parsed command against the agent, producing the response.
async fn dispatch(cmd: SessionCommand, agent: &dyn SessionAgent) -> Response {
    match cmd {
        SessionCommand::Send { message, mode, wait_until, id } => {
            if message.is_empty() {
                return Response::fail("send", "message must not be empty").with_id(id);
            }
            // Subscribe before delivering so the turn this send starts
            // cannot slip past us.
            let mut turn_rx = agent.turn_events();
            match agent.deliver(message, mode).await {
                Ok(()) => match wait_until {
                    None => Response::ok("send", None).with_id(id),
                    Some(WaitUntil::TurnEnd) => loop {
                        match turn_rx.recv().await {
                            Ok(turn) => {
                                break Response::ok(
                                    "send",
                                    Some(serde_json::json!({ "message": turn.message })),
                                )
                                .with_id(id)
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => {
                                break Response::fail("send", "session closed before turn end")
                                    .with_id(id)
                            }
                        }
                    },
                },
                Err(e) => Response::fail("send", backend_error(e)).with_id(id),
            }
        }

        SessionCommand::GetMessage { id } => {
            let message = agent.last_assistant_message().await;
            Response::ok("get_message", Some(serde_json::json!({ "message": message }))).with_id(id)
        }

        SessionCommand::GetSummary { id } => match agent.summarize().await {
            Ok(summary) => {
                Response::ok("get_summary", Some(serde_json::json!({ "summary": summary })))
                    .with_id(id)
            }
            Err(e) => Response::fail("get_summary", backend_error(e)).with_id(id),
        },

        SessionCommand::Clear { summarize, id } => {
            if !agent.is_idle() {
                return Response::fail("clear", ErrorKind::Busy.to_string()).with_id(id);
            }
            if summarize {
                return Response::fail(
                    "clear",
                    ErrorKind::Unsupported("summarized clear on this channel".into()).to_string(),
                )
                .with_id(id);
            }
            match agent.rewind_to_root().await {
                Ok(outcome) => Response::ok(
                    "clear",
                    Some(serde_json::json!({ "alreadyAtRoot": outcome.already_at_root })),
                )
                .with_id(id),
                Err(e) => Response::fail("clear", backend_error(e)).with_id(id),
            }
        }

        SessionCommand::Abort { id } => {
            agent.abort().await;
            Response::ok("abort", None).with_id(id)
        }

        // Handled inline by the connection loop; unreachable here.
        SessionCommand::Subscribe { id, .. } => {
            Response::fail("subscribe", "subscribe must be handled per-connection").with_id(id)
        }
    }
}

fn backend_error(e: AgentError) -> String {
    ErrorKind::Backend(e.to_string()).to_string()
}

/// Re-assert the alias link for the agent's advertised name.
///
/// Creates `<name>.alias → <sessionId>.sock` when a name is advertised,
/// retires the link this endpoint previously created when the name
/// changed or was dropped. Best-effort: failures are logged, never
/// surfaced to the RPC that triggered the sync.
async fn reconcile_alias(
    control_dir: &ControlDir,
    session_id: &str,
    agent: &dyn SessionAgent,
    owned_alias: &Arc<Mutex<Option<String>>>,
) {
    let advertised = agent
        .session_name()
        .filter(|name| validate_id(name).is_ok());
    let mut owned = owned_alias.lock().await;

    if *owned == advertised {
        if let Some(name) = advertised.as_deref() {
            if let Err(e) = control_dir.write_alias(name, session_id) {
                debug!(name, "alias re-assert failed: {e}");
            }
        }
        return;
    }

    if let Some(old) = owned.take() {
        if control_dir.read_alias(&old).as_deref() == Some(session_id) {
            if let Err(e) = control_dir.remove_alias(&old) {
                debug!(%old, "alias removal failed: {e}");
            }
        }
    }
    if let Some(name) = advertised {
        match control_dir.write_alias(&name, session_id) {
            Ok(()) => *owned = Some(name),
            Err(e) => debug!(%name, "alias create failed: {e}"),
        }
    }
}

/// Periodic alias sync, so a rename is reflected within a second even on
/// a quiet endpoint.
async fn alias_maintenance(
    agent: Arc<dyn SessionAgent>,
    control_dir: ControlDir,
    session_id: String,
    owned_alias: Arc<Mutex<Option<String>>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut tick = tokio::time::interval(ALIAS_SYNC_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                reconcile_alias(&control_dir, &session_id, agent.as_ref(), &owned_alias).await;
            }
            _ = shutdown_rx.recv() => return,
        }
    }
}
