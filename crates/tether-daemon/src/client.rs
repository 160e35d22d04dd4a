//! Daemon client — connect to `daemon.sock`, spawning a detached daemon
//! first when none is listening.
//!
//! The spawn path mirrors what every local tool does: fork `tetherd run`
//! with all stdio nulled, then poll for the control socket to appear
//! before giving up.

use std::process::Stdio;
use std::time::Duration;

use futures::SinkExt;
use thiserror::Error;
use tokio::net::UnixStream;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::debug;

use tether_wire::{ControlDir, DaemonRequest, Event, LineCodec, Response};

/// How long to wait for a spawned daemon's socket to appear.
const SPAWN_DEADLINE: Duration = Duration::from_secs(5);
const SPAWN_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon unavailable: {0}")]
    DaemonUnavailable(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct DaemonClient {
    framed: Framed<UnixStream, LineCodec>,
}

impl DaemonClient {
    /// Connect to a running daemon; fail if none is listening.
    pub async fn connect(dir: &ControlDir) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(dir.daemon_sock())
            .await
            .map_err(|e| ClientError::DaemonUnavailable(e.to_string()))?;
        Ok(Self {
            framed: Framed::new(stream, LineCodec),
        })
    }

    /// Connect, spawning a detached daemon first when nothing answers.
    pub async fn connect_or_spawn(dir: &ControlDir) -> Result<Self, ClientError> {
        match UnixStream::connect(dir.daemon_sock()).await {
            Ok(stream) => {
                return Ok(Self {
                    framed: Framed::new(stream, LineCodec),
                })
            }
            Err(e) if should_spawn(&e) => debug!("no daemon listening, spawning: {e}"),
            Err(e) => return Err(e.into()),
        }

        spawn_daemon(dir)?;
        let deadline = tokio::time::Instant::now() + SPAWN_DEADLINE;
        loop {
            tokio::time::sleep(SPAWN_POLL).await;
            match UnixStream::connect(dir.daemon_sock()).await {
                Ok(stream) => {
                    return Ok(Self {
                        framed: Framed::new(stream, LineCodec),
                    })
                }
                Err(e) if should_spawn(&e) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(ClientError::DaemonUnavailable(
                            "timed out waiting for daemon socket".into(),
                        ));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Send one request and read its response, skipping any interleaved
    /// event frames.
    pub async fn request(&mut self, request: &DaemonRequest) -> Result<Response, ClientError> {
        let json = serde_json::to_string(request).map_err(|e| ClientError::Protocol(e.to_string()))?;
        self.framed.send(json).await.map_err(io_like)?;
        loop {
            match self.next_frame().await? {
                Frame::Response(resp) => return Ok(resp),
                Frame::Event(_) => continue,
            }
        }
    }

    /// Read the next event frame, skipping stray responses.
    pub async fn next_event(&mut self) -> Result<Event, ClientError> {
        loop {
            match self.next_frame().await? {
                Frame::Event(event) => return Ok(event),
                Frame::Response(_) => continue,
            }
        }
    }

    async fn next_frame(&mut self) -> Result<Frame, ClientError> {
        let line = match self.framed.next().await {
            Some(Ok(line)) => line,
            Some(Err(e)) => return Err(io_like(e)),
            None => {
                return Err(ClientError::DaemonUnavailable(
                    "daemon closed the connection".into(),
                ))
            }
        };
        if let Ok(resp) = serde_json::from_str::<Response>(&line) {
            return Ok(Frame::Response(resp));
        }
        if let Ok(event) = serde_json::from_str::<Event>(&line) {
            return Ok(Frame::Event(event));
        }
        Err(ClientError::Protocol(format!("unrecognized frame: {line}")))
    }
}

enum Frame {
    Response(Response),
    Event(Event),
}

fn io_like(e: tether_wire::CodecError) -> ClientError {
    ClientError::Protocol(e.to_string())
}

fn should_spawn(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::NotFound
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
    )
}

/// Fork a detached `tetherd run` for this control directory.
pub fn spawn_daemon(dir: &ControlDir) -> Result<(), ClientError> {
    let exe = std::env::current_exe()?;
    std::process::Command::new(exe)
        .arg("run")
        .arg("--control-dir")
        .arg(dir.root())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| ClientError::DaemonUnavailable(format!("failed to spawn daemon: {e}")))?;
    Ok(())
}
