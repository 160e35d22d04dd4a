//! Mesh wire protocol — tagged JSON frames, one per line.
//!
//! Three closed unions share the envelope style, one per listener:
//!
//! - [`SessionCommand`] — what a session endpoint accepts on `<id>.sock`.
//! - [`DaemonRequest`] — what the daemon accepts on `daemon.sock`.
//! - [`PeerMessage`] — what two daemons exchange over the federation TCP
//!   link.
//!
//! Every request gets exactly one [`Response`]; streaming listeners emit
//! [`Event`] frames interleaved with responses. Unknown `type` tags are a
//! deserialization error, never routed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Public identity of one agent session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    /// Primary display label (persisted auto-name or agent-chosen).
    pub name: String,
    /// Alternate names that resolve to this session, in discovery order.
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// A session as reported by `list_sessions` and session events: identity
/// plus where it lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    #[serde(flatten)]
    pub info: SessionInfo,
    pub host: String,
    pub is_remote: bool,
}

/// How a `send` payload is handed to a busy agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Interrupt the current turn and prepend.
    #[default]
    Steer,
    /// Queue after the current turn completes.
    FollowUp,
}

/// Optional completion gate for `send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitUntil {
    /// Respond only once the delivered turn has ended, carrying the
    /// trailing assistant message.
    TurnEnd,
}

/// Events a session endpoint can stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    TurnEnd,
}

/// RPC commands accepted by a session endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SessionCommand {
    /// Deliver a message to the session, even mid-turn.
    Send {
        message: String,
        #[serde(default)]
        mode: DeliveryMode,
        #[serde(default, rename = "wait_until", skip_serializing_if = "Option::is_none")]
        wait_until: Option<WaitUntil>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// Most recent assistant text on the current branch, or null.
    GetMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// Summary of the span since the last user prompt.
    GetSummary {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// Rewind the conversation branch to its root entry.
    Clear {
        #[serde(default)]
        summarize: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// Cancel any in-progress turn. Idempotent.
    Abort {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// Register for the next matching event on this connection.
    Subscribe {
        event: SessionEventKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

impl SessionCommand {
    /// Wire name of the command, echoed in the response envelope.
    pub fn command_name(&self) -> &'static str {
        match self {
            Self::Send { .. } => "send",
            Self::GetMessage { .. } => "get_message",
            Self::GetSummary { .. } => "get_summary",
            Self::Clear { .. } => "clear",
            Self::Abort { .. } => "abort",
            Self::Subscribe { .. } => "subscribe",
        }
    }

    /// Correlation id supplied by the client, if any.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Send { id, .. }
            | Self::GetMessage { id }
            | Self::GetSummary { id }
            | Self::Clear { id, .. }
            | Self::Abort { id }
            | Self::Subscribe { id, .. } => id.as_deref(),
        }
    }
}

/// Requests accepted on the daemon control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum DaemonRequest {
    Status,
    AddPeer {
        host: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },
    RemovePeer {
        host: String,
    },
    ListSessions,
    ListTailscale,
    Relay {
        target_session_id: String,
        rpc_command: Value,
        request_id: String,
        #[serde(default)]
        fire_and_forget: bool,
    },
    /// Upgrade this connection to a long-lived daemon event stream.
    Subscribe,
    /// Acknowledge, clean up, and exit the daemon process.
    Kill,
    /// Historical no-op: the daemon is evidently already running.
    #[serde(rename = "start-daemon")]
    StartDaemon,
}

impl DaemonRequest {
    pub fn command_name(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::AddPeer { .. } => "add_peer",
            Self::RemovePeer { .. } => "remove_peer",
            Self::ListSessions => "list_sessions",
            Self::ListTailscale => "list_tailscale",
            Self::Relay { .. } => "relay",
            Self::Subscribe => "subscribe",
            Self::Kill => "kill",
            Self::StartDaemon => "start-daemon",
        }
    }
}

/// Frames exchanged between two daemons over the federation TCP link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum PeerMessage {
    /// Identity + full session snapshot. First frame in each direction.
    Hello {
        host: String,
        port: u16,
        sessions: Vec<SessionInfo>,
    },
    /// Liveness tick. Any inbound frame counts as liveness; this one
    /// exists so an otherwise-idle link still carries traffic.
    Heartbeat,
    SessionAdded {
        session: SessionInfo,
    },
    SessionRemoved {
        session_id: String,
    },
    /// Forward-leg relay: run `command` against `target_session_id`.
    Rpc {
        target_session_id: String,
        request_id: String,
        command: Value,
    },
    /// Return-leg relay, correlated by `request_id`.
    RpcResponse {
        request_id: String,
        response: Value,
    },
}

/// Response envelope: every accepted request produces exactly one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename = "response", rename_all = "camelCase")]
pub struct Response {
    pub command: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Response {
    pub fn ok(command: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            command: command.into(),
            success: true,
            data,
            error: None,
            id: None,
        }
    }

    pub fn fail(command: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            success: false,
            data: None,
            error: Some(error.into()),
            id: None,
        }
    }

    pub fn with_id(mut self, id: Option<String>) -> Self {
        self.id = id;
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Event envelope for streamed notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename = "event", rename_all = "camelCase")]
pub struct Event {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
}

impl Event {
    pub fn new(event: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            event: event.into(),
            data,
            subscription_id: None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Bare error frame for faults that precede any parsed request, e.g. an
/// oversized line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename = "error")]
pub struct ErrorFrame {
    pub error: String,
}

/// Error taxonomy surfaced to clients in the `error` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Non-JSON frame or missing/unknown `type`.
    Parse(String),
    /// Frame over the 8 KiB cap.
    SizeExceeded,
    /// Target session unknown anywhere.
    NotFound,
    /// Target session lives on a peer whose transport is closed.
    PeerUnreachable,
    /// Relay deadline elapsed before a response arrived.
    Timeout { ms: u64 },
    /// Per-peer relay budget exhausted.
    RateLimited,
    /// Operation requires an idle session.
    Busy,
    /// Command recognized but disabled on this channel.
    Unsupported(String),
    /// Agent-side failure (no model, no key, summarization failed).
    Backend(String),
    /// Underlying socket error during a relay.
    Transport(String),
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(detail) => write!(f, "Parse error: {detail}"),
            Self::SizeExceeded => {
                write!(f, "Message size exceeds {} bytes", crate::MAX_FRAME_BYTES)
            }
            Self::NotFound => write!(f, "Session not found"),
            Self::PeerUnreachable => write!(f, "session is on a disconnected peer"),
            Self::Timeout { ms } => write!(f, "Relay timeout after {ms}ms"),
            Self::RateLimited => write!(f, "Rate limit exceeded"),
            Self::Busy => write!(f, "Session is busy"),
            Self::Unsupported(what) => write!(f, "Unsupported: {what}"),
            Self::Backend(detail) => write!(f, "{detail}"),
            Self::Transport(detail) => write!(f, "{detail}"),
        }
    }
}
