//! The agent collaborator contract.
//!
//! The endpoint drives a host agent through this trait and nothing else:
//! deliver a message into the current turn, abort it, rewind the branch
//! to its root, summarize the span since the last user prompt, plus a
//! read-only view of the branch tail and idle state, and a turn-end
//! broadcast. The agent process implements this; the mesh never sees
//! past it.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use tether_wire::DeliveryMode;

/// Agent-side failures, surfaced to clients as `backend` errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("no messages since the last user prompt")]
    EmptySpan,
    #[error("no summarization model available")]
    NoModel,
    #[error("no API key configured")]
    NoApiKey,
    #[error("{0}")]
    Backend(String),
}

/// Result of a rewind-to-root request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewindOutcome {
    /// The branch was already at its root entry; nothing changed.
    pub already_at_root: bool,
}

/// Fired once per completed turn.
#[derive(Debug, Clone)]
pub struct TurnEnd {
    /// Trailing assistant message of the completed turn, if any.
    pub message: Option<String>,
}

/// What the endpoint needs from its host agent.
#[async_trait]
pub trait SessionAgent: Send + Sync {
    /// Deliver a message. Accepted while idle (starts a new turn) or
    /// mid-turn (`Steer` interrupts, `FollowUp` queues).
    async fn deliver(&self, message: String, mode: DeliveryMode) -> Result<(), AgentError>;

    /// Cancel any in-progress turn. Idempotent; a no-op while idle.
    async fn abort(&self);

    /// Rewind the conversation branch to its root entry.
    async fn rewind_to_root(&self) -> Result<RewindOutcome, AgentError>;

    /// Summarize the span between the last user prompt and the branch
    /// tail.
    async fn summarize(&self) -> Result<String, AgentError>;

    /// Most recent assistant text message on the current branch.
    async fn last_assistant_message(&self) -> Option<String>;

    /// Whether the session is between turns.
    fn is_idle(&self) -> bool;

    /// Name the agent currently advertises for this session, if any.
    fn session_name(&self) -> Option<String>;

    /// Subscribe to turn-end notifications.
    fn turn_events(&self) -> broadcast::Receiver<TurnEnd>;
}
