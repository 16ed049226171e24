//! Typed errors for the coordination core.
//!
//! Every operation fails independently and leaves shared state consistent;
//! none of these are fatal to the process. The variants mirror the error
//! taxonomy the call boundary reports to remote callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoordinationError>;

/// Errors surfaced by coordination operations.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum CoordinationError {
    /// Channel is at capacity and the overflow policy is `Reject`.
    #[error("channel '{channel}' is full (capacity: {capacity})")]
    ChannelFull { channel: String, capacity: usize },

    /// Message content failed schema validation for its type.
    #[error("invalid '{message_type}' message: {reason}")]
    Validation {
        message_type: String,
        reason: String,
    },

    /// Agent already holds the maximum number of simultaneous locks.
    #[error("agent '{agent_id}' exceeded lock quota ({held}/{max})")]
    LockQuotaExceeded {
        agent_id: String,
        held: usize,
        max: usize,
    },

    /// Lock acquisition timed out while another agent held the lock.
    #[error("lock '{name}' is held by '{held_by}'")]
    LockUnavailable {
        name: String,
        held_by: String,
        expires_at: DateTime<Utc>,
    },

    /// Release attempted by a non-holder or with a stale lock id.
    #[error("lock release rejected: {reason}")]
    LockOwnership { lock_id: String, reason: String },

    /// Operation referenced an agent that never joined.
    #[error("unknown agent '{agent_id}'")]
    AgentUnknown { agent_id: String },

    /// Agent exceeded its request rate limit.
    #[error("agent '{agent_id}' exceeded rate limit ({limit})")]
    RateLimitExceeded { agent_id: String, limit: String },

    /// Read-boundary URI did not resolve to any known resource.
    #[error("resource not found: {uri}")]
    ResourceNotFound { uri: String },
}
