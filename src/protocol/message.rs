//! Message record and the structured type taxonomy.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Coordination protocol phases, in their conventional order.
///
/// Phase discipline is advisory: the store logs out-of-phase traffic but
/// never rejects it, so minor protocol deviations cannot wedge a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Discovery,
    Synchronization,
    Operational,
    Control,
    Conflict,
}

/// Structured message types for the coordination protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // Discovery
    /// Start coordination, declare role.
    Init,
    /// Confirm receipt, accept role.
    Acknowledgment,

    // Synchronization
    /// Share configuration, rules, standards.
    Sync,
    /// Declare agent capabilities and limits.
    Capabilities,
    /// Declare file ownership boundaries.
    Ownership,
    /// Synchronization phase finished.
    CoordinationComplete,

    // Operational
    /// Request information from another agent.
    Question,
    /// Provide requested information.
    Response,
    /// Assign work.
    TaskAssign,
    /// Report task completion.
    TaskComplete,
    /// Clarify a previous message.
    Clarification,
    /// Progress update.
    Progress,

    // Control
    /// Signal readiness for work.
    Ready,
    /// Enter passive mode, await instructions.
    Standby,
    /// Halt current activity.
    Stop,
    /// Work finished, entering idle state.
    Done,

    // Conflict
    /// Report a detected conflict.
    ConflictDetected,
    /// Resolution for a reported conflict.
    ConflictResolved,
}

impl MessageType {
    /// All message types, grouped by declaration order.
    pub const ALL: [MessageType; 18] = [
        Self::Init,
        Self::Acknowledgment,
        Self::Sync,
        Self::Capabilities,
        Self::Ownership,
        Self::CoordinationComplete,
        Self::Question,
        Self::Response,
        Self::TaskAssign,
        Self::TaskComplete,
        Self::Clarification,
        Self::Progress,
        Self::Ready,
        Self::Standby,
        Self::Stop,
        Self::Done,
        Self::ConflictDetected,
        Self::ConflictResolved,
    ];

    /// The coordination phase this type belongs to.
    pub fn phase(&self) -> Phase {
        match self {
            Self::Init | Self::Acknowledgment => Phase::Discovery,
            Self::Sync | Self::Capabilities | Self::Ownership | Self::CoordinationComplete => {
                Phase::Synchronization
            }
            Self::Question
            | Self::Response
            | Self::TaskAssign
            | Self::TaskComplete
            | Self::Clarification
            | Self::Progress => Phase::Operational,
            Self::Ready | Self::Standby | Self::Stop | Self::Done => Phase::Control,
            Self::ConflictDetected | Self::ConflictResolved => Phase::Conflict,
        }
    }

    /// Wire name of the type, e.g. `task_assign`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Acknowledgment => "acknowledgment",
            Self::Sync => "sync",
            Self::Capabilities => "capabilities",
            Self::Ownership => "ownership",
            Self::CoordinationComplete => "coordination_complete",
            Self::Question => "question",
            Self::Response => "response",
            Self::TaskAssign => "task_assign",
            Self::TaskComplete => "task_complete",
            Self::Clarification => "clarification",
            Self::Progress => "progress",
            Self::Ready => "ready",
            Self::Standby => "standby",
            Self::Stop => "stop",
            Self::Done => "done",
            Self::ConflictDetected => "conflict_detected",
            Self::ConflictResolved => "conflict_resolved",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown message type '{s}'"))
    }
}

/// An immutable coordination message.
///
/// Once appended to a channel, none of these fields ever change; readers and
/// subscribers share the same `Arc<Message>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique, opaque message id.
    pub id: Uuid,
    /// Sender agent id.
    pub from_agent: String,
    /// Wall-clock send time.
    pub timestamp: DateTime<Utc>,
    /// Per-`(from_agent, channel)` sequence number, starting at 1.
    pub sequence: u64,
    /// Structured message type.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Type-specific payload. Objects are schema-validated; plain strings
    /// pass through untouched.
    pub content: Value,
    /// Open key-value annotations.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Message id this one replies to, for threading.
    #[serde(default)]
    pub reply_to: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_round_trip() {
        for t in MessageType::ALL {
            assert_eq!(t.as_str().parse::<MessageType>().unwrap(), t);
            // serde uses the same snake_case names as `as_str`
            let json = serde_json::to_value(t).unwrap();
            assert_eq!(json, Value::String(t.as_str().to_string()));
        }
    }

    #[test]
    fn phases_cover_taxonomy() {
        assert_eq!(MessageType::Init.phase(), Phase::Discovery);
        assert_eq!(MessageType::CoordinationComplete.phase(), Phase::Synchronization);
        assert_eq!(MessageType::Progress.phase(), Phase::Operational);
        assert_eq!(MessageType::Done.phase(), Phase::Control);
        assert_eq!(MessageType::ConflictResolved.phase(), Phase::Conflict);
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!("telepathy".parse::<MessageType>().is_err());
    }

    #[test]
    fn message_serializes_type_field() {
        let msg = Message {
            id: Uuid::new_v4(),
            from_agent: "a1".into(),
            timestamp: Utc::now(),
            sequence: 1,
            message_type: MessageType::TaskAssign,
            content: serde_json::json!({"task": "update docs"}),
            metadata: HashMap::new(),
            reply_to: None,
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "task_assign");
        assert_eq!(v["sequence"], 1);
    }
}
