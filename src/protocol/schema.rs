//! Per-type content schemas and validation.
//!
//! Each message type declares required and optional fields for object
//! payloads. Plain-string payloads always pass; the schemas only constrain
//! structured content. Types without an entry carry free-form payloads
//! (control messages like `ready`/`stop` need none).

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde_json::Value;

use crate::errors::{CoordinationError, Result};
use crate::protocol::MessageType;

/// Field requirements for one message type.
#[derive(Debug, Clone)]
pub struct MessageSchema {
    pub required: &'static [&'static str],
    pub optional: &'static [&'static str],
    pub description: &'static str,
}

static SCHEMAS: Lazy<HashMap<MessageType, MessageSchema>> = Lazy::new(|| {
    use MessageType::*;

    let mut m = HashMap::new();
    let mut def = |t: MessageType,
                   required: &'static [&'static str],
                   optional: &'static [&'static str],
                   description: &'static str| {
        m.insert(
            t,
            MessageSchema {
                required,
                optional,
                description,
            },
        );
    };

    def(Init, &[], &["role", "capabilities"], "Initialize coordination session");
    def(Acknowledgment, &[], &["role", "status"], "Acknowledge message or role");
    def(Sync, &["config"], &["rules", "standards"], "Synchronize configuration");
    def(
        Capabilities,
        &["capabilities"],
        &["protocol_version", "supported_versions"],
        "Declare agent capabilities",
    );
    def(Ownership, &["files"], &["patterns"], "Declare file ownership");
    def(CoordinationComplete, &[], &["summary"], "Synchronization complete");
    def(Question, &["question"], &["context"], "Ask question");
    def(Response, &["answer"], &["reply_to"], "Provide answer");
    def(
        TaskAssign,
        &["task"],
        &["files", "subtasks", "depends_on"],
        "Assign task",
    );
    def(
        TaskComplete,
        &["task_id"],
        &["files_modified", "status"],
        "Report task completion",
    );
    def(Progress, &["status"], &["percentage", "details"], "Progress update");
    def(
        ConflictDetected,
        &["conflict_type", "details"],
        &["suggested_resolution"],
        "Report conflict",
    );
    def(ConflictResolved, &["resolution"], &["rationale"], "Conflict resolved");

    m
});

/// Look up the schema for a message type, if one is defined.
pub fn schema_for(message_type: MessageType) -> Option<&'static MessageSchema> {
    SCHEMAS.get(&message_type)
}

/// Validate `content` against the schema for `message_type`.
///
/// Only object payloads are checked for required fields; strings and other
/// scalar payloads are accepted as-is.
pub fn validate_content(message_type: MessageType, content: &Value) -> Result<()> {
    let Value::Object(fields) = content else {
        return Ok(());
    };

    let Some(schema) = schema_for(message_type) else {
        return Ok(());
    };

    for field in schema.required {
        if !fields.contains_key(*field) {
            return Err(CoordinationError::Validation {
                message_type: message_type.to_string(),
                reason: format!("missing required field '{field}'"),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_payload_requires_fields() {
        let err = validate_content(MessageType::TaskAssign, &json!({"files": ["a.rs"]}))
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Validation { .. }));
        assert!(err.to_string().contains("task"));

        validate_content(MessageType::TaskAssign, &json!({"task": "refactor"})).unwrap();
    }

    #[test]
    fn string_payload_always_passes() {
        validate_content(MessageType::Sync, &json!("free-form note")).unwrap();
    }

    #[test]
    fn types_without_schema_pass() {
        validate_content(MessageType::Ready, &json!({"anything": true})).unwrap();
    }

    #[test]
    fn conflict_schema_needs_both_fields() {
        let err =
            validate_content(MessageType::ConflictDetected, &json!({"conflict_type": "edit"}))
                .unwrap_err();
        assert!(err.to_string().contains("details"));
    }
}
