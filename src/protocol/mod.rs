//! Coordination message protocol: type taxonomy, content validation, and
//! per-agent sequencing rules.
//!
//! Pure logic, no state. The Channel Store calls into this module before any
//! append; nothing here mutates anything.

mod message;
mod schema;

pub use message::{Message, MessageType, Phase};
pub use schema::{schema_for, validate_content, MessageSchema};
