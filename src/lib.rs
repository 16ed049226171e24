//! # Coordination
//!
//! In-process coordination bus and distributed lock service for multi-agent
//! systems. Independent agent processes discover each other over named
//! channels, exchange structured protocol messages with per-sender FIFO
//! ordering, and serialize access to shared resources through named locks
//! with bounded lifetimes.
//!
//! The crate is the coordination *core* only: a transport layer (MCP, HTTP,
//! whatever) adapts [`CoordinationCore`]'s call boundary and the
//! `coordination://` read boundary to remote callers.
//!
//! ```
//! use coordination::{CoordinationConfig, CoordinationCore, MessageType};
//! use std::collections::HashMap;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> coordination::Result<()> {
//! let core = CoordinationCore::new(CoordinationConfig::default());
//!
//! core.join("project-alpha", "agent-1", Some("primary"), HashMap::new())?;
//! core.send(
//!     "project-alpha",
//!     "agent-1",
//!     MessageType::Ready,
//!     serde_json::json!("standing by"),
//!     HashMap::new(),
//!     None,
//! )?;
//!
//! let window = core.read("project-alpha", None, None, 100);
//! assert_eq!(window.messages.len(), 2); // init announcement + ready
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod broker;
pub mod channels;
pub mod config;
pub mod core;
pub mod errors;
pub mod locks;
pub mod protocol;
pub mod ratelimit;
pub mod registry;
pub mod resources;

pub use audit::{AuditEntry, AuditEvent, AuditLog};
pub use broker::{Subscription, SubscriptionBroker};
pub use channels::{ChannelInfo, ChannelStore, JoinResponse, ReadResponse};
pub use config::{CoordinationConfig, OverflowPolicy};
pub use core::{AcquireLockResponse, CoordinationCore, CoordinationStats, SendResponse};
pub use errors::{CoordinationError, Result};
pub use locks::{LockGrant, LockInfo, LockManager};
pub use protocol::{Message, MessageType, Phase};
pub use registry::{AgentInfo, AgentRegistry, AgentStatus, HeartbeatAck};
pub use resources::ResourcePath;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
