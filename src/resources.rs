//! Read boundary: `coordination://` URIs over live state.
//!
//! Each URI resolves to a serialized snapshot of store state at read time;
//! a transport layer (out of scope) exposes these as addressable resources.
//!
//! Supported forms:
//!
//! - `coordination://channels` — channel listings
//! - `coordination://agents` — agent snapshots with liveness
//! - `coordination://locks` — live locks
//! - `coordination://audit` — the full audit chain
//! - `coordination://stats` — aggregated counters
//! - `coordination://<channel>` — all retained messages
//! - `coordination://<channel>/<message_id>` — one message
//! - `coordination://<channel>/type/<type>` — messages of one type
//! - `coordination://<channel>/since/<message_id>` — messages after an id
//!
//! The five reserved names win over channels with the same name.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::core::CoordinationCore;
use crate::errors::{CoordinationError, Result};
use crate::protocol::MessageType;

const SCHEME: &str = "coordination://";

/// A parsed `coordination://` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourcePath {
    Channels,
    Agents,
    Locks,
    Audit,
    Stats,
    Channel(String),
    Message(String, Uuid),
    ByType(String, MessageType),
    Since(String, Uuid),
}

impl ResourcePath {
    /// Parse a URI, rejecting anything outside the scheme or shapes above.
    pub fn parse(uri: &str) -> Result<Self> {
        let not_found = || CoordinationError::ResourceNotFound {
            uri: uri.to_string(),
        };

        let rest = uri.strip_prefix(SCHEME).ok_or_else(not_found)?;
        let mut parts = rest.split('/').filter(|p| !p.is_empty());

        let head = parts.next().ok_or_else(not_found)?;
        let path = match (head, parts.next(), parts.next(), parts.next()) {
            ("channels", None, ..) => Self::Channels,
            ("agents", None, ..) => Self::Agents,
            ("locks", None, ..) => Self::Locks,
            ("audit", None, ..) => Self::Audit,
            ("stats", None, ..) => Self::Stats,
            (channel, None, ..) => Self::Channel(channel.to_string()),
            (channel, Some("type"), Some(t), None) => Self::ByType(
                channel.to_string(),
                t.parse::<MessageType>().map_err(|_| not_found())?,
            ),
            (channel, Some("since"), Some(id), None) => Self::Since(
                channel.to_string(),
                id.parse::<Uuid>().map_err(|_| not_found())?,
            ),
            (channel, Some(id), None, _) => Self::Message(
                channel.to_string(),
                id.parse::<Uuid>().map_err(|_| not_found())?,
            ),
            _ => return Err(not_found()),
        };
        Ok(path)
    }
}

impl CoordinationCore {
    /// Resolve a `coordination://` URI to a JSON snapshot.
    pub fn read_resource(&self, uri: &str) -> Result<Value> {
        match ResourcePath::parse(uri)? {
            ResourcePath::Channels => Ok(json!(self.channels().list_channels())),
            ResourcePath::Agents => Ok(json!(self.registry().list_agents(None))),
            ResourcePath::Locks => Ok(json!(self.locks().list_locks())),
            ResourcePath::Audit => Ok(json!(self.audit().snapshot())),
            ResourcePath::Stats => Ok(json!(self.stats())),
            ResourcePath::Channel(channel) => {
                let resp = self.read(&channel, None, None, usize::MAX);
                Ok(json!(resp.messages))
            }
            ResourcePath::Message(channel, id) => self
                .channels()
                .get_message(&channel, id)
                .map(|m| json!(m))
                .ok_or_else(|| CoordinationError::ResourceNotFound {
                    uri: uri.to_string(),
                }),
            ResourcePath::ByType(channel, t) => {
                let resp = self.read(&channel, None, Some(t), usize::MAX);
                Ok(json!(resp.messages))
            }
            ResourcePath::Since(channel, id) => {
                let resp = self.read(&channel, Some(id), None, usize::MAX);
                Ok(json!(resp.messages))
            }
        }
    }
}
