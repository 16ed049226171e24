//! Channel Store: the coordination bus itself.
//!
//! Owns named channels (membership plus append-only message history) and is
//! the only writer of channel state. Each channel carries its own lock so
//! operations on different channels never contend; within one channel,
//! appends are serialized and reads see either the pre- or post-append state.
//!
//! Capacity overflow follows the configured [`OverflowPolicy`]: the default
//! evicts the oldest message (ring-buffer semantics), the strict mode rejects
//! the append with `ChannelFull`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::broker::SubscriptionBroker;
use crate::config::OverflowPolicy;
use crate::errors::{CoordinationError, Result};
use crate::protocol::{validate_content, Message, MessageType, Phase};

/// Result of a `join` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub channel: String,
    pub agent_id: String,
    pub joined_at: DateTime<Utc>,
    /// Whether this call created the channel.
    pub created: bool,
    /// Members other than the joining agent.
    pub other_agents: Vec<String>,
    pub message_count: usize,
}

/// Result of a `read` call.
#[derive(Debug, Clone, Serialize)]
pub struct ReadResponse {
    pub messages: Vec<Arc<Message>>,
    /// True when matching messages remained beyond the returned window.
    pub has_more: bool,
    /// Id of the last returned message, to pass as the next `since` cursor.
    pub latest_id: Option<Uuid>,
}

/// Channel metadata snapshot for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub members: Vec<String>,
    pub message_count: usize,
    pub capacity: usize,
}

/// Store-wide counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStoreStats {
    pub channels: usize,
    pub total_messages: usize,
    pub evicted_messages: u64,
}

struct ChannelState {
    created_at: DateTime<Utc>,
    members: HashSet<String>,
    messages: VecDeque<Arc<Message>>,
    /// Next sequence number per sender, starting at 1.
    sequences: HashMap<String, u64>,
    /// Set once a `coordination_complete` has been seen; operational-phase
    /// traffic before that point is logged (advisory, never rejected).
    sync_complete: bool,
    evicted: u64,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            created_at: Utc::now(),
            members: HashSet::new(),
            messages: VecDeque::new(),
            sequences: HashMap::new(),
            sync_complete: false,
            evicted: 0,
        }
    }
}

/// In-memory channel store with per-channel synchronization.
pub struct ChannelStore {
    channels: DashMap<String, Arc<RwLock<ChannelState>>>,
    capacity: usize,
    overflow_policy: OverflowPolicy,
    broker: Arc<SubscriptionBroker>,
}

impl ChannelStore {
    pub fn new(
        capacity: usize,
        overflow_policy: OverflowPolicy,
        broker: Arc<SubscriptionBroker>,
    ) -> Self {
        Self {
            channels: DashMap::new(),
            capacity,
            overflow_policy,
            broker,
        }
    }

    fn channel(&self, name: &str) -> Arc<RwLock<ChannelState>> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(ChannelState::new())))
            .clone()
    }

    /// Add `agent_id` to `channel`, creating the channel on first join.
    ///
    /// Idempotent: joining an already-joined channel just returns the
    /// current state.
    pub fn join(&self, channel: &str, agent_id: &str) -> JoinResponse {
        let created = !self.channels.contains_key(channel);
        let state = self.channel(channel);
        let mut state = state.write();

        state.members.insert(agent_id.to_string());
        let other_agents = state
            .members
            .iter()
            .filter(|m| m.as_str() != agent_id)
            .cloned()
            .collect();

        JoinResponse {
            channel: channel.to_string(),
            agent_id: agent_id.to_string(),
            joined_at: Utc::now(),
            created,
            other_agents,
            message_count: state.messages.len(),
        }
    }

    /// Remove `agent_id` from `channel` membership. Past messages stay.
    pub fn leave(&self, channel: &str, agent_id: &str) -> bool {
        match self.channels.get(channel) {
            Some(state) => state.write().members.remove(agent_id),
            None => false,
        }
    }

    /// Remove an agent from every channel it is a member of.
    ///
    /// Used by the heartbeat sweep when reaping a dead agent. Returns the
    /// channels the agent was removed from.
    pub fn remove_member_everywhere(&self, agent_id: &str) -> Vec<String> {
        let mut removed = Vec::new();
        for entry in self.channels.iter() {
            if entry.value().write().members.remove(agent_id) {
                removed.push(entry.key().clone());
            }
        }
        removed
    }

    /// Validate, sequence, and append a message to `channel`.
    ///
    /// The broker is notified inside the write lock, so subscribers observe
    /// messages in append order.
    pub fn append(
        &self,
        channel: &str,
        from_agent: &str,
        message_type: MessageType,
        content: Value,
        metadata: HashMap<String, Value>,
        reply_to: Option<Uuid>,
    ) -> Result<Arc<Message>> {
        validate_content(message_type, &content)?;

        let state = self.channel(channel);
        let mut state = state.write();

        if state.messages.len() >= self.capacity {
            match self.overflow_policy {
                OverflowPolicy::Reject => {
                    return Err(CoordinationError::ChannelFull {
                        channel: channel.to_string(),
                        capacity: self.capacity,
                    });
                }
                OverflowPolicy::EvictOldest => {
                    state.messages.pop_front();
                    state.evicted += 1;
                    log::debug!("channel '{channel}' at capacity, evicted oldest message");
                }
            }
        }

        // Advisory phase discipline: log operational traffic that arrives
        // before the synchronization phase has completed.
        match message_type.phase() {
            Phase::Operational if !state.sync_complete => {
                log::warn!(
                    "agent '{from_agent}' sent operational '{message_type}' on '{channel}' \
                     before coordination_complete"
                );
            }
            _ => {}
        }
        if message_type == MessageType::CoordinationComplete {
            state.sync_complete = true;
        }

        let sequence = {
            let counter = state.sequences.entry(from_agent.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };

        let message = Arc::new(Message {
            id: Uuid::new_v4(),
            from_agent: from_agent.to_string(),
            timestamp: Utc::now(),
            sequence,
            message_type,
            content,
            metadata,
            reply_to,
        });

        state.messages.push_back(Arc::clone(&message));
        self.broker.publish(channel, &message);

        Ok(message)
    }

    /// Non-blocking read of channel history.
    ///
    /// `since_message_id` excludes that message and everything before it; an
    /// id that is no longer retained (or never existed) reads from the start.
    pub fn read(
        &self,
        channel: &str,
        since_message_id: Option<Uuid>,
        filter_type: Option<MessageType>,
        max_messages: usize,
    ) -> ReadResponse {
        let Some(state) = self.channels.get(channel).map(|e| e.value().clone()) else {
            return ReadResponse {
                messages: Vec::new(),
                has_more: false,
                latest_id: None,
            };
        };
        let state = state.read();

        let start = match since_message_id {
            Some(id) => state
                .messages
                .iter()
                .position(|m| m.id == id)
                .map(|i| i + 1)
                .unwrap_or(0),
            None => 0,
        };

        let mut matching = state
            .messages
            .iter()
            .skip(start)
            .filter(|m| filter_type.map_or(true, |t| m.message_type == t));

        let mut messages: Vec<Arc<Message>> = Vec::new();
        let mut has_more = false;
        for msg in matching.by_ref() {
            if messages.len() == max_messages {
                has_more = true;
                break;
            }
            messages.push(Arc::clone(msg));
        }

        let latest_id = messages.last().map(|m| m.id);
        ReadResponse {
            messages,
            has_more,
            latest_id,
        }
    }

    /// Fetch a single retained message by id.
    pub fn get_message(&self, channel: &str, message_id: Uuid) -> Option<Arc<Message>> {
        let state = self.channels.get(channel)?.value().clone();
        let state = state.read();
        state.messages.iter().find(|m| m.id == message_id).cloned()
    }

    /// Metadata snapshot for one channel.
    pub fn channel_info(&self, channel: &str) -> Option<ChannelInfo> {
        let state = self.channels.get(channel)?.value().clone();
        let state = state.read();
        Some(ChannelInfo {
            name: channel.to_string(),
            created_at: state.created_at,
            members: state.members.iter().cloned().collect(),
            message_count: state.messages.len(),
            capacity: self.capacity,
        })
    }

    /// Metadata snapshots for all channels.
    pub fn list_channels(&self) -> Vec<ChannelInfo> {
        let mut infos: Vec<ChannelInfo> = self
            .channels
            .iter()
            .map(|entry| {
                let state = entry.value().read();
                ChannelInfo {
                    name: entry.key().clone(),
                    created_at: state.created_at,
                    members: state.members.iter().cloned().collect(),
                    message_count: state.messages.len(),
                    capacity: self.capacity,
                }
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Store-wide counters.
    pub fn stats(&self) -> ChannelStoreStats {
        let mut total_messages = 0;
        let mut evicted = 0;
        for entry in self.channels.iter() {
            let state = entry.value().read();
            total_messages += state.messages.len();
            evicted += state.evicted;
        }
        ChannelStoreStats {
            channels: self.channels.len(),
            total_messages,
            evicted_messages: evicted,
        }
    }
}
