//! Agent Registry: liveness tracking for coordination participants.
//!
//! The registry is the single writer of per-agent liveness state. Agents are
//! created on first join, touched by every successful call (implicit
//! heartbeat), and classified `alive` / `missing` / `dead` from how many
//! expected heartbeat intervals have elapsed since `last_seen`. The registry
//! holds only channel and lock *names* for an agent; the stores own the
//! actual state.
//!
//! Reaping dead agents (releasing locks, dropping memberships) is
//! orchestrated by [`CoordinationCore`](crate::core::CoordinationCore)'s
//! sweep, which consults this registry.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::errors::{CoordinationError, Result};

/// Liveness classification derived from missed heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Alive,
    Missing,
    Dead,
}

/// Acknowledgment returned from `heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub acknowledged: bool,
    /// Deadline for the next heartbeat to stay `alive`.
    pub next_heartbeat_by: DateTime<Utc>,
    pub status: AgentStatus,
}

/// Read-only agent snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub role: Option<String>,
    pub capabilities: HashMap<String, Value>,
    pub channels_joined: Vec<String>,
    pub locks_held: Vec<String>,
    pub status: AgentStatus,
    pub last_seen: DateTime<Utc>,
    pub missed_beats: u32,
    pub heartbeat_count: u64,
}

/// Registry-wide counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_agents: usize,
    pub alive: usize,
    pub missing: usize,
    pub dead: usize,
}

struct AgentRecord {
    role: Option<String>,
    capabilities: HashMap<String, Value>,
    channels_joined: HashSet<String>,
    locks_held: HashSet<String>,
    last_seen: Instant,
    last_seen_wall: DateTime<Utc>,
    heartbeat_count: u64,
}

/// Tracks known agents and their liveness.
pub struct AgentRegistry {
    agents: DashMap<String, AgentRecord>,
    heartbeat_interval: Duration,
    missing_threshold: u32,
    dead_threshold: u32,
}

impl AgentRegistry {
    pub fn new(heartbeat_interval: Duration, missing_threshold: u32, dead_threshold: u32) -> Self {
        Self {
            agents: DashMap::new(),
            heartbeat_interval,
            missing_threshold,
            dead_threshold,
        }
    }

    /// Create or refresh an agent record on `join`.
    ///
    /// Re-registering updates role and merges capabilities rather than
    /// erroring, matching the idempotent join contract.
    pub fn register(
        &self,
        agent_id: &str,
        role: Option<&str>,
        capabilities: HashMap<String, Value>,
    ) {
        let mut entry = self
            .agents
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentRecord {
                role: None,
                capabilities: HashMap::new(),
                channels_joined: HashSet::new(),
                locks_held: HashSet::new(),
                last_seen: Instant::now(),
                last_seen_wall: Utc::now(),
                heartbeat_count: 0,
            });

        if let Some(role) = role {
            entry.role = Some(role.to_string());
        }
        entry.capabilities.extend(capabilities);
        entry.last_seen = Instant::now();
        entry.last_seen_wall = Utc::now();
    }

    /// Implicit heartbeat: refresh `last_seen` on any successful call.
    pub fn touch(&self, agent_id: &str) -> Result<()> {
        match self.agents.get_mut(agent_id) {
            Some(mut rec) => {
                rec.last_seen = Instant::now();
                rec.last_seen_wall = Utc::now();
                Ok(())
            }
            None => Err(CoordinationError::AgentUnknown {
                agent_id: agent_id.to_string(),
            }),
        }
    }

    /// Explicit heartbeat. Fails with `AgentUnknown` before the first join.
    pub fn heartbeat(&self, agent_id: &str) -> Result<HeartbeatAck> {
        let mut rec = self.agents.get_mut(agent_id).ok_or_else(|| {
            CoordinationError::AgentUnknown {
                agent_id: agent_id.to_string(),
            }
        })?;

        rec.last_seen = Instant::now();
        rec.last_seen_wall = Utc::now();
        rec.heartbeat_count += 1;

        let interval = chrono::Duration::from_std(self.heartbeat_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        Ok(HeartbeatAck {
            acknowledged: true,
            next_heartbeat_by: rec.last_seen_wall + interval,
            status: AgentStatus::Alive,
        })
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// Record that an agent joined / left a channel (names only).
    pub fn note_channel_joined(&self, agent_id: &str, channel: &str) {
        if let Some(mut rec) = self.agents.get_mut(agent_id) {
            rec.channels_joined.insert(channel.to_string());
        }
    }

    pub fn note_channel_left(&self, agent_id: &str, channel: &str) {
        if let Some(mut rec) = self.agents.get_mut(agent_id) {
            rec.channels_joined.remove(channel);
        }
    }

    /// Record lock ownership changes (names only).
    pub fn note_lock_acquired(&self, agent_id: &str, lock_name: &str) {
        if let Some(mut rec) = self.agents.get_mut(agent_id) {
            rec.locks_held.insert(lock_name.to_string());
        }
    }

    pub fn note_lock_released(&self, agent_id: &str, lock_name: &str) {
        if let Some(mut rec) = self.agents.get_mut(agent_id) {
            rec.locks_held.remove(lock_name);
        }
    }

    fn missed_beats(&self, rec: &AgentRecord, now: Instant) -> u32 {
        let elapsed = now.saturating_duration_since(rec.last_seen);
        (elapsed.as_secs_f64() / self.heartbeat_interval.as_secs_f64()) as u32
    }

    fn status_of(&self, rec: &AgentRecord, now: Instant) -> AgentStatus {
        let missed = self.missed_beats(rec, now);
        if missed >= self.dead_threshold {
            AgentStatus::Dead
        } else if missed >= self.missing_threshold {
            AgentStatus::Missing
        } else {
            AgentStatus::Alive
        }
    }

    /// Snapshot one agent.
    pub fn agent_info(&self, agent_id: &str) -> Option<AgentInfo> {
        let rec = self.agents.get(agent_id)?;
        let now = Instant::now();
        Some(self.info_from(agent_id, &rec, now))
    }

    /// Snapshot all agents, optionally filtered by status.
    pub fn list_agents(&self, status_filter: Option<AgentStatus>) -> Vec<AgentInfo> {
        let now = Instant::now();
        let mut infos: Vec<AgentInfo> = self
            .agents
            .iter()
            .map(|entry| self.info_from(entry.key(), entry.value(), now))
            .filter(|info| status_filter.map_or(true, |s| info.status == s))
            .collect();
        infos.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        infos
    }

    /// Agents whose heartbeats are stale past the dead threshold.
    ///
    /// The sweep in `CoordinationCore` reaps these.
    pub fn dead_agents(&self) -> Vec<String> {
        let now = Instant::now();
        self.agents
            .iter()
            .filter(|entry| self.status_of(entry.value(), now) == AgentStatus::Dead)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Drop an agent record entirely (after reaping its resources).
    pub fn remove(&self, agent_id: &str) -> bool {
        self.agents.remove(agent_id).is_some()
    }

    /// Registry-wide counters.
    pub fn stats(&self) -> RegistryStats {
        let now = Instant::now();
        let mut stats = RegistryStats {
            total_agents: self.agents.len(),
            alive: 0,
            missing: 0,
            dead: 0,
        };
        for entry in self.agents.iter() {
            match self.status_of(entry.value(), now) {
                AgentStatus::Alive => stats.alive += 1,
                AgentStatus::Missing => stats.missing += 1,
                AgentStatus::Dead => stats.dead += 1,
            }
        }
        stats
    }

    fn info_from(&self, agent_id: &str, rec: &AgentRecord, now: Instant) -> AgentInfo {
        let mut channels: Vec<String> = rec.channels_joined.iter().cloned().collect();
        channels.sort();
        let mut locks: Vec<String> = rec.locks_held.iter().cloned().collect();
        locks.sort();
        AgentInfo {
            agent_id: agent_id.to_string(),
            role: rec.role.clone(),
            capabilities: rec.capabilities.clone(),
            channels_joined: channels,
            locks_held: locks,
            status: self.status_of(rec, now),
            last_seen: rec.last_seen_wall,
            missed_beats: self.missed_beats(rec, now),
            heartbeat_count: rec.heartbeat_count,
        }
    }
}
