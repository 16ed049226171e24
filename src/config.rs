//! Configuration for a coordination instance.
//!
//! Everything is carried by a plain struct injected into the constructors,
//! so multiple independent coordination instances can coexist (tests build
//! several side by side). `from_env` layers `COORD_*` environment variables
//! over the defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do when an `append` would push a channel past its capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the oldest retained message (ring-buffer semantics). Default.
    #[default]
    EvictOldest,
    /// Fail the append with `ChannelFull`. Opt-in strict mode.
    Reject,
}

/// Tunables for the coordination core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Maximum retained messages per channel.
    pub channel_capacity: usize,
    /// Behavior when a channel reaches capacity.
    pub overflow_policy: OverflowPolicy,
    /// Default lock lifetime when the caller does not specify one.
    pub default_auto_release: Duration,
    /// Upper bound on caller-requested lock lifetimes.
    pub max_auto_release: Duration,
    /// Maximum simultaneously held locks per agent.
    pub lock_quota: usize,
    /// Interval between expired-lock sweep passes.
    pub lock_sweep_interval: Duration,
    /// Expected heartbeat interval for agents.
    pub heartbeat_interval: Duration,
    /// Missed heartbeats before an agent is considered missing.
    pub missing_threshold: u32,
    /// Missed heartbeats before an agent is reaped.
    pub dead_threshold: u32,
    /// Whether mutating calls are rate limited.
    pub rate_limit_enabled: bool,
    /// Per-agent request budget per minute.
    pub rate_limit_per_agent: u32,
    /// Global request budget per minute across all agents.
    pub rate_limit_global: u32,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 10_000,
            overflow_policy: OverflowPolicy::EvictOldest,
            default_auto_release: Duration::from_secs(300),
            max_auto_release: Duration::from_secs(3_600),
            lock_quota: 10,
            lock_sweep_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            missing_threshold: 2,
            dead_threshold: 3,
            rate_limit_enabled: false,
            rate_limit_per_agent: 100,
            rate_limit_global: 1_000,
        }
    }
}

impl CoordinationConfig {
    /// Build a config from `COORD_*` environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_parse::<usize>("COORD_CHANNEL_CAPACITY") {
            cfg.channel_capacity = v;
        }
        if let Ok(v) = std::env::var("COORD_OVERFLOW_POLICY") {
            match v.as_str() {
                "reject" => cfg.overflow_policy = OverflowPolicy::Reject,
                "evict_oldest" => cfg.overflow_policy = OverflowPolicy::EvictOldest,
                other => log::warn!("ignoring unknown COORD_OVERFLOW_POLICY '{other}'"),
            }
        }
        if let Some(v) = env_parse::<u64>("COORD_DEFAULT_AUTO_RELEASE_SECONDS") {
            cfg.default_auto_release = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("COORD_MAX_AUTO_RELEASE_SECONDS") {
            cfg.max_auto_release = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<usize>("COORD_LOCK_QUOTA") {
            cfg.lock_quota = v;
        }
        if let Some(v) = env_parse::<u64>("COORD_LOCK_SWEEP_INTERVAL_SECONDS") {
            cfg.lock_sweep_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("COORD_HEARTBEAT_INTERVAL_SECONDS") {
            cfg.heartbeat_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u32>("COORD_MISSING_THRESHOLD") {
            cfg.missing_threshold = v;
        }
        if let Some(v) = env_parse::<u32>("COORD_DEAD_THRESHOLD") {
            cfg.dead_threshold = v;
        }
        if let Some(v) = env_parse::<bool>("COORD_RATE_LIMIT_ENABLED") {
            cfg.rate_limit_enabled = v;
        }
        if let Some(v) = env_parse::<u32>("COORD_RATE_LIMIT_PER_AGENT") {
            cfg.rate_limit_per_agent = v;
        }
        if let Some(v) = env_parse::<u32>("COORD_RATE_LIMIT_GLOBAL") {
            cfg.rate_limit_global = v;
        }

        cfg
    }

    /// Clamp a caller-requested auto-release duration to the configured bounds.
    pub fn clamp_auto_release(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.default_auto_release)
            .min(self.max_auto_release)
    }

    /// How stale `last_seen` may be before the sweep reaps an agent.
    pub fn dead_after(&self) -> Duration {
        self.heartbeat_interval * self.dead_threshold
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("ignoring unparsable {key}='{raw}'");
            None
        }
    }
}
