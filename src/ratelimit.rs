//! Token-bucket rate limiting for mutating calls.
//!
//! Two layers: a per-agent bucket (defaults to 100 requests/min) and a
//! global bucket shared by all agents (defaults to 1000/min). A request must
//! clear both; when the per-agent bucket is empty the global token is
//! refunded so one throttled agent does not burn the shared budget.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::errors::{CoordinationError, Result};

/// Classic token bucket refilled continuously from elapsed time.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn per_minute(limit: u32) -> Self {
        Self {
            capacity: f64::from(limit),
            refill_per_sec: f64::from(limit) / 60.0,
            tokens: f64::from(limit),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn available(&mut self) -> u32 {
        self.refill();
        self.tokens as u32
    }
}

/// Per-agent rate limit snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub agent_id: String,
    pub limit_per_minute: u32,
    pub available_tokens: u32,
    pub global_limit: u32,
    pub global_available: u32,
}

struct LimiterState {
    agent_buckets: HashMap<String, TokenBucket>,
    global_bucket: TokenBucket,
}

/// Multi-agent rate limiter with per-agent and global budgets.
pub struct RateLimiter {
    per_agent_limit: u32,
    global_limit: u32,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(per_agent_limit: u32, global_limit: u32) -> Self {
        Self {
            per_agent_limit,
            global_limit,
            state: Mutex::new(LimiterState {
                agent_buckets: HashMap::new(),
                global_bucket: TokenBucket::per_minute(global_limit),
            }),
        }
    }

    /// Charge one request to `agent_id`, failing with `RateLimitExceeded`
    /// when either budget is spent.
    pub fn check(&self, agent_id: &str, operation: &str) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if !state.global_bucket.consume() {
            log::warn!("global rate limit hit by '{agent_id}' on {operation}");
            return Err(CoordinationError::RateLimitExceeded {
                agent_id: agent_id.to_string(),
                limit: format!("{}/min (global)", self.global_limit),
            });
        }

        let per_agent_limit = self.per_agent_limit;
        let bucket = state
            .agent_buckets
            .entry(agent_id.to_string())
            .or_insert_with(|| TokenBucket::per_minute(per_agent_limit));

        if !bucket.consume() {
            // Refund the global token this request took.
            state.global_bucket.tokens = (state.global_bucket.tokens + 1.0)
                .min(state.global_bucket.capacity);
            log::warn!("rate limit hit by '{agent_id}' on {operation}");
            return Err(CoordinationError::RateLimitExceeded {
                agent_id: agent_id.to_string(),
                limit: format!("{per_agent_limit}/min"),
            });
        }

        Ok(())
    }

    /// Current budget for one agent.
    pub fn status(&self, agent_id: &str) -> RateLimitStatus {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let per_agent_limit = self.per_agent_limit;
        let global_available = state.global_bucket.available();
        let bucket = state
            .agent_buckets
            .entry(agent_id.to_string())
            .or_insert_with(|| TokenBucket::per_minute(per_agent_limit));

        RateLimitStatus {
            agent_id: agent_id.to_string(),
            limit_per_minute: per_agent_limit,
            available_tokens: bucket.available(),
            global_limit: self.global_limit,
            global_available,
        }
    }
}
