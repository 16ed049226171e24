//! Append-only, hash-chained audit log of lifecycle events.
//!
//! Each entry hashes its own content together with the previous entry's
//! hash, so any retroactive edit or deletion breaks the chain and is caught
//! by [`AuditLog::verify_integrity`]. The log is a pure observer: it is
//! written after the fact and never decides whether an operation succeeds.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle events worth a forensic record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    ChannelCreated {
        channel: String,
    },
    AgentJoined {
        channel: String,
        agent_id: String,
    },
    AgentLeft {
        channel: String,
        agent_id: String,
    },
    MessageAppended {
        channel: String,
        agent_id: String,
        message_id: Uuid,
        message_type: String,
    },
    LockAcquired {
        name: String,
        agent_id: String,
        lock_id: Uuid,
    },
    LockReleased {
        name: String,
        agent_id: String,
        reason: ReleaseReason,
    },
    AgentReaped {
        agent_id: String,
        locks_released: Vec<String>,
        channels_left: Vec<String>,
    },
}

/// Why a lock stopped being held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    Explicit,
    Expired,
    Reaped,
}

/// One link in the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub index: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: AuditEvent,
    pub prev_hash: String,
    pub hash: String,
}

/// Chain verification failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("audit chain broken at entry {index}")]
pub struct ChainViolation {
    pub index: u64,
}

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

fn entry_hash(index: u64, timestamp: &DateTime<Utc>, event: &AuditEvent, prev_hash: &str) -> String {
    // Struct-variant field order makes the JSON deterministic.
    let event_json = serde_json::to_string(event).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(index.to_be_bytes());
    hasher.update(timestamp.to_rfc3339().as_bytes());
    hasher.update(event_json.as_bytes());
    hasher.update(prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Append-only audit log with a SHA-256 hash chain.
#[derive(Default)]
pub struct AuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event, chaining it to the previous entry's hash.
    pub fn record(&self, event: AuditEvent) -> AuditEntry {
        let mut entries = self.entries.lock();
        let index = entries.len() as u64;
        let prev_hash = entries
            .last()
            .map(|e| e.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let timestamp = Utc::now();
        let hash = entry_hash(index, &timestamp, &event, &prev_hash);

        let entry = AuditEntry {
            index,
            timestamp,
            event,
            prev_hash,
            hash,
        };
        entries.push(entry.clone());
        entry
    }

    /// Recompute the chain, detecting any retroactive edit or deletion.
    ///
    /// Returns the number of verified entries.
    pub fn verify_integrity(&self) -> Result<u64, ChainViolation> {
        let entries = self.entries.lock();
        let mut prev_hash = GENESIS_HASH.to_string();

        for (i, entry) in entries.iter().enumerate() {
            let expected =
                entry_hash(entry.index, &entry.timestamp, &entry.event, &entry.prev_hash);
            if entry.index != i as u64 || entry.prev_hash != prev_hash || entry.hash != expected {
                return Err(ChainViolation { index: i as u64 });
            }
            prev_hash = entry.hash.clone();
        }
        Ok(entries.len() as u64)
    }

    /// Copy of the full chain, oldest first.
    pub fn snapshot(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    #[cfg(test)]
    fn tamper(&self, index: usize, f: impl FnOnce(&mut AuditEntry)) {
        let mut entries = self.entries.lock();
        f(&mut entries[index]);
    }

    #[cfg(test)]
    fn truncate(&self, len: usize) {
        self.entries.lock().truncate(len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(agent: &str) -> AuditEvent {
        AuditEvent::AgentJoined {
            channel: "proj".into(),
            agent_id: agent.into(),
        }
    }

    #[test]
    fn empty_log_verifies() {
        let log = AuditLog::new();
        assert_eq!(log.verify_integrity().unwrap(), 0);
        assert!(log.is_empty());
    }

    #[test]
    fn chain_links_consecutive_entries() {
        let log = AuditLog::new();
        let first = log.record(joined("a1"));
        let second = log.record(AuditEvent::LockAcquired {
            name: "file:x".into(),
            agent_id: "a1".into(),
            lock_id: Uuid::new_v4(),
        });

        assert_eq!(first.prev_hash, GENESIS_HASH);
        assert_eq!(second.prev_hash, first.hash);
        assert_eq!(log.verify_integrity().unwrap(), 2);
    }

    #[test]
    fn edit_is_detected() {
        let log = AuditLog::new();
        log.record(joined("a1"));
        log.record(joined("a2"));
        log.record(joined("a3"));

        log.tamper(1, |entry| {
            entry.event = AuditEvent::AgentLeft {
                channel: "proj".into(),
                agent_id: "a2".into(),
            };
        });

        assert_eq!(log.verify_integrity().unwrap_err(), ChainViolation { index: 1 });
    }

    #[test]
    fn deletion_is_detected() {
        let log = AuditLog::new();
        log.record(joined("a1"));
        log.record(joined("a2"));
        log.record(joined("a3"));

        // Dropping the tail alone still verifies (a shorter but valid
        // chain), so deletion detection needs the surviving suffix to
        // disagree — delete from the middle by shifting entries down.
        let mut entries = log.snapshot();
        entries.remove(1);
        let log2 = AuditLog::new();
        *log2.entries.lock() = entries;
        assert!(log2.verify_integrity().is_err());

        // Tail truncation keeps a valid (shorter) chain.
        log.truncate(2);
        assert_eq!(log.verify_integrity().unwrap(), 2);
    }

    #[test]
    fn entries_serialize_flat() {
        let log = AuditLog::new();
        log.record(joined("a1"));
        let v = serde_json::to_value(log.snapshot()).unwrap();
        assert_eq!(v[0]["event"], "agent_joined");
        assert_eq!(v[0]["agent_id"], "a1");
        assert!(v[0]["hash"].as_str().unwrap().len() == 64);
    }
}
