//! Lock Manager: named mutual exclusion across agents.
//!
//! A lock is granted to at most one live holder at a time. Every acquisition
//! carries an auto-release deadline so a crashed or hung holder can only
//! block others for a bounded window; a lock past its deadline is treated as
//! free by the next acquire attempt even before the periodic sweep removes
//! it. Waiters park on a per-lock `Notify` (wake-on-release, no busy polling)
//! and also wake themselves at the holder's expiry deadline.
//!
//! Deadlines use `tokio::time::Instant` so tests can drive expiry with the
//! paused clock; the wall-clock `expires_at` reported to callers is advisory.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::errors::{CoordinationError, Result};

/// A successful acquisition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockGrant {
    pub lock_id: Uuid,
    pub name: String,
    pub held_by: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Live-lock snapshot for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub lock_id: Uuid,
    pub name: String,
    pub held_by: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub seconds_remaining: u64,
}

/// Manager-wide counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockStats {
    pub active_locks: usize,
    pub agents_with_locks: usize,
    pub expired_reclaimed: u64,
}

struct LockRecord {
    lock_id: Uuid,
    held_by: String,
    acquired_at: DateTime<Utc>,
    expires_wall: DateTime<Utc>,
    expires_at: Instant,
}

impl LockRecord {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Default)]
struct LockTable {
    locks: HashMap<String, LockRecord>,
    by_id: HashMap<Uuid, String>,
    agent_locks: HashMap<String, HashSet<String>>,
    waiters: HashMap<String, Arc<Notify>>,
    expired_reclaimed: u64,
}

impl LockTable {
    /// Count an agent's live locks, dropping bookkeeping for expired ones.
    fn live_count(&mut self, agent_id: &str, now: Instant) -> usize {
        let LockTable {
            locks, agent_locks, ..
        } = self;
        let Some(names) = agent_locks.get_mut(agent_id) else {
            return 0;
        };
        names.retain(|name| {
            locks
                .get(name)
                .map_or(false, |rec| rec.held_by == agent_id && rec.is_live(now))
        });
        names.len()
    }

    fn remove(&mut self, name: &str) -> Option<LockRecord> {
        let rec = self.locks.remove(name)?;
        self.by_id.remove(&rec.lock_id);
        if let Some(names) = self.agent_locks.get_mut(&rec.held_by) {
            names.remove(name);
        }
        // Every parked waiter holds a clone of the Notify; once only the
        // table's copy is left, the slot can go.
        if self
            .waiters
            .get(name)
            .map_or(false, |notify| Arc::strong_count(notify) == 1)
        {
            self.waiters.remove(name);
        }
        Some(rec)
    }

    fn waiter(&mut self, name: &str) -> Arc<Notify> {
        self.waiters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn wake_one(&self, name: &str) {
        if let Some(notify) = self.waiters.get(name) {
            notify.notify_one();
        }
    }
}

/// Mutual exclusion over named shared resources.
pub struct LockManager {
    table: Mutex<LockTable>,
    quota: usize,
}

impl LockManager {
    pub fn new(quota: usize) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            quota,
        }
    }

    /// Acquire `name` for `agent_id`, waiting up to `timeout` for the current
    /// holder to release or expire (`timeout` of zero fails immediately).
    ///
    /// Fails fast with `LockQuotaExceeded` when the agent is already at its
    /// quota, without waiting. Returns `LockUnavailable` (carrying the
    /// current holder) when the wait times out. Cancelling the returned
    /// future while it waits leaves no partial state.
    pub async fn acquire(
        &self,
        name: &str,
        agent_id: &str,
        timeout: Duration,
        auto_release: Duration,
    ) -> Result<LockGrant> {
        let deadline = Instant::now() + timeout;

        loop {
            let (notify, holder_expires) = {
                let mut table = self.table.lock();
                let now = Instant::now();

                let held = table.live_count(agent_id, now);
                if held >= self.quota {
                    return Err(CoordinationError::LockQuotaExceeded {
                        agent_id: agent_id.to_string(),
                        held,
                        max: self.quota,
                    });
                }

                let live = table
                    .locks
                    .get(name)
                    .filter(|rec| rec.is_live(now))
                    .map(|rec| (rec.held_by.clone(), rec.expires_wall, rec.expires_at));

                match live {
                    None => {
                        // Free, or expired in place: reclaim and grant.
                        if table.locks.contains_key(name) {
                            table.remove(name);
                            table.expired_reclaimed += 1;
                            log::debug!("lock '{name}' expired in place, reclaimed on acquire");
                        }
                        return Ok(self.grant(&mut table, name, agent_id, auto_release));
                    }
                    Some((held_by, expires_wall, expires_at)) => {
                        if now >= deadline {
                            return Err(CoordinationError::LockUnavailable {
                                name: name.to_string(),
                                held_by,
                                expires_at: expires_wall,
                            });
                        }
                        (table.waiter(name), expires_at)
                    }
                }
            };

            // Park until the holder releases, the holder's lease runs out,
            // or our own deadline passes, whichever comes first. The next
            // loop iteration re-examines the table.
            let wake_at = deadline.min(holder_expires);
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    fn grant(
        &self,
        table: &mut LockTable,
        name: &str,
        agent_id: &str,
        auto_release: Duration,
    ) -> LockGrant {
        let lock_id = Uuid::new_v4();
        let acquired_at = Utc::now();
        let expires_wall = acquired_at
            + chrono::Duration::from_std(auto_release).unwrap_or(chrono::Duration::zero());

        table.locks.insert(
            name.to_string(),
            LockRecord {
                lock_id,
                held_by: agent_id.to_string(),
                acquired_at,
                expires_wall,
                expires_at: Instant::now() + auto_release,
            },
        );
        table.by_id.insert(lock_id, name.to_string());
        table
            .agent_locks
            .entry(agent_id.to_string())
            .or_default()
            .insert(name.to_string());

        log::debug!("lock '{name}' granted to '{agent_id}' ({lock_id})");

        LockGrant {
            lock_id,
            name: name.to_string(),
            held_by: agent_id.to_string(),
            acquired_at,
            expires_at: expires_wall,
        }
    }

    /// Release a lock by the id returned from `acquire`.
    ///
    /// Succeeds only when `agent_id` is the current holder and `lock_id`
    /// matches the live acquisition; a mismatched release is a caller bug
    /// and is surfaced as `LockOwnership` rather than ignored.
    pub fn release(&self, lock_id: Uuid, agent_id: &str) -> Result<String> {
        let mut table = self.table.lock();

        let Some(name) = table.by_id.get(&lock_id).cloned() else {
            return Err(CoordinationError::LockOwnership {
                lock_id: lock_id.to_string(),
                reason: "no such lock id (already released or expired)".into(),
            });
        };

        let holder = table.locks.get(&name).map(|rec| rec.held_by.clone());
        match holder {
            Some(held_by) if held_by == agent_id => {
                table.remove(&name);
                table.wake_one(&name);
                log::debug!("lock '{name}' released by '{agent_id}'");
                Ok(name)
            }
            Some(held_by) => Err(CoordinationError::LockOwnership {
                lock_id: lock_id.to_string(),
                reason: format!("held by '{held_by}', not '{agent_id}'"),
            }),
            None => Err(CoordinationError::LockOwnership {
                lock_id: lock_id.to_string(),
                reason: "no such lock id (already released or expired)".into(),
            }),
        }
    }

    /// Release every lock held by `agent_id`, waking waiters.
    ///
    /// Used by the heartbeat sweep when reaping a dead agent. Returns the
    /// names of the released locks.
    pub fn release_all(&self, agent_id: &str) -> Vec<String> {
        let mut table = self.table.lock();
        let names: Vec<String> = table
            .agent_locks
            .get(agent_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        let mut released = Vec::new();
        for name in names {
            let matches = table
                .locks
                .get(&name)
                .map_or(false, |rec| rec.held_by == agent_id);
            if matches {
                table.remove(&name);
                table.wake_one(&name);
                released.push(name);
            }
        }
        table.agent_locks.remove(agent_id);
        released
    }

    /// Proactively free expired locks and wake their waiters.
    ///
    /// Returns `(name, former holder)` pairs for audit logging. Passive
    /// expiry in `acquire` makes this a latency optimization, not a
    /// correctness requirement.
    pub fn sweep_expired(&self) -> Vec<(String, String)> {
        let mut table = self.table.lock();
        let now = Instant::now();

        let expired: Vec<String> = table
            .locks
            .iter()
            .filter(|(_, rec)| !rec.is_live(now))
            .map(|(name, _)| name.clone())
            .collect();

        let mut reclaimed = Vec::new();
        for name in expired {
            if let Some(rec) = table.remove(&name) {
                table.expired_reclaimed += 1;
                table.wake_one(&name);
                log::warn!(
                    "lock '{name}' held by '{holder}' expired, auto-released",
                    holder = rec.held_by
                );
                reclaimed.push((name, rec.held_by));
            }
        }
        reclaimed
    }

    /// Snapshot of one lock, `None` when free or expired.
    pub fn lock_info(&self, name: &str) -> Option<LockInfo> {
        let table = self.table.lock();
        let now = Instant::now();
        table
            .locks
            .get(name)
            .filter(|rec| rec.is_live(now))
            .map(|rec| snapshot(name, rec, now))
    }

    /// Snapshots of all live locks.
    pub fn list_locks(&self) -> Vec<LockInfo> {
        let table = self.table.lock();
        let now = Instant::now();
        let mut infos: Vec<LockInfo> = table
            .locks
            .iter()
            .filter(|(_, rec)| rec.is_live(now))
            .map(|(name, rec)| snapshot(name, rec, now))
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Names of live locks held by `agent_id`.
    pub fn locks_held_by(&self, agent_id: &str) -> Vec<String> {
        let mut table = self.table.lock();
        let now = Instant::now();
        table.live_count(agent_id, now);
        table
            .agent_locks
            .get(agent_id)
            .map(|set| {
                let mut v: Vec<String> = set.iter().cloned().collect();
                v.sort();
                v
            })
            .unwrap_or_default()
    }

    /// Manager-wide counters.
    pub fn stats(&self) -> LockStats {
        let table = self.table.lock();
        let now = Instant::now();
        let active = table.locks.values().filter(|rec| rec.is_live(now)).count();
        let agents = table
            .locks
            .values()
            .filter(|rec| rec.is_live(now))
            .map(|rec| rec.held_by.as_str())
            .collect::<HashSet<_>>()
            .len();
        LockStats {
            active_locks: active,
            agents_with_locks: agents,
            expired_reclaimed: table.expired_reclaimed,
        }
    }
}

fn snapshot(name: &str, rec: &LockRecord, now: Instant) -> LockInfo {
    LockInfo {
        lock_id: rec.lock_id,
        name: name.to_string(),
        held_by: rec.held_by.clone(),
        acquired_at: rec.acquired_at,
        expires_at: rec.expires_wall,
        seconds_remaining: rec.expires_at.saturating_duration_since(now).as_secs(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOLD: Duration = Duration::from_secs(300);

    #[tokio::test]
    async fn grants_free_lock_immediately() {
        let mgr = LockManager::new(10);
        let grant = mgr
            .acquire("file:x", "a1", Duration::ZERO, HOLD)
            .await
            .unwrap();
        assert_eq!(grant.held_by, "a1");
        assert_eq!(mgr.lock_info("file:x").unwrap().held_by, "a1");
    }

    #[tokio::test]
    async fn zero_timeout_fails_immediately_with_holder() {
        let mgr = LockManager::new(10);
        mgr.acquire("file:x", "a1", Duration::ZERO, HOLD).await.unwrap();

        let err = mgr
            .acquire("file:x", "a2", Duration::ZERO, HOLD)
            .await
            .unwrap_err();
        match err {
            CoordinationError::LockUnavailable { held_by, .. } => assert_eq!(held_by, "a1"),
            other => panic!("expected LockUnavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn waiter_is_woken_by_release() {
        let mgr = Arc::new(LockManager::new(10));
        let grant = mgr
            .acquire("file:x", "a1", Duration::ZERO, HOLD)
            .await
            .unwrap();

        let waiter = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move {
                mgr.acquire("file:x", "a2", Duration::from_secs(5), HOLD).await
            })
        };
        tokio::task::yield_now().await;

        mgr.release(grant.lock_id, "a1").unwrap();
        let grant2 = waiter.await.unwrap().unwrap();
        assert_eq!(grant2.held_by, "a2");
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lock_is_acquirable_without_release() {
        let mgr = LockManager::new(10);
        mgr.acquire("file:x", "a1", Duration::ZERO, Duration::from_secs(1))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(1_100)).await;

        // Passive expiry: no sweep has run, the next acquire reclaims.
        let grant = mgr
            .acquire("file:x", "a2", Duration::ZERO, HOLD)
            .await
            .unwrap();
        assert_eq!(grant.held_by, "a2");
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_outlasting_lease_gets_the_lock() {
        let mgr = Arc::new(LockManager::new(10));
        mgr.acquire("file:x", "a1", Duration::ZERO, Duration::from_secs(2))
            .await
            .unwrap();

        let waiter = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move {
                mgr.acquire("file:x", "a2", Duration::from_secs(10), HOLD).await
            })
        };

        let grant = waiter.await.unwrap().unwrap();
        assert_eq!(grant.held_by, "a2");
    }

    #[tokio::test]
    async fn quota_fails_fast_without_waiting() {
        let mgr = LockManager::new(10);
        for i in 0..10 {
            mgr.acquire(&format!("res:{i}"), "a1", Duration::ZERO, HOLD)
                .await
                .unwrap();
        }

        // Even with a positive timeout, the 11th fails immediately.
        let started = std::time::Instant::now();
        let err = mgr
            .acquire("res:10", "a1", Duration::from_secs(30), HOLD)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoordinationError::LockQuotaExceeded { held: 10, max: 10, .. }
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn release_rejects_non_holder_and_stale_ids() {
        let mgr = LockManager::new(10);
        let grant = mgr
            .acquire("file:x", "a1", Duration::ZERO, HOLD)
            .await
            .unwrap();

        let err = mgr.release(grant.lock_id, "a2").unwrap_err();
        assert!(matches!(err, CoordinationError::LockOwnership { .. }));

        mgr.release(grant.lock_id, "a1").unwrap();
        let err = mgr.release(grant.lock_id, "a1").unwrap_err();
        assert!(matches!(err, CoordinationError::LockOwnership { .. }));
    }

    #[tokio::test]
    async fn release_all_frees_everything_held() {
        let mgr = LockManager::new(10);
        mgr.acquire("a", "a1", Duration::ZERO, HOLD).await.unwrap();
        mgr.acquire("b", "a1", Duration::ZERO, HOLD).await.unwrap();
        mgr.acquire("c", "a2", Duration::ZERO, HOLD).await.unwrap();

        let mut released = mgr.release_all("a1");
        released.sort();
        assert_eq!(released, vec!["a".to_string(), "b".to_string()]);
        assert!(mgr.lock_info("c").is_some());
        assert_eq!(mgr.stats().active_locks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_reclaims_expired_and_reports_holders() {
        let mgr = LockManager::new(10);
        mgr.acquire("a", "a1", Duration::ZERO, Duration::from_secs(1))
            .await
            .unwrap();
        mgr.acquire("b", "a2", Duration::ZERO, HOLD).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;

        let reclaimed = mgr.sweep_expired();
        assert_eq!(reclaimed, vec![("a".to_string(), "a1".to_string())]);
        assert!(mgr.lock_info("a").is_none());
        assert!(mgr.lock_info("b").is_some());
    }

    #[tokio::test]
    async fn concurrent_acquires_grant_exactly_one() {
        let mgr = Arc::new(LockManager::new(10));
        let mut tasks = Vec::new();
        for i in 0..8 {
            let mgr = Arc::clone(&mgr);
            tasks.push(tokio::spawn(async move {
                mgr.acquire("contested", &format!("a{i}"), Duration::ZERO, HOLD)
                    .await
                    .is_ok()
            }));
        }

        let mut granted = 0;
        for t in tasks {
            if t.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_slot_is_dropped_once_unused() {
        let mgr = Arc::new(LockManager::new(10));
        let grant = mgr
            .acquire("file:x", "a1", Duration::ZERO, HOLD)
            .await
            .unwrap();

        let waiter = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move {
                mgr.acquire("file:x", "a2", Duration::from_secs(1), HOLD).await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(mgr.table.lock().waiters.len(), 1);

        // The waiter times out and drops its handle; the next release
        // removes the now-unused slot instead of leaving it behind.
        assert!(waiter.await.unwrap().is_err());
        mgr.release(grant.lock_id, "a1").unwrap();
        assert!(mgr.table.lock().waiters.is_empty());
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_no_state() {
        let mgr = Arc::new(LockManager::new(10));
        let grant = mgr
            .acquire("file:x", "a1", Duration::ZERO, HOLD)
            .await
            .unwrap();

        let waiter = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move {
                mgr.acquire("file:x", "a2", Duration::from_secs(60), HOLD).await
            })
        };
        tokio::task::yield_now().await;
        waiter.abort();
        let _ = waiter.await;

        // The cancelled waiter must not end up holding anything.
        assert!(mgr.locks_held_by("a2").is_empty());

        // And the lock still releases normally for the next caller.
        mgr.release(grant.lock_id, "a1").unwrap();
        let grant = mgr
            .acquire("file:x", "a3", Duration::ZERO, HOLD)
            .await
            .unwrap();
        assert_eq!(grant.held_by, "a3");
    }
}
