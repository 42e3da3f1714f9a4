//! In-process counting store.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::hll::HyperLogLog;
use super::CountingStore;

/// Stand-in lifetime for TTLs too large to add to an `Instant`.
const FOREVER: Duration = Duration::from_secs(100 * 365 * 86_400);

fn expiry(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .or_else(|| now.checked_add(FOREVER))
        .unwrap_or(now)
}

struct Membership {
    hll: HyperLogLog,
    expires_at: Instant,
}

/// Keeps everything in mutex-guarded maps. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    sorted_sets: Mutex<HashMap<String, HashMap<String, f64>>>,
    memberships: Mutex<HashMap<String, Membership>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Score of `member` in `key`, if present.
    pub fn score(&self, key: &str, member: &str) -> Option<f64> {
        let sets = self.sorted_sets.lock().unwrap_or_else(PoisonError::into_inner);
        sets.get(key)?.get(member).copied()
    }

    /// All sorted-set keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let sets = self.sorted_sets.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<_> = sets.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Estimated cardinality of the live approximate set `key`.
    pub fn estimate(&self, key: &str) -> Option<u64> {
        let sets = self.memberships.lock().unwrap_or_else(PoisonError::into_inner);
        sets.get(key)
            .filter(|m| m.expires_at > Instant::now())
            .map(|m| m.hll.count())
    }
}

impl CountingStore for MemoryStore {
    fn increment(&self, key: &str, weight: f64, member: &str) -> anyhow::Result<f64> {
        let mut sets = self.sorted_sets.lock().unwrap_or_else(PoisonError::into_inner);
        let score = sets
            .entry(key.to_string())
            .or_default()
            .entry(member.to_string())
            .or_insert(0.0);
        *score += weight;
        Ok(*score)
    }

    fn add_unique(&self, key: &str, element: &str, ttl: Duration) -> anyhow::Result<bool> {
        let now = Instant::now();
        let mut sets = self.memberships.lock().unwrap_or_else(PoisonError::into_inner);
        let membership = sets.entry(key.to_string()).or_insert_with(|| Membership {
            hll: HyperLogLog::new(),
            expires_at: expiry(now, ttl),
        });
        if membership.expires_at <= now {
            *membership = Membership {
                hll: HyperLogLog::new(),
                expires_at: expiry(now, ttl),
            };
        }
        Ok(membership.hll.add(element))
    }

    fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn purge_expired(&self) -> anyhow::Result<usize> {
        let now = Instant::now();
        let mut sets = self.memberships.lock().unwrap_or_else(PoisonError::into_inner);
        let before = sets.len();
        sets.retain(|_, m| m.expires_at > now);
        Ok(before - sets.len())
    }
}
