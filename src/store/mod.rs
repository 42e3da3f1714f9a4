//! The counting store: sorted-set score increments and probabilistic
//! distinct-membership sets.

use std::time::Duration;

pub mod hll;
pub mod memory;
pub mod redis;
pub mod sqlite;

pub use self::redis::RedisStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// What the pipeline needs from a backing store.
///
/// Calls block; async callers go through `spawn_blocking`. Implementations
/// must be safe to call concurrently without outside locking.
pub trait CountingStore: Send + Sync {
    /// Add `weight` to `member`'s score in the sorted set `key`, returning the
    /// new score.
    fn increment(&self, key: &str, weight: f64, member: &str) -> anyhow::Result<f64>;

    /// Add `element` to the approximate set `key`, creating it with lifetime
    /// `ttl` if absent or expired. Returns whether the set changed, i.e.
    /// whether `element` looks new.
    ///
    /// The check and the update are atomic per key.
    fn add_unique(&self, key: &str, element: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Cheap liveness probe.
    fn ping(&self) -> anyhow::Result<()>;

    /// Drop expired approximate sets, returning how many were removed.
    fn purge_expired(&self) -> anyhow::Result<usize> {
        Ok(0)
    }
}

/// Ping the store every `period` until cancelled, purging expired sets on the
/// way. Failures are logged; the next tick tries again.
pub async fn keep_alive(
    store: std::sync::Arc<dyn CountingStore>,
    period: Duration,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let store = std::sync::Arc::clone(&store);
        let result = tokio::task::spawn_blocking(move || {
            store.ping()?;
            store.purge_expired()
        })
        .await;
        match result {
            Ok(Ok(0)) => {}
            Ok(Ok(purged)) => tracing::debug!(purged, "purged expired visitor sets"),
            Ok(Err(e)) => tracing::warn!(error = %e, "counting store ping failed"),
            Err(e) => tracing::warn!(error = %e, "keep-alive task failed"),
        }
    }
    tracing::debug!("keep-alive stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    /// Counts keep-alive traffic on top of a [`MemoryStore`].
    #[derive(Default)]
    struct Watched {
        inner: MemoryStore,
        pings: AtomicUsize,
        purged: AtomicUsize,
    }

    impl CountingStore for Watched {
        fn increment(&self, key: &str, weight: f64, member: &str) -> anyhow::Result<f64> {
            self.inner.increment(key, weight, member)
        }
        fn add_unique(&self, key: &str, element: &str, ttl: Duration) -> anyhow::Result<bool> {
            self.inner.add_unique(key, element, ttl)
        }
        fn ping(&self) -> anyhow::Result<()> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            self.inner.ping()
        }
        fn purge_expired(&self) -> anyhow::Result<usize> {
            let purged = self.inner.purge_expired()?;
            self.purged.fetch_add(purged, Ordering::SeqCst);
            Ok(purged)
        }
    }

    #[tokio::test]
    async fn keep_alive_pings_and_purges_until_cancelled() {
        let store = Arc::new(Watched::default());
        store.add_unique("uv_hpll_0", "gone", Duration::ZERO).unwrap();
        store.add_unique("uv_hpll_1", "kept", Duration::from_secs(3600)).unwrap();

        let cancel = tokio_util::sync::CancellationToken::new();
        let task = tokio::spawn(keep_alive(
            store.clone(),
            Duration::from_millis(10),
            cancel.clone(),
        ));
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.purged.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        assert!(store.pings.load(Ordering::SeqCst) >= 1);
        assert_eq!(store.purged.load(Ordering::SeqCst), 1);
        assert_eq!(store.inner.estimate("uv_hpll_1"), Some(1));
    }
}
