//! Counting store backed by a Redis server.
//!
//! Sorted sets are native `ZINCRBY`s. Daily visitor sets are native
//! HyperLogLogs: `PFADD` plus a first-write `EXPIRE`, run as one script so a
//! set's lifetime is fixed when it is created and never extended.

use std::time::Duration;

use anyhow::Context;

use super::CountingStore;

/// How long an operation waits for a free pooled connection.
const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest lifetime handed to `EXPIRE`.
const MAX_EXPIRE_SECS: u64 = i32::MAX as u64;

const ADMIT: &str = r#"
local changed = redis.call('PFADD', KEYS[1], ARGV[1])
if redis.call('TTL', KEYS[1]) < 0 then
    redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return changed
"#;

pub struct RedisStore {
    pool: r2d2::Pool<::redis::Client>,
    admit: ::redis::Script,
}

impl RedisStore {
    /// Connect to `url` (`redis://host:port/db`) with up to `connections`
    /// pooled connections. Fails unless the server answers `PING`.
    pub fn open(url: &str, connections: usize) -> anyhow::Result<Self> {
        let client = ::redis::Client::open(url).context("invalid redis URL")?;
        let addr = client.get_connection_info().addr.to_string();
        let pool = r2d2::Pool::builder()
            .max_size(u32::try_from(connections.max(1)).unwrap_or(u32::MAX))
            .min_idle(Some(1))
            .connection_timeout(CHECKOUT_TIMEOUT)
            .build(client)
            .with_context(|| format!("could not connect to redis at {addr}"))?;
        let store = Self {
            pool,
            admit: ::redis::Script::new(ADMIT),
        };
        store.ping()?;
        tracing::debug!(%addr, connections, "opened counting store");
        Ok(store)
    }

    fn conn(&self) -> anyhow::Result<r2d2::PooledConnection<::redis::Client>> {
        self.pool
            .get()
            .context("no counting store connection available")
    }

    /// Score of `member` in `key`, if present.
    pub fn score(&self, key: &str, member: &str) -> anyhow::Result<Option<f64>> {
        let mut conn = self.conn()?;
        let score = ::redis::cmd("ZSCORE")
            .arg(key)
            .arg(member)
            .query(&mut *conn)
            .with_context(|| format!("reading {key}"))?;
        Ok(score)
    }
}

impl CountingStore for RedisStore {
    fn increment(&self, key: &str, weight: f64, member: &str) -> anyhow::Result<f64> {
        let mut conn = self.conn()?;
        let score = ::redis::cmd("ZINCRBY")
            .arg(key)
            .arg(weight)
            .arg(member)
            .query(&mut *conn)
            .with_context(|| format!("incrementing {key}"))?;
        Ok(score)
    }

    fn add_unique(&self, key: &str, element: &str, ttl: Duration) -> anyhow::Result<bool> {
        // EXPIRE 0 would delete the set outright.
        let ttl = ttl.as_secs().clamp(1, MAX_EXPIRE_SECS);
        let mut conn = self.conn()?;
        let changed: i64 = self
            .admit
            .key(key)
            .arg(element)
            .arg(ttl)
            .invoke(&mut *conn)
            .with_context(|| format!("adding to {key}"))?;
        Ok(changed == 1)
    }

    fn ping(&self) -> anyhow::Result<()> {
        let mut conn = self.conn()?;
        let pong: String = ::redis::cmd("PING")
            .query(&mut *conn)
            .context("ping failed")?;
        anyhow::ensure!(pong == "PONG", "unexpected ping reply {pong:?}");
        Ok(())
    }
}
