//! Counting store persisted in SQLite.
//!
//! Sorted sets are rows of `(key, member, score)`. Approximate sets are
//! HyperLogLog registers stored as one blob per key, updated inside an
//! `IMMEDIATE` transaction so two writers can't both see "new".

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::hll::HyperLogLog;
use super::CountingStore;

const SCHEMA: &str = include_str!("schema.sql");

/// How long a connection waits on another writer's lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long an operation waits for a free pooled connection.
const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(30);

type Pool = r2d2::Pool<SqliteConnectionManager>;

pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db` with `connections`
    /// pooled connections.
    pub fn open(db: &Path, connections: usize) -> anyhow::Result<Self> {
        {
            let mut conn = Connection::open(db).context("could not open DB")?;
            conn.busy_timeout(BUSY_TIMEOUT)
                .context("could not set busy timeout")?;
            let mode: String = conn
                .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
                .context("could not enable WAL")?;
            tracing::debug!(journal_mode = %mode, db = %db.display(), "opened counting store");
            let tx = conn.transaction().context("could not initialize DB")?;
            tx.execute_batch(SCHEMA)
                .context("could not initialize DB schema")?;
            tx.commit()?;
        }

        let manager = SqliteConnectionManager::file(db)
            .with_init(|conn| conn.busy_timeout(BUSY_TIMEOUT));
        let pool = r2d2::Pool::builder()
            .max_size(u32::try_from(connections.max(1)).unwrap_or(u32::MAX))
            .connection_timeout(CHECKOUT_TIMEOUT)
            .build(manager)
            .with_context(|| format!("could not build connection pool for {}", db.display()))?;
        Ok(Self { pool })
    }

    fn conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .context("no counting store connection available")
    }

    /// Score of `member` in `key`, if present.
    pub fn score(&self, key: &str, member: &str) -> anyhow::Result<Option<f64>> {
        let conn = self.conn()?;
        let score = conn
            .prepare_cached("SELECT score FROM sorted_sets WHERE key = ?1 AND member = ?2")?
            .query_row(params![key, member], |row| row.get(0))
            .optional()?;
        Ok(score)
    }
}

impl CountingStore for SqliteStore {
    fn increment(&self, key: &str, weight: f64, member: &str) -> anyhow::Result<f64> {
        let conn = self.conn()?;
        let score = conn
            .prepare_cached(
                r#"
INSERT INTO sorted_sets (key, member, score) VALUES (?1, ?2, ?3)
ON CONFLICT (key, member) DO UPDATE SET score = score + excluded.score
RETURNING score"#,
            )?
            .query_row(params![key, member, weight], |row| row.get(0))
            .with_context(|| format!("incrementing {key}"))?;
        Ok(score)
    }

    fn add_unique(&self, key: &str, element: &str, ttl: Duration) -> anyhow::Result<bool> {
        let now = Utc::now().timestamp();
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);

        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("could not begin transaction")?;
        let existing: Option<(Vec<u8>, i64)> = tx
            .prepare_cached("SELECT registers, expires_at FROM hll_sets WHERE key = ?1")?
            .query_row([key], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;

        let (mut hll, expires_at, fresh) = match existing {
            Some((registers, expires_at)) if expires_at > now => {
                let hll = HyperLogLog::from_bytes(&registers)
                    .with_context(|| format!("corrupt registers under {key}"))?;
                (hll, expires_at, false)
            }
            _ => (HyperLogLog::new(), now.saturating_add(ttl), true),
        };

        let added = hll.add(element);
        if added || fresh {
            tx.prepare_cached(
                "INSERT OR REPLACE INTO hll_sets (key, registers, expires_at) VALUES (?1, ?2, ?3)",
            )?
            .execute(params![key, hll.as_bytes(), expires_at])?;
        }
        tx.commit().context("could not commit transaction")?;
        Ok(added)
    }

    fn ping(&self) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .context("ping failed")?;
        Ok(())
    }

    fn purge_expired(&self) -> anyhow::Result<usize> {
        let conn = self.conn()?;
        let removed = conn
            .prepare_cached("DELETE FROM hll_sets WHERE expires_at <= ?1")?
            .execute([Utc::now().timestamp()])?;
        Ok(removed)
    }
}
