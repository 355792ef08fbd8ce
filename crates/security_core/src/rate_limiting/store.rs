//! Durable attempt/block storage for the rate limiter

use super::{AttemptStats, CleanupReport, LimitType, RateLimitAttempt, RateLimitBlock};
use crate::error::{SecurityError, SecurityResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Storage behind the [`RateLimiter`](super::RateLimiter).
///
/// Identifiers arrive already hashed; implementations never see the raw value.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Block for the pair that is still in force at `now`
    async fn active_block(
        &self,
        identifier_hash: &str,
        limit_type: LimitType,
        now: DateTime<Utc>,
    ) -> SecurityResult<Option<RateLimitBlock>>;

    /// Failed attempts for the pair at or after `since` that came after the
    /// pair's most recent success
    async fn count_recent_failures(
        &self,
        identifier_hash: &str,
        limit_type: LimitType,
        since: DateTime<Utc>,
    ) -> SecurityResult<u32>;

    /// Create the block for the pair, replacing any previous one
    async fn upsert_block(&self, block: &RateLimitBlock) -> SecurityResult<()>;

    /// Append an attempt row
    async fn insert_attempt(&self, attempt: &RateLimitAttempt) -> SecurityResult<()>;

    /// Most recent attempts for the pair, newest first
    async fn recent_attempts(
        &self,
        identifier_hash: &str,
        limit_type: LimitType,
        limit: usize,
    ) -> SecurityResult<Vec<RateLimitAttempt>>;

    /// Delete blocks of an identifier; every limit type when `None`
    async fn delete_blocks(
        &self,
        identifier_hash: &str,
        limit_type: Option<LimitType>,
    ) -> SecurityResult<u64>;

    /// Attempt counters and blocks in force at `now`
    async fn attempt_stats(
        &self,
        identifier_hash: &str,
        limit_type: Option<LimitType>,
        now: DateTime<Utc>,
    ) -> SecurityResult<AttemptStats>;

    /// Delete attempts older than `cutoff` and blocks that lifted before it
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> SecurityResult<CleanupReport>;
}

/// `SQLite` store. Timestamps are unix milliseconds.
pub struct SqliteRateLimitStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteRateLimitStore {
    /// Open (or create) a database file
    ///
    /// # Errors
    ///
    /// Returns `Database` if the file cannot be opened or the schema created
    pub async fn open(path: &Path) -> SecurityResult<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SecurityError::Database {
                    operation: "create_directories".to_string(),
                    reason: format!("Failed to create directory {}: {e}", parent.display()),
                })?;
        }
        let connection = Connection::open(path).map_err(|e| SecurityError::Database {
            operation: "open".to_string(),
            reason: format!("Failed to open database {}: {e}", path.display()),
        })?;

        let store = Self::from_connection(connection);
        store.initialize_schema(true).await?;
        info!("Rate limit store opened at {}", path.display());
        Ok(store)
    }

    /// Store that lives only as long as the process
    ///
    /// # Errors
    ///
    /// Returns `Database` if the schema cannot be created
    pub async fn in_memory() -> SecurityResult<Self> {
        let connection = Connection::open_in_memory().map_err(db_error("open_in_memory"))?;
        let store = Self::from_connection(connection);
        store.initialize_schema(false).await?;
        debug!("In-memory rate limit store created");
        Ok(store)
    }

    fn from_connection(connection: Connection) -> Self {
        Self {
            connection: Arc::new(Mutex::new(connection)),
        }
    }

    async fn initialize_schema(&self, wal: bool) -> SecurityResult<()> {
        let connection = self.connection.lock().await;

        if wal {
            let _: String = connection
                .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
                .map_err(db_error("pragma_wal"))?;
        }

        connection
            .execute_batch(
                r"
            CREATE TABLE IF NOT EXISTS rate_limit_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                identifier_hash TEXT NOT NULL,
                limit_type TEXT NOT NULL,
                success INTEGER NOT NULL,
                attempted_at INTEGER NOT NULL,
                ip_address TEXT,
                user_agent TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_rate_limit_attempts_lookup
                ON rate_limit_attempts(identifier_hash, limit_type, attempted_at);
            CREATE TABLE IF NOT EXISTS rate_limit_blocks (
                identifier_hash TEXT NOT NULL,
                limit_type TEXT NOT NULL,
                blocked_at INTEGER NOT NULL,
                blocked_until INTEGER NOT NULL,
                reason TEXT NOT NULL,
                attempt_count INTEGER NOT NULL,
                UNIQUE(identifier_hash, limit_type)
            );
            ",
            )
            .map_err(db_error("create_schema"))?;
        drop(connection);

        debug!("Rate limit schema initialized");
        Ok(())
    }

    fn row_to_attempt(row: &Row<'_>) -> rusqlite::Result<RateLimitAttempt> {
        let limit_type: String = row.get("limit_type")?;
        Ok(RateLimitAttempt {
            identifier_hash: row.get("identifier_hash")?,
            limit_type: parse_limit_type(&limit_type)?,
            success: row.get("success")?,
            attempted_at: from_millis(row.get("attempted_at")?, "attempted_at")?,
            ip_address: row.get("ip_address")?,
            user_agent: row.get("user_agent")?,
        })
    }

    fn row_to_block(row: &Row<'_>) -> rusqlite::Result<RateLimitBlock> {
        let limit_type: String = row.get("limit_type")?;
        Ok(RateLimitBlock {
            identifier_hash: row.get("identifier_hash")?,
            limit_type: parse_limit_type(&limit_type)?,
            blocked_at: from_millis(row.get("blocked_at")?, "blocked_at")?,
            blocked_until: from_millis(row.get("blocked_until")?, "blocked_until")?,
            reason: row.get("reason")?,
            attempt_count: u32::try_from(row.get::<_, i64>("attempt_count")?).unwrap_or(u32::MAX),
        })
    }
}

fn db_error(operation: &'static str) -> impl Fn(rusqlite::Error) -> SecurityError {
    move |e| SecurityError::Database {
        operation: operation.to_string(),
        reason: e.to_string(),
    }
}

fn parse_limit_type(value: &str) -> rusqlite::Result<LimitType> {
    LimitType::parse(value).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(1, "limit_type".to_string(), rusqlite::types::Type::Text)
    })
}

fn from_millis(millis: i64, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(0, column.to_string(), rusqlite::types::Type::Integer)
    })
}

const BLOCK_COLUMNS: &str =
    "identifier_hash, limit_type, blocked_at, blocked_until, reason, attempt_count";

#[async_trait]
impl RateLimitStore for SqliteRateLimitStore {
    async fn active_block(
        &self,
        identifier_hash: &str,
        limit_type: LimitType,
        now: DateTime<Utc>,
    ) -> SecurityResult<Option<RateLimitBlock>> {
        let connection = self.connection.lock().await;
        connection
            .query_row(
                &format!(
                    "SELECT {BLOCK_COLUMNS} FROM rate_limit_blocks
                     WHERE identifier_hash = ?1 AND limit_type = ?2 AND blocked_until > ?3"
                ),
                params![identifier_hash, limit_type.as_str(), now.timestamp_millis()],
                Self::row_to_block,
            )
            .optional()
            .map_err(db_error("select_block"))
    }

    async fn count_recent_failures(
        &self,
        identifier_hash: &str,
        limit_type: LimitType,
        since: DateTime<Utc>,
    ) -> SecurityResult<u32> {
        let connection = self.connection.lock().await;
        // Row ids order attempts that share a millisecond
        let count: i64 = connection
            .query_row(
                "SELECT COUNT(*) FROM rate_limit_attempts
                 WHERE identifier_hash = ?1 AND limit_type = ?2 AND success = 0 AND attempted_at >= ?3
                   AND id > COALESCE((
                       SELECT MAX(id) FROM rate_limit_attempts
                       WHERE identifier_hash = ?1 AND limit_type = ?2 AND success = 1 AND attempted_at >= ?3
                   ), 0)",
                params![identifier_hash, limit_type.as_str(), since.timestamp_millis()],
                |row| row.get(0),
            )
            .map_err(db_error("count_failures"))?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn upsert_block(&self, block: &RateLimitBlock) -> SecurityResult<()> {
        let connection = self.connection.lock().await;
        connection
            .execute(
                &format!("INSERT OR REPLACE INTO rate_limit_blocks ({BLOCK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
                params![
                    block.identifier_hash,
                    block.limit_type.as_str(),
                    block.blocked_at.timestamp_millis(),
                    block.blocked_until.timestamp_millis(),
                    block.reason,
                    i64::from(block.attempt_count),
                ],
            )
            .map_err(db_error("upsert_block"))?;
        Ok(())
    }

    async fn insert_attempt(&self, attempt: &RateLimitAttempt) -> SecurityResult<()> {
        let connection = self.connection.lock().await;
        connection
            .execute(
                "INSERT INTO rate_limit_attempts
                     (identifier_hash, limit_type, success, attempted_at, ip_address, user_agent)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    attempt.identifier_hash,
                    attempt.limit_type.as_str(),
                    attempt.success,
                    attempt.attempted_at.timestamp_millis(),
                    attempt.ip_address,
                    attempt.user_agent,
                ],
            )
            .map_err(db_error("insert_attempt"))?;
        Ok(())
    }

    async fn recent_attempts(
        &self,
        identifier_hash: &str,
        limit_type: LimitType,
        limit: usize,
    ) -> SecurityResult<Vec<RateLimitAttempt>> {
        let connection = self.connection.lock().await;
        let mut statement = connection
            .prepare(
                "SELECT identifier_hash, limit_type, success, attempted_at, ip_address, user_agent
                 FROM rate_limit_attempts
                 WHERE identifier_hash = ?1 AND limit_type = ?2
                 ORDER BY attempted_at DESC, id DESC
                 LIMIT ?3",
            )
            .map_err(db_error("prepare_recent_attempts"))?;
        let attempts = statement
            .query_map(
                params![
                    identifier_hash,
                    limit_type.as_str(),
                    i64::try_from(limit).unwrap_or(i64::MAX)
                ],
                Self::row_to_attempt,
            )
            .map_err(db_error("select_recent_attempts"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_error("read_recent_attempts"))?;
        Ok(attempts)
    }

    async fn delete_blocks(
        &self,
        identifier_hash: &str,
        limit_type: Option<LimitType>,
    ) -> SecurityResult<u64> {
        let connection = self.connection.lock().await;
        let deleted = connection
            .execute(
                "DELETE FROM rate_limit_blocks
                 WHERE identifier_hash = ?1 AND (?2 IS NULL OR limit_type = ?2)",
                params![identifier_hash, limit_type.map(LimitType::as_str)],
            )
            .map_err(db_error("delete_blocks"))?;
        Ok(deleted as u64)
    }

    async fn attempt_stats(
        &self,
        identifier_hash: &str,
        limit_type: Option<LimitType>,
        now: DateTime<Utc>,
    ) -> SecurityResult<AttemptStats> {
        let connection = self.connection.lock().await;
        let limit_type = limit_type.map(LimitType::as_str);

        let (total, successful, last): (i64, i64, Option<i64>) = connection
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(success), 0), MAX(attempted_at)
                 FROM rate_limit_attempts
                 WHERE identifier_hash = ?1 AND (?2 IS NULL OR limit_type = ?2)",
                params![identifier_hash, limit_type],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(db_error("attempt_stats"))?;

        let mut statement = connection
            .prepare(&format!(
                "SELECT {BLOCK_COLUMNS} FROM rate_limit_blocks
                 WHERE identifier_hash = ?1 AND (?2 IS NULL OR limit_type = ?2) AND blocked_until > ?3
                 ORDER BY blocked_until DESC"
            ))
            .map_err(db_error("prepare_active_blocks"))?;
        let active_blocks = statement
            .query_map(
                params![identifier_hash, limit_type, now.timestamp_millis()],
                Self::row_to_block,
            )
            .map_err(db_error("select_active_blocks"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_error("read_active_blocks"))?;

        let total = u64::try_from(total).unwrap_or_default();
        let successful = u64::try_from(successful).unwrap_or_default();
        Ok(AttemptStats {
            total_attempts: total,
            successful_attempts: successful,
            failed_attempts: total.saturating_sub(successful),
            last_attempt_at: last.and_then(DateTime::from_timestamp_millis),
            active_blocks,
        })
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> SecurityResult<CleanupReport> {
        let connection = self.connection.lock().await;
        let cutoff = cutoff.timestamp_millis();
        let attempts_deleted = connection
            .execute(
                "DELETE FROM rate_limit_attempts WHERE attempted_at < ?1",
                params![cutoff],
            )
            .map_err(db_error("purge_attempts"))?;
        let blocks_deleted = connection
            .execute(
                "DELETE FROM rate_limit_blocks WHERE blocked_until < ?1",
                params![cutoff],
            )
            .map_err(db_error("purge_blocks"))?;
        Ok(CleanupReport {
            attempts_deleted: attempts_deleted as u64,
            blocks_deleted: blocks_deleted as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(hash: &str, success: bool, at: DateTime<Utc>) -> RateLimitAttempt {
        RateLimitAttempt {
            identifier_hash: hash.to_string(),
            limit_type: LimitType::Login,
            success,
            attempted_at: at,
            ip_address: None,
            user_agent: None,
        }
    }

    #[tokio::test]
    async fn test_counts_only_failures_in_window() -> SecurityResult<()> {
        let store = SqliteRateLimitStore::in_memory().await?;
        let now = Utc::now();
        store.insert_attempt(&attempt("h", false, now - chrono::Duration::minutes(20))).await?;
        store.insert_attempt(&attempt("h", false, now - chrono::Duration::minutes(2))).await?;
        store.insert_attempt(&attempt("h", true, now - chrono::Duration::minutes(1))).await?;
        store.insert_attempt(&attempt("other", false, now)).await?;

        let since = now - chrono::Duration::minutes(10);
        // The success resets the count
        assert_eq!(store.count_recent_failures("h", LimitType::Login, since).await?, 0);
        store.insert_attempt(&attempt("h", false, now)).await?;
        assert_eq!(store.count_recent_failures("h", LimitType::Login, since).await?, 1);
        assert_eq!(store.count_recent_failures("h", LimitType::Api, since).await?, 0);

        let stats = store.attempt_stats("h", None, now).await?;
        assert_eq!(stats.total_attempts, 4);
        assert_eq!(stats.successful_attempts, 1);
        assert_eq!(stats.failed_attempts, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_block_upsert_replaces() -> SecurityResult<()> {
        let store = SqliteRateLimitStore::in_memory().await?;
        let now = Utc::now();
        let mut block = RateLimitBlock {
            identifier_hash: "h".to_string(),
            limit_type: LimitType::Login,
            blocked_at: now,
            blocked_until: now + chrono::Duration::minutes(15),
            reason: "first".to_string(),
            attempt_count: 5,
        };
        store.upsert_block(&block).await?;
        block.reason = "second".to_string();
        store.upsert_block(&block).await?;

        let active = store.active_block("h", LimitType::Login, now).await?.expect("block");
        assert_eq!(active.reason, "second");
        assert!(store
            .active_block("h", LimitType::Login, now + chrono::Duration::minutes(16))
            .await?
            .is_none());
        assert_eq!(store.delete_blocks("h", None).await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_file_store_persists() -> SecurityResult<()> {
        let dir = tempfile::tempdir().map_err(|e| SecurityError::io("tempdir", &e))?;
        let path = dir.path().join("nested").join("rate_limits.db");
        let now = Utc::now();
        {
            let store = SqliteRateLimitStore::open(&path).await?;
            store.insert_attempt(&attempt("h", false, now)).await?;
        }
        let store = SqliteRateLimitStore::open(&path).await?;
        let since = now - chrono::Duration::minutes(1);
        assert_eq!(store.count_recent_failures("h", LimitType::Login, since).await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_success_in_same_millisecond_resets_count() -> SecurityResult<()> {
        let store = SqliteRateLimitStore::in_memory().await?;
        let now = Utc::now();
        for _ in 0..3 {
            store.insert_attempt(&attempt("h", false, now)).await?;
        }
        store.insert_attempt(&attempt("h", true, now)).await?;
        let since = now - chrono::Duration::minutes(10);
        assert_eq!(store.count_recent_failures("h", LimitType::Login, since).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_attempts_keep_client_details() -> SecurityResult<()> {
        let store = SqliteRateLimitStore::in_memory().await?;
        let now = Utc::now();
        let mut first = attempt("h", false, now - chrono::Duration::seconds(5));
        first.ip_address = Some("203.0.113.7".to_string());
        first.user_agent = Some("Mozilla/5.0".to_string());
        store.insert_attempt(&first).await?;
        store.insert_attempt(&attempt("h", true, now)).await?;

        let attempts = store.recent_attempts("h", LimitType::Login, 10).await?;
        assert_eq!(attempts.len(), 2);
        assert!(attempts[0].success);
        assert_eq!(attempts[0].ip_address, None);
        assert_eq!(attempts[1].ip_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(attempts[1].user_agent.as_deref(), Some("Mozilla/5.0"));

        assert_eq!(store.recent_attempts("h", LimitType::Login, 1).await?.len(), 1);
        assert!(store.recent_attempts("h", LimitType::Api, 10).await?.is_empty());
        Ok(())
    }
}
