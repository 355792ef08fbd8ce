//! # Rate limiting
//!
//! Sliding-window brute-force protection for login, registration, password
//! reset and generic API traffic. Identifiers (user names, e-mail addresses,
//! IP addresses) are hashed with SHA-256 before they touch the store.
//!
//! ## Algorithm
//!
//! 1. A block still in force denies the request.
//! 2. Otherwise failed attempts inside the policy window that came after the
//!    most recent success are counted. Reaching the policy maximum creates
//!    (or replaces) a block and denies.
//! 3. Otherwise the request is allowed.
//!
//! A successful attempt lifts the block and resets the count. The failure
//! rows stay in the store for statistics until cleanup removes them.

mod store;

pub use store::{RateLimitStore, SqliteRateLimitStore};

use crate::audit::{AuditCategory, AuditLogger, AuditOutcome, AuditRecord, AuditSeverity};
use crate::config::RateLimitingConfig;
use crate::encryption::utils;
use crate::error::{SecurityError, SecurityResult};
use crate::types::ActorContext;
use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const SOURCE: &str = "rate_limiter";

/// Kind of traffic a policy applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    /// Login attempts
    Login,
    /// Account registrations
    Registration,
    /// Password reset requests
    PasswordReset,
    /// Generic API calls
    Api,
}

impl LimitType {
    /// Every limit type
    pub const ALL: [Self; 4] = [Self::Login, Self::Registration, Self::PasswordReset, Self::Api];

    /// Stable storage name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Registration => "registration",
            Self::PasswordReset => "password_reset",
            Self::Api => "api",
        }
    }

    /// Inverse of [`as_str`](Self::as_str)
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }
}

impl fmt::Display for LimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limits for one [`LimitType`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct RateLimitPolicy {
    /// Failed attempts tolerated inside the window
    #[garde(range(min = 1, max = 100_000))]
    pub max_attempts: u32,
    /// Sliding window length in minutes
    #[garde(range(min = 1, max = 10_080))]
    pub window_minutes: u32,
    /// Block duration in minutes
    #[garde(range(min = 1, max = 43_200))]
    pub block_minutes: u32,
}

impl RateLimitPolicy {
    /// Policy from its three limits
    #[must_use]
    pub const fn new(max_attempts: u32, window_minutes: u32, block_minutes: u32) -> Self {
        Self {
            max_attempts,
            window_minutes,
            block_minutes,
        }
    }

    fn window(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.window_minutes))
    }

    fn block_duration(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.block_minutes))
    }
}

/// What to do when the store cannot answer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Allow the request and raise an alert
    #[default]
    FailOpen,
    /// Propagate the store error to the caller
    FailClosed,
}

/// One recorded attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitAttempt {
    /// SHA-256 of the identifier
    pub identifier_hash: String,
    /// Traffic kind
    pub limit_type: LimitType,
    /// Whether the attempt succeeded
    pub success: bool,
    /// When it happened
    pub attempted_at: DateTime<Utc>,
    /// Client IP address, when known
    pub ip_address: Option<String>,
    /// Client user agent, when known
    pub user_agent: Option<String>,
}

/// A block on an identifier for one limit type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitBlock {
    /// SHA-256 of the identifier
    pub identifier_hash: String,
    /// Traffic kind
    pub limit_type: LimitType,
    /// Block start
    pub blocked_at: DateTime<Utc>,
    /// Block end
    pub blocked_until: DateTime<Utc>,
    /// Human readable reason
    pub reason: String,
    /// Failures counted when the block was created
    pub attempt_count: u32,
}

/// Attempt history of an identifier
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptStats {
    /// Retained attempts
    pub total_attempts: u64,
    /// Retained successful attempts
    pub successful_attempts: u64,
    /// Retained failed attempts
    pub failed_attempts: u64,
    /// Most recent attempt
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Blocks currently in force, latest expiry first
    pub active_blocks: Vec<RateLimitBlock>,
}

impl AttemptStats {
    /// Whether any block is in force
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        !self.active_blocks.is_empty()
    }
}

/// Rows removed by [`RateLimiter::cleanup_old_records`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Attempt rows deleted
    pub attempts_deleted: u64,
    /// Lifted blocks deleted
    pub blocks_deleted: u64,
}

/// Outcome of [`RateLimiter::check_limit`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Under the limit
    Allowed,
    /// Denied until the block lifts
    Blocked {
        /// Human readable reason
        reason: String,
        /// Whole minutes until the block lifts, at least 1
        remaining_minutes: i64,
    },
    /// Allowed because the store failed and the policy is fail-open
    AllowedFailOpen {
        /// Store error
        error: String,
    },
}

impl RateLimitDecision {
    /// Whether the request may proceed
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        !matches!(self, Self::Blocked { .. })
    }

    /// `Err(RateLimited)` for blocked decisions
    ///
    /// # Errors
    ///
    /// Returns `RateLimited` if the decision is `Blocked`
    pub fn into_result(self) -> SecurityResult<()> {
        match self {
            Self::Blocked {
                remaining_minutes, ..
            } => Err(SecurityError::RateLimited { remaining_minutes }),
            Self::Allowed | Self::AllowedFailOpen { .. } => Ok(()),
        }
    }
}

/// Brute-force protection over a [`RateLimitStore`]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    config: RateLimitingConfig,
    fail_open_count: AtomicU64,
    audit: Arc<AuditLogger>,
}

impl RateLimiter {
    /// Limiter over the configured `SQLite` store (in memory without a path)
    ///
    /// # Errors
    ///
    /// Returns `Database` if the store cannot be opened
    pub async fn open(config: &RateLimitingConfig, audit: Arc<AuditLogger>) -> SecurityResult<Self> {
        let store: Arc<dyn RateLimitStore> = match &config.database_path {
            Some(path) => Arc::new(SqliteRateLimitStore::open(path).await?),
            None => Arc::new(SqliteRateLimitStore::in_memory().await?),
        };
        Ok(Self::with_store(config, store, audit))
    }

    /// Limiter over any store
    #[must_use]
    pub fn with_store(
        config: &RateLimitingConfig,
        store: Arc<dyn RateLimitStore>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        info!("Rate limiter ready ({:?} on store failure)", config.failure_policy);
        Self {
            store,
            config: config.clone(),
            fail_open_count: AtomicU64::new(0),
            audit,
        }
    }

    /// Policy applied to a limit type
    #[must_use]
    pub const fn policy(&self, limit_type: LimitType) -> &RateLimitPolicy {
        self.config.policy(limit_type)
    }

    /// Decide whether `identifier` may make another `limit_type` attempt
    ///
    /// # Errors
    ///
    /// Returns the store error only under [`StoreFailurePolicy::FailClosed`]
    pub async fn check_limit(
        &self,
        identifier: &str,
        limit_type: LimitType,
    ) -> SecurityResult<RateLimitDecision> {
        self.check_limit_at(identifier, limit_type, Utc::now()).await
    }

    async fn check_limit_at(
        &self,
        identifier: &str,
        limit_type: LimitType,
        now: DateTime<Utc>,
    ) -> SecurityResult<RateLimitDecision> {
        let identifier_hash = hash_identifier(identifier);
        match self.evaluate(&identifier_hash, limit_type, now).await {
            Ok(decision) => Ok(decision),
            Err(e) => match self.config.failure_policy {
                // Locking every user out because the store is down is the worse
                // outcome for this platform; the alert makes the gap visible.
                StoreFailurePolicy::FailOpen => {
                    self.fail_open_count.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Rate limit store failed during {} check, failing open: {}",
                        limit_type, e
                    );
                    self.audit.log_event(
                        AuditRecord::new(
                            AuditCategory::SecurityEvents,
                            "rate_limit_fail_open",
                            AuditSeverity::Warning,
                            SOURCE,
                            "Rate limit store unavailable, request allowed",
                        )
                        .detail("limit_type", limit_type.as_str())
                        .detail("error", e.to_string())
                        .outcome(AuditOutcome::Error),
                    );
                    Ok(RateLimitDecision::AllowedFailOpen {
                        error: e.to_string(),
                    })
                }
                StoreFailurePolicy::FailClosed => {
                    error!("Rate limit store failed during {} check: {}", limit_type, e);
                    Err(e)
                }
            },
        }
    }

    async fn evaluate(
        &self,
        identifier_hash: &str,
        limit_type: LimitType,
        now: DateTime<Utc>,
    ) -> SecurityResult<RateLimitDecision> {
        if let Some(block) = self.store.active_block(identifier_hash, limit_type, now).await? {
            return Ok(RateLimitDecision::Blocked {
                reason: block.reason,
                remaining_minutes: remaining_minutes(block.blocked_until, now),
            });
        }

        let policy = *self.policy(limit_type);
        let failures = self
            .store
            .count_recent_failures(identifier_hash, limit_type, now - policy.window())
            .await?;
        if failures < policy.max_attempts {
            return Ok(RateLimitDecision::Allowed);
        }

        let block = RateLimitBlock {
            identifier_hash: identifier_hash.to_string(),
            limit_type,
            blocked_at: now,
            blocked_until: now + policy.block_duration(),
            reason: format!(
                "Too many failed {} attempts ({} in {} minutes)",
                limit_type.as_str().replace('_', " "),
                failures,
                policy.window_minutes
            ),
            attempt_count: failures,
        };
        self.store.upsert_block(&block).await?;

        warn!(
            "Blocked identifier {} for {} ({} minutes)",
            short(identifier_hash),
            limit_type,
            policy.block_minutes
        );
        self.audit.log_event(
            AuditRecord::new(
                AuditCategory::SecurityEvents,
                "rate_limit_block",
                AuditSeverity::Warning,
                SOURCE,
                "Identifier blocked after repeated failures",
            )
            .detail("identifier_hash", identifier_hash)
            .detail("limit_type", limit_type.as_str())
            .detail("failed_attempts", failures)
            .detail("block_minutes", policy.block_minutes)
            .outcome(AuditOutcome::Failure),
        );

        Ok(RateLimitDecision::Blocked {
            reason: block.reason,
            remaining_minutes: i64::from(policy.block_minutes),
        })
    }

    /// Record an attempt. A success lifts the identifier's block for this
    /// limit type.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the store fails
    pub async fn record_attempt(
        &self,
        identifier: &str,
        limit_type: LimitType,
        success: bool,
        actor: &ActorContext,
    ) -> SecurityResult<()> {
        self.record_attempt_at(identifier, limit_type, success, actor, Utc::now())
            .await
    }

    async fn record_attempt_at(
        &self,
        identifier: &str,
        limit_type: LimitType,
        success: bool,
        actor: &ActorContext,
        now: DateTime<Utc>,
    ) -> SecurityResult<()> {
        let identifier_hash = hash_identifier(identifier);
        self.store
            .insert_attempt(&RateLimitAttempt {
                identifier_hash: identifier_hash.clone(),
                limit_type,
                success,
                attempted_at: now,
                ip_address: actor.ip_address.clone(),
                user_agent: actor.user_agent.clone(),
            })
            .await?;

        if success {
            let lifted = self
                .store
                .delete_blocks(&identifier_hash, Some(limit_type))
                .await?;
            if lifted > 0 {
                info!("Block on {} for {} lifted by a successful attempt", short(&identifier_hash), limit_type);
                self.audit.log_event(
                    AuditRecord::new(
                        AuditCategory::SecurityEvents,
                        "rate_limit_block_lifted",
                        AuditSeverity::Info,
                        SOURCE,
                        "Block lifted by a successful attempt",
                    )
                    .actor(actor)
                    .detail("identifier_hash", identifier_hash.as_str())
                    .detail("limit_type", limit_type.as_str()),
                );
            }
        } else {
            debug!("Failed {} attempt by {}", limit_type, short(&identifier_hash));
        }
        Ok(())
    }

    /// Remove blocks on an identifier (every limit type when `None`).
    /// Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the store fails
    pub async fn unblock_identifier(
        &self,
        identifier: &str,
        limit_type: Option<LimitType>,
    ) -> SecurityResult<u64> {
        let identifier_hash = hash_identifier(identifier);
        let removed = self.store.delete_blocks(&identifier_hash, limit_type).await?;

        info!("Unblocked {} ({} blocks removed)", short(&identifier_hash), removed);
        self.audit.log_event(
            AuditRecord::new(
                AuditCategory::SecurityEvents,
                "rate_limit_unblocked",
                AuditSeverity::Info,
                SOURCE,
                "Identifier unblocked by an administrator",
            )
            .detail("identifier_hash", identifier_hash.as_str())
            .detail("limit_type", limit_type.map(LimitType::as_str))
            .detail("blocks_removed", removed),
        );
        Ok(removed)
    }

    /// Attempt history and blocks in force for an identifier
    ///
    /// # Errors
    ///
    /// Returns `Database` if the store fails
    pub async fn get_attempt_stats(
        &self,
        identifier: &str,
        limit_type: Option<LimitType>,
    ) -> SecurityResult<AttemptStats> {
        self.store
            .attempt_stats(&hash_identifier(identifier), limit_type, Utc::now())
            .await
    }

    /// Most recent `limit` attempts of an identifier for one limit type,
    /// newest first
    ///
    /// # Errors
    ///
    /// Returns `Database` if the store fails
    pub async fn recent_attempts(
        &self,
        identifier: &str,
        limit_type: LimitType,
        limit: usize,
    ) -> SecurityResult<Vec<RateLimitAttempt>> {
        self.store
            .recent_attempts(&hash_identifier(identifier), limit_type, limit)
            .await
    }

    /// Delete attempts older than `days_to_keep` days and blocks that lifted
    /// before then
    ///
    /// # Errors
    ///
    /// Returns `Database` if the store fails
    pub async fn cleanup_old_records(&self, days_to_keep: u32) -> SecurityResult<CleanupReport> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days_to_keep));
        let report = self.store.purge_before(cutoff).await?;
        if report != CleanupReport::default() {
            info!(
                "Rate limit cleanup removed {} attempts and {} blocks",
                report.attempts_deleted, report.blocks_deleted
            );
        }
        Ok(report)
    }

    /// Number of checks answered fail-open since startup
    #[must_use]
    pub fn fail_open_count(&self) -> u64 {
        self.fail_open_count.load(Ordering::Relaxed)
    }
}

fn hash_identifier(identifier: &str) -> String {
    utils::sha256_hex(identifier.as_bytes())
}

fn short(identifier_hash: &str) -> &str {
    identifier_hash.get(..12).unwrap_or(identifier_hash)
}

fn remaining_minutes(until: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let seconds = (until - now).num_seconds().max(0);
    ((seconds + 59) / 60).max(1)
}
