//! Retention sweeps over the durable stores
//!
//! Retired keys, dated audit streams and rate limit history are deleted once
//! they are older than their section's `retention_days`.

use crate::audit::{AuditCategory, AuditLogger, AuditOutcome, AuditRecord, AuditSeverity};
use crate::config::SecurityConfig;
use crate::keys::KeyManager;
use crate::rate_limiting::{CleanupReport, RateLimiter};
use crate::shutdown::ShutdownSignal;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const SOURCE: &str = "retention";

/// Outcome of one retention sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// Retired keys deleted
    pub keys_deleted: usize,
    /// Audit stream files deleted
    pub audit_streams_deleted: usize,
    /// Rate limit rows deleted
    pub rate_limit: CleanupReport,
    /// Steps that failed and why
    pub failures: Vec<String>,
}

/// The stores a sweep works on, with their retention periods
#[derive(Clone)]
pub struct RetentionSweeper {
    keys: Arc<KeyManager>,
    audit: Arc<AuditLogger>,
    rate_limiter: Arc<RateLimiter>,
    key_retention_days: u32,
    audit_retention_days: u32,
    rate_limit_retention_days: u32,
}

impl RetentionSweeper {
    /// Sweeper using the retention periods of `config`
    #[must_use]
    pub fn new(
        config: &SecurityConfig,
        keys: Arc<KeyManager>,
        audit: Arc<AuditLogger>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            keys,
            audit,
            rate_limiter,
            key_retention_days: config.keys.retention_days,
            audit_retention_days: config.audit.retention_days,
            rate_limit_retention_days: config.rate_limiting.retention_days,
        }
    }

    /// Run every cleanup once. A failing step is recorded in the report and
    /// does not stop the others.
    pub async fn sweep(&self) -> RetentionReport {
        let mut report = RetentionReport::default();

        match self.keys.cleanup_old_keys(self.key_retention_days).await {
            Ok(deleted) => report.keys_deleted = deleted,
            Err(e) => report.failures.push(format!("keys: {e}")),
        }
        match self.audit.cleanup_old_streams(self.audit_retention_days).await {
            Ok(deleted) => report.audit_streams_deleted = deleted,
            Err(e) => report.failures.push(format!("audit streams: {e}")),
        }
        match self
            .rate_limiter
            .cleanup_old_records(self.rate_limit_retention_days)
            .await
        {
            Ok(cleanup) => report.rate_limit = cleanup,
            Err(e) => report.failures.push(format!("rate limit records: {e}")),
        }

        for failure in &report.failures {
            warn!("Retention sweep step failed: {}", failure);
        }
        debug!("Retention sweep finished: {:?}", report);

        let outcome = if report.failures.is_empty() {
            AuditOutcome::Success
        } else {
            AuditOutcome::Error
        };
        self.audit.log_event(
            AuditRecord::new(
                AuditCategory::SystemEvents,
                "retention_sweep",
                AuditSeverity::Info,
                SOURCE,
                "Deleted records past retention",
            )
            .detail("keys_deleted", report.keys_deleted)
            .detail("audit_streams_deleted", report.audit_streams_deleted)
            .detail("rate_limit_attempts_deleted", report.rate_limit.attempts_deleted)
            .detail("rate_limit_blocks_deleted", report.rate_limit.blocks_deleted)
            .detail("failed_steps", report.failures.len())
            .outcome(outcome),
        );
        report
    }

    /// Sweep every `interval` until `shutdown` fires, starting one interval
    /// after the call
    #[must_use]
    pub fn spawn(self, interval: Duration, shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!("Retention task started (every {:?})", interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                    () = shutdown.wait() => {
                        info!("Retention task shutting down");
                        break;
                    }
                }
            }
        })
    }
}
