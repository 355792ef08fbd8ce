//! Rate limiter tests against the `SQLite` store

#![allow(clippy::unwrap_used)]

use ideaforge_security_core::audit::AuditLogger;
use ideaforge_security_core::config::{AuditConfig, RateLimitingConfig};
use ideaforge_security_core::error::{SecurityError, SecurityResult};
use ideaforge_security_core::rate_limiting::{LimitType, RateLimitDecision, RateLimiter};
use ideaforge_security_core::types::ActorContext;
use std::path::Path;
use tempfile::tempdir;

async fn limiter(dir: &Path) -> SecurityResult<RateLimiter> {
    let audit = AuditLogger::start(&AuditConfig {
        log_dir: dir.join("audit"),
        ..AuditConfig::default()
    })?;
    let config = RateLimitingConfig {
        database_path: Some(dir.join("rate_limits.db")),
        ..RateLimitingConfig::default()
    };
    RateLimiter::open(&config, audit).await
}

#[tokio::test]
async fn test_block_survives_restart() -> SecurityResult<()> {
    let dir = tempdir().unwrap();
    {
        let limiter = limiter(dir.path()).await?;
        for _ in 0..3 {
            limiter
                .record_attempt("new-user@example.com", LimitType::Registration, false, &ActorContext::system())
                .await?;
        }
        assert!(!limiter.check_limit("new-user@example.com", LimitType::Registration).await?.is_allowed());
    }

    let limiter = limiter(dir.path()).await?;
    let decision = limiter.check_limit("new-user@example.com", LimitType::Registration).await?;
    assert!(matches!(
        decision,
        RateLimitDecision::Blocked { remaining_minutes, .. } if remaining_minutes > 0 && remaining_minutes <= 30
    ));
    assert!(matches!(
        decision.into_result(),
        Err(SecurityError::RateLimited { .. })
    ));

    assert_eq!(limiter.unblock_identifier("new-user@example.com", Some(LimitType::Registration)).await?, 1);
    let stats = limiter.get_attempt_stats("new-user@example.com", None).await?;
    assert!(!stats.is_blocked());
    assert_eq!(stats.failed_attempts, 3);
    Ok(())
}

#[tokio::test]
async fn test_identifiers_are_stored_hashed() -> SecurityResult<()> {
    let dir = tempdir().unwrap();
    let limiter = limiter(dir.path()).await?;
    limiter
        .record_attempt("private@example.com", LimitType::Login, false, &ActorContext::system())
        .await?;
    drop(limiter);

    let needle = b"private@example.com";
    for file in ["rate_limits.db", "rate_limits.db-wal"] {
        let raw = std::fs::read(dir.path().join(file)).unwrap_or_default();
        assert!(!raw.windows(needle.len()).any(|window| window == needle));
    }
    Ok(())
}

#[tokio::test]
async fn test_api_policy() -> SecurityResult<()> {
    let dir = tempdir().unwrap();
    let limiter = limiter(dir.path()).await?;
    assert_eq!(limiter.policy(LimitType::Api).max_attempts, 100);

    for _ in 0..99 {
        limiter.record_attempt("203.0.113.9", LimitType::Api, false, &ActorContext::system()).await?;
    }
    assert_eq!(limiter.check_limit("203.0.113.9", LimitType::Api).await?, RateLimitDecision::Allowed);
    limiter.record_attempt("203.0.113.9", LimitType::Api, false, &ActorContext::system()).await?;
    assert!(!limiter.check_limit("203.0.113.9", LimitType::Api).await?.is_allowed());
    Ok(())
}

#[tokio::test]
async fn test_successful_login_clears_block() -> SecurityResult<()> {
    let dir = tempdir().unwrap();
    let limiter = limiter(dir.path()).await?;
    let actor = ActorContext::user("walter").with_ip("192.0.2.10");

    for _ in 0..5 {
        limiter.record_attempt("walter", LimitType::Login, false, &actor).await?;
    }
    assert!(matches!(
        limiter.check_limit("walter", LimitType::Login).await?,
        RateLimitDecision::Blocked { remaining_minutes: 15, .. }
    ));

    limiter.record_attempt("walter", LimitType::Login, true, &actor).await?;
    assert_eq!(
        limiter.check_limit("walter", LimitType::Login).await?,
        RateLimitDecision::Allowed
    );

    let attempts = limiter.recent_attempts("walter", LimitType::Login, 10).await?;
    assert_eq!(attempts.len(), 6);
    assert!(attempts.iter().all(|a| a.ip_address.as_deref() == Some("192.0.2.10")));
    Ok(())
}
