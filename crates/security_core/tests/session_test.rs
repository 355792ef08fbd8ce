//! Session manager tests

#![allow(clippy::unwrap_used)]

use ideaforge_security_core::audit::{AuditLevel, AuditLogger};
use ideaforge_security_core::config::{AuditConfig, CryptoConfig, SessionConfig};
use ideaforge_security_core::crypto::CryptoManager;
use ideaforge_security_core::error::{SecurityError, SecurityResult};
use ideaforge_security_core::session::{SecurityFlags, SessionManager, SessionStatus};
use ideaforge_security_core::shutdown::ShutdownSignal;
use ideaforge_security_core::types::ActorContext;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn sessions(dir: &Path, config: SessionConfig) -> SecurityResult<Arc<SessionManager>> {
    let audit = AuditLogger::start(&AuditConfig {
        log_dir: dir.to_path_buf(),
        ..AuditConfig::default()
    })?;
    let crypto = Arc::new(CryptoManager::new(&CryptoConfig::default(), Arc::clone(&audit)));
    Ok(Arc::new(SessionManager::new(&config, crypto, audit)))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creation_respects_cap() -> SecurityResult<()> {
    let dir = tempdir().unwrap();
    let max = 5;
    let manager = sessions(
        dir.path(),
        SessionConfig {
            max_concurrent: max,
            ..SessionConfig::default()
        },
    )?;

    let barrier = Arc::new(tokio::sync::Barrier::new(max + 1));
    let mut attempts = Vec::new();
    for _ in 0..=max {
        let manager = Arc::clone(&manager);
        let barrier = Arc::clone(&barrier);
        attempts.push(tokio::spawn(async move {
            barrier.wait().await;
            manager.create_session(Some("racer"), &ActorContext::user("racer"), None)
        }));
    }

    let mut created = 0;
    let mut rejected = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(_) => created += 1,
            Err(SecurityError::TooManySessions { .. }) => rejected += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(created, max);
    assert_eq!(rejected, 1);
    assert_eq!(manager.list_active(Some("racer")).len(), max);
    Ok(())
}

#[tokio::test]
async fn test_session_lifecycle() -> SecurityResult<()> {
    let dir = tempdir().unwrap();
    let manager = sessions(dir.path(), SessionConfig::default())?;
    let actor = ActorContext::user("quinn")
        .with_ip("203.0.113.5")
        .with_user_agent("Mozilla/5.0");

    let id = manager.create_session(Some("quinn"), &actor, Some(&json!({"theme": "dark"})))?;
    let info = manager
        .validate_session(&id, Some("203.0.113.5"), Some("Mozilla/5.0"))
        .unwrap();
    assert!(info.has_payload);
    assert!(info.flags.is_empty());

    let info = manager
        .validate_session(&id, Some("198.51.100.77"), Some("Mozilla/5.0"))
        .unwrap();
    assert!(info.flags.contains(SecurityFlags::MULTIPLE_IPS));

    assert_eq!(manager.get_session_data(&id)?, Some(json!({"theme": "dark"})));
    assert!(manager.terminate_session(&id, "logout"));
    assert!(manager.validate_session(&id, None, None).is_none());

    let ended = manager.get_session(&id).unwrap();
    assert_eq!(ended.status, SessionStatus::Terminated);
    assert_eq!(ended.end_reason.as_deref(), Some("logout"));
    assert!(!ended.has_payload);
    Ok(())
}

#[tokio::test]
async fn test_cleanup_task_stops_on_shutdown() -> SecurityResult<()> {
    let dir = tempdir().unwrap();
    let manager = sessions(
        dir.path(),
        SessionConfig {
            cleanup_interval_secs: 1,
            ..SessionConfig::default()
        },
    )?;
    let shutdown = ShutdownSignal::new();
    let task = manager.spawn_cleanup_task(shutdown.clone());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("cleanup task stops promptly")
        .unwrap();
    Ok(())
}

#[tokio::test]
async fn test_session_ids_never_reach_the_audit_trail() -> SecurityResult<()> {
    let dir = tempdir().unwrap();
    let audit = AuditLogger::start(&AuditConfig {
        log_dir: dir.path().to_path_buf(),
        level: AuditLevel::Comprehensive,
        ..AuditConfig::default()
    })?;
    let crypto = Arc::new(CryptoManager::new(&CryptoConfig::default(), Arc::clone(&audit)));
    let manager = SessionManager::new(&SessionConfig::default(), crypto, Arc::clone(&audit));

    let actor = ActorContext::user("zoe").with_ip("10.1.1.1");
    let id = manager.create_session(Some("zoe"), &actor, Some(&json!({"theme": "dark"})))?;
    assert!(manager.validate_session(&id, Some("10.9.9.9"), None).is_some());
    assert_eq!(manager.get_session_data(&id)?, Some(json!({"theme": "dark"})));
    assert!(manager.update_session_data(&id, &json!({"theme": "light"}))?);
    assert!(manager.terminate_session(&id, "logout"));
    audit.flush().await?;

    let mut scanned = 0;
    for entry in std::fs::read_dir(dir.path()).unwrap() {
        let path = entry.unwrap().path();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains(&id), "session id leaked into {}", path.display());
        scanned += 1;
    }
    assert!(scanned > 0);
    Ok(())
}
