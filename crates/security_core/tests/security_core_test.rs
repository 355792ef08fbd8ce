//! End-to-end tests of the assembled security core

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

mod common;

use chrono::Utc;
use common::{master_secret, read_lines, test_config};
use ideaforge_security_core::audit::stream_file_name;
use ideaforge_security_core::config::MasterSecret;
use ideaforge_security_core::error::{SecurityError, SecurityResult};
use ideaforge_security_core::keys::{KeySpec, KeyStatus, KeyType};
use ideaforge_security_core::rate_limiting::{LimitType, RateLimitDecision};
use ideaforge_security_core::types::ActorContext;
use ideaforge_security_core::{SecurityCore, AUDIT_SEALING_PURPOSE};
use serde_json::json;
use tempfile::tempdir;

#[tokio::test]
async fn test_start_and_shutdown() -> SecurityResult<()> {
    let dir = tempdir().unwrap();
    let core = SecurityCore::start(test_config(dir.path()), master_secret()?).await?;

    assert!(core.audit().detail_sealing_enabled());
    assert!(core.keys().current_key_for_purpose(AUDIT_SEALING_PURPOSE).await.is_some());

    let audit = core.audit();
    let master_stream = audit.master_stream_path(Utc::now().date_naive());
    core.shutdown().await?;

    assert!(audit.is_shut_down());
    let lines = read_lines(&master_stream);
    assert!(lines.iter().any(|line| line.contains("security_core_started")));
    assert!(lines.last().unwrap().contains("security_core_stopped"));
    Ok(())
}

#[tokio::test]
async fn test_key_survives_restart() -> SecurityResult<()> {
    let dir = tempdir().unwrap();

    let (key_id, payload) = {
        let core = SecurityCore::start(test_config(dir.path()), master_secret()?).await?;
        let keys = core.keys();
        let key_id = keys.generate_key(KeySpec::new(KeyType::Database, "database")).await?;
        let material = keys.get_key(&key_id).await?.expect("fresh key");
        let payload = core.crypto().encrypt_with_key(b"hello", material.as_bytes(), "database")?;
        core.shutdown().await?;
        (key_id, payload)
    };

    let core = SecurityCore::start(test_config(dir.path()), master_secret()?).await?;
    let keys = core.keys();
    assert_eq!(keys.current_key_for_purpose("database").await, Some(key_id.clone()));
    let material = keys.get_key(&key_id).await?.expect("key after restart");
    let plaintext = core
        .crypto()
        .decrypt_with_key(&payload, material.as_bytes(), "database")?;
    assert_eq!(plaintext.as_slice(), b"hello");

    // The audit sealing key is reused, not regenerated
    assert_eq!(keys.list_keys(Some(KeyType::Symmetric), None).await.len(), 1);
    core.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_wrong_master_secret_refuses_to_start() -> SecurityResult<()> {
    let dir = tempdir().unwrap();
    let core = SecurityCore::start(test_config(dir.path()), master_secret()?).await?;
    core.shutdown().await?;

    let result = SecurityCore::start(
        test_config(dir.path()),
        MasterSecret::new("not the password we started with")?,
    )
    .await;
    assert!(matches!(result, Err(SecurityError::MasterKeyMismatch)));

    // The failed start still leaves an audit trail
    let security_stream = dir
        .path()
        .join("audit")
        .join(format!("security_{}.log", Utc::now().format("%Y%m%d")));
    assert!(read_lines(&security_stream)
        .iter()
        .any(|line| line.contains("master_key_mismatch")));
    Ok(())
}

#[tokio::test]
async fn test_invalid_config_is_rejected() -> SecurityResult<()> {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.sessions.max_concurrent = 0;
    assert!(matches!(
        SecurityCore::start(config, master_secret()?).await,
        Err(SecurityError::Configuration { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_sensitive_details_are_sealed() -> SecurityResult<()> {
    let dir = tempdir().unwrap();
    let core = SecurityCore::start(test_config(dir.path()), master_secret()?).await?;
    let audit = core.audit();

    let mut details = std::collections::BTreeMap::new();
    details.insert("password".to_string(), json!("hunter2hunter2"));
    details.insert("attempt".to_string(), json!(3));
    audit.log_security_event(
        "suspicious_login",
        ideaforge_security_core::audit::AuditSeverity::Warning,
        "Password sprayed",
        &ActorContext::user("victim"),
        details,
    );
    audit.flush().await?;

    let lines = read_lines(&audit.security_stream_path(Utc::now().date_naive()));
    let line = lines
        .iter()
        .find(|line| line.contains("suspicious_login"))
        .expect("security event written");
    assert!(!line.contains("hunter2hunter2"));

    let event: serde_json::Value = serde_json::from_str(line).unwrap();
    let opened = audit.open_sealed_detail(&event["details"]["password"])?;
    assert_eq!(opened, json!("hunter2hunter2"));
    assert_eq!(event["details"]["attempt"], json!(3));

    core.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_components_work_together() -> SecurityResult<()> {
    let dir = tempdir().unwrap();
    let core = SecurityCore::start(test_config(dir.path()), master_secret()?).await?;
    let actor = ActorContext::user("ada").with_ip("192.0.2.1");

    let limiter = core.rate_limiter();
    assert_eq!(
        limiter.check_limit("ada", LimitType::Login).await?,
        RateLimitDecision::Allowed
    );
    limiter.record_attempt("ada", LimitType::Login, true, &actor).await?;

    let sessions = core.sessions();
    let session_id = sessions.create_session(Some("ada"), &actor, Some(&json!({"role": "owner"})))?;
    assert_eq!(sessions.get_session_data(&session_id)?, Some(json!({"role": "owner"})));

    let rotated = {
        let keys = core.keys();
        let old = keys.generate_key(KeySpec::new(KeyType::File, "attachments")).await?;
        let new = keys.rotate_key(&old).await?;
        assert_eq!(keys.get_metadata(&old).await.unwrap().status, KeyStatus::Archived);
        new
    };
    assert!(core.keys().get_key(&rotated).await?.is_some());

    core.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_retention_task_removes_expired_audit_streams() -> SecurityResult<()> {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.maintenance.retention_sweep_interval_secs = 1;

    std::fs::create_dir_all(&config.audit.log_dir).unwrap();
    let stale = config.audit.log_dir.join("audit_20200101.log");
    std::fs::write(&stale, "{}\n").unwrap();

    let core = SecurityCore::start(config, master_secret()?).await?;

    let mut removed = false;
    for _ in 0..50 {
        if !stale.exists() {
            removed = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    assert!(removed, "expired audit stream should be swept");

    let audit = core.audit();
    let master_stream = audit.master_stream_path(Utc::now().date_naive());
    core.shutdown().await?;
    assert!(read_lines(&master_stream)
        .iter()
        .any(|line| line.contains("retention_sweep")));
    Ok(())
}

#[tokio::test]
async fn test_retention_sweep_on_demand() -> SecurityResult<()> {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let audit_dir = config.audit.log_dir.clone();
    let retention_days = config.audit.retention_days;
    let core = SecurityCore::start(config, master_secret()?).await?;

    let expired = Utc::now().date_naive() - chrono::Duration::days(i64::from(retention_days) + 1);
    let stale = audit_dir.join(stream_file_name("security", expired));
    std::fs::write(&stale, "{}\n").unwrap();

    let report = core.run_retention_sweep().await;
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert_eq!(report.audit_streams_deleted, 1);
    assert_eq!(report.keys_deleted, 0);
    assert!(!stale.exists());

    // Today's streams are kept
    let audit = core.audit();
    audit.flush().await?;
    assert!(audit.master_stream_path(Utc::now().date_naive()).exists());
    core.shutdown().await?;
    Ok(())
}
