//! Audit trail tests

#![allow(clippy::unwrap_used)]

mod common;

use chrono::Utc;
use common::read_lines;
use ideaforge_security_core::audit::{
    AuditCategory, AuditLevel, AuditLogger, AuditRecord, AuditSeverity, DataClassification,
};
use ideaforge_security_core::config::AuditConfig;
use ideaforge_security_core::error::SecurityResult;
use ideaforge_security_core::types::ActorContext;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn logger(dir: &Path, level: AuditLevel) -> SecurityResult<Arc<AuditLogger>> {
    AuditLogger::start(&AuditConfig {
        log_dir: dir.to_path_buf(),
        level,
        ..AuditConfig::default()
    })
}

#[tokio::test]
async fn test_events_are_written_in_order() -> SecurityResult<()> {
    let dir = tempdir().unwrap();
    let audit = logger(dir.path(), AuditLevel::Standard)?;
    let actor = ActorContext::user("lin").with_ip("198.51.100.7");

    let mut ids = Vec::new();
    for i in 0..50 {
        ids.push(audit.log_event(
            AuditRecord::new(
                AuditCategory::DataAccess,
                "idea_viewed",
                AuditSeverity::Info,
                "ideas",
                format!("Viewed idea {i}"),
            )
            .actor(&actor)
            .detail("index", i),
        ));
    }
    audit.shutdown().await?;

    let today = Utc::now().date_naive();
    let written: Vec<String> = read_lines(&audit.category_stream_path(AuditCategory::DataAccess, today))
        .iter()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap()["event_id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(written, ids);
    assert_eq!(read_lines(&audit.master_stream_path(today)).len(), 50);
    assert_eq!(audit.stats().total_events, 50);
    Ok(())
}

#[tokio::test]
async fn test_stream_tampering_is_detected() -> SecurityResult<()> {
    let dir = tempdir().unwrap();
    let audit = logger(dir.path(), AuditLevel::Standard)?;
    let actor = ActorContext::user("mo");

    audit.log_authentication("login", &actor, true, "password");
    audit.log_authentication("login", &actor, false, "password");
    audit.log_authentication("logout", &actor, true, "session");
    audit.flush().await?;

    let path = audit.category_stream_path(AuditCategory::Authentication, Utc::now().date_naive());
    let report = AuditLogger::verify_stream(&path).await?;
    assert_eq!(report.total, 3);
    assert!(report.is_intact());

    let lines = read_lines(&path);
    let forged = lines[1].replace("\"FAILURE\"", "\"SUCCESS\"");
    assert_ne!(forged, lines[1]);
    assert!(!AuditLogger::verify_event_integrity(&forged));
    std::fs::write(&path, format!("{}\n{}\n{}\n", lines[0], forged, lines[2])).unwrap();

    let report = AuditLogger::verify_stream(&path).await?;
    assert_eq!(report.valid, 2);
    assert_eq!(report.tampered_lines, vec![2]);
    audit.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_level_filtering() -> SecurityResult<()> {
    let dir = tempdir().unwrap();
    let audit = logger(dir.path(), AuditLevel::Minimal)?;

    assert!(audit.log_api_call("GET", "/ideas", 200, Duration::from_millis(12), &ActorContext::system()).is_empty());
    assert!(!audit
        .log_event(AuditRecord::new(
            AuditCategory::SystemEvents,
            "disk_failure",
            AuditSeverity::Error,
            "storage",
            "Disk failed",
        ))
        .is_empty());
    // Security warnings bypass the level
    assert!(!audit
        .log_event(AuditRecord::new(
            AuditCategory::SecurityEvents,
            "port_scan",
            AuditSeverity::Warning,
            "network",
            "Port scan detected",
        ))
        .is_empty());

    audit.flush().await?;
    let stats = audit.stats();
    assert_eq!(stats.total_events, 2);
    assert_eq!(stats.suppressed, 1);
    audit.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_data_access_classification_is_recorded() -> SecurityResult<()> {
    let dir = tempdir().unwrap();
    let audit = logger(dir.path(), AuditLevel::Detailed)?;

    audit.log_data_access(
        "business_plan/42",
        "export",
        &ActorContext::user("nora"),
        DataClassification::Confidential,
    );
    audit.shutdown().await?;

    let lines = read_lines(&audit.category_stream_path(AuditCategory::DataAccess, Utc::now().date_naive()));
    assert_eq!(lines.len(), 1);
    let event: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(event["data_classification"], "CONFIDENTIAL");
    assert_eq!(event["user_id"], "nora");
    assert!(AuditLogger::verify_event_integrity(&lines[0]));
    Ok(())
}

#[tokio::test]
async fn test_no_event_loss_on_shutdown() -> SecurityResult<()> {
    let dir = tempdir().unwrap();
    let audit = logger(dir.path(), AuditLevel::Standard)?;

    let mut producers = Vec::new();
    for worker in 0..4 {
        let audit = Arc::clone(&audit);
        producers.push(tokio::spawn(async move {
            for i in 0..100 {
                audit.log_event(AuditRecord::new(
                    AuditCategory::UserManagement,
                    "profile_updated",
                    AuditSeverity::Info,
                    "users",
                    format!("worker {worker} update {i}"),
                ));
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }
    audit.shutdown().await?;

    assert_eq!(audit.stats().total_events, 400);
    let lines = read_lines(&audit.master_stream_path(Utc::now().date_naive()));
    assert_eq!(lines.len(), 400);

    // Nothing is accepted once shut down
    assert!(audit
        .log_event(AuditRecord::new(
            AuditCategory::UserManagement,
            "late",
            AuditSeverity::Critical,
            "users",
            "Too late",
        ))
        .is_empty());
    Ok(())
}
