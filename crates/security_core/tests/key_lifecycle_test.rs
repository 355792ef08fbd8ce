//! Key manager tests through the public API

#![allow(clippy::unwrap_used)]

mod common;

use chrono::Utc;
use common::{master_secret, test_config};
use ideaforge_security_core::audit::AuditLogger;
use ideaforge_security_core::error::SecurityResult;
use ideaforge_security_core::keys::{
    KeyAlgorithm, KeyManager, KeyMetadataPatch, KeySpec, KeyStatus, KeyType,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

async fn open(dir: &Path) -> SecurityResult<Arc<KeyManager>> {
    let config = test_config(dir);
    let audit = AuditLogger::start(&config.audit)?;
    KeyManager::open(&config.keys, &master_secret()?, audit).await
}

#[tokio::test]
async fn test_rotation_chain_across_restart() -> SecurityResult<()> {
    let dir = tempdir().unwrap();
    let (first, second, third) = {
        let keys = open(dir.path()).await?;
        let first = keys
            .generate_key(
                KeySpec::new(KeyType::Communication, "Mail Relay")
                    .with_algorithm(KeyAlgorithm::ChaCha20Poly1305, 256)
                    .with_rotation_interval(30),
            )
            .await?;
        let second = keys.rotate_key(&first).await?;
        let third = keys.rotate_key(&second).await?;
        keys.shutdown().await?;
        (first, second, third)
    };

    let keys = open(dir.path()).await?;
    assert_eq!(
        keys.current_key_for_purpose("mail-relay").await,
        Some(third.clone())
    );

    let chain = keys.list_keys(Some(KeyType::Communication), None).await;
    assert_eq!(chain.len(), 3);
    assert_eq!(
        chain.iter().map(|k| k.status).collect::<Vec<_>>(),
        vec![KeyStatus::Archived, KeyStatus::Archived, KeyStatus::Active]
    );
    let newest = keys.get_metadata(&third).await.unwrap();
    assert_eq!(newest.replaces, Some(second.clone()));
    assert_eq!(newest.algorithm, KeyAlgorithm::ChaCha20Poly1305);
    assert_eq!(newest.rotation_interval_days, 30);
    assert_eq!(keys.get_metadata(&first).await.unwrap().replaced_by, Some(second));

    let material = keys.get_key(&third).await?.unwrap();
    assert_eq!(material.as_bytes().len(), 32);
    Ok(())
}

#[tokio::test]
async fn test_revoked_keys_are_cleaned_up() -> SecurityResult<()> {
    let dir = tempdir().unwrap();
    let keys = open(dir.path()).await?;
    let doomed = keys.generate_key(KeySpec::new(KeyType::Backup, "nightly")).await?;
    let kept = keys.generate_key(KeySpec::new(KeyType::Backup, "weekly")).await?;

    assert!(keys.revoke_key(&doomed, "leaked in a support ticket").await?);
    assert_eq!(keys.cleanup_old_keys(0).await?, 1);

    assert!(keys.get_metadata(&doomed).await.is_none());
    assert!(keys.get_metadata(&kept).await.is_some());
    assert!(!dir.path().join("keys").join(format!("{doomed}.meta.json")).exists());
    Ok(())
}

#[tokio::test]
async fn test_metadata_patch_controls_rotation() -> SecurityResult<()> {
    let dir = tempdir().unwrap();
    let keys = open(dir.path()).await?;
    let id = keys.generate_key(KeySpec::new(KeyType::Database, "analytics")).await?;

    // Never rotate
    let never = KeyMetadataPatch::default()
        .rotation_interval_days(0)
        .expires_at(None);
    assert!(keys.update_key_metadata(&id, never).await?);
    assert_eq!(keys.rotate_due_keys().await.due, 0);

    let past = Utc::now() - chrono::Duration::hours(1);
    keys.update_key_metadata(&id, KeyMetadataPatch::default().expires_at(Some(past)))
        .await?;
    let sweep = keys.rotate_due_keys().await;
    assert_eq!(sweep.rotated.len(), 1);
    assert_eq!(sweep.rotated[0].0, id);

    let replacement = keys.get_metadata(&sweep.rotated[0].1).await.unwrap();
    // The replacement inherits "never rotate"
    assert_eq!(replacement.rotation_interval_days, 0);
    assert!(replacement.expires_at.is_none());
    Ok(())
}
