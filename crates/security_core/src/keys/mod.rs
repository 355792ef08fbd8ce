//! # Key management
//!
//! Durable lifecycle of named keys: generation, storage sealed under the
//! master key, lazy expiry, rotation, revocation and cleanup.
//!
//! ## Rotation protocol
//!
//! 1. The replacement key is persisted as ACTIVE with `replaces = old`.
//! 2. The purpose pointer in `current_keys.json` is flipped to the new key.
//! 3. The old key is archived with `replaced_by = new`.
//!
//! The pointer is the single authority on which key serves a purpose. When
//! the manager opens a key directory after a crash it finishes rotations whose
//! pointer was already flipped and revokes the orphaned replacement of those
//! whose pointer was not, so a rotation chain never ends up with two ACTIVE
//! keys.

mod master;
mod store;
pub mod types;

pub use types::{
    KeyAlgorithm, KeyId, KeyMaterial, KeyMetadata, KeyMetadataPatch, KeySpec, KeyStatus,
    KeyType, RotationSweep,
};

use crate::audit::{AuditCategory, AuditLogger, AuditOutcome, AuditRecord, AuditSeverity};
use crate::config::{KeyConfig, MasterSecret};
use crate::encryption::{self, utils};
use crate::error::{SecurityError, SecurityResult};
use crate::shutdown::ShutdownSignal;
use crate::types::EncryptionAlgorithm;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use master::MasterKeyOrigin;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use store::KeyStore;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use types::sanitize_purpose;
use zeroize::Zeroizing;

const SOURCE: &str = "key_manager";

/// Parameters shared by a key and its rotation successors
struct NewKey {
    key_type: KeyType,
    purpose: String,
    algorithm: KeyAlgorithm,
    key_size_bits: u32,
    rotation_interval_days: u32,
}

impl NewKey {
    fn like(metadata: &KeyMetadata) -> Self {
        Self {
            key_type: metadata.key_type,
            purpose: metadata.purpose.clone(),
            algorithm: metadata.algorithm,
            key_size_bits: metadata.key_size_bits,
            rotation_interval_days: metadata.rotation_interval_days,
        }
    }
}

/// Marks a key as rotating for as long as it lives
struct RotationGuard<'a> {
    rotating: &'a Mutex<HashSet<KeyId>>,
    key_id: KeyId,
}

impl<'a> RotationGuard<'a> {
    fn acquire(rotating: &'a Mutex<HashSet<KeyId>>, key_id: &KeyId) -> SecurityResult<Self> {
        if !rotating.lock().insert(key_id.clone()) {
            return Err(SecurityError::Internal {
                reason: format!("key {key_id} is already rotating"),
            });
        }
        Ok(Self {
            rotating,
            key_id: key_id.clone(),
        })
    }
}

impl Drop for RotationGuard<'_> {
    fn drop(&mut self) {
        self.rotating.lock().remove(&self.key_id);
    }
}

/// Owner of the durable key lifecycle
pub struct KeyManager {
    config: KeyConfig,
    store: KeyStore,
    master_key: parking_lot::RwLock<Option<Zeroizing<Vec<u8>>>>,
    metadata: RwLock<HashMap<KeyId, KeyMetadata>>,
    pointers: RwLock<BTreeMap<String, KeyId>>,
    material: DashMap<KeyId, Zeroizing<Vec<u8>>>,
    rotating: Mutex<HashSet<KeyId>>,
    /// Keys whose usage counters changed since the last persist
    dirty: Mutex<HashSet<KeyId>>,
    audit: Arc<AuditLogger>,
}

impl KeyManager {
    /// Open (or initialise) the key directory.
    ///
    /// On first run a master key is generated and sealed under the master
    /// secret. Later runs must present the same secret.
    ///
    /// # Errors
    ///
    /// Returns `MasterKeyMismatch` if the secret does not unlock the stored
    /// master key, `Format` for malformed key files and `Io` for filesystem
    /// failures
    pub async fn open(
        config: &KeyConfig,
        secret: &MasterSecret,
        audit: Arc<AuditLogger>,
    ) -> SecurityResult<Arc<Self>> {
        let store = KeyStore::open(&config.key_dir).await?;

        let (master_key, origin) =
            match master::load_or_create(&store, secret, &config.master_kdf).await {
                Ok(unlocked) => unlocked,
                Err(e) => {
                    if matches!(e, SecurityError::MasterKeyMismatch) {
                        error!("Master secret does not unlock the stored master key, refusing to start");
                        audit.log_event(
                            AuditRecord::new(
                                AuditCategory::SecurityEvents,
                                "master_key_mismatch",
                                AuditSeverity::Critical,
                                SOURCE,
                                "Master secret does not unlock the stored master key",
                            )
                            .outcome(AuditOutcome::Failure),
                        );
                    }
                    return Err(e);
                }
            };

        let records = store.load_all_metadata().await?;
        let pointers = store.load_pointers().await?;
        let key_count = records.len();

        let manager = Self {
            config: config.clone(),
            store,
            master_key: parking_lot::RwLock::new(Some(master_key)),
            metadata: RwLock::new(
                records
                    .into_iter()
                    .map(|metadata| (metadata.key_id.clone(), metadata))
                    .collect(),
            ),
            pointers: RwLock::new(pointers),
            material: DashMap::new(),
            rotating: Mutex::new(HashSet::new()),
            dirty: Mutex::new(HashSet::new()),
            audit,
        };

        let recovered = manager.recover_interrupted_rotations().await?;

        info!(
            "Key manager opened {} with {} keys ({} interrupted rotations recovered)",
            config.key_dir.display(),
            key_count,
            recovered
        );
        manager.audit.log_event(
            AuditRecord::new(
                AuditCategory::KeyManagement,
                "key_manager_started",
                AuditSeverity::Info,
                SOURCE,
                "Key manager started",
            )
            .detail("key_count", key_count)
            .detail("master_key_created", origin == MasterKeyOrigin::Created)
            .detail("recovered_rotations", recovered),
        );

        Ok(Arc::new(manager))
    }

    fn master_key(&self) -> SecurityResult<Zeroizing<Vec<u8>>> {
        self.master_key
            .read()
            .as_ref()
            .cloned()
            .ok_or_else(|| SecurityError::ShutDown {
                component: "key manager".to_string(),
            })
    }

    /// Generate, persist and register a new ACTIVE key and make it the
    /// current key for its purpose
    ///
    /// # Errors
    ///
    /// Returns `Generation` for unsupported algorithm/size/type combinations
    /// or unusable purposes
    pub async fn generate_key(&self, spec: KeySpec) -> SecurityResult<KeyId> {
        if !spec.algorithm.supports(spec.key_type, spec.key_size_bits) {
            warn!(
                "Rejected key generation: {} with {} bits for {} keys",
                spec.algorithm,
                spec.key_size_bits,
                spec.key_type.as_str()
            );
            return Err(SecurityError::generation(format!(
                "{} with {} bits is not supported for {} keys",
                spec.algorithm,
                spec.key_size_bits,
                spec.key_type.as_str()
            )));
        }

        let new_key = NewKey {
            key_type: spec.key_type,
            purpose: sanitize_purpose(&spec.purpose)?,
            algorithm: spec.algorithm,
            key_size_bits: spec.key_size_bits,
            rotation_interval_days: spec
                .rotation_interval_days
                .unwrap_or(self.config.default_rotation_interval_days),
        };

        let metadata = self.persist_new_key(&new_key, None).await?;
        self.set_pointer(&metadata.purpose, &metadata.key_id).await?;

        info!(
            "Generated {} key {} for purpose {}",
            metadata.algorithm, metadata.key_id, metadata.purpose
        );
        self.audit.log_event(
            AuditRecord::new(
                AuditCategory::KeyManagement,
                "key_generated",
                AuditSeverity::Info,
                SOURCE,
                "Generated key",
            )
            .detail("key_id", metadata.key_id.as_str())
            .detail("key_type", metadata.key_type.as_str())
            .detail("algorithm", metadata.algorithm.name())
            .detail("key_size_bits", metadata.key_size_bits)
            .detail("purpose", metadata.purpose.as_str()),
        );
        Ok(metadata.key_id)
    }

    async fn persist_new_key(
        &self,
        new_key: &NewKey,
        replaces: Option<KeyId>,
    ) -> SecurityResult<KeyMetadata> {
        let master = self.master_key()?;
        let now = Utc::now();
        let key_id = KeyId::generate(new_key.key_type, &new_key.purpose, now);
        let (material, public_key) = generate_material(new_key.algorithm, new_key.key_size_bits);
        let sealed = encryption::seal(EncryptionAlgorithm::Aes256Gcm, &master, &material)?;

        let metadata = KeyMetadata {
            key_id: key_id.clone(),
            key_type: new_key.key_type,
            algorithm: new_key.algorithm,
            key_size_bits: new_key.key_size_bits,
            created_at: now,
            expires_at: expiry_after(now, new_key.rotation_interval_days),
            last_used_at: None,
            usage_count: 0,
            status: KeyStatus::Active,
            purpose: new_key.purpose.clone(),
            rotation_interval_days: new_key.rotation_interval_days,
            checksum: utils::sha256_hex(&material),
            public_key,
            replaces,
            replaced_by: None,
            status_changed_at: now,
            status_reason: None,
        };

        self.store.save_material(&key_id, &sealed).await?;
        self.store.save_metadata(&metadata).await?;
        self.metadata
            .write()
            .await
            .insert(key_id.clone(), metadata.clone());
        self.material.insert(key_id, material);
        Ok(metadata)
    }

    async fn set_pointer(&self, purpose: &str, key_id: &KeyId) -> SecurityResult<()> {
        let mut pointers = self.pointers.write().await;
        let previous = pointers.insert(purpose.to_string(), key_id.clone());
        if let Err(e) = self.store.save_pointers(&pointers).await {
            match previous {
                Some(previous) => pointers.insert(purpose.to_string(), previous),
                None => pointers.remove(purpose),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Material of an ACTIVE, unexpired key.
    ///
    /// Returns `None` for unknown keys and keys in any other state. A key
    /// found past its expiry is marked EXPIRED on the way.
    ///
    /// # Errors
    ///
    /// Returns `Integrity` if the stored material fails authentication or its
    /// checksum, `Format`/`Io` if it cannot be read
    pub async fn get_key(&self, key_id: &KeyId) -> SecurityResult<Option<KeyMaterial>> {
        let now = Utc::now();
        let mut metadata = self.metadata.write().await;
        let Some(meta) = metadata.get_mut(key_id) else {
            return Ok(None);
        };
        if meta.status != KeyStatus::Active {
            return Ok(None);
        }

        if meta.is_expired_at(now) {
            meta.set_status(KeyStatus::Expired, "expired");
            let snapshot = meta.clone();
            self.material.remove(key_id);
            self.store.save_metadata(&snapshot).await?;
            info!("Key {} expired", key_id);
            self.audit.log_event(
                AuditRecord::new(
                    AuditCategory::KeyManagement,
                    "key_expired",
                    AuditSeverity::Info,
                    SOURCE,
                    "Key expired on access",
                )
                .detail("key_id", key_id.as_str()),
            );
            return Ok(None);
        }

        let cached = self.material.get(key_id).map(|entry| entry.value().clone());
        let bytes = match cached {
            Some(bytes) => bytes,
            None => {
                let loaded = self.load_material(meta).await?;
                self.material.insert(key_id.clone(), loaded.clone());
                loaded
            }
        };

        meta.last_used_at = Some(now);
        meta.usage_count += 1;
        self.dirty.lock().insert(key_id.clone());
        Ok(Some(KeyMaterial::new(key_id.clone(), meta.algorithm, bytes)))
    }

    async fn load_material(&self, meta: &KeyMetadata) -> SecurityResult<Zeroizing<Vec<u8>>> {
        let master = self.master_key()?;
        let sealed = self.store.load_material(&meta.key_id).await?;
        let material = encryption::open(&sealed, &master).map_err(|e| match e {
            SecurityError::Integrity { .. } => {
                self.integrity_failure(&meta.key_id, "sealed material failed authentication")
            }
            other => other,
        })?;

        let checksum = utils::sha256_hex(&material);
        if !utils::constant_time_eq(checksum.as_bytes(), meta.checksum.as_bytes()) {
            return Err(self.integrity_failure(&meta.key_id, "material checksum mismatch"));
        }
        debug!("Loaded material of key {} from disk", meta.key_id);
        Ok(material)
    }

    fn integrity_failure(&self, key_id: &KeyId, context: &str) -> SecurityError {
        error!("Integrity failure for key {}: {}", key_id, context);
        self.audit.log_event(
            AuditRecord::new(
                AuditCategory::SecurityEvents,
                "key_integrity_failure",
                AuditSeverity::Critical,
                SOURCE,
                "Stored key failed integrity verification",
            )
            .detail("key_id", key_id.as_str())
            .detail("context", context)
            .outcome(AuditOutcome::Error),
        );
        SecurityError::integrity(format!("key {key_id}: {context}"))
    }

    /// Current key for a purpose, as recorded by the purpose pointer
    pub async fn current_key_for_purpose(&self, purpose: &str) -> Option<KeyId> {
        let purpose = sanitize_purpose(purpose).ok()?;
        self.pointers.read().await.get(&purpose).cloned()
    }

    /// Metadata of a key
    pub async fn get_metadata(&self, key_id: &KeyId) -> Option<KeyMetadata> {
        self.metadata.read().await.get(key_id).cloned()
    }

    /// Replace an ACTIVE key with a new one of identical parameters
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the key is unknown or not ACTIVE and `Internal`
    /// if a rotation of the same key is already running
    pub async fn rotate_key(&self, key_id: &KeyId) -> SecurityResult<KeyId> {
        self.rotate_internal(key_id, false).await
    }

    async fn rotate_internal(&self, key_id: &KeyId, allow_expired: bool) -> SecurityResult<KeyId> {
        let _guard = RotationGuard::acquire(&self.rotating, key_id)?;

        let old = self
            .metadata
            .read()
            .await
            .get(key_id)
            .cloned()
            .ok_or_else(|| SecurityError::not_found("key", key_id.as_str()))?;
        let rotatable = old.status == KeyStatus::Active
            || (allow_expired && old.status == KeyStatus::Expired && old.replaced_by.is_none());
        if !rotatable {
            return Err(SecurityError::not_found("active key", key_id.as_str()));
        }

        let new_meta = self
            .persist_new_key(&NewKey::like(&old), Some(key_id.clone()))
            .await?;
        let new_id = new_meta.key_id;

        if let Err(e) = self.commit_rotation(key_id, &old.purpose, &new_id).await {
            self.abandon_rotation(key_id, &old.purpose, &new_id).await;
            return Err(e);
        }
        self.material.remove(key_id);

        info!("Rotated key {} -> {}", key_id, new_id);
        self.audit.log_event(
            AuditRecord::new(
                AuditCategory::KeyManagement,
                "key_rotated",
                AuditSeverity::Info,
                SOURCE,
                "Rotated key",
            )
            .detail("old_key_id", key_id.as_str())
            .detail("new_key_id", new_id.as_str())
            .detail("purpose", old.purpose.as_str()),
        );
        Ok(new_id)
    }

    /// Point the purpose at the new key and archive the old one
    async fn commit_rotation(&self, key_id: &KeyId, purpose: &str, new_id: &KeyId) -> SecurityResult<()> {
        // A pointer that already moved on to an unrelated key stays put
        let owns_pointer = {
            let pointers = self.pointers.read().await;
            pointers.get(purpose).map_or(true, |current| current == key_id)
        };
        if owns_pointer {
            self.set_pointer(purpose, new_id).await?;
        }

        let mut metadata = self.metadata.write().await;
        if let Some(meta) = metadata.get_mut(key_id) {
            let previous = meta.clone();
            if meta.status == KeyStatus::Active {
                meta.set_status(KeyStatus::Archived, format!("rotated to {new_id}"));
            }
            meta.replaced_by = Some(new_id.clone());
            let snapshot = meta.clone();
            if let Err(e) = self.store.save_metadata(&snapshot).await {
                *meta = previous;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Undo a rotation that failed after its new key was persisted: the old
    /// key gets its pointer back and the new key is revoked. Whatever fails
    /// here is logged and left to startup recovery.
    async fn abandon_rotation(&self, key_id: &KeyId, purpose: &str, new_id: &KeyId) {
        error!("Rotation of {} failed, revoking replacement {}", key_id, new_id);
        let pointer_moved = self.pointers.read().await.get(purpose) == Some(new_id);
        if pointer_moved {
            if let Err(e) = self.set_pointer(purpose, key_id).await {
                warn!("Could not restore key pointer for {}: {}", purpose, e);
            }
        }
        if let Err(e) = self
            .revoke_key(new_id, &format!("rotation of {key_id} failed"))
            .await
        {
            warn!("Could not revoke abandoned key {}: {}", new_id, e);
        }
    }

    /// Revoke a key immediately and irreversibly.
    ///
    /// Returns `false` if the key is unknown or already revoked.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the new state cannot be persisted
    pub async fn revoke_key(&self, key_id: &KeyId, reason: &str) -> SecurityResult<bool> {
        let purpose = {
            let mut metadata = self.metadata.write().await;
            let Some(meta) = metadata.get_mut(key_id) else {
                return Ok(false);
            };
            if meta.status == KeyStatus::Revoked {
                return Ok(false);
            }
            meta.set_status(KeyStatus::Revoked, reason);
            let snapshot = meta.clone();
            self.store.save_metadata(&snapshot).await?;
            snapshot.purpose
        };
        self.material.remove(key_id);

        {
            let mut pointers = self.pointers.write().await;
            if pointers.get(&purpose) == Some(key_id) {
                pointers.remove(&purpose);
                self.store.save_pointers(&pointers).await?;
            }
        }

        warn!("Revoked key {}: {}", key_id, reason);
        self.audit.log_event(
            AuditRecord::new(
                AuditCategory::KeyManagement,
                "key_revoked",
                AuditSeverity::Warning,
                SOURCE,
                "Revoked key",
            )
            .detail("key_id", key_id.as_str())
            .detail("reason", reason),
        );
        Ok(true)
    }

    /// Metadata of every key matching the filters, oldest first
    pub async fn list_keys(
        &self,
        key_type: Option<KeyType>,
        status: Option<KeyStatus>,
    ) -> Vec<KeyMetadata> {
        let mut keys: Vec<KeyMetadata> = self
            .metadata
            .read()
            .await
            .values()
            .filter(|meta| key_type.map_or(true, |t| meta.key_type == t))
            .filter(|meta| status.map_or(true, |s| meta.status == s))
            .cloned()
            .collect();
        keys.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.key_id.cmp(&b.key_id))
        });
        keys
    }

    /// Apply a metadata patch. Returns `false` for unknown or revoked keys
    /// and empty patches.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the updated record cannot be persisted
    pub async fn update_key_metadata(
        &self,
        key_id: &KeyId,
        patch: KeyMetadataPatch,
    ) -> SecurityResult<bool> {
        if patch.is_empty() {
            return Ok(false);
        }
        {
            let mut metadata = self.metadata.write().await;
            let Some(meta) = metadata.get_mut(key_id) else {
                return Ok(false);
            };
            if meta.status == KeyStatus::Revoked {
                return Ok(false);
            }
            if let Some(days) = patch.rotation_interval_days {
                meta.rotation_interval_days = days;
            }
            if let Some(expires_at) = patch.expires_at {
                meta.expires_at = expires_at;
            }
            let snapshot = meta.clone();
            self.store.save_metadata(&snapshot).await?;
        }

        self.audit.log_event(
            AuditRecord::new(
                AuditCategory::KeyManagement,
                "key_metadata_updated",
                AuditSeverity::Info,
                SOURCE,
                "Updated key metadata",
            )
            .detail("key_id", key_id.as_str())
            .detail("rotation_interval_days", patch.rotation_interval_days)
            .detail(
                "expires_at",
                patch.expires_at.flatten().map(|t| t.to_rfc3339()),
            ),
        );
        Ok(true)
    }

    /// Delete archived, expired and revoked keys whose status changed more
    /// than `max_age_days` ago. Returns how many were deleted.
    ///
    /// # Errors
    ///
    /// Returns `Io` if key files cannot be removed
    pub async fn cleanup_old_keys(&self, max_age_days: u32) -> SecurityResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(max_age_days));
        let mut metadata = self.metadata.write().await;
        let doomed: Vec<KeyId> = metadata
            .values()
            .filter(|meta| meta.status.is_terminal() && meta.status_changed_at < cutoff)
            .map(|meta| meta.key_id.clone())
            .collect();

        for key_id in &doomed {
            self.store.delete_key(key_id).await?;
            metadata.remove(key_id);
            self.material.remove(key_id);
            self.dirty.lock().remove(key_id);
        }
        drop(metadata);

        if !doomed.is_empty() {
            info!("Deleted {} retired keys older than {} days", doomed.len(), max_age_days);
            self.audit.log_event(
                AuditRecord::new(
                    AuditCategory::KeyManagement,
                    "keys_cleaned_up",
                    AuditSeverity::Info,
                    SOURCE,
                    "Deleted retired keys",
                )
                .detail("count", doomed.len())
                .detail("max_age_days", max_age_days),
            );
        }
        Ok(doomed.len())
    }

    /// Rotate every ACTIVE key that is due, and replace expired keys that
    /// are still current for their purpose. Failures are logged and counted
    /// and never stop the sweep.
    pub async fn rotate_due_keys(&self) -> RotationSweep {
        let now = Utc::now();
        let due: Vec<KeyId> = {
            let metadata = self.metadata.read().await;
            let pointers = self.pointers.read().await;
            metadata
                .values()
                .filter(|meta| match meta.status {
                    KeyStatus::Active => meta.rotation_due_at(now),
                    KeyStatus::Expired => {
                        meta.replaced_by.is_none()
                            && pointers.get(&meta.purpose) == Some(&meta.key_id)
                    }
                    KeyStatus::Archived | KeyStatus::Revoked => false,
                })
                .map(|meta| meta.key_id.clone())
                .collect()
        };

        let mut sweep = RotationSweep {
            due: due.len(),
            ..RotationSweep::default()
        };
        for key_id in due {
            match self.rotate_internal(&key_id, true).await {
                Ok(new_id) => sweep.rotated.push((key_id, new_id)),
                Err(e) => {
                    warn!("Scheduled rotation of key {} failed: {}", key_id, e);
                    self.audit.log_event(
                        AuditRecord::new(
                            AuditCategory::KeyManagement,
                            "key_rotation_failed",
                            AuditSeverity::Error,
                            SOURCE,
                            "Scheduled key rotation failed",
                        )
                        .detail("key_id", key_id.as_str())
                        .detail("reason", e.to_string())
                        .outcome(AuditOutcome::Error),
                    );
                    sweep.failed.push((key_id, e.to_string()));
                }
            }
        }

        if let Err(e) = self.persist_usage().await {
            warn!("Failed to persist key usage counters: {}", e);
        }
        if sweep.due > 0 {
            info!(
                "Rotation sweep: {} due, {} rotated, {} failed",
                sweep.due,
                sweep.rotated.len(),
                sweep.failed.len()
            );
        }
        sweep
    }

    /// Spawn the periodic rotation sweep
    #[must_use]
    pub fn spawn_rotation_task(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: ShutdownSignal,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!("Key rotation task started (every {:?})", interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.rotate_due_keys().await;
                    }
                    () = shutdown.wait() => {
                        info!("Key rotation task shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Write usage counters changed since the last call
    async fn persist_usage(&self) -> SecurityResult<()> {
        let dirty: Vec<KeyId> = self.dirty.lock().drain().collect();
        if dirty.is_empty() {
            return Ok(());
        }
        let snapshots: Vec<KeyMetadata> = {
            let metadata = self.metadata.read().await;
            dirty.iter().filter_map(|id| metadata.get(id).cloned()).collect()
        };
        for snapshot in &snapshots {
            self.store.save_metadata(snapshot).await?;
        }
        debug!("Persisted usage of {} keys", snapshots.len());
        Ok(())
    }

    async fn recover_interrupted_rotations(&self) -> SecurityResult<usize> {
        let mut metadata = self.metadata.write().await;
        let pointers = self.pointers.read().await;

        let interrupted: Vec<(KeyId, KeyId)> = metadata
            .values()
            .filter(|meta| meta.status == KeyStatus::Active)
            .filter_map(|meta| {
                let old_id = meta.replaces.as_ref()?;
                let old = metadata.get(old_id)?;
                (old.replaced_by.as_ref() != Some(&meta.key_id))
                    .then(|| (meta.key_id.clone(), old_id.clone()))
            })
            .collect();

        for (new_id, old_id) in &interrupted {
            let pointer_flipped = metadata
                .get(new_id)
                .and_then(|meta| pointers.get(&meta.purpose))
                == Some(new_id);

            let (changed_id, action) = if pointer_flipped {
                if let Some(old) = metadata.get_mut(old_id) {
                    if old.status == KeyStatus::Active {
                        old.set_status(KeyStatus::Archived, format!("rotated to {new_id}"));
                    }
                    old.replaced_by = Some(new_id.clone());
                }
                (old_id, "completed")
            } else {
                if let Some(new) = metadata.get_mut(new_id) {
                    new.set_status(KeyStatus::Revoked, "incomplete rotation");
                }
                self.material.remove(new_id);
                (new_id, "rolled_back")
            };

            if let Some(snapshot) = metadata.get(changed_id) {
                self.store.save_metadata(snapshot).await?;
            }
            warn!(
                "Recovered interrupted rotation {} -> {} ({})",
                old_id, new_id, action
            );
            self.audit.log_event(
                AuditRecord::new(
                    AuditCategory::KeyManagement,
                    "key_rotation_recovered",
                    AuditSeverity::Warning,
                    SOURCE,
                    "Recovered interrupted key rotation",
                )
                .detail("old_key_id", old_id.as_str())
                .detail("new_key_id", new_id.as_str())
                .detail("action", action),
            );
        }
        Ok(interrupted.len())
    }

    /// Persist usage counters and wipe all key material from memory
    ///
    /// # Errors
    ///
    /// Returns `Io` if usage counters cannot be persisted; material is wiped
    /// regardless
    pub async fn shutdown(&self) -> SecurityResult<()> {
        let persisted = self.persist_usage().await;
        self.material.clear();
        *self.master_key.write() = None;
        info!("Key manager shut down, key material wiped");
        persisted
    }
}

fn expiry_after(now: DateTime<Utc>, rotation_interval_days: u32) -> Option<DateTime<Utc>> {
    (rotation_interval_days > 0)
        .then(|| now + chrono::Duration::days(i64::from(rotation_interval_days)))
}

/// Fresh material and, for signing keys, the hex public key
fn generate_material(
    algorithm: KeyAlgorithm,
    key_size_bits: u32,
) -> (Zeroizing<Vec<u8>>, Option<String>) {
    match algorithm {
        KeyAlgorithm::Ed25519 => {
            let mut seed = Zeroizing::new([0u8; 32]);
            OsRng.fill_bytes(seed.as_mut_slice());
            let signing_key = ed25519_dalek::SigningKey::from_bytes(&seed);
            let public_key = hex::encode(signing_key.verifying_key().to_bytes());
            (Zeroizing::new(seed.to_vec()), Some(public_key))
        }
        KeyAlgorithm::Aes256Gcm | KeyAlgorithm::ChaCha20Poly1305 => {
            (utils::random_secret(key_size_bits as usize / 8), None)
        }
    }
}
