//! Master key bootstrap
//!
//! The master key is 32 random bytes sealed under a key derived from the
//! operator's master secret. The salt and KDF parameters are stored next to
//! it so later runs derive the same wrapping key even if the configured
//! defaults change.

use super::store::{KeyStore, MASTER_KEY_FILE, MASTER_SALT_FILE};
use crate::config::MasterSecret;
use crate::encryption::key_derivation::{self, KdfParams, DEFAULT_SALT_LEN, DERIVED_KEY_LEN};
use crate::encryption::{self, utils};
use crate::error::{SecurityError, SecurityResult};
use crate::types::{EncryptedPayload, EncryptionAlgorithm};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use zeroize::Zeroizing;

const MASTER_KEY_LEN: usize = 32;

#[derive(Debug, Serialize, Deserialize)]
struct MasterSaltRecord {
    salt: String,
    kdf: KdfParams,
    created_at: DateTime<Utc>,
}

/// Whether the master key was created by this call or unlocked from disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum MasterKeyOrigin {
    Created,
    Loaded,
}

pub(super) async fn load_or_create(
    store: &KeyStore,
    secret: &MasterSecret,
    kdf: &KdfParams,
) -> SecurityResult<(Zeroizing<Vec<u8>>, MasterKeyOrigin)> {
    let sealed = store.read(&store.path(MASTER_KEY_FILE)).await?;
    let salt_record = store.read(&store.path(MASTER_SALT_FILE)).await?;

    match (sealed, salt_record) {
        (Some(sealed), Some(salt_record)) => {
            let key = unlock(secret, &sealed, &salt_record).await?;
            Ok((key, MasterKeyOrigin::Loaded))
        }
        (Some(_), None) => Err(SecurityError::format(
            "master key present without its salt record",
        )),
        (None, leftover) => {
            // A fresh master key could never open keys sealed under the lost one
            let orphaned = store.count_key_files().await?;
            if orphaned > 0 {
                error!(
                    "Master key is missing but {} sealed key files remain, refusing to create a new one",
                    orphaned
                );
                return Err(SecurityError::format(format!(
                    "master key missing while {orphaned} key files remain"
                )));
            }
            if leftover.is_some() {
                // Salt is written first, so a crash before the key landed leaves only the salt
                warn!("Found master salt without master key, creating a new master key");
            }
            let key = create(store, secret, kdf).await?;
            Ok((key, MasterKeyOrigin::Created))
        }
    }
}

async fn unlock(
    secret: &MasterSecret,
    sealed: &[u8],
    salt_record: &[u8],
) -> SecurityResult<Zeroizing<Vec<u8>>> {
    let record: MasterSaltRecord = serde_json::from_slice(salt_record)
        .map_err(|e| SecurityError::format(format!("malformed master salt record: {e}")))?;
    let salt = hex::decode(&record.salt)
        .map_err(|e| SecurityError::format(format!("malformed master salt: {e}")))?;
    let payload = EncryptedPayload::from_json(sealed)?;

    let wrapping_key = derive_wrapping_key(secret, salt, record.kdf).await?;
    let master = encryption::open(&payload, wrapping_key.as_slice()).map_err(|e| match e {
        SecurityError::Integrity { .. } => SecurityError::MasterKeyMismatch,
        other => other,
    })?;

    if master.len() != MASTER_KEY_LEN {
        return Err(SecurityError::format("master key has the wrong length"));
    }
    info!("Master key unlocked");
    Ok(master)
}

async fn create(
    store: &KeyStore,
    secret: &MasterSecret,
    kdf: &KdfParams,
) -> SecurityResult<Zeroizing<Vec<u8>>> {
    let salt = utils::generate_salt(DEFAULT_SALT_LEN);
    let record = MasterSaltRecord {
        salt: hex::encode(&salt),
        kdf: kdf.clone(),
        created_at: Utc::now(),
    };

    let wrapping_key = derive_wrapping_key(secret, salt, kdf.clone()).await?;
    let master = utils::random_secret(MASTER_KEY_LEN);
    let sealed = encryption::seal(EncryptionAlgorithm::Aes256Gcm, wrapping_key.as_slice(), &master)?;

    store
        .write_atomic(&store.path(MASTER_SALT_FILE), &serde_json::to_vec_pretty(&record)?)
        .await?;
    store
        .write_atomic(&store.path(MASTER_KEY_FILE), &sealed.to_json()?)
        .await?;

    info!("Generated new master key");
    Ok(master)
}

async fn derive_wrapping_key(
    secret: &MasterSecret,
    salt: Vec<u8>,
    kdf: KdfParams,
) -> SecurityResult<Zeroizing<[u8; DERIVED_KEY_LEN]>> {
    let password = Zeroizing::new(secret.expose().to_vec());
    tokio::task::spawn_blocking(move || key_derivation::derive(&password, &salt, &kdf))
        .await
        .map_err(|e| SecurityError::Internal {
            reason: format!("master key derivation task failed: {e}"),
        })?
}
