//! On-disk layout of the key directory
//!
//! ```text
//! {key_dir}/
//! ├── master.key            sealed master key (payload JSON)
//! ├── master.salt           salt and KDF parameters of the master key
//! ├── current_keys.json     purpose -> current key id
//! ├── {key_id}.key          material sealed under the master key
//! └── {key_id}.meta.json    KeyMetadata
//! ```
//!
//! Every write goes to a temporary file first and is renamed into place, so a
//! crash leaves either the old or the new version of a file.

use super::types::{KeyId, KeyMetadata};
use crate::error::{SecurityError, SecurityResult};
use crate::types::EncryptedPayload;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

const MATERIAL_SUFFIX: &str = ".key";
const METADATA_SUFFIX: &str = ".meta.json";
const POINTERS_FILE: &str = "current_keys.json";
pub(super) const MASTER_KEY_FILE: &str = "master.key";
pub(super) const MASTER_SALT_FILE: &str = "master.salt";

pub(super) struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    pub(super) async fn open(dir: &Path) -> SecurityResult<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| SecurityError::io("create key directory", &e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub(super) fn path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    fn material_path(&self, key_id: &KeyId) -> SecurityResult<PathBuf> {
        Self::check_id(key_id)?;
        Ok(self.path(&format!("{key_id}{MATERIAL_SUFFIX}")))
    }

    fn metadata_path(&self, key_id: &KeyId) -> SecurityResult<PathBuf> {
        Self::check_id(key_id)?;
        Ok(self.path(&format!("{key_id}{METADATA_SUFFIX}")))
    }

    fn check_id(key_id: &KeyId) -> SecurityResult<()> {
        if key_id.is_path_safe() {
            Ok(())
        } else {
            Err(SecurityError::format(format!("invalid key id '{key_id}'")))
        }
    }

    pub(super) async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> SecurityResult<()> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| SecurityError::io("create temporary key file", &e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| SecurityError::io("write temporary key file", &e))?;
        file.sync_all()
            .await
            .map_err(|e| SecurityError::io("sync temporary key file", &e))?;
        drop(file);

        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| SecurityError::io("rename key file", &e))
    }

    pub(super) async fn read(&self, path: &Path) -> SecurityResult<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SecurityError::io("read key file", &e)),
        }
    }

    pub(super) async fn save_material(
        &self,
        key_id: &KeyId,
        sealed: &EncryptedPayload,
    ) -> SecurityResult<()> {
        let path = self.material_path(key_id)?;
        self.write_atomic(&path, &sealed.to_json()?).await
    }

    pub(super) async fn load_material(&self, key_id: &KeyId) -> SecurityResult<EncryptedPayload> {
        let path = self.material_path(key_id)?;
        let bytes = self
            .read(&path)
            .await?
            .ok_or_else(|| SecurityError::not_found("key material", key_id.as_str()))?;
        EncryptedPayload::from_json(&bytes)
    }

    pub(super) async fn save_metadata(&self, metadata: &KeyMetadata) -> SecurityResult<()> {
        let path = self.metadata_path(&metadata.key_id)?;
        let bytes = serde_json::to_vec_pretty(metadata)?;
        self.write_atomic(&path, &bytes).await
    }

    /// Every metadata record in the directory
    pub(super) async fn load_all_metadata(&self) -> SecurityResult<Vec<KeyMetadata>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| SecurityError::io("read key directory", &e))?;

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SecurityError::io("read key directory", &e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(METADATA_SUFFIX) {
                continue;
            }
            let bytes = tokio::fs::read(entry.path())
                .await
                .map_err(|e| SecurityError::io("read key metadata", &e))?;
            let metadata: KeyMetadata = serde_json::from_slice(&bytes).map_err(|e| {
                SecurityError::format(format!("malformed key metadata {name}: {e}"))
            })?;
            records.push(metadata);
        }
        Ok(records)
    }

    /// Number of key material and metadata files in the directory
    pub(super) async fn count_key_files(&self) -> SecurityResult<usize> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| SecurityError::io("read key directory", &e))?;

        let mut count = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SecurityError::io("read key directory", &e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name != MASTER_KEY_FILE
                && (name.ends_with(MATERIAL_SUFFIX) || name.ends_with(METADATA_SUFFIX))
            {
                count += 1;
            }
        }
        Ok(count)
    }

    pub(super) async fn save_pointers(&self, pointers: &BTreeMap<String, KeyId>) -> SecurityResult<()> {
        let bytes = serde_json::to_vec_pretty(pointers)?;
        self.write_atomic(&self.path(POINTERS_FILE), &bytes).await
    }

    pub(super) async fn load_pointers(&self) -> SecurityResult<BTreeMap<String, KeyId>> {
        match self.read(&self.path(POINTERS_FILE)).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| SecurityError::format(format!("malformed key pointers: {e}"))),
            None => Ok(BTreeMap::new()),
        }
    }

    /// Remove material and metadata of a key. Missing files are ignored.
    pub(super) async fn delete_key(&self, key_id: &KeyId) -> SecurityResult<()> {
        for path in [self.material_path(key_id)?, self.metadata_path(key_id)?] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(SecurityError::io("remove key file", &e)),
            }
        }
        Ok(())
    }
}
