//! Configuration for the security core
//!
//! Every component receives its own section of [`SecurityConfig`]. The whole
//! tree is validated with `garde` before any component is constructed, so the
//! components themselves can assume sane values.
//!
//! The master password is deliberately not part of this file: it is provided
//! through [`MasterSecret`] at startup.

use crate::audit::{AuditCategory, AuditLevel};
use crate::encryption::key_derivation::KdfParams;
use crate::error::{SecurityError, SecurityResult};
use crate::rate_limiting::{LimitType, RateLimitPolicy, StoreFailurePolicy};
use crate::types::EncryptionAlgorithm;
use garde::Validate;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable consulted for the master password by default
pub const DEFAULT_MASTER_SECRET_ENV: &str = "IDEAFORGE_MASTER_PASSWORD";

/// Shortest master password accepted
pub const MIN_MASTER_SECRET_LEN: usize = 12;

/// Root configuration of the security core.
///
/// ```text
/// SecurityConfig
/// ├── crypto: CryptoConfig (AEAD algorithm, password KDF)
/// ├── keys: KeyConfig (key directory, rotation cadence, master key KDF)
/// ├── sessions: SessionConfig (timeout, concurrency cap, sweeps)
/// ├── audit: AuditConfig (level, categories, stream directory)
/// ├── rate_limiting: RateLimitingConfig (store, policies, failure policy)
/// ├── maintenance: MaintenanceConfig (retention sweep cadence)
/// └── logging: LoggingConfig (tracing subscriber)
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SecurityConfig {
    /// Encryption settings
    #[garde(dive)]
    pub crypto: CryptoConfig,

    /// Key management settings
    #[garde(dive)]
    pub keys: KeyConfig,

    /// Session settings
    #[garde(dive)]
    pub sessions: SessionConfig,

    /// Audit settings
    #[garde(dive)]
    pub audit: AuditConfig,

    /// Rate limiting settings
    #[garde(dive)]
    pub rate_limiting: RateLimitingConfig,

    /// Background retention settings
    #[garde(dive)]
    pub maintenance: MaintenanceConfig,

    /// Logging settings
    #[garde(dive)]
    pub logging: LoggingConfig,
}

impl SecurityConfig {
    /// Default configuration with every durable artifact under `data_dir`
    #[must_use]
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        let mut config = Self::default();
        config.keys.key_dir = data_dir.join("keys");
        config.audit.log_dir = data_dir.join("audit");
        config.rate_limiting.database_path = Some(data_dir.join("rate_limits.db"));
        config
    }

    /// Load configuration from a JSON or YAML file
    ///
    /// # Errors
    ///
    /// Returns `SecurityError::Configuration` if:
    /// - File cannot be read
    /// - File format is invalid (JSON/YAML parsing fails)
    /// - Configuration validation fails
    pub fn from_file(path: impl AsRef<Path>) -> SecurityResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| SecurityError::Configuration {
            field: "config_file".to_string(),
            reason: format!("Failed to read config file {}: {}", path.display(), e),
        })?;

        let config: Self = if is_yaml(path) {
            serde_yaml::from_str(&content).map_err(|e| SecurityError::Configuration {
                field: "yaml_parsing".to_string(),
                reason: e.to_string(),
            })?
        } else {
            serde_json::from_str(&content).map_err(|e| SecurityError::Configuration {
                field: "json_parsing".to_string(),
                reason: e.to_string(),
            })?
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON or YAML file
    ///
    /// # Errors
    ///
    /// Returns `SecurityError::Configuration` if serialization or the write fails
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> SecurityResult<()> {
        let path = path.as_ref();
        let content = if is_yaml(path) {
            serde_yaml::to_string(self).map_err(|e| SecurityError::Configuration {
                field: "yaml_serialization".to_string(),
                reason: e.to_string(),
            })?
        } else {
            serde_json::to_string_pretty(self).map_err(|e| SecurityError::Configuration {
                field: "json_serialization".to_string(),
                reason: e.to_string(),
            })?
        };

        std::fs::write(path, content).map_err(|e| SecurityError::Configuration {
            field: "file_write".to_string(),
            reason: format!("Failed to write config file {}: {}", path.display(), e),
        })
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns `SecurityError::Configuration` if any parameter is out of range
    pub fn validate(&self) -> SecurityResult<()> {
        garde::Validate::validate(self, &()).map_err(|e| SecurityError::Configuration {
            field: "validation".to_string(),
            reason: e.to_string(),
        })?;
        self.crypto.kdf.validate()?;
        self.keys.master_kdf.validate()?;
        if self.audit.enabled_categories.is_empty() {
            return Err(SecurityError::Configuration {
                field: "audit.enabled_categories".to_string(),
                reason: "at least one category must be enabled".to_string(),
            });
        }
        Ok(())
    }

    /// Sliding session timeout
    #[must_use]
    pub const fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.sessions.timeout_secs)
    }

    /// Interval between session cleanup sweeps
    #[must_use]
    pub const fn session_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.sessions.cleanup_interval_secs)
    }

    /// Interval between key rotation sweeps
    #[must_use]
    pub const fn rotation_check_interval(&self) -> Duration {
        Duration::from_secs(self.keys.rotation_check_interval_secs)
    }

    /// Interval between retention sweeps
    #[must_use]
    pub const fn retention_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance.retention_sweep_interval_secs)
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml" | "yml")
    )
}

/// Encryption settings for the [`CryptoManager`](crate::crypto::CryptoManager)
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CryptoConfig {
    /// AEAD algorithm for new encryptions
    #[garde(skip)]
    pub algorithm: EncryptionAlgorithm,

    /// Password key derivation parameters
    #[garde(skip)]
    pub kdf: KdfParams,

    /// Nonces remembered per key for reuse detection
    #[garde(range(min = 16, max = 1_000_000))]
    pub nonce_history: usize,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            algorithm: EncryptionAlgorithm::Aes256Gcm,
            kdf: KdfParams::default(),
            nonce_history: 4096,
        }
    }
}

/// Key lifecycle settings for the [`KeyManager`](crate::keys::KeyManager)
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct KeyConfig {
    /// Directory holding key files, metadata and the master key
    #[garde(skip)]
    pub key_dir: PathBuf,

    /// Rotation interval applied when a key spec does not name one (0 = never)
    #[garde(range(max = 3650))]
    pub default_rotation_interval_days: u32,

    /// Seconds between rotation sweeps
    #[garde(range(min = 60, max = 604_800))] // 1 minute to 1 week
    pub rotation_check_interval_secs: u64,

    /// Days archived, expired and revoked keys are kept
    #[garde(range(min = 1, max = 3650))]
    pub retention_days: u32,

    /// Derivation of the key that seals the master key
    #[garde(skip)]
    pub master_kdf: KdfParams,

    /// Environment variable holding the master password
    #[garde(length(min = 1))]
    pub master_secret_env: String,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            key_dir: PathBuf::from("./data/keys"),
            default_rotation_interval_days: 90,
            rotation_check_interval_secs: 86_400, // daily
            retention_days: 365,
            master_kdf: KdfParams::default(),
            master_secret_env: DEFAULT_MASTER_SECRET_ENV.to_string(),
        }
    }
}

/// Session settings for the [`SessionManager`](crate::session::SessionManager)
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SessionConfig {
    /// Sliding timeout in seconds
    #[garde(range(min = 60, max = 604_800))]
    pub timeout_secs: u64,

    /// Maximum concurrent ACTIVE sessions per user
    #[garde(range(min = 1, max = 1000))]
    pub max_concurrent: usize,

    /// Seconds between cleanup sweeps
    #[garde(range(min = 1, max = 86_400))]
    pub cleanup_interval_secs: u64,

    /// Hours terminal sessions are retained before they are purged
    #[garde(range(min = 1, max = 720))]
    pub retention_hours: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 3600, // 1 hour
            max_concurrent: 5,
            cleanup_interval_secs: 300,
            retention_hours: 24,
        }
    }
}

/// Audit trail settings for the [`AuditLogger`](crate::audit::AuditLogger)
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AuditConfig {
    /// Directory receiving the dated stream files
    #[garde(skip)]
    pub log_dir: PathBuf,

    /// Minimum detail level
    #[garde(skip)]
    pub level: AuditLevel,

    /// Categories that are recorded at all
    #[garde(skip)]
    pub enabled_categories: Vec<AuditCategory>,

    /// Days stream files are kept
    #[garde(range(min = 1, max = 3650))]
    pub retention_days: u32,

    /// Detail keys whose values are sealed before they are written
    #[garde(skip)]
    pub sensitive_detail_keys: Vec<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./data/audit"),
            level: AuditLevel::Standard,
            enabled_categories: AuditCategory::ALL.to_vec(),
            retention_days: 365,
            sensitive_detail_keys: ["password", "token", "secret", "api_key", "credit_card"]
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

/// Rate limiting settings for the [`RateLimiter`](crate::rate_limiting::RateLimiter)
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RateLimitingConfig {
    /// SQLite database file; `None` keeps the store in memory
    #[garde(skip)]
    pub database_path: Option<PathBuf>,

    /// Behaviour when the store cannot be reached
    #[garde(skip)]
    pub failure_policy: StoreFailurePolicy,

    /// Login attempts
    #[garde(dive)]
    pub login: RateLimitPolicy,

    /// Account registrations
    #[garde(dive)]
    pub registration: RateLimitPolicy,

    /// Password reset requests
    #[garde(dive)]
    pub password_reset: RateLimitPolicy,

    /// Generic API calls
    #[garde(dive)]
    pub api: RateLimitPolicy,

    /// Days attempts and lifted blocks are kept
    #[garde(range(min = 1, max = 3650))]
    pub retention_days: u32,
}

impl RateLimitingConfig {
    /// Policy for a limit type
    #[must_use]
    pub const fn policy(&self, limit_type: LimitType) -> &RateLimitPolicy {
        match limit_type {
            LimitType::Login => &self.login,
            LimitType::Registration => &self.registration,
            LimitType::PasswordReset => &self.password_reset,
            LimitType::Api => &self.api,
        }
    }
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            failure_policy: StoreFailurePolicy::FailOpen,
            login: RateLimitPolicy::new(5, 10, 15),
            registration: RateLimitPolicy::new(3, 10, 30),
            password_reset: RateLimitPolicy::new(3, 60, 60),
            api: RateLimitPolicy::new(100, 1, 5),
            retention_days: 30,
        }
    }
}

/// Retention sweep settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Seconds between sweeps deleting keys, audit streams and rate limit
    /// records past their retention
    #[garde(range(min = 1, max = 604_800))]
    pub retention_sweep_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            retention_sweep_interval_secs: 86_400, // daily
        }
    }
}

/// Tracing subscriber settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[garde(length(min = 1))]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[garde(skip)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// The operator supplied master password.
///
/// There is no fallback value: a missing or short secret stops startup.
pub struct MasterSecret(SecretString);

impl MasterSecret {
    /// Wrap an explicit secret
    ///
    /// # Errors
    ///
    /// Returns `MasterSecretMissing` if the secret is shorter than 12 characters
    pub fn new(secret: impl Into<String>) -> SecurityResult<Self> {
        let secret: String = secret.into();
        if secret.chars().count() < MIN_MASTER_SECRET_LEN {
            return Err(SecurityError::MasterSecretMissing {
                reason: format!("master secret must be at least {MIN_MASTER_SECRET_LEN} characters"),
            });
        }
        Ok(Self(SecretString::new(secret)))
    }

    /// Read the secret from an environment variable
    ///
    /// # Errors
    ///
    /// Returns `MasterSecretMissing` if the variable is unset, not unicode or too short
    pub fn from_env(var: &str) -> SecurityResult<Self> {
        let value = std::env::var(var).map_err(|e| SecurityError::MasterSecretMissing {
            reason: format!("{var}: {e}"),
        })?;
        Self::new(value)
    }

    /// Secret bytes for key derivation
    pub(crate) fn expose(&self) -> &[u8] {
        self.0.expose_secret().as_bytes()
    }
}

impl std::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterSecret([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() -> SecurityResult<()> {
        let config = SecurityConfig::default();
        config.validate()?;
        assert_eq!(config.rate_limiting.policy(LimitType::Login).max_attempts, 5);
        assert_eq!(config.rate_limiting.policy(LimitType::Api).window_minutes, 1);
        assert_eq!(config.session_timeout(), Duration::from_secs(3600));
        Ok(())
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        let mut config = SecurityConfig::default();
        config.sessions.max_concurrent = 0;
        assert!(matches!(
            config.validate(),
            Err(SecurityError::Configuration { .. })
        ));

        let mut config = SecurityConfig::default();
        config.crypto.kdf.iterations = 10;
        assert!(config.validate().is_err());

        let mut config = SecurityConfig::default();
        config.audit.enabled_categories.clear();
        assert!(config.validate().is_err());

        let mut config = SecurityConfig::default();
        config.maintenance.retention_sweep_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_roundtrip_json_and_yaml() -> SecurityResult<()> {
        let dir = tempfile::tempdir().map_err(|e| SecurityError::io("tempdir", &e))?;
        let mut config = SecurityConfig::with_data_dir(dir.path());
        config.sessions.max_concurrent = 3;

        for name in ["security.json", "security.yaml"] {
            let path = dir.path().join(name);
            config.save_to_file(&path)?;
            let loaded = SecurityConfig::from_file(&path)?;
            assert_eq!(loaded.sessions.max_concurrent, 3);
            assert_eq!(loaded.keys.key_dir, dir.path().join("keys"));
        }
        Ok(())
    }

    #[test]
    fn test_partial_file_uses_defaults() -> SecurityResult<()> {
        let dir = tempfile::tempdir().map_err(|e| SecurityError::io("tempdir", &e))?;
        let path = dir.path().join("partial.yaml");
        std::fs::write(&path, "sessions:\n  timeout_secs: 900\n")
            .map_err(|e| SecurityError::io("write", &e))?;

        let loaded = SecurityConfig::from_file(&path)?;
        assert_eq!(loaded.sessions.timeout_secs, 900);
        assert_eq!(loaded.sessions.max_concurrent, 5);
        Ok(())
    }

    #[test]
    fn test_master_secret_rules() {
        assert!(matches!(
            MasterSecret::new("short"),
            Err(SecurityError::MasterSecretMissing { .. })
        ));
        assert!(MasterSecret::from_env("IDEAFORGE_TEST_UNSET_VARIABLE").is_err());

        let secret = MasterSecret::new("a sufficiently long secret").unwrap();
        assert!(!format!("{secret:?}").contains("sufficiently"));
    }
}
