//! # IdeaForge Security Core
//!
//! Security services shared by every IdeaForge backend component: durable key
//! lifecycle, authenticated encryption, session tracking, a tamper-evident
//! audit trail and brute-force protection.
//!
//! ## Components
//!
//! - [`AuditLogger`](audit::AuditLogger): checksummed, FIFO audit streams written by one background consumer
//! - [`CryptoManager`](crypto::CryptoManager): AES-256-GCM / ChaCha20-Poly1305 over named keys
//! - [`KeyManager`](keys::KeyManager): master-key sealed key store with rotation and crash recovery
//! - [`SessionManager`](session::SessionManager): sliding-expiry sessions with encrypted payloads
//! - [`RateLimiter`](rate_limiting::RateLimiter): `SQLite` backed sliding-window limits
//! - [`RetentionSweeper`](maintenance::RetentionSweeper): periodic deletion of records past retention
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ideaforge_security_core::config::{MasterSecret, SecurityConfig};
//! use ideaforge_security_core::types::ActorContext;
//! use ideaforge_security_core::SecurityCore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SecurityConfig::with_data_dir("/var/lib/ideaforge/security");
//!     let core = SecurityCore::start(config, MasterSecret::from_env("IDEAFORGE_MASTER_PASSWORD")?).await?;
//!
//!     let payload = core.crypto().encrypt(b"idea draft", "ideas")?;
//!     let session = core.sessions().create_session(Some("user-1"), &ActorContext::user("user-1"), None)?;
//!     assert!(core.sessions().validate_session(&session, None, None).is_some());
//!     # let _ = payload;
//!
//!     core.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    bad_style,
    dead_code,
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    overflowing_literals,
    path_statements,
    patterns_in_fns_without_body,
    unconditional_recursion,
    unused,
    unused_allocation,
    unused_comparisons,
    unused_parens,
    while_true
)]

pub mod audit;
pub mod config;
pub mod crypto;
pub mod encryption;
pub mod error;
pub mod keys;
pub mod logging;
pub mod maintenance;
pub mod rate_limiting;
pub mod session;
pub mod shutdown;
pub mod types;

use crate::audit::{AuditCategory, AuditLogger, AuditRecord, AuditSeverity};
use crate::config::{MasterSecret, SecurityConfig};
use crate::crypto::CryptoManager;
use crate::error::SecurityResult;
use crate::keys::{KeyManager, KeySpec, KeyType};
use crate::maintenance::{RetentionReport, RetentionSweeper};
use crate::rate_limiting::RateLimiter;
use crate::session::SessionManager;
use crate::shutdown::ShutdownSignal;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use zeroize::Zeroizing;

/// Key purpose of the audit detail sealing key
pub const AUDIT_SEALING_PURPOSE: &str = "audit-details";

/// Upper bound on waiting for each background worker at shutdown
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The five security components wired together, plus their background workers
pub struct SecurityCore {
    config: SecurityConfig,
    audit: Arc<AuditLogger>,
    crypto: Arc<CryptoManager>,
    keys: Arc<KeyManager>,
    sessions: Arc<SessionManager>,
    rate_limiter: Arc<RateLimiter>,
    retention: RetentionSweeper,
    shutdown: ShutdownSignal,
    workers: Vec<JoinHandle<()>>,
}

impl SecurityCore {
    /// Validate `config`, start every component and spawn the background
    /// workers.
    ///
    /// Components start in dependency order: audit logger, crypto manager, key
    /// manager, session manager, rate limiter. A key manager that cannot
    /// unlock its master key aborts startup.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for invalid settings, `MasterKeyMismatch` if
    /// the secret does not match the key directory, or the error of whichever
    /// component failed to start
    pub async fn start(config: SecurityConfig, master_secret: MasterSecret) -> SecurityResult<Self> {
        config.validate()?;
        logging::init_tracing(&config.logging)?;

        let audit = AuditLogger::start(&config.audit)?;
        match Self::start_components(config, master_secret, Arc::clone(&audit)).await {
            Ok(core) => Ok(core),
            Err(e) => {
                warn!("Security core failed to start: {}", e);
                if let Err(shutdown_error) = audit.shutdown().await {
                    warn!("Audit logger shutdown failed: {}", shutdown_error);
                }
                Err(e)
            }
        }
    }

    /// [`start`](Self::start) with the master secret read from the environment
    /// variable named in the key configuration
    ///
    /// # Errors
    ///
    /// Returns `MasterSecretMissing` if the variable is unset or too short,
    /// otherwise as [`start`](Self::start)
    pub async fn start_from_env(config: SecurityConfig) -> SecurityResult<Self> {
        let secret = MasterSecret::from_env(&config.keys.master_secret_env)?;
        Self::start(config, secret).await
    }

    async fn start_components(
        config: SecurityConfig,
        master_secret: MasterSecret,
        audit: Arc<AuditLogger>,
    ) -> SecurityResult<Self> {
        let crypto = Arc::new(CryptoManager::new(&config.crypto, Arc::clone(&audit)));
        let keys = KeyManager::open(&config.keys, &master_secret, Arc::clone(&audit)).await?;
        drop(master_secret);

        install_audit_sealing_key(&keys, &audit).await?;

        let sessions = Arc::new(SessionManager::new(
            &config.sessions,
            Arc::clone(&crypto),
            Arc::clone(&audit),
        ));
        let rate_limiter = Arc::new(RateLimiter::open(&config.rate_limiting, Arc::clone(&audit)).await?);

        let retention = RetentionSweeper::new(
            &config,
            Arc::clone(&keys),
            Arc::clone(&audit),
            Arc::clone(&rate_limiter),
        );

        let shutdown = ShutdownSignal::new();
        let workers = vec![
            keys.spawn_rotation_task(config.rotation_check_interval(), shutdown.clone()),
            sessions.spawn_cleanup_task(shutdown.clone()),
            retention
                .clone()
                .spawn(config.retention_sweep_interval(), shutdown.clone()),
        ];

        info!("Security core started");
        audit.log_event(AuditRecord::new(
            AuditCategory::SystemEvents,
            "security_core_started",
            AuditSeverity::Info,
            "security_core",
            "Security core started",
        ));

        Ok(Self {
            config,
            audit,
            crypto,
            keys,
            sessions,
            rate_limiter,
            retention,
            shutdown,
            workers,
        })
    }

    /// Effective configuration
    #[must_use]
    pub const fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Audit logger
    #[must_use]
    pub fn audit(&self) -> Arc<AuditLogger> {
        Arc::clone(&self.audit)
    }

    /// Crypto manager
    #[must_use]
    pub fn crypto(&self) -> Arc<CryptoManager> {
        Arc::clone(&self.crypto)
    }

    /// Key manager
    #[must_use]
    pub fn keys(&self) -> Arc<KeyManager> {
        Arc::clone(&self.keys)
    }

    /// Session manager
    #[must_use]
    pub fn sessions(&self) -> Arc<SessionManager> {
        Arc::clone(&self.sessions)
    }

    /// Rate limiter
    #[must_use]
    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.rate_limiter)
    }

    /// Delete retired keys, audit streams and rate limit history past their
    /// configured retention now, without waiting for the background sweep
    pub async fn run_retention_sweep(&self) -> RetentionReport {
        self.retention.sweep().await
    }

    /// Stop the workers, wipe key and session material and drain the audit
    /// trail. The audit logger stops last so shutdown events are recorded.
    ///
    /// # Errors
    ///
    /// Returns the first error of the key manager or audit logger shutdown;
    /// every step runs regardless
    pub async fn shutdown(self) -> SecurityResult<()> {
        info!("Security core shutting down");
        self.shutdown.trigger();
        for worker in self.workers {
            match tokio::time::timeout(WORKER_JOIN_TIMEOUT, worker).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Background worker ended abnormally: {}", e),
                Err(_) => warn!("Background worker did not stop within {:?}", WORKER_JOIN_TIMEOUT),
            }
        }

        let sessions_dropped = self.sessions.shutdown();
        let keys_result = self.keys.shutdown().await;
        let cached_keys = self.crypto.clear();

        self.audit.log_event(
            AuditRecord::new(
                AuditCategory::SystemEvents,
                "security_core_stopped",
                AuditSeverity::Info,
                "security_core",
                "Security core stopped",
            )
            .detail("sessions_dropped", sessions_dropped)
            .detail("cached_keys_wiped", cached_keys),
        );
        let audit_result = self.audit.shutdown().await;

        keys_result.and(audit_result)
    }
}

/// Make sure the audit logger can seal sensitive details, creating the
/// sealing key on first start
async fn install_audit_sealing_key(keys: &KeyManager, audit: &AuditLogger) -> SecurityResult<()> {
    let current = match keys.current_key_for_purpose(AUDIT_SEALING_PURPOSE).await {
        Some(key_id) => keys.get_key(&key_id).await?,
        None => None,
    };
    let material = match current {
        Some(material) => material,
        None => {
            let key_id = keys
                .generate_key(KeySpec::new(KeyType::Symmetric, AUDIT_SEALING_PURPOSE))
                .await?;
            keys.get_key(&key_id).await?.ok_or_else(|| {
                error::SecurityError::not_found("audit sealing key", key_id.as_str())
            })?
        }
    };
    audit.enable_detail_sealing(Zeroizing::new(material.as_bytes().to_vec()));
    Ok(())
}
