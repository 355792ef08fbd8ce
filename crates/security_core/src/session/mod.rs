//! # Session management
//!
//! In-memory session table with sliding expiry. Session identifiers are
//! bearer credentials: they never reach logs or the audit trail, which see a
//! short SHA-256 reference instead. Session payloads are JSON documents
//! encrypted through the [`CryptoManager`] under a key scoped to the session.
//!
//! The table sits behind one reader-writer lock so the concurrent-session
//! count and the insert of a new session happen atomically.

pub mod types;

pub use types::{SecurityFlags, SessionInfo, SessionStatus, SessionUpdate, SweepReport};

use crate::audit::{AuditCategory, AuditLogger, AuditOutcome, AuditRecord, AuditSeverity};
use crate::config::SessionConfig;
use crate::crypto::CryptoManager;
use crate::encryption::utils;
use crate::error::{SecurityError, SecurityResult};
use crate::shutdown::ShutdownSignal;
use crate::types::ActorContext;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use types::Session;
use zeroize::Zeroizing;

const SOURCE: &str = "session_manager";

/// Outcome of a validation, computed under the lock and reported after it
enum Validation {
    Unknown,
    Inactive(SessionStatus),
    Expired(Option<String>),
    Valid {
        info: SessionInfo,
        raised: SecurityFlags,
    },
}

/// Owner of the session table
pub struct SessionManager {
    timeout: chrono::Duration,
    max_concurrent: usize,
    cleanup_interval: Duration,
    retention: chrono::Duration,
    sessions: RwLock<HashMap<String, Session>>,
    crypto: Arc<CryptoManager>,
    audit: Arc<AuditLogger>,
    shut_down: AtomicBool,
}

impl SessionManager {
    /// Create an empty manager
    #[must_use]
    pub fn new(config: &SessionConfig, crypto: Arc<CryptoManager>, audit: Arc<AuditLogger>) -> Self {
        info!(
            "Session manager: timeout {}s, max {} concurrent sessions per user",
            config.timeout_secs, config.max_concurrent
        );
        Self {
            timeout: bounded(Duration::from_secs(config.timeout_secs)),
            max_concurrent: config.max_concurrent,
            cleanup_interval: Duration::from_secs(config.cleanup_interval_secs),
            retention: bounded(Duration::from_secs(config.retention_hours.saturating_mul(3600))),
            sessions: RwLock::new(HashMap::new()),
            crypto,
            audit,
            shut_down: AtomicBool::new(false),
        }
    }

    fn ensure_running(&self) -> SecurityResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(SecurityError::ShutDown {
                component: "session manager".to_string(),
            });
        }
        Ok(())
    }

    /// Open a session and return its identifier.
    ///
    /// # Errors
    ///
    /// Returns `TooManySessions` if the user already holds the maximum number
    /// of active sessions, `ShutDown` after [`shutdown`](Self::shutdown), or
    /// the encryption error if the payload cannot be sealed
    pub fn create_session(
        &self,
        user_id: Option<&str>,
        actor: &ActorContext,
        payload: Option<&Value>,
    ) -> SecurityResult<String> {
        self.ensure_running()?;

        let session_id = generate_session_id();
        let key_name = payload_key_name(&session_id);
        let payload = match payload {
            Some(value) => Some(self.crypto.encrypt(&serde_json::to_vec(value)?, &key_name)?),
            None => None,
        };

        let now = Utc::now();
        let session = Session {
            session_id: session_id.clone(),
            user_id: user_id.map(str::to_string),
            created_at: now,
            last_activity: now,
            expires_at: now + self.timeout,
            ip_address: actor.ip_address.clone(),
            user_agent: actor.user_agent.clone(),
            status: SessionStatus::Active,
            flags: SecurityFlags::empty(),
            payload,
            ended_at: None,
            end_reason: None,
        };

        {
            let mut sessions = self.sessions.write();
            if let Some(user) = user_id {
                let active = sessions
                    .values()
                    .filter(|s| {
                        s.user_id.as_deref() == Some(user)
                            && s.status == SessionStatus::Active
                            && !s.is_expired_at(now)
                    })
                    .count();
                if active >= self.max_concurrent {
                    drop(sessions);
                    self.crypto.remove_key(&key_name);
                    warn!("User {} hit the concurrent session limit", user);
                    self.audit.log_event(
                        AuditRecord::new(
                            AuditCategory::SessionManagement,
                            "session_limit_reached",
                            AuditSeverity::Warning,
                            SOURCE,
                            "Session rejected: concurrent session limit reached",
                        )
                        .actor(actor)
                        .detail("limit", self.max_concurrent)
                        .outcome(AuditOutcome::Failure),
                    );
                    return Err(SecurityError::TooManySessions {
                        user_id: user.to_string(),
                        limit: self.max_concurrent,
                    });
                }
            }
            sessions.insert(session_id.clone(), session);
        }

        let reference = session_ref(&session_id);
        debug!("Created session {}", reference);
        self.audit.log_event(
            AuditRecord::new(
                AuditCategory::SessionManagement,
                "session_created",
                AuditSeverity::Info,
                SOURCE,
                "Session created",
            )
            .actor(&actor.clone().with_session(reference)),
        );
        Ok(session_id)
    }

    /// Validate a session and slide its expiry forward.
    ///
    /// Returns `None` for unknown, ended and expired sessions; a session found
    /// past its expiry is marked EXPIRED. IP or user-agent changes raise
    /// advisory flags. Every call is audited.
    pub fn validate_session(
        &self,
        session_id: &str,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
    ) -> Option<SessionInfo> {
        let now = Utc::now();
        let validation = {
            let mut sessions = self.sessions.write();
            match sessions.get_mut(session_id) {
                None => Validation::Unknown,
                Some(session) if session.status != SessionStatus::Active => {
                    Validation::Inactive(session.status)
                }
                Some(session) if session.is_expired_at(now) => {
                    session.end(SessionStatus::Expired, "idle timeout", now);
                    Validation::Expired(session.user_id.clone())
                }
                Some(session) => {
                    let before = session.flags;
                    if let Some(ip) = ip_address {
                        if session.ip_address.as_deref().is_some_and(|known| known != ip) {
                            session.flags |= SecurityFlags::MULTIPLE_IPS;
                        }
                        session.ip_address = Some(ip.to_string());
                    }
                    if let Some(agent) = user_agent {
                        if session.user_agent.as_deref().is_some_and(|known| known != agent) {
                            session.flags |= SecurityFlags::UNUSUAL_USER_AGENT;
                        }
                        session.user_agent = Some(agent.to_string());
                    }
                    session.last_activity = now;
                    session.expires_at = now + self.timeout;
                    Validation::Valid {
                        info: session.info(),
                        raised: session.flags.difference(before),
                    }
                }
            }
        };

        let reference = session_ref(session_id);
        let mut actor = ActorContext::system().with_session(reference.clone());
        actor.ip_address = ip_address.map(str::to_string);
        actor.user_agent = user_agent.map(str::to_string);

        match validation {
            Validation::Valid { info, raised } => {
                actor.user_id = info.user_id.clone();
                self.audit.log_event(
                    AuditRecord::new(
                        AuditCategory::SessionManagement,
                        "session_validated",
                        AuditSeverity::Debug,
                        SOURCE,
                        "Session validated",
                    )
                    .actor(&actor),
                );
                if !raised.is_empty() {
                    warn!("Session {} raised flags {:?}", reference, raised);
                    self.audit.log_event(
                        AuditRecord::new(
                            AuditCategory::SecurityEvents,
                            "session_anomaly",
                            AuditSeverity::Warning,
                            SOURCE,
                            "Session characteristics changed mid-session",
                        )
                        .actor(&actor)
                        .detail("raised_flags", raised.bits())
                        .detail("flags", info.flags.bits()),
                    );
                }
                Some(info)
            }
            Validation::Expired(user_id) => {
                self.crypto.remove_key(&payload_key_name(session_id));
                actor.user_id = user_id;
                self.audit_validation_failure(&actor, "expired");
                None
            }
            Validation::Inactive(status) => {
                self.audit_validation_failure(&actor, &status.to_string().to_lowercase());
                None
            }
            Validation::Unknown => {
                self.audit_validation_failure(&actor, "unknown");
                None
            }
        }
    }

    fn audit_validation_failure(&self, actor: &ActorContext, reason: &str) {
        self.audit.log_event(
            AuditRecord::new(
                AuditCategory::SessionManagement,
                "session_validation_failed",
                AuditSeverity::Info,
                SOURCE,
                "Session validation failed",
            )
            .actor(actor)
            .detail("reason", reason)
            .outcome(AuditOutcome::Failure),
        );
    }

    fn active_payload(&self, session_id: &str) -> Option<Option<crate::types::EncryptedPayload>> {
        let now = Utc::now();
        self.sessions
            .read()
            .get(session_id)
            .filter(|s| s.status == SessionStatus::Active && !s.is_expired_at(now))
            .map(|s| s.payload.clone())
    }

    /// Decrypted payload of an ACTIVE session. `None` if the session is not
    /// active or carries no payload.
    ///
    /// # Errors
    ///
    /// Returns `Integrity` if the stored payload fails authentication and
    /// `Serialization` if it is not JSON
    pub fn get_session_data(&self, session_id: &str) -> SecurityResult<Option<Value>> {
        let Some(Some(payload)) = self.active_payload(session_id) else {
            return Ok(None);
        };
        let plaintext = self
            .crypto
            .decrypt(&payload, &payload_key_name(session_id))?;
        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    /// Replace the payload of an ACTIVE session. Returns `false` if the
    /// session is not active.
    ///
    /// # Errors
    ///
    /// Returns the encryption error if the payload cannot be sealed
    pub fn update_session_data(&self, session_id: &str, data: &Value) -> SecurityResult<bool> {
        if self.active_payload(session_id).is_none() {
            return Ok(false);
        }
        let payload = self
            .crypto
            .encrypt(&serde_json::to_vec(data)?, &payload_key_name(session_id))?;

        let mut sessions = self.sessions.write();
        match sessions.get_mut(session_id) {
            Some(session) if session.status == SessionStatus::Active => {
                session.payload = Some(payload);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Apply a typed patch to an ACTIVE session
    pub fn update_session(&self, session_id: &str, update: SessionUpdate) -> bool {
        let flags = {
            let mut sessions = self.sessions.write();
            let Some(session) = sessions
                .get_mut(session_id)
                .filter(|s| s.status == SessionStatus::Active)
            else {
                return false;
            };
            match update {
                SessionUpdate::AddFlags(flags) => session.flags |= flags,
                SessionUpdate::ClearFlags(flags) => session.flags.remove(flags),
            }
            session.flags
        };

        self.audit.log_event(
            AuditRecord::new(
                AuditCategory::SessionManagement,
                "session_updated",
                AuditSeverity::Info,
                SOURCE,
                "Session flags updated",
            )
            .actor(&ActorContext::system().with_session(session_ref(session_id)))
            .detail("flags", flags.bits()),
        );
        true
    }

    /// End an ACTIVE session. Returns `false` if it was not active.
    pub fn terminate_session(&self, session_id: &str, reason: &str) -> bool {
        let user_id = {
            let mut sessions = self.sessions.write();
            match sessions.get_mut(session_id) {
                Some(session) if session.status == SessionStatus::Active => {
                    session.end(SessionStatus::Terminated, reason, Utc::now());
                    session.user_id.clone()
                }
                _ => return false,
            }
        };
        self.crypto.remove_key(&payload_key_name(session_id));

        let mut actor = ActorContext::system().with_session(session_ref(session_id));
        actor.user_id = user_id;
        self.audit.log_event(
            AuditRecord::new(
                AuditCategory::SessionManagement,
                "session_terminated",
                AuditSeverity::Info,
                SOURCE,
                "Session terminated",
            )
            .actor(&actor)
            .detail("reason", reason),
        );
        true
    }

    /// End every ACTIVE session of a user except `except`. Returns how many
    /// were ended.
    pub fn terminate_user_sessions(&self, user_id: &str, except: Option<&str>) -> usize {
        let now = Utc::now();
        let ended: Vec<String> = {
            let mut sessions = self.sessions.write();
            sessions
                .values_mut()
                .filter(|s| {
                    s.user_id.as_deref() == Some(user_id)
                        && s.status == SessionStatus::Active
                        && Some(s.session_id.as_str()) != except
                })
                .map(|s| {
                    s.end(SessionStatus::Terminated, "user sessions terminated", now);
                    s.session_id.clone()
                })
                .collect()
        };
        for session_id in &ended {
            self.crypto.remove_key(&payload_key_name(session_id));
        }

        if !ended.is_empty() {
            info!("Terminated {} sessions of user {}", ended.len(), user_id);
            self.audit.log_event(
                AuditRecord::new(
                    AuditCategory::SessionManagement,
                    "user_sessions_terminated",
                    AuditSeverity::Info,
                    SOURCE,
                    "Terminated user sessions",
                )
                .actor(&ActorContext::user(user_id))
                .detail("count", ended.len()),
            );
        }
        ended.len()
    }

    /// ACTIVE, unexpired sessions, optionally of one user, oldest first
    #[must_use]
    pub fn list_active(&self, user_id: Option<&str>) -> Vec<SessionInfo> {
        let now = Utc::now();
        let mut active: Vec<SessionInfo> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.status == SessionStatus::Active && !s.is_expired_at(now))
            .filter(|s| user_id.map_or(true, |user| s.user_id.as_deref() == Some(user)))
            .map(Session::info)
            .collect();
        active.sort_by_key(|s| s.created_at);
        active
    }

    /// Session in any state, without touching its expiry
    #[must_use]
    pub fn get_session(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.read().get(session_id).map(Session::info)
    }

    /// Number of sessions held, in any state
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether no sessions are held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Expire idle sessions and purge ended ones past the retention window
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now())
    }

    fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let purge_before = now - self.retention;
        let (expired, purged) = {
            let mut sessions = self.sessions.write();
            let mut expired = Vec::new();
            for session in sessions.values_mut() {
                if session.status == SessionStatus::Active && session.is_expired_at(now) {
                    session.end(SessionStatus::Expired, "idle timeout", now);
                    expired.push(session.session_id.clone());
                }
            }
            let before = sessions.len();
            sessions.retain(|_, s| {
                !(s.status.is_terminal() && s.ended_at.is_some_and(|ended| ended < purge_before))
            });
            (expired, before - sessions.len())
        };
        for session_id in &expired {
            self.crypto.remove_key(&payload_key_name(session_id));
        }

        let report = SweepReport {
            expired: expired.len(),
            purged,
        };
        if report != SweepReport::default() {
            debug!("Session sweep: {} expired, {} purged", report.expired, report.purged);
            self.audit.log_event(
                AuditRecord::new(
                    AuditCategory::SessionManagement,
                    "session_sweep",
                    AuditSeverity::Info,
                    SOURCE,
                    "Session cleanup sweep",
                )
                .detail("expired", report.expired)
                .detail("purged", report.purged),
            );
        }
        report
    }

    /// Spawn the periodic cleanup sweep
    #[must_use]
    pub fn spawn_cleanup_task(self: &Arc<Self>, shutdown: ShutdownSignal) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = self.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!("Session cleanup task started (every {:?})", period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.sweep();
                    }
                    () = shutdown.wait() => {
                        info!("Session cleanup task shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Drop every session and its payload key. Returns how many were held.
    pub fn shutdown(&self) -> usize {
        self.shut_down.store(true, Ordering::Release);
        let drained: Vec<String> = self.sessions.write().drain().map(|(id, _)| id).collect();
        for session_id in &drained {
            self.crypto.remove_key(&payload_key_name(session_id));
        }
        info!("Session manager shut down, {} sessions dropped", drained.len());
        drained.len()
    }
}

/// 32 bytes of OS randomness and a nanosecond timestamp, hashed and encoded
/// as 43 URL-safe characters
fn generate_session_id() -> String {
    let mut entropy = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(entropy.as_mut_slice());
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(entropy.as_slice());
    hasher.update(nanos.to_be_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Configured durations beyond a year are treated as a year
fn bounded(duration: Duration) -> chrono::Duration {
    let year = chrono::Duration::days(365);
    chrono::Duration::from_std(duration).map_or(year, |d| d.min(year))
}

/// Crypto key name for a session payload. Key names are audited, so the
/// raw id never appears in it.
fn payload_key_name(session_id: &str) -> String {
    format!("session:{}", utils::sha256_hex(session_id.as_bytes()))
}

/// Loggable stand-in for a session id
fn session_ref(session_id: &str) -> String {
    let mut digest = utils::sha256_hex(session_id.as_bytes());
    digest.truncate(16);
    digest
}
