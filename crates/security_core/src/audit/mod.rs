//! # Audit trail
//!
//! Append-only, checksum protected event streams. Producers call
//! [`AuditLogger::log_event`], which filters, stamps and checksums the event
//! and pushes it onto an unbounded queue without blocking. A single consumer
//! task drains the queue in FIFO order and appends each event as one JSON line
//! to its category stream, the master stream and, for security events, the
//! security stream.
//!
//! Shutdown closes the queue and waits for the consumer to write everything
//! that was accepted before the close.

pub mod event;
mod writer;

pub use event::{
    AuditCategory, AuditEvent, AuditLevel, AuditOutcome, AuditRecord, AuditSeverity,
    DataClassification,
};
pub use writer::stream_file_name;

use crate::config::AuditConfig;
use crate::encryption::{self, utils};
use crate::error::{SecurityError, SecurityResult};
use crate::logging::SECURITY_AUDIT_TARGET;
use crate::types::{ActorContext, EncryptedPayload, EncryptionAlgorithm};
use chrono::{NaiveDate, Utc};
use event::{checksum_of_value, CHECKSUM_FIELD};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use writer::{StreamWriter, MASTER_STREAM, SECURITY_STREAM};
use zeroize::Zeroizing;

/// Replacement for sensitive detail values when no sealing key is installed
pub const REDACTED: &str = "[REDACTED]";

/// Key of the object wrapping a sealed detail value
const SEALED_FIELD: &str = "sealed";

enum AuditCommand {
    Event(Box<AuditEvent>),
    Flush(oneshot::Sender<()>),
}

/// Counters maintained by the consumer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditStats {
    /// Events written
    pub total_events: u64,
    /// Events written per category
    pub by_category: BTreeMap<AuditCategory, u64>,
    /// Events written per severity
    pub by_severity: BTreeMap<AuditSeverity, u64>,
    /// Events filtered out by level or category
    pub suppressed: u64,
    /// Stream appends that failed
    pub write_failures: u64,
}

/// Result of verifying a stream file line by line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    /// Non-empty lines inspected
    pub total: usize,
    /// Lines whose checksum verified
    pub valid: usize,
    /// 1-based numbers of tampered or unparseable lines
    pub tampered_lines: Vec<usize>,
}

impl IntegrityReport {
    /// True when every line verified
    #[must_use]
    pub fn is_intact(&self) -> bool {
        self.tampered_lines.is_empty()
    }
}

/// Asynchronous, tamper evident audit logger
pub struct AuditLogger {
    level: AuditLevel,
    enabled: HashSet<AuditCategory>,
    sensitive_keys: Vec<String>,
    sender: RwLock<Option<mpsc::UnboundedSender<AuditCommand>>>,
    consumer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    stats: Arc<Mutex<AuditStats>>,
    sealing_key: RwLock<Option<Zeroizing<Vec<u8>>>>,
    writer: Arc<StreamWriter>,
}

impl AuditLogger {
    /// Create the logger and spawn its consumer task.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the stream directory cannot be created and `Internal`
    /// when called outside a tokio runtime.
    pub fn start(config: &AuditConfig) -> SecurityResult<Arc<Self>> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| SecurityError::Internal {
            reason: format!("audit logger requires a tokio runtime: {e}"),
        })?;
        let writer = Arc::new(StreamWriter::new(config.log_dir.clone())?);
        let stats = Arc::new(Mutex::new(AuditStats::default()));
        let (sender, receiver) = mpsc::unbounded_channel();

        let consumer = runtime.spawn(Self::run_consumer(
            receiver,
            Arc::clone(&writer),
            Arc::clone(&stats),
        ));

        info!(
            "Audit logger started at level {:?} writing to {}",
            config.level,
            config.log_dir.display()
        );

        Ok(Arc::new(Self {
            level: config.level,
            enabled: config.enabled_categories.iter().copied().collect(),
            sensitive_keys: config.sensitive_detail_keys.clone(),
            sender: RwLock::new(Some(sender)),
            consumer: tokio::sync::Mutex::new(Some(consumer)),
            stats,
            sealing_key: RwLock::new(None),
            writer,
        }))
    }

    /// Whether an event of this category and severity is recorded.
    ///
    /// Disabled categories are never recorded. Within enabled categories,
    /// CRITICAL and above and WARNING-or-above security events bypass the
    /// level threshold.
    #[must_use]
    pub fn should_log(&self, category: AuditCategory, severity: AuditSeverity) -> bool {
        if !self.enabled.contains(&category) {
            return false;
        }
        if severity >= AuditSeverity::Critical {
            return true;
        }
        if category == AuditCategory::SecurityEvents && severity >= AuditSeverity::Warning {
            return true;
        }
        severity >= self.level.min_severity()
    }

    /// Record an event.
    ///
    /// Never blocks on I/O. Returns the event id, or an empty string when the
    /// event was suppressed or the logger has been shut down.
    pub fn log_event(&self, record: AuditRecord) -> String {
        if !self.should_log(record.category, record.severity) {
            self.stats.lock().suppressed += 1;
            return String::new();
        }

        let mut event = AuditEvent::from_record(record);
        self.seal_sensitive_details(&mut event.details);
        if let Err(e) = event.seal_checksum() {
            error!("Failed to checksum audit event {}: {}", event.event_type, e);
            return String::new();
        }

        let event_id = event.event_id.clone();
        let event_type = event.event_type.clone();
        let sender = self.sender.read();
        match sender.as_ref() {
            Some(sender) if sender.send(AuditCommand::Event(Box::new(event))).is_ok() => event_id,
            _ => {
                warn!("Audit logger is shut down, dropping event {}", event_type);
                String::new()
            }
        }
    }

    /// Install the key used to seal sensitive detail values
    pub fn enable_detail_sealing(&self, key: Zeroizing<Vec<u8>>) {
        *self.sealing_key.write() = Some(key);
        debug!("Audit detail sealing enabled");
    }

    /// Whether a sealing key is installed
    #[must_use]
    pub fn detail_sealing_enabled(&self) -> bool {
        self.sealing_key.read().is_some()
    }

    /// Recover the original value of a sealed detail
    ///
    /// # Errors
    ///
    /// Returns `Format` if `value` is not a sealed detail, `NotFound` if no
    /// sealing key is installed and `Integrity` if the value was altered
    pub fn open_sealed_detail(&self, value: &Value) -> SecurityResult<Value> {
        let sealed = value
            .get(SEALED_FIELD)
            .ok_or_else(|| SecurityError::format("detail value is not sealed"))?;
        let payload: EncryptedPayload = serde_json::from_value(sealed.clone())
            .map_err(|e| SecurityError::format(format!("invalid sealed detail: {e}")))?;

        let key_guard = self.sealing_key.read();
        let key = key_guard
            .as_ref()
            .ok_or_else(|| SecurityError::not_found("audit sealing key", "audit-details"))?;
        let plaintext = encryption::open(&payload, key)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    fn is_sensitive(&self, name: &str) -> bool {
        self.sensitive_keys
            .iter()
            .any(|key| key.eq_ignore_ascii_case(name))
    }

    fn seal_sensitive_details(&self, details: &mut BTreeMap<String, Value>) {
        if details.is_empty() || self.sensitive_keys.is_empty() {
            return;
        }
        let key_guard = self.sealing_key.read();
        for (name, value) in details.iter_mut() {
            if !self.is_sensitive(name) {
                continue;
            }
            let replacement = match key_guard.as_ref() {
                Some(key) => match Self::seal_value(key, value) {
                    Ok(sealed) => sealed,
                    Err(e) => {
                        warn!("Failed to seal audit detail {}: {}", name, e);
                        Value::String(REDACTED.to_string())
                    }
                },
                None => Value::String(REDACTED.to_string()),
            };
            *value = replacement;
        }
    }

    fn seal_value(key: &[u8], value: &Value) -> SecurityResult<Value> {
        let plaintext = Zeroizing::new(serde_json::to_vec(value)?);
        let payload = encryption::seal(EncryptionAlgorithm::Aes256Gcm, key, &plaintext)?;
        let mut sealed = serde_json::Map::new();
        sealed.insert(SEALED_FIELD.to_string(), serde_json::to_value(payload)?);
        Ok(Value::Object(sealed))
    }

    async fn run_consumer(
        mut receiver: mpsc::UnboundedReceiver<AuditCommand>,
        writer: Arc<StreamWriter>,
        stats: Arc<Mutex<AuditStats>>,
    ) {
        while let Some(command) = receiver.recv().await {
            match command {
                AuditCommand::Event(event) => Self::persist(&writer, &stats, &event).await,
                AuditCommand::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("Audit queue closed, consumer stopped");
    }

    async fn persist(writer: &StreamWriter, stats: &Mutex<AuditStats>, event: &AuditEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize audit event {}: {}", event.event_id, e);
                stats.lock().write_failures += 1;
                return;
            }
        };

        let mut failures = 0;
        for path in writer.paths_for(event) {
            if let Err(e) = writer.append(&path, &line).await {
                error!("Audit write to {} failed: {}", path.display(), e);
                failures += 1;
            }
        }

        if event.category == AuditCategory::SecurityEvents {
            mirror_to_tracing(event);
        }

        let mut stats = stats.lock();
        stats.total_events += 1;
        *stats.by_category.entry(event.category).or_insert(0) += 1;
        *stats.by_severity.entry(event.severity).or_insert(0) += 1;
        stats.write_failures += failures;
    }

    /// Recompute the checksum of a serialized event and compare it with the
    /// stored one. Any alteration after creation yields `false`.
    #[must_use]
    pub fn verify_event_integrity(serialized: &str) -> bool {
        let Ok(value) = serde_json::from_str::<Value>(serialized) else {
            return false;
        };
        let Some(stored) = value
            .get(CHECKSUM_FIELD)
            .and_then(Value::as_str)
            .map(str::to_owned)
        else {
            return false;
        };
        match checksum_of_value(value) {
            Ok(Some(computed)) => utils::constant_time_eq(computed.as_bytes(), stored.as_bytes()),
            _ => false,
        }
    }

    /// Verify every line of a stream file
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be read
    pub async fn verify_stream(path: impl AsRef<Path>) -> SecurityResult<IntegrityReport> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| SecurityError::io("read audit stream", &e))?;

        let mut report = IntegrityReport::default();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            report.total += 1;
            if Self::verify_event_integrity(line) {
                report.valid += 1;
            } else {
                report.tampered_lines.push(index + 1);
            }
        }

        if !report.is_intact() {
            warn!(
                "Audit stream {} has {} tampered lines",
                path.as_ref().display(),
                report.tampered_lines.len()
            );
        }
        Ok(report)
    }

    /// Wait until every event queued before this call has been written
    ///
    /// # Errors
    ///
    /// Returns `Audit` if the consumer stopped before acknowledging
    pub async fn flush(&self) -> SecurityResult<()> {
        let (done, acknowledged) = oneshot::channel();
        {
            let sender = self.sender.read();
            let Some(sender) = sender.as_ref() else {
                return Ok(());
            };
            if sender.send(AuditCommand::Flush(done)).is_err() {
                return Ok(());
            }
        }
        acknowledged.await.map_err(|_| SecurityError::Audit {
            reason: "consumer stopped before flush completed".to_string(),
        })
    }

    /// Snapshot of the counters
    #[must_use]
    pub fn stats(&self) -> AuditStats {
        self.stats.lock().clone()
    }

    /// Directory holding the stream files
    #[must_use]
    pub fn log_dir(&self) -> &Path {
        self.writer.dir()
    }

    /// Path of a category stream for a day
    #[must_use]
    pub fn category_stream_path(&self, category: AuditCategory, date: NaiveDate) -> PathBuf {
        self.writer.stream_path(category.as_str(), date)
    }

    /// Path of the master stream for a day
    #[must_use]
    pub fn master_stream_path(&self, date: NaiveDate) -> PathBuf {
        self.writer.stream_path(MASTER_STREAM, date)
    }

    /// Path of the security stream for a day
    #[must_use]
    pub fn security_stream_path(&self, date: NaiveDate) -> PathBuf {
        self.writer.stream_path(SECURITY_STREAM, date)
    }

    /// Delete stream files older than `retention_days`
    ///
    /// # Errors
    ///
    /// Returns `Io` if the directory cannot be read or a file cannot be removed
    pub async fn cleanup_old_streams(&self, retention_days: u32) -> SecurityResult<usize> {
        let cutoff = Utc::now().date_naive() - chrono::Duration::days(i64::from(retention_days));
        let removed = self.writer.remove_older_than(cutoff).await?;
        if removed > 0 {
            info!("Removed {} audit streams older than {}", removed, cutoff);
        }
        Ok(removed)
    }

    /// Whether [`shutdown`](Self::shutdown) has run
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.sender.read().is_none()
    }

    /// Stop accepting events, drain the queue and join the consumer
    ///
    /// # Errors
    ///
    /// Returns `Audit` if the consumer task panicked
    pub async fn shutdown(&self) -> SecurityResult<()> {
        // Dropping the only sender closes the queue once it is drained
        drop(self.sender.write().take());

        let consumer = self.consumer.lock().await.take();
        if let Some(consumer) = consumer {
            consumer.await.map_err(|e| SecurityError::Audit {
                reason: format!("consumer task failed: {e}"),
            })?;
            let stats = self.stats();
            info!(
                "Audit logger stopped after {} events ({} write failures)",
                stats.total_events, stats.write_failures
            );
        }
        *self.sealing_key.write() = None;
        Ok(())
    }

    /// Authentication attempt
    pub fn log_authentication(
        &self,
        event_type: &str,
        actor: &ActorContext,
        success: bool,
        method: &str,
    ) -> String {
        let (severity, outcome) = if success {
            (AuditSeverity::Info, AuditOutcome::Success)
        } else {
            (AuditSeverity::Warning, AuditOutcome::Failure)
        };
        self.log_event(
            AuditRecord::new(
                AuditCategory::Authentication,
                event_type,
                severity,
                "authentication",
                format!(
                    "Authentication {} for user {}",
                    if success { "succeeded" } else { "failed" },
                    actor.user_id.as_deref().unwrap_or("unknown")
                ),
            )
            .detail("method", method)
            .actor(actor)
            .outcome(outcome),
        )
    }

    /// Read access to a protected resource
    pub fn log_data_access(
        &self,
        resource: &str,
        action: &str,
        actor: &ActorContext,
        classification: DataClassification,
    ) -> String {
        self.log_event(
            AuditRecord::new(
                AuditCategory::DataAccess,
                "data_access",
                AuditSeverity::Info,
                "data_access",
                format!("{action} on {resource}"),
            )
            .detail("resource", resource)
            .detail("action", action)
            .actor(actor)
            .classification(classification),
        )
    }

    /// API call with its response status
    pub fn log_api_call(
        &self,
        method: &str,
        endpoint: &str,
        status_code: u16,
        duration: Duration,
        actor: &ActorContext,
    ) -> String {
        let (severity, outcome) = match status_code {
            0..=399 => (AuditSeverity::Info, AuditOutcome::Success),
            400..=499 => (AuditSeverity::Warning, AuditOutcome::Failure),
            _ => (AuditSeverity::Error, AuditOutcome::Error),
        };
        self.log_event(
            AuditRecord::new(
                AuditCategory::ApiAccess,
                "api_call",
                severity,
                "api",
                format!("{method} {endpoint} -> {status_code}"),
            )
            .detail("method", method)
            .detail("endpoint", endpoint)
            .detail("status_code", status_code)
            .duration(duration)
            .actor(actor)
            .outcome(outcome),
        )
    }

    /// Unexpected failure in a component
    pub fn log_error(
        &self,
        source_component: &str,
        error: &dyn std::fmt::Display,
        actor: &ActorContext,
    ) -> String {
        self.log_event(
            AuditRecord::new(
                AuditCategory::SystemEvents,
                "error",
                AuditSeverity::Error,
                source_component,
                error.to_string(),
            )
            .actor(actor)
            .outcome(AuditOutcome::Error),
        )
    }

    /// Security relevant signal
    pub fn log_security_event(
        &self,
        event_type: &str,
        severity: AuditSeverity,
        description: &str,
        actor: &ActorContext,
        details: BTreeMap<String, Value>,
    ) -> String {
        let mut record = AuditRecord::new(
            AuditCategory::SecurityEvents,
            event_type,
            severity,
            "security",
            description,
        )
        .actor(actor);
        record.details = details;
        self.log_event(record)
    }
}

fn mirror_to_tracing(event: &AuditEvent) {
    match event.severity {
        AuditSeverity::Debug => tracing::debug!(
            target: SECURITY_AUDIT_TARGET,
            event_id = %event.event_id,
            event_type = %event.event_type,
            "{}",
            event.description
        ),
        AuditSeverity::Info => tracing::info!(
            target: SECURITY_AUDIT_TARGET,
            event_id = %event.event_id,
            event_type = %event.event_type,
            "{}",
            event.description
        ),
        AuditSeverity::Warning => tracing::warn!(
            target: SECURITY_AUDIT_TARGET,
            event_id = %event.event_id,
            event_type = %event.event_type,
            "{}",
            event.description
        ),
        AuditSeverity::Error | AuditSeverity::Critical | AuditSeverity::Emergency => {
            tracing::error!(
                target: SECURITY_AUDIT_TARGET,
                event_id = %event.event_id,
                event_type = %event.event_type,
                severity = ?event.severity,
                "{}",
                event.description
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir, level: AuditLevel) -> AuditConfig {
        AuditConfig {
            log_dir: dir.path().join("audit"),
            level,
            ..AuditConfig::default()
        }
    }

    fn record(category: AuditCategory, severity: AuditSeverity) -> AuditRecord {
        AuditRecord::new(category, "test_event", severity, "tests", "test event")
    }

    async fn read_lines(path: &Path) -> Vec<String> {
        tokio::fs::read_to_string(path)
            .await
            .unwrap_or_default()
            .lines()
            .map(ToString::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_level_filtering() -> SecurityResult<()> {
        let dir = tempfile::tempdir().map_err(|e| SecurityError::io("tempdir", &e))?;
        let logger = AuditLogger::start(&config(&dir, AuditLevel::Minimal))?;

        assert!(logger.log_event(record(AuditCategory::DataAccess, AuditSeverity::Info)).is_empty());
        assert!(logger.log_event(record(AuditCategory::DataAccess, AuditSeverity::Warning)).is_empty());
        assert!(!logger.log_event(record(AuditCategory::DataAccess, AuditSeverity::Error)).is_empty());

        // Bypasses regardless of level
        assert!(!logger
            .log_event(record(AuditCategory::SecurityEvents, AuditSeverity::Warning))
            .is_empty());
        assert!(!logger
            .log_event(record(AuditCategory::ApiAccess, AuditSeverity::Critical))
            .is_empty());

        logger.flush().await?;
        let stats = logger.stats();
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.suppressed, 2);
        logger.shutdown().await
    }

    #[tokio::test]
    async fn test_disabled_category_is_suppressed() -> SecurityResult<()> {
        let dir = tempfile::tempdir().map_err(|e| SecurityError::io("tempdir", &e))?;
        let mut config = config(&dir, AuditLevel::Comprehensive);
        config.enabled_categories = vec![AuditCategory::Authentication];
        let logger = AuditLogger::start(&config)?;

        assert!(logger
            .log_event(record(AuditCategory::KeyManagement, AuditSeverity::Emergency))
            .is_empty());
        assert!(!logger
            .log_event(record(AuditCategory::Authentication, AuditSeverity::Debug))
            .is_empty());
        logger.shutdown().await
    }

    #[tokio::test]
    async fn test_security_events_reach_three_streams() -> SecurityResult<()> {
        let dir = tempfile::tempdir().map_err(|e| SecurityError::io("tempdir", &e))?;
        let logger = AuditLogger::start(&config(&dir, AuditLevel::Standard))?;

        let id = logger.log_event(record(AuditCategory::SecurityEvents, AuditSeverity::Error));
        logger.log_event(record(AuditCategory::Authentication, AuditSeverity::Info));
        logger.flush().await?;

        let today = Utc::now().date_naive();
        let security = read_lines(&logger.security_stream_path(today)).await;
        let category =
            read_lines(&logger.category_stream_path(AuditCategory::SecurityEvents, today)).await;
        let master = read_lines(&logger.master_stream_path(today)).await;

        assert_eq!(security.len(), 1);
        assert_eq!(category.len(), 1);
        assert_eq!(master.len(), 2);
        assert!(security[0].contains(&id));
        assert!(AuditLogger::verify_event_integrity(&security[0]));
        logger.shutdown().await
    }

    #[tokio::test]
    async fn test_fifo_order_and_drain_on_shutdown() -> SecurityResult<()> {
        let dir = tempfile::tempdir().map_err(|e| SecurityError::io("tempdir", &e))?;
        let logger = AuditLogger::start(&config(&dir, AuditLevel::Standard))?;

        let ids: Vec<String> = (0..300)
            .map(|_| logger.log_event(record(AuditCategory::DataModification, AuditSeverity::Info)))
            .collect();
        logger.shutdown().await?;

        let lines = read_lines(&logger.master_stream_path(Utc::now().date_naive())).await;
        assert_eq!(lines.len(), 300);
        for (line, id) in lines.iter().zip(&ids) {
            let event: AuditEvent = serde_json::from_str(line)?;
            assert_eq!(&event.event_id, id);
        }

        // Nothing is accepted after shutdown
        assert!(logger
            .log_event(record(AuditCategory::DataModification, AuditSeverity::Error))
            .is_empty());
        assert!(logger.is_shut_down());
        Ok(())
    }

    #[tokio::test]
    async fn test_verify_stream_reports_tampered_lines() -> SecurityResult<()> {
        let dir = tempfile::tempdir().map_err(|e| SecurityError::io("tempdir", &e))?;
        let logger = AuditLogger::start(&config(&dir, AuditLevel::Standard))?;
        for _ in 0..3 {
            logger.log_event(record(AuditCategory::UserManagement, AuditSeverity::Info));
        }
        logger.flush().await?;

        let path = logger.master_stream_path(Utc::now().date_naive());
        assert!(AuditLogger::verify_stream(&path).await?.is_intact());

        let mut lines = read_lines(&path).await;
        lines[1] = lines[1].replace("test event", "nothing happened");
        tokio::fs::write(&path, lines.join("\n"))
            .await
            .map_err(|e| SecurityError::io("write", &e))?;

        let report = AuditLogger::verify_stream(&path).await?;
        assert_eq!(report.total, 3);
        assert_eq!(report.valid, 2);
        assert_eq!(report.tampered_lines, vec![2]);
        logger.shutdown().await
    }

    #[tokio::test]
    async fn test_sensitive_details_are_redacted_or_sealed() -> SecurityResult<()> {
        let dir = tempfile::tempdir().map_err(|e| SecurityError::io("tempdir", &e))?;
        let logger = AuditLogger::start(&config(&dir, AuditLevel::Standard))?;

        logger.log_event(
            record(AuditCategory::Authentication, AuditSeverity::Info).detail("password", "hunter2"),
        );
        logger.enable_detail_sealing(utils::random_secret(32));
        logger.log_event(
            record(AuditCategory::Authentication, AuditSeverity::Info).detail("Token", "abc123"),
        );
        logger.flush().await?;

        let lines = read_lines(&logger.master_stream_path(Utc::now().date_naive())).await;
        assert!(!lines.iter().any(|l| l.contains("hunter2") || l.contains("abc123")));

        let redacted: AuditEvent = serde_json::from_str(&lines[0])?;
        assert_eq!(redacted.details["password"], Value::from(REDACTED));

        let sealed: AuditEvent = serde_json::from_str(&lines[1])?;
        assert_eq!(
            logger.open_sealed_detail(&sealed.details["Token"])?,
            Value::from("abc123")
        );
        assert!(AuditLogger::verify_event_integrity(&lines[1]));
        logger.shutdown().await
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired_streams() -> SecurityResult<()> {
        let dir = tempfile::tempdir().map_err(|e| SecurityError::io("tempdir", &e))?;
        let logger = AuditLogger::start(&config(&dir, AuditLevel::Standard))?;
        logger.log_event(record(AuditCategory::Compliance, AuditSeverity::Info));
        logger.flush().await?;

        let old = logger.log_dir().join("audit_20000101.log");
        tokio::fs::write(&old, "")
            .await
            .map_err(|e| SecurityError::io("write", &e))?;

        assert_eq!(logger.cleanup_old_streams(30).await?, 1);
        assert!(!old.exists());
        assert!(logger.master_stream_path(Utc::now().date_naive()).exists());
        logger.shutdown().await
    }
}
