//! Audit event model and checksum

use crate::encryption::utils;
use crate::error::SecurityResult;
use crate::types::ActorContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Name of the checksum field, excluded from its own computation
pub(crate) const CHECKSUM_FIELD: &str = "checksum";

/// Audit event categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditCategory {
    /// Logins, logouts, credential checks
    Authentication,
    /// Permission decisions
    Authorization,
    /// Reads of protected data
    DataAccess,
    /// Writes to protected data
    DataModification,
    /// Component lifecycle and internal failures
    SystemEvents,
    /// Tampering, abuse and other security relevant signals
    SecurityEvents,
    /// User administration
    UserManagement,
    /// Configuration updates
    ConfigurationChanges,
    /// API calls
    ApiAccess,
    /// Encrypt / decrypt / hash operations
    EncryptionOperations,
    /// Key lifecycle
    KeyManagement,
    /// Session lifecycle
    SessionManagement,
    /// Compliance reporting
    Compliance,
}

impl AuditCategory {
    /// Every category
    pub const ALL: [Self; 13] = [
        Self::Authentication,
        Self::Authorization,
        Self::DataAccess,
        Self::DataModification,
        Self::SystemEvents,
        Self::SecurityEvents,
        Self::UserManagement,
        Self::ConfigurationChanges,
        Self::ApiAccess,
        Self::EncryptionOperations,
        Self::KeyManagement,
        Self::SessionManagement,
        Self::Compliance,
    ];

    /// Lowercase name used for stream file names
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Authorization => "authorization",
            Self::DataAccess => "data_access",
            Self::DataModification => "data_modification",
            Self::SystemEvents => "system_events",
            Self::SecurityEvents => "security_events",
            Self::UserManagement => "user_management",
            Self::ConfigurationChanges => "configuration_changes",
            Self::ApiAccess => "api_access",
            Self::EncryptionOperations => "encryption_operations",
            Self::KeyManagement => "key_management",
            Self::SessionManagement => "session_management",
            Self::Compliance => "compliance",
        }
    }
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditSeverity {
    /// Routine diagnostics
    Debug,
    /// Normal operations
    Info,
    /// Unusual but handled
    Warning,
    /// Failed operation
    Error,
    /// Security or integrity failure
    Critical,
    /// System unusable
    Emergency,
}

/// How much the audit trail records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditLevel {
    /// ERROR and above
    Minimal,
    /// WARNING and above
    Basic,
    /// INFO and above
    #[default]
    Standard,
    /// Everything
    Detailed,
    /// Everything
    Comprehensive,
}

impl AuditLevel {
    /// Lowest severity recorded at this level
    #[must_use]
    pub const fn min_severity(self) -> AuditSeverity {
        match self {
            Self::Minimal => AuditSeverity::Error,
            Self::Basic => AuditSeverity::Warning,
            Self::Standard => AuditSeverity::Info,
            Self::Detailed | Self::Comprehensive => AuditSeverity::Debug,
        }
    }
}

/// Result of the audited action
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    /// Completed as requested
    #[default]
    Success,
    /// Refused or unsuccessful
    Failure,
    /// Failed unexpectedly
    Error,
}

/// Sensitivity of the data the event concerns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataClassification {
    /// Public
    Public,
    /// Internal use
    #[default]
    Internal,
    /// Confidential
    Confidential,
    /// Restricted
    Restricted,
}

/// One entry of the audit trail.
///
/// `checksum` is the SHA-256 of the canonical JSON of every other field.
/// `serde_json` objects keep their keys sorted, which makes the
/// serialization canonical without extra work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Globally unique id
    pub event_id: String,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Category
    pub category: AuditCategory,
    /// Event type, e.g. `key_rotated`
    pub event_type: String,
    /// Severity
    pub severity: AuditSeverity,
    /// Emitting component
    pub source_component: String,
    /// Acting user
    pub user_id: Option<String>,
    /// Session of the actor
    pub session_id: Option<String>,
    /// Originating IP address
    pub ip_address: Option<String>,
    /// Originating user agent
    pub user_agent: Option<String>,
    /// Human readable description
    pub description: String,
    /// Structured details
    pub details: BTreeMap<String, Value>,
    /// Outcome
    pub outcome: AuditOutcome,
    /// Duration of the action in milliseconds
    pub duration_ms: Option<u64>,
    /// Data classification
    pub data_classification: DataClassification,
    /// Compliance tags, e.g. `GDPR`
    pub compliance_tags: Vec<String>,
    /// Integrity checksum
    #[serde(default)]
    pub checksum: String,
}

impl AuditEvent {
    /// Build an event from a record, stamping id and timestamp.
    ///
    /// The checksum is left empty; call [`seal_checksum`](Self::seal_checksum).
    #[must_use]
    pub fn from_record(record: AuditRecord) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            category: record.category,
            event_type: record.event_type,
            severity: record.severity,
            source_component: record.source_component,
            user_id: record.actor.user_id,
            session_id: record.actor.session_id,
            ip_address: record.actor.ip_address,
            user_agent: record.actor.user_agent,
            description: record.description,
            details: record.details,
            outcome: record.outcome,
            duration_ms: record.duration_ms,
            data_classification: record.classification,
            compliance_tags: record.compliance_tags,
            checksum: String::new(),
        }
    }

    /// Checksum over every field except `checksum`
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the event cannot be encoded
    pub fn compute_checksum(&self) -> SecurityResult<String> {
        let value = serde_json::to_value(self)?;
        Ok(checksum_of_value(value)?.unwrap_or_default())
    }

    /// Compute and store the checksum
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the event cannot be encoded
    pub fn seal_checksum(&mut self) -> SecurityResult<()> {
        self.checksum = self.compute_checksum()?;
        Ok(())
    }
}

/// SHA-256 over the canonical form of `value` with the checksum field removed.
///
/// Returns `None` if `value` is not a JSON object.
pub(crate) fn checksum_of_value(mut value: Value) -> SecurityResult<Option<String>> {
    let Some(object) = value.as_object_mut() else {
        return Ok(None);
    };
    object.remove(CHECKSUM_FIELD);
    let canonical = serde_json::to_vec(&value)?;
    Ok(Some(utils::sha256_hex(&canonical)))
}

/// Arguments of [`AuditLogger::log_event`](super::AuditLogger::log_event)
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub(crate) category: AuditCategory,
    pub(crate) event_type: String,
    pub(crate) severity: AuditSeverity,
    pub(crate) source_component: String,
    pub(crate) description: String,
    pub(crate) details: BTreeMap<String, Value>,
    pub(crate) actor: ActorContext,
    pub(crate) outcome: AuditOutcome,
    pub(crate) duration_ms: Option<u64>,
    pub(crate) classification: DataClassification,
    pub(crate) compliance_tags: Vec<String>,
}

impl AuditRecord {
    /// Start a record with the mandatory fields
    #[must_use]
    pub fn new(
        category: AuditCategory,
        event_type: impl Into<String>,
        severity: AuditSeverity,
        source_component: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            category,
            event_type: event_type.into(),
            severity,
            source_component: source_component.into(),
            description: description.into(),
            details: BTreeMap::new(),
            actor: ActorContext::default(),
            outcome: AuditOutcome::Success,
            duration_ms: None,
            classification: DataClassification::Internal,
            compliance_tags: Vec::new(),
        }
    }

    /// Add a structured detail
    #[must_use]
    pub fn detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Attach the acting user/session/ip/user-agent
    #[must_use]
    pub fn actor(mut self, actor: &ActorContext) -> Self {
        self.actor = actor.clone();
        self
    }

    /// Set the outcome
    #[must_use]
    pub const fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Set the duration of the audited action
    #[must_use]
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Set the data classification
    #[must_use]
    pub const fn classification(mut self, classification: DataClassification) -> Self {
        self.classification = classification;
        self
    }

    /// Add a compliance tag
    #[must_use]
    pub fn compliance_tag(mut self, tag: impl Into<String>) -> Self {
        self.compliance_tags.push(tag.into());
        self
    }

    /// Category of the record
    #[must_use]
    pub const fn category(&self) -> AuditCategory {
        self.category
    }

    /// Severity of the record
    #[must_use]
    pub const fn severity(&self) -> AuditSeverity {
        self.severity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AuditEvent {
        let record = AuditRecord::new(
            AuditCategory::Authentication,
            "login",
            AuditSeverity::Info,
            "auth",
            "user logged in",
        )
        .detail("method", "password")
        .detail("attempt", 1)
        .actor(&ActorContext::user("u-1").with_ip("10.0.0.1"))
        .compliance_tag("SOC2");
        let mut event = AuditEvent::from_record(record);
        event.seal_checksum().unwrap();
        event
    }

    #[test]
    fn test_checksum_ignores_checksum_field() {
        let event = sample();
        assert_eq!(event.checksum.len(), 64);
        assert_eq!(event.compute_checksum().unwrap(), event.checksum);
    }

    #[test]
    fn test_checksum_covers_every_field() {
        let event = sample();

        let mut altered = event.clone();
        altered.timestamp += chrono::Duration::seconds(1);
        assert_ne!(altered.compute_checksum().unwrap(), event.checksum);

        let mut altered = event.clone();
        altered.details.insert("attempt".into(), Value::from(2));
        assert_ne!(altered.compute_checksum().unwrap(), event.checksum);

        let mut altered = event.clone();
        altered.user_id = None;
        assert_ne!(altered.compute_checksum().unwrap(), event.checksum);
    }

    #[test]
    fn test_severity_ordering_and_levels() {
        assert!(AuditSeverity::Debug < AuditSeverity::Info);
        assert!(AuditSeverity::Critical < AuditSeverity::Emergency);
        assert_eq!(AuditLevel::Minimal.min_severity(), AuditSeverity::Error);
        assert_eq!(AuditLevel::Comprehensive.min_severity(), AuditSeverity::Debug);
    }

    #[test]
    fn test_wire_names() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert!(json.contains("\"category\":\"AUTHENTICATION\""));
        assert!(json.contains("\"severity\":\"INFO\""));
        assert!(json.contains("\"outcome\":\"SUCCESS\""));
    }
}
