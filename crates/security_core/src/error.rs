//! Error types for the security core

use thiserror::Error;

/// Result type for security core operations
pub type SecurityResult<T> = Result<T, SecurityError>;

/// Main error type for security core operations
///
/// Expected outcomes on the hot path (key or session absent, expired, blocked)
/// are returned as `Option`s or decision enums by the components and never
/// show up here. Everything in this enum is a failure the caller must handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityError {
    /// AEAD tag or checksum mismatch
    #[error("Integrity check failed: {context}")]
    Integrity {
        /// What was being verified
        context: String,
    },

    /// Malformed persisted record or payload
    #[error("Malformed data: {reason}")]
    Format {
        /// Error description
        reason: String,
    },

    /// Resource absent or not in a usable state
    #[error("Not found: {resource} '{identifier}'")]
    NotFound {
        /// Resource type
        resource: String,
        /// Resource identifier
        identifier: String,
    },

    /// Unsupported algorithm/size combination or failed key generation
    #[error("Key generation failed: {reason}")]
    Generation {
        /// Error description
        reason: String,
    },

    /// The master secret does not unlock the stored master key
    #[error("Master key mismatch: the configured master secret does not unlock the stored master key")]
    MasterKeyMismatch,

    /// No usable master secret was supplied
    #[error("Master secret missing: {reason}")]
    MasterSecretMissing {
        /// Error description
        reason: String,
    },

    /// The user already holds the maximum number of active sessions
    #[error("Too many sessions: user '{user_id}' already holds {limit} active sessions")]
    TooManySessions {
        /// User identifier
        user_id: String,
        /// Configured concurrent session cap
        limit: usize,
    },

    /// Identifier is blocked by the rate limiter
    #[error("Rate limited: retry in {remaining_minutes} minutes")]
    RateLimited {
        /// Minutes until the block lifts
        remaining_minutes: i64,
    },

    /// A nonce was produced twice for the same key
    #[error("Nonce reuse detected for key '{key}'")]
    NonceReuse {
        /// Key name
        key: String,
    },

    /// Configuration errors
    #[error("Configuration error: {field} - {reason}")]
    Configuration {
        /// Configuration field that failed
        field: String,
        /// Error description
        reason: String,
    },

    /// Database errors
    #[error("Database error: {operation} failed - {reason}")]
    Database {
        /// Database operation that failed
        operation: String,
        /// Error description
        reason: String,
    },

    /// Filesystem errors
    #[error("I/O error: {operation} failed - {reason}")]
    Io {
        /// Operation that failed
        operation: String,
        /// Error description
        reason: String,
    },

    /// Serialization errors
    #[error("Serialization error: {reason}")]
    Serialization {
        /// Serialization error description
        reason: String,
    },

    /// Audit pipeline errors
    #[error("Audit error: {reason}")]
    Audit {
        /// Audit error description
        reason: String,
    },

    /// Component has been shut down
    #[error("{component} has been shut down")]
    ShutDown {
        /// Component name
        component: String,
    },

    /// Internal system errors
    #[error("Internal error: {reason}")]
    Internal {
        /// Internal error description
        reason: String,
    },
}

impl SecurityError {
    /// Create an integrity error
    pub fn integrity(context: impl Into<String>) -> Self {
        Self::Integrity {
            context: context.into(),
        }
    }

    /// Create a format error
    pub fn format(reason: impl Into<String>) -> Self {
        Self::Format {
            reason: reason.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(resource: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            identifier: identifier.into(),
        }
    }

    /// Create a key generation error
    pub fn generation(reason: impl Into<String>) -> Self {
        Self::Generation {
            reason: reason.into(),
        }
    }

    /// Create an I/O error with the failing operation attached
    pub fn io(operation: impl Into<String>, err: &std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            reason: err.to_string(),
        }
    }

    /// Errors that must abort the operation (or the process) and never be recovered locally
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Integrity { .. } | Self::MasterKeyMismatch | Self::NonceReuse { .. }
        )
    }

    /// Text that may be shown to an end user.
    ///
    /// Internal details of key and crypto failures are never surfaced; operators
    /// find them in the audit trail instead.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::TooManySessions { limit, .. } => format!(
                "You have reached the maximum of {limit} active sessions. Please sign out elsewhere and try again."
            ),
            Self::RateLimited { remaining_minutes } => format!(
                "Too many attempts. Please try again in {remaining_minutes} minutes."
            ),
            Self::NotFound { resource, .. } if resource == "session" => {
                "Your session is no longer valid. Please re-authenticate.".to_string()
            }
            _ => "The request could not be completed. Please try again later.".to_string(),
        }
    }
}

impl From<rusqlite::Error> for SecurityError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database {
            operation: "sqlite_operation".to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for SecurityError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            reason: err.to_string(),
        }
    }
}
