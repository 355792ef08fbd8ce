//! Session records and their public views

use crate::types::EncryptedPayload;
use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Usable
    Active,
    /// Idle past its expiry
    Expired,
    /// Ended deliberately
    Terminated,
}

impl SessionStatus {
    /// Whether the session can never become usable again
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Expired | Self::Terminated)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "ACTIVE",
            Self::Expired => "EXPIRED",
            Self::Terminated => "TERMINATED",
        })
    }
}

bitflags! {
    /// Advisory anomaly markers. Cumulative; they never end a session on their own.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct SecurityFlags: u32 {
        /// Seen from more than one IP address
        const MULTIPLE_IPS = 1 << 0;
        /// User agent changed mid-session
        const UNUSUAL_USER_AGENT = 1 << 1;
        /// Flagged by an administrator
        const ADMIN_FLAGGED = 1 << 2;
    }
}

/// Full session record, held only inside the manager
#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub(crate) session_id: String,
    pub(crate) user_id: Option<String>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) last_activity: DateTime<Utc>,
    pub(crate) expires_at: DateTime<Utc>,
    pub(crate) ip_address: Option<String>,
    pub(crate) user_agent: Option<String>,
    pub(crate) status: SessionStatus,
    pub(crate) flags: SecurityFlags,
    pub(crate) payload: Option<EncryptedPayload>,
    pub(crate) ended_at: Option<DateTime<Utc>>,
    pub(crate) end_reason: Option<String>,
}

impl Session {
    pub(crate) fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub(crate) fn end(&mut self, status: SessionStatus, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = status;
        self.ended_at = Some(now);
        self.end_reason = Some(reason.into());
        self.payload = None;
    }

    pub(crate) fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity,
            expires_at: self.expires_at,
            ip_address: self.ip_address.clone(),
            user_agent: self.user_agent.clone(),
            status: self.status,
            flags: self.flags,
            has_payload: self.payload.is_some(),
            ended_at: self.ended_at,
            end_reason: self.end_reason.clone(),
        }
    }
}

/// Session as seen by callers. Never carries the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Bearer identifier
    pub session_id: String,
    /// Owning user, if authenticated
    pub user_id: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last successful validation
    pub last_activity: DateTime<Utc>,
    /// Sliding expiry
    pub expires_at: DateTime<Utc>,
    /// Most recent IP address
    pub ip_address: Option<String>,
    /// Most recent user agent
    pub user_agent: Option<String>,
    /// Lifecycle state
    pub status: SessionStatus,
    /// Anomaly markers
    pub flags: SecurityFlags,
    /// Whether encrypted session data is attached
    pub has_payload: bool,
    /// When the session left ACTIVE
    pub ended_at: Option<DateTime<Utc>>,
    /// Why the session left ACTIVE
    pub end_reason: Option<String>,
}

/// Typed session patch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionUpdate {
    /// Set flags (bitwise OR)
    AddFlags(SecurityFlags),
    /// Clear flags
    ClearFlags(SecurityFlags),
}

/// Outcome of one cleanup sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// ACTIVE sessions moved to EXPIRED
    pub expired: usize,
    /// Terminal sessions deleted after the retention window
    pub purged: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_are_cumulative() {
        let mut flags = SecurityFlags::empty();
        flags |= SecurityFlags::MULTIPLE_IPS;
        flags |= SecurityFlags::UNUSUAL_USER_AGENT;
        flags |= SecurityFlags::MULTIPLE_IPS;
        assert!(flags.contains(SecurityFlags::MULTIPLE_IPS | SecurityFlags::UNUSUAL_USER_AGENT));
        assert!(!flags.contains(SecurityFlags::ADMIN_FLAGGED));
        assert_eq!(flags.bits(), 0b11);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!SessionStatus::Active.is_terminal());
        assert!(SessionStatus::Expired.is_terminal());
        assert!(SessionStatus::Terminated.is_terminal());
        assert_eq!(SessionStatus::Terminated.to_string(), "TERMINATED");
    }
}
