//! Rows of the local store.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::UserProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Token pair issued by the hosted auth service.
    Hosted,
    /// Local session opened by a verified PIN; carries no token.
    Pin,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Hosted => "hosted",
            SessionKind::Pin => "pin",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "hosted" => Some(SessionKind::Hosted),
            "pin" => Some(SessionKind::Pin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSession {
    pub session_id: String,
    pub kind: SessionKind,
    pub user_id: Uuid,
    pub email: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedProfile {
    pub profile: UserProfile,
    pub fetched_at: DateTime<Utc>,
}

impl CachedProfile {
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.fetched_at < ttl
    }
}
