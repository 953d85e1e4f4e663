use std::fmt;

use serde::{Deserialize, Serialize};

use crate::clock::EpochMillis;

/// Tokens issued by the portal, either at interactive login or by a refresh.
///
/// Not retained: the store turns it into a [`Session`] and drops it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct TokenResponse {
    pub access_token: String,
    /// Access token lifetime in seconds
    pub expires_in: u64,
    /// Refresh credential lifetime in seconds
    pub refresh_expires_in: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

/// The authenticated session.
///
/// Replaced wholesale on every change; never edited in place.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Session {
    pub access_token: String,
    #[cfg_attr(feature = "ts", ts(type = "number"))]
    pub access_expires_at: EpochMillis,
    #[cfg_attr(feature = "ts", ts(type = "number"))]
    pub refresh_expires_at: EpochMillis,
    /// Absolute ceiling of the login window. Refreshes never move it.
    #[cfg_attr(feature = "ts", ts(type = "number"))]
    pub session_ends_at: EpochMillis,
    pub id_token: Option<String>,
}

impl Session {
    /// Build a session from a token response received at `now`.
    pub fn from_tokens(
        tokens: &TokenResponse,
        now: EpochMillis,
        session_ends_at: EpochMillis,
        id_token: Option<String>,
    ) -> Self {
        Self {
            access_token: tokens.access_token.clone(),
            access_expires_at: now.saturating_add(secs_to_ms(tokens.expires_in)),
            refresh_expires_at: now.saturating_add(secs_to_ms(tokens.refresh_expires_in)),
            session_ends_at,
            id_token,
        }
    }

    pub fn is_access_expired(&self, now: EpochMillis) -> bool {
        now >= self.access_expires_at
    }

    pub fn is_window_over(&self, now: EpochMillis) -> bool {
        now >= self.session_ends_at
    }

    /// Milliseconds left before the forced logout, floored at zero.
    pub fn ms_until_end(&self, now: EpochMillis) -> i64 {
        (self.session_ends_at - now).max(0)
    }
}

// Keep bearer material out of logs.
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"<redacted>")
            .field("access_expires_at", &self.access_expires_at)
            .field("refresh_expires_at", &self.refresh_expires_at)
            .field("session_ends_at", &self.session_ends_at)
            .field("id_token", &self.id_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX).saturating_mul(1_000)
}

/// What the store currently exposes to its observers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SessionSnapshot {
    pub session: Option<Session>,
    pub is_refreshing: bool,
    pub show_expiry_warning: bool,
}

impl SessionSnapshot {
    pub fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoginOptions {
    /// Start a new 10-hour window (interactive login) instead of reusing
    /// the persisted one (background refresh, bootstrap).
    pub reset_session_window: bool,
}

impl LoginOptions {
    pub fn interactive() -> Self {
        Self {
            reset_session_window: true,
        }
    }

    pub fn background() -> Self {
        Self {
            reset_session_window: false,
        }
    }
}

/// Why a session was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutReason {
    /// The user asked for it
    User,
    /// The persisted window was already over when it was read
    Expired,
    /// The access token could not be renewed
    RefreshFailed,
    /// The logout timer reached the session ceiling
    SessionCeiling,
}

impl LogoutReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogoutReason::User => "user",
            LogoutReason::Expired => "expired",
            LogoutReason::RefreshFailed => "refresh_failed",
            LogoutReason::SessionCeiling => "session_ceiling",
        }
    }
}

impl fmt::Display for LogoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
