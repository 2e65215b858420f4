use chrono::{DateTime, Duration, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::client::app_identity::AppIdentity;
use crate::error::AuthError;

/// Expiry assumed when the server omits or garbles `expiresIn` (3 hours).
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 10_800;
pub const DEFAULT_TOKEN_TYPE: &str = "Bearer";
/// Longest token lifetime taken at face value (one year)
pub const MAX_EXPIRES_IN_SECS: u64 = 365 * 24 * 60 * 60;

/// Lightweight profile of the signed-in user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub email: Option<String>,
    pub login_time: DateTime<Utc>,
    pub app_id: Option<AppIdentity>,
}

/// The authenticated identity state.
///
/// A `Session` only exists while authenticated, so both tokens are always
/// non-empty; construction goes through [`TokenGrant`] which enforces that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub issued_at: DateTime<Utc>,
    pub expires_in_secs: u64,
    pub user: Option<User>,
}

impl Session {
    /// Saturates at the latest representable instant
    pub fn expires_at(&self) -> DateTime<Utc> {
        i64::try_from(self.expires_in_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|lifetime| self.issued_at.checked_add_signed(lifetime))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// True once the elapsed time since issuance exceeds the recorded expiry
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }

    /// True when `now` is inside the `window` leading up to expiry (or past it)
    pub fn expires_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        let expires_at = self.expires_at();
        let threshold = expires_at.checked_sub_signed(window).unwrap_or(expires_at);
        now > threshold
    }

    pub fn email(&self) -> Option<&str> {
        self.user.as_ref().and_then(|u| u.email.as_deref())
    }
}

/// Token payload as the account service sends it.
///
/// Every field is optional here; [`TokenResponse::into_grant`] decides what is
/// mandatory.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default, alias = "expires_in")]
    pub expires_in: Option<serde_json::Value>,
}

impl TokenResponse {
    pub fn into_grant(self) -> Result<TokenGrant, AuthError> {
        let access_token = self
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::ProtocolError("Missing accessToken in response".into()))?;
        let refresh_token = self
            .refresh_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::ProtocolError("Missing refreshToken in response".into()))?;

        Ok(TokenGrant {
            access_token,
            refresh_token,
            token_type: self
                .token_type
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_string()),
            expires_in_secs: normalize_expires_in(self.expires_in.as_ref()),
        })
    }
}

/// Normalized token pair with defaults applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in_secs: u64,
}

impl TokenGrant {
    pub fn into_session(self, issued_at: DateTime<Utc>, user: Option<User>) -> Session {
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            token_type: self.token_type,
            issued_at,
            expires_in_secs: self.expires_in_secs,
            user,
        }
    }
}

/// Accepts a positive integer or numeric string; anything else falls back to
/// [`DEFAULT_EXPIRES_IN_SECS`].
pub fn normalize_expires_in(value: Option<&serde_json::Value>) -> u64 {
    let parsed = match value {
        Some(serde_json::Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 1.0).map(|f| f as u64)),
        Some(serde_json::Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    parsed
        .filter(|secs| is_valid_expires_in(*secs))
        .unwrap_or(DEFAULT_EXPIRES_IN_SECS)
}

/// Lifetimes outside `1..=MAX_EXPIRES_IN_SECS` are replaced by the default
pub fn is_valid_expires_in(secs: u64) -> bool {
    (1..=MAX_EXPIRES_IN_SECS).contains(&secs)
}
