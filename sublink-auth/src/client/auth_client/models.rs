use serde::{Deserialize, Serialize};

use crate::error::AuthError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
    pub app_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Error payload; the service uses `error`, some proxies use `message`
#[derive(Debug, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ErrorBody {
    pub fn detail(self) -> Option<String> {
        self.error
            .or(self.message)
            .filter(|detail| !detail.trim().is_empty())
    }
}

/// Result of one bearer-authenticated call.
///
/// `Unauthorized` is kept apart from other failures so the retry-once policy
/// is a plain match instead of error inspection.
#[derive(Debug)]
pub enum Outcome {
    Success(reqwest::Response),
    Unauthorized,
    Failed(AuthError),
}
