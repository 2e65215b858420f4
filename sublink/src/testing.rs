use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;
use std::time::Duration;

use crate::core::{CoreError, ProfileImporter};

/// Unsigned JWT-shaped token expiring at `exp`
pub fn jwt(exp: DateTime<Utc>) -> String {
    let header = URL_SAFE_NO_PAD.encode(json!({"alg": "HS256", "typ": "JWT"}).to_string());
    let claims = URL_SAFE_NO_PAD.encode(
        json!({"sub": "a@x.com", "iat": Utc::now().timestamp(), "exp": exp.timestamp()})
            .to_string(),
    );
    format!("{}.{}.signature", header, claims)
}

/// Importer that records URLs instead of talking to a proxy core
#[derive(Default)]
pub struct RecordingImporter {
    urls: Mutex<Vec<String>>,
    delay: Duration,
    failure: Mutex<Option<u16>>,
}

impl RecordingImporter {
    /// Every import takes `delay` before completing
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Subsequent imports fail as if the subscription returned `status`
    pub fn fail_with(&self, status: u16) {
        *self.failure.lock() = Some(status);
    }

    pub fn succeed(&self) {
        *self.failure.lock() = None;
    }

    pub fn calls(&self) -> usize {
        self.urls.lock().len()
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }
}

#[async_trait]
impl ProfileImporter for RecordingImporter {
    async fn import_profile(&self, url: &str) -> Result<(), CoreError> {
        self.urls.lock().push(url.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match *self.failure.lock() {
            Some(status) => Err(CoreError::Subscription(status)),
            None => Ok(()),
        }
    }
}
