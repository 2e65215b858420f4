use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use sublink_auth::AuthService;
use thiserror::Error;
use url::Url;

use crate::core::{CoreError, ProfileImporter};

pub const SUBSCRIPTION_PATH: &str = "/api/subscription";

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Access token is not a JWT")]
    MalformedToken,

    #[error("Access token has expired, please sign in again")]
    TokenExpired,

    #[error("Invalid subscription URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error(transparent)]
    Import(#[from] CoreError),
}

/// Outcome of one subscription import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyImportResult {
    pub success: bool,
    pub message: String,
    /// Subscription URL used, empty on failure
    pub url: String,
}

impl ProxyImportResult {
    fn failed(error: &SyncError) -> Self {
        Self {
            success: false,
            message: describe(error),
            url: String::new(),
        }
    }
}

fn describe(error: &SyncError) -> String {
    match error {
        SyncError::Import(CoreError::Subscription(403)) => {
            "Access denied (403): the subscription token was rejected, please sign in again"
                .to_string()
        }
        SyncError::Import(CoreError::Subscription(401)) | SyncError::NotAuthenticated => {
            format!("Authentication failed (401): {}", error)
        }
        SyncError::Import(CoreError::Subscription(404)) => {
            "Subscription endpoint not found (404), check the server configuration".to_string()
        }
        other => format!("Failed to import proxy nodes: {}", other),
    }
}

/// Builds `{base}/api/subscription?token=...` after checking the token is a
/// JWT that has not expired. An unreadable payload is tolerated.
pub fn subscription_url(
    base_url: &str,
    access_token: &str,
    now: DateTime<Utc>,
) -> Result<Url, SyncError> {
    let segments: Vec<&str> = access_token.split('.').collect();
    if segments.len() != 3 || segments.iter().any(|s| s.is_empty()) {
        return Err(SyncError::MalformedToken);
    }

    match token_expiry(segments[1]) {
        Some(exp) if now.timestamp() > exp => return Err(SyncError::TokenExpired),
        Some(_) => {}
        None => tracing::debug!("Access token carries no readable expiry"),
    }

    let mut url = Url::parse(base_url)?.join(SUBSCRIPTION_PATH)?;
    url.query_pairs_mut().append_pair("token", access_token);
    Ok(url)
}

fn token_expiry(payload: &str) -> Option<i64> {
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?;
    exp.as_i64().or_else(|| exp.as_f64().map(|f| f as i64))
}

/// Subscription URL with the token replaced, for logs
pub fn redact(url: &Url) -> String {
    let mut redacted = url.clone();
    redacted.set_query(Some("token=[TOKEN]"));
    redacted.to_string()
}

type ImportFuture = Shared<BoxFuture<'static, ProxyImportResult>>;

struct SyncSlot {
    generation: u64,
    in_flight: Option<ImportFuture>,
}

/// Imports the proxy subscription once per signed-in session.
///
/// Concurrent triggers share one import. The latch is set only by a
/// successful import of the current generation; [`ProxySync::reset`] starts a
/// new generation.
pub struct ProxySync {
    auth: Arc<AuthService>,
    importer: Arc<dyn ProfileImporter>,
    slot: Mutex<SyncSlot>,
    synced: AtomicBool,
}

impl ProxySync {
    pub fn new(auth: Arc<AuthService>, importer: Arc<dyn ProfileImporter>) -> Self {
        Self {
            auth,
            importer,
            slot: Mutex::new(SyncSlot {
                generation: 0,
                in_flight: None,
            }),
            synced: AtomicBool::new(false),
        }
    }

    /// Runs the import unless this session already synced. Returns `None`
    /// when there was nothing to do.
    pub async fn ensure_synced(&self) -> Option<ProxyImportResult> {
        let (pending, generation) = {
            let mut slot = self.slot.lock();
            if self.synced.load(Ordering::SeqCst) {
                return None;
            }
            let pending = match slot.in_flight.clone() {
                Some(pending) => pending,
                None => {
                    let pending = Self::import(self.auth.clone(), self.importer.clone())
                        .boxed()
                        .shared();
                    slot.in_flight = Some(pending.clone());
                    pending
                }
            };
            (pending, slot.generation)
        };

        let result = pending.clone().await;

        let mut slot = self.slot.lock();
        if slot.in_flight.as_ref().is_some_and(|p| p.ptr_eq(&pending)) {
            slot.in_flight = None;
        }
        if result.success && slot.generation == generation {
            self.synced.store(true, Ordering::SeqCst);
        }

        Some(result)
    }

    /// Forgets the latch and any import in flight
    pub fn reset(&self) {
        let mut slot = self.slot.lock();
        slot.generation += 1;
        slot.in_flight = None;
        self.synced.store(false, Ordering::SeqCst);
        tracing::debug!(generation = slot.generation, "Proxy sync reset");
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    async fn import(
        auth: Arc<AuthService>,
        importer: Arc<dyn ProfileImporter>,
    ) -> ProxyImportResult {
        let url = match Self::prepare(&auth) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot build subscription URL");
                return ProxyImportResult::failed(&e);
            }
        };

        tracing::info!(url = %redact(&url), "Importing proxy nodes");
        match importer.import_profile(url.as_str()).await {
            Ok(()) => {
                tracing::info!("Proxy nodes imported");
                ProxyImportResult {
                    success: true,
                    message: "Imported proxy nodes from subscription".to_string(),
                    url: url.to_string(),
                }
            }
            Err(e) => {
                let e = SyncError::from(e);
                tracing::error!(error = %e, "Proxy import failed");
                ProxyImportResult::failed(&e)
            }
        }
    }

    fn prepare(auth: &AuthService) -> Result<Url, SyncError> {
        if !auth.is_authenticated() {
            return Err(SyncError::NotAuthenticated);
        }
        let token = auth.access_token().ok_or(SyncError::NotAuthenticated)?;
        subscription_url(auth.client().base_url(), &token, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{jwt, RecordingImporter};
    use chrono::Duration;
    use secrecy::SecretString;
    use sublink_auth::testing::{MockAccountServer, MockReply};
    use sublink_auth::{AccountClient, AppIdentity, MemoryStore, SessionStore};

    async fn signed_in(server: &MockAccountServer, token: &str) -> Arc<AuthService> {
        server.set_login(MockReply::tokens(token, "refresh-1", 3_600));
        let client =
            AccountClient::new(server.base_url(), std::time::Duration::from_secs(5)).unwrap();
        let auth = Arc::new(AuthService::new(
            client,
            SessionStore::new(Arc::new(MemoryStore::new())),
            AppIdentity::Windows,
        ));
        auth.login("a@x.com", &SecretString::from("secret".to_string()))
            .await
            .unwrap();
        auth
    }

    #[test]
    fn builds_token_scoped_url() {
        let token = jwt(Utc::now() + Duration::hours(1));
        let url = subscription_url("https://api.example.com", &token, Utc::now()).unwrap();

        assert_eq!(url.path(), "/api/subscription");
        let (key, value) = url.query_pairs().next().unwrap();
        assert_eq!(key, "token");
        assert_eq!(value, token);
        assert!(!redact(&url).contains(&token));
    }

    #[test]
    fn rejects_non_jwt_tokens() {
        let err = subscription_url("https://api.example.com", "opaque", Utc::now()).unwrap_err();
        assert!(matches!(err, SyncError::MalformedToken));
    }

    #[test]
    fn rejects_expired_tokens() {
        let token = jwt(Utc::now() - Duration::minutes(1));
        let err = subscription_url("https://api.example.com", &token, Utc::now()).unwrap_err();
        assert!(matches!(err, SyncError::TokenExpired));
    }

    #[test]
    fn tolerates_unreadable_payload() {
        assert!(subscription_url("https://api.example.com", "a.%%%.c", Utc::now()).is_ok());
    }

    #[tokio::test]
    async fn concurrent_triggers_import_once() {
        let server = MockAccountServer::start().await;
        let auth = signed_in(&server, &jwt(Utc::now() + Duration::hours(1))).await;
        let importer = Arc::new(RecordingImporter::with_delay(
            std::time::Duration::from_millis(100),
        ));
        let sync = Arc::new(ProxySync::new(auth, importer.clone()));

        let (a, b, c) = tokio::join!(sync.ensure_synced(), sync.ensure_synced(), sync.ensure_synced());

        assert!(a.unwrap().success);
        assert!(b.unwrap().success);
        assert!(c.unwrap().success);
        assert_eq!(importer.calls(), 1);
        assert!(sync.is_synced());

        // Latched for the rest of the session
        assert!(sync.ensure_synced().await.is_none());
        assert_eq!(importer.calls(), 1);
    }

    #[tokio::test]
    async fn reset_allows_next_session_to_sync() {
        let server = MockAccountServer::start().await;
        let auth = signed_in(&server, &jwt(Utc::now() + Duration::hours(1))).await;
        let importer = Arc::new(RecordingImporter::default());
        let sync = ProxySync::new(auth, importer.clone());

        sync.ensure_synced().await;
        sync.reset();
        assert!(!sync.is_synced());
        sync.ensure_synced().await;
        sync.ensure_synced().await;

        assert_eq!(importer.calls(), 2);
    }

    #[tokio::test]
    async fn failure_leaves_latch_open() {
        let server = MockAccountServer::start().await;
        let auth = signed_in(&server, &jwt(Utc::now() + Duration::hours(1))).await;
        let importer = Arc::new(RecordingImporter::default());
        importer.fail_with(403);
        let sync = ProxySync::new(auth, importer.clone());

        let result = sync.ensure_synced().await.unwrap();
        assert!(!result.success);
        assert!(result.message.contains("403"));
        assert!(result.url.is_empty());
        assert!(!sync.is_synced());

        importer.succeed();
        assert!(sync.ensure_synced().await.unwrap().success);
        assert_eq!(importer.calls(), 2);
    }

    #[tokio::test]
    async fn import_started_before_reset_does_not_latch() {
        let server = MockAccountServer::start().await;
        let auth = signed_in(&server, &jwt(Utc::now() + Duration::hours(1))).await;
        let importer = Arc::new(RecordingImporter::with_delay(
            std::time::Duration::from_millis(100),
        ));
        let sync = Arc::new(ProxySync::new(auth, importer.clone()));

        let pending = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.ensure_synced().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        sync.reset();

        assert!(pending.await.unwrap().unwrap().success);
        assert!(!sync.is_synced());
    }

    #[tokio::test]
    async fn signed_out_sync_fails_without_import() {
        let server = MockAccountServer::start().await;
        let auth = signed_in(&server, &jwt(Utc::now() + Duration::hours(1))).await;
        auth.logout(true).await;
        let importer = Arc::new(RecordingImporter::default());
        let sync = ProxySync::new(auth, importer.clone());

        let result = sync.ensure_synced().await.unwrap();
        assert!(!result.success);
        assert_eq!(importer.calls(), 0);
    }
}
