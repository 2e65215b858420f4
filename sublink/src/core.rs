use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::CoreConfig;
use crate::traffic::{decode_samples, TrafficSample};

/// File name the subscription document is stored under
pub const SUBSCRIPTION_PROFILE: &str = "subscription.yaml";

const RECONNECT_DELAY: Duration = Duration::from_secs(3);

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Subscription download failed (HTTP {0})")]
    Subscription(u16),

    #[error("Proxy core rejected the request (HTTP {0})")]
    Rejected(u16),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Loads a remote profile into the proxy core
#[async_trait]
pub trait ProfileImporter: Send + Sync {
    async fn import_profile(&self, url: &str) -> Result<(), CoreError>;
}

/// Client for the proxy core's external controller
pub struct CoreController {
    http_client: Client,
    base_url: String,
    secret: Option<String>,
    profiles_dir: PathBuf,
}

impl CoreController {
    pub fn new(config: &CoreConfig, profiles_dir: PathBuf) -> Result<Self, CoreError> {
        // No overall timeout: the traffic endpoint streams indefinitely
        let http_client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http_client,
            base_url: format!("http://{}", Self::normalize_address(&config.controller)),
            secret: config.secret.clone().filter(|s| !s.is_empty()),
            profiles_dir: config.profiles_dir.clone().unwrap_or(profiles_dir),
        })
    }

    /// `:9090` and `9090` both mean the loopback interface
    pub fn normalize_address(address: &str) -> String {
        let address = address.trim();
        let address = address
            .strip_prefix("http://")
            .unwrap_or(address)
            .trim_end_matches('/');

        if let Some(port) = address.strip_prefix(':') {
            return format!("127.0.0.1:{}", port);
        }
        if !address.is_empty() && address.chars().all(|c| c.is_ascii_digit()) {
            return format!("127.0.0.1:{}", address);
        }
        address.to_string()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.secret {
            Some(secret) => request.bearer_auth(secret),
            None => request,
        }
    }

    /// One connection to the controller's `/traffic` stream
    pub async fn traffic_feed(&self) -> Result<BoxStream<'static, TrafficSample>, CoreError> {
        let resp = self
            .authorize(self.http_client.get(format!("{}/traffic", self.base_url)))
            .send()
            .await?
            .error_for_status()?;

        tracing::info!("Connected to proxy core traffic feed");
        Ok(decode_samples(resp.bytes_stream()))
    }

    /// Forwards samples into `tx`, reconnecting whenever the feed drops.
    /// Returns once the receiver is gone.
    pub async fn run_feed(&self, tx: mpsc::UnboundedSender<TrafficSample>) {
        loop {
            match self.traffic_feed().await {
                Ok(mut samples) => {
                    while let Some(sample) = samples.next().await {
                        if tx.send(sample).is_err() {
                            return;
                        }
                    }
                    tracing::info!("Traffic feed closed");
                }
                Err(e) => tracing::warn!(error = %e, "Could not connect to traffic feed"),
            }

            if tx.is_closed() {
                return;
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }
}

#[async_trait]
impl ProfileImporter for CoreController {
    async fn import_profile(&self, url: &str) -> Result<(), CoreError> {
        let resp = self.http_client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CoreError::Subscription(status.as_u16()));
        }
        let document = resp.bytes().await?;

        tokio::fs::create_dir_all(&self.profiles_dir).await?;
        let path = self.profiles_dir.join(SUBSCRIPTION_PROFILE);
        tokio::fs::write(&path, &document).await?;
        tracing::debug!(path = %path.display(), bytes = document.len(), "Subscription stored");

        let path = path
            .to_str()
            .ok_or_else(|| CoreError::Configuration("Profile path is not UTF-8".to_string()))?;
        let resp = self
            .authorize(
                self.http_client
                    .put(format!("{}/configs", self.base_url))
                    .query(&[("force", "true")])
                    .json(&json!({ "path": path })),
            )
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CoreError::Rejected(status.as_u16()));
        }

        tracing::info!("Proxy core loaded subscription profile");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Query, State},
        http::{HeaderMap, StatusCode},
        routing::{get, put},
        Json, Router,
    };
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[derive(Default)]
    struct CoreState {
        loaded: Mutex<Vec<(Option<String>, Value)>>,
    }

    async fn spawn_core() -> (String, Arc<CoreState>) {
        let state = Arc::new(CoreState::default());
        let app = Router::new()
            .route(
                "/traffic",
                get(|| async { "{\"up\":10,\"down\":20}\n{\"up\":30,\"down\":40}\n" }),
            )
            .route(
                "/configs",
                put(
                    |State(state): State<Arc<CoreState>>,
                     Query(query): Query<HashMap<String, String>>,
                     headers: HeaderMap,
                     Json(body): Json<Value>| async move {
                        let auth = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(String::from);
                        assert_eq!(query.get("force").map(String::as_str), Some("true"));
                        state.loaded.lock().push((auth, body));
                        StatusCode::NO_CONTENT
                    },
                ),
            )
            .route("/sub", get(|| async { "proxies: []\n" }))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr.to_string(), state)
    }

    fn controller(address: &str, dir: PathBuf) -> CoreController {
        let config = CoreConfig {
            controller: address.to_string(),
            secret: Some("s3cret".to_string()),
            profiles_dir: None,
        };
        CoreController::new(&config, dir).unwrap()
    }

    #[test]
    fn normalizes_controller_addresses() {
        assert_eq!(CoreController::normalize_address(":9090"), "127.0.0.1:9090");
        assert_eq!(CoreController::normalize_address("9090"), "127.0.0.1:9090");
        assert_eq!(
            CoreController::normalize_address("http://10.0.0.2:9097/"),
            "10.0.0.2:9097"
        );
        assert_eq!(
            CoreController::normalize_address("127.0.0.1:9097"),
            "127.0.0.1:9097"
        );
    }

    #[tokio::test]
    async fn traffic_feed_yields_samples() {
        let (address, _) = spawn_core().await;
        let dir = tempfile::tempdir().unwrap();
        let core = controller(&address, dir.path().to_path_buf());

        let samples: Vec<_> = core.traffic_feed().await.unwrap().collect().await;
        assert_eq!(
            samples,
            vec![
                TrafficSample { up: 10.0, down: 20.0 },
                TrafficSample { up: 30.0, down: 40.0 },
            ]
        );
    }

    #[tokio::test]
    async fn import_downloads_then_loads_profile() {
        let (address, state) = spawn_core().await;
        let dir = tempfile::tempdir().unwrap();
        let core = controller(&address, dir.path().to_path_buf());

        core.import_profile(&format!("http://{}/sub", address))
            .await
            .unwrap();

        let stored = std::fs::read_to_string(dir.path().join(SUBSCRIPTION_PROFILE)).unwrap();
        assert_eq!(stored, "proxies: []\n");

        let loaded = state.loaded.lock().clone();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0.as_deref(), Some("Bearer s3cret"));
        assert!(loaded[0].1["path"]
            .as_str()
            .unwrap()
            .ends_with(SUBSCRIPTION_PROFILE));
    }

    #[tokio::test]
    async fn failed_download_is_reported() {
        let (address, state) = spawn_core().await;
        let dir = tempfile::tempdir().unwrap();
        let core = controller(&address, dir.path().to_path_buf());

        let err = core
            .import_profile(&format!("http://{}/missing", address))
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::Subscription(404)));
        assert!(state.loaded.lock().is_empty());
    }
}
