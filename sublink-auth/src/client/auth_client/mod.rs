mod models;

pub use models::{ErrorBody, Outcome};
use models::*;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, Request, Response, StatusCode};
use std::time::Duration;

use crate::client::app_identity::AppIdentity;
use crate::client::config::Settings;
use crate::common::{TokenGrant, TokenResponse};
use crate::error::AuthError;

pub const LOGIN_PATH: &str = "/api/auth/login";
pub const REFRESH_PATH: &str = "/api/auth/refresh";
pub const LOGOUT_PATH: &str = "/api/auth/logout";

/// HTTP client for the account service
#[derive(Clone)]
pub struct AccountClient {
    http_client: Client,
    base_url: String,
}

impl AccountClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AuthError> {
        let http_client = Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();

        Ok(Self {
            http_client,
            base_url,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, AuthError> {
        Self::new(settings.base_url(), settings.request_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Underlying client, for building requests handed to [`Self::execute`]
    pub fn http(&self) -> &Client {
        &self.http_client
    }

    pub async fn login(
        &self,
        email: &str,
        password: &str,
        app_id: AppIdentity,
    ) -> Result<TokenGrant, AuthError> {
        let req = LoginRequest {
            email,
            password,
            app_id: app_id.as_str(),
        };

        let resp = self
            .http_client
            .post(self.url(LOGIN_PATH))
            .json(&req)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Self::read_grant(resp).await;
        }

        Err(match status.as_u16() {
            401 => AuthError::InvalidCredentials,
            400 => AuthError::BadRequest(
                Self::error_detail(resp)
                    .await
                    .unwrap_or_else(|| "Invalid request".to_string()),
            ),
            s if s >= 500 => AuthError::ServerError(s),
            s => AuthError::UnexpectedStatus(s),
        })
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        let req = RefreshRequest { refresh_token };

        let resp = self
            .http_client
            .post(self.url(REFRESH_PATH))
            .json(&req)
            .send()
            .await?;

        match resp.status() {
            status if status.is_success() => Self::read_grant(resp).await,
            StatusCode::UNAUTHORIZED => Err(AuthError::RefreshExpired),
            status if status.is_server_error() => Err(AuthError::ServerError(status.as_u16())),
            status => Err(AuthError::UnexpectedStatus(status.as_u16())),
        }
    }

    /// Invalidates the session server side. Without `app_id` every device of
    /// the user is signed out.
    pub async fn logout(
        &self,
        access_token: &str,
        app_id: Option<AppIdentity>,
    ) -> Result<(), AuthError> {
        let mut request = self
            .http_client
            .post(self.url(LOGOUT_PATH))
            .bearer_auth(access_token);
        if let Some(app_id) = app_id {
            request = request.query(&[("appId", app_id.as_str())]);
        }

        let resp = request.send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Self::failure(resp).await)
        }
    }

    /// Sends `request` with `access_token` as bearer credential
    pub async fn execute(&self, mut request: Request, access_token: &str) -> Outcome {
        let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", access_token)) else {
            return Outcome::Failed(AuthError::ProtocolError(
                "Access token is not a valid header value".to_string(),
            ));
        };
        request.headers_mut().insert(AUTHORIZATION, value);

        match self.http_client.execute(request).await {
            Err(e) => Outcome::Failed(e.into()),
            Ok(resp) if resp.status() == StatusCode::UNAUTHORIZED => Outcome::Unauthorized,
            Ok(resp) if resp.status().is_success() => Outcome::Success(resp),
            Ok(resp) => Outcome::Failed(Self::failure(resp).await),
        }
    }

    async fn read_grant(resp: Response) -> Result<TokenGrant, AuthError> {
        let body = resp.bytes().await?;
        let tokens: TokenResponse = serde_json::from_slice(&body).map_err(|e| {
            tracing::error!(error = %e, body_len = body.len(), "Token response is not valid JSON");
            AuthError::ProtocolError(format!("Malformed token response: {}", e))
        })?;
        tokens.into_grant().inspect_err(|e| {
            tracing::error!(error = %e, "Token response is missing mandatory fields");
        })
    }

    async fn error_detail(resp: Response) -> Option<String> {
        resp.json::<ErrorBody>().await.ok().and_then(ErrorBody::detail)
    }

    async fn failure(resp: Response) -> AuthError {
        match resp.status().as_u16() {
            400 => AuthError::BadRequest(Self::error_detail(resp).await.unwrap_or_default()),
            401 => AuthError::Unauthorized,
            s if s >= 500 => AuthError::ServerError(s),
            s => AuthError::UnexpectedStatus(s),
        }
    }
}
