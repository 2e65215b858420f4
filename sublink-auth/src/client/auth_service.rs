use chrono::{Duration, Utc};
use reqwest::{Method, Request, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::watch;

use crate::client::app_identity::AppIdentity;
use crate::client::auth_client::{AccountClient, Outcome};
use crate::client::refresh::RefreshCoordinator;
use crate::client::token_storage::SessionStore;
use crate::common::{Session, User};
use crate::error::AuthError;

/// Tokens this close to expiry (seconds) are refreshed before use
pub const REFRESH_LOOKAHEAD_SECS: i64 = 5 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Refreshing,
}

/// Snapshot published to subscribers on every transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthState {
    pub phase: AuthPhase,
    pub session: Option<Session>,
    /// Restored session whose recorded expiry has already passed
    pub possibly_stale: bool,
    /// Signed out because the server no longer honours the session
    pub expired: bool,
}

impl AuthState {
    fn signed_out(expired: bool) -> Self {
        Self {
            phase: AuthPhase::Unauthenticated,
            session: None,
            possibly_stale: false,
            expired,
        }
    }

    fn signed_in(session: Session, possibly_stale: bool) -> Self {
        Self {
            phase: AuthPhase::Authenticated,
            session: Some(session),
            possibly_stale,
            expired: false,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.phase, AuthPhase::Authenticated | AuthPhase::Refreshing)
            && self.session.is_some()
    }
}

/// Owns the session: login, logout, validation and authorized requests.
pub struct AuthService {
    client: AccountClient,
    store: SessionStore,
    refresher: RefreshCoordinator,
    identity: AppIdentity,
    state: watch::Sender<AuthState>,
}

impl AuthService {
    /// Builds the service around whatever session storage holds. No network
    /// I/O happens here; an expired restored session is only flagged.
    pub fn new(client: AccountClient, store: SessionStore, identity: AppIdentity) -> Self {
        let initial = match store.restore() {
            Some(mut session) => {
                let stale = session.is_expired_at(Utc::now());
                if let Some(user) = session.user.as_mut() {
                    user.app_id = Some(identity);
                }
                tracing::info!(possibly_stale = stale, "Restored stored session");
                AuthState::signed_in(session, stale)
            }
            None => {
                if let Err(e) = store.clear() {
                    tracing::warn!(error = %e, "Failed to clear unusable session storage");
                }
                AuthState::signed_out(false)
            }
        };

        let (state, _) = watch::channel(initial);
        let refresher = RefreshCoordinator::new(client.clone(), store.clone());

        Self {
            client,
            store,
            refresher,
            identity,
            state,
        }
    }

    pub async fn login(&self, email: &str, password: &SecretString) -> Result<User, AuthError> {
        let email = email.trim();
        if email.is_empty() || password.expose_secret().is_empty() {
            return Err(AuthError::BadRequest(
                "Email and password are required".to_string(),
            ));
        }

        self.state.send_replace(AuthState {
            phase: AuthPhase::Authenticating,
            ..AuthState::signed_out(false)
        });
        tracing::info!(app_id = %self.identity, "Logging in");

        let grant = match self
            .client
            .login(email, password.expose_secret(), self.identity)
            .await
        {
            Ok(grant) => grant,
            Err(e) => {
                tracing::warn!(error = %e, "Login failed");
                self.clear_local(false);
                return Err(e);
            }
        };

        let now = Utc::now();
        let user = User {
            email: Some(email.to_string()),
            login_time: now,
            app_id: Some(self.identity),
        };
        let session = grant.into_session(now, Some(user.clone()));

        if let Err(e) = self.store.save(&session) {
            tracing::error!(error = %e, "Failed to persist session");
            self.clear_local(false);
            return Err(e);
        }

        tracing::info!(expires_in = session.expires_in_secs, "Login successful");
        self.state.send_replace(AuthState::signed_in(session, false));
        Ok(user)
    }

    /// Signs out locally no matter what the server says. Without
    /// `all_devices` only this app identity's session is revoked remotely.
    pub async fn logout(&self, all_devices: bool) {
        if let Some(token) = self.access_token() {
            let app_id = (!all_devices).then_some(self.identity);
            match self.client.logout(&token, app_id).await {
                Ok(()) => tracing::info!(all_devices, "Remote logout succeeded"),
                Err(e) => tracing::warn!(error = %e, "Remote logout failed, clearing local session"),
            }
        }
        self.clear_local(false);
    }

    /// True when a usable session exists, refreshing it first if it expires
    /// within [`REFRESH_LOOKAHEAD_SECS`].
    pub async fn validate_session(&self) -> bool {
        let Some(session) = self.session() else {
            return false;
        };
        if session.access_token.is_empty() {
            return false;
        }
        if !session.expires_within(Utc::now(), Duration::seconds(REFRESH_LOOKAHEAD_SECS)) {
            return true;
        }

        tracing::debug!("Access token near expiry, refreshing");
        match self.refresh_session(&session).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Session validation failed");
                if self.is_current(&session) {
                    self.clear_local(true);
                }
                false
            }
        }
    }

    /// Sends `request` with the current bearer token. A 401 triggers one
    /// refresh and one retry; a second 401 is returned as
    /// [`AuthError::Unauthorized`].
    pub async fn send_authorized(&self, request: Request) -> Result<Response, AuthError> {
        let session = self.session().ok_or(AuthError::NotAuthenticated)?;
        let retry = request.try_clone();

        match self.client.execute(request, &session.access_token).await {
            Outcome::Success(resp) => return Ok(resp),
            Outcome::Failed(e) => return Err(e),
            Outcome::Unauthorized => {}
        }

        let Some(retry) = retry else {
            tracing::warn!("Unauthorized request has a streaming body, not retrying");
            return Err(AuthError::Unauthorized);
        };

        tracing::debug!("Request unauthorized, refreshing token");
        let fresh = match self.refresh_session(&session).await {
            Ok(fresh) => fresh,
            Err(AuthError::RefreshExpired) => return Err(AuthError::RefreshExpired),
            Err(e) => {
                tracing::debug!(error = %e, "Keeping stale session after failed refresh");
                return Err(AuthError::Unauthorized);
            }
        };

        match self.client.execute(retry, &fresh.access_token).await {
            Outcome::Success(resp) => Ok(resp),
            Outcome::Unauthorized => {
                tracing::warn!("Request still unauthorized after refresh");
                Err(AuthError::Unauthorized)
            }
            Outcome::Failed(e) => Err(e),
        }
    }

    /// Request builder for an account service path, for use with
    /// [`Self::send_authorized`]
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.http().request(method, self.client.url(path))
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated()
    }

    pub fn current_user(&self) -> Option<User> {
        self.state
            .borrow()
            .session
            .as_ref()
            .and_then(|s| s.user.clone())
    }

    pub fn access_token(&self) -> Option<String> {
        self.state
            .borrow()
            .session
            .as_ref()
            .map(|s| s.access_token.clone())
    }

    pub fn session(&self) -> Option<Session> {
        self.state.borrow().session.clone()
    }

    pub fn state(&self) -> AuthState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    pub fn identity(&self) -> AppIdentity {
        self.identity
    }

    pub fn client(&self) -> &AccountClient {
        &self.client
    }

    pub fn is_refreshing(&self) -> bool {
        self.refresher.is_refreshing()
    }

    /// Replaces `stale` with a refreshed session, unless another caller
    /// already did.
    async fn refresh_session(&self, stale: &Session) -> Result<Session, AuthError> {
        match self.session() {
            None => return Err(AuthError::NotAuthenticated),
            Some(current) if current.access_token != stale.access_token => return Ok(current),
            Some(_) => {}
        }

        self.state.send_if_modified(|s| {
            if s.phase == AuthPhase::Authenticated {
                s.phase = AuthPhase::Refreshing;
                true
            } else {
                false
            }
        });

        match self.refresher.refresh(stale).await {
            Ok(fresh) => self.apply_refreshed(stale, fresh),
            Err(AuthError::RefreshExpired) => {
                if self.is_current(stale) {
                    tracing::warn!("Session expired, signing out");
                    self.clear_local(true);
                }
                Err(AuthError::RefreshExpired)
            }
            Err(e) => {
                self.state.send_if_modified(|s| {
                    if s.phase == AuthPhase::Refreshing {
                        s.phase = AuthPhase::Authenticated;
                        true
                    } else {
                        false
                    }
                });
                Err(e)
            }
        }
    }

    fn apply_refreshed(&self, stale: &Session, fresh: Session) -> Result<Session, AuthError> {
        let applied = self.state.send_if_modified(|s| {
            let ours = s.session.as_ref().is_some_and(|current| {
                current.refresh_token == stale.refresh_token
                    || current.access_token == fresh.access_token
            });
            if ours {
                s.phase = AuthPhase::Authenticated;
                s.session = Some(fresh.clone());
                s.possibly_stale = false;
            }
            ours
        });
        if applied {
            return Ok(fresh);
        }

        // Signed out or signed in again while the exchange was running; the
        // coordinator already wrote the refreshed tokens, so put storage back.
        match self.session() {
            Some(current) => {
                self.store.save(&current)?;
                Ok(current)
            }
            None => {
                self.store.clear()?;
                Err(AuthError::NotAuthenticated)
            }
        }
    }

    fn is_current(&self, session: &Session) -> bool {
        self.state
            .borrow()
            .session
            .as_ref()
            .is_some_and(|s| s.refresh_token == session.refresh_token)
    }

    fn clear_local(&self, expired: bool) {
        if let Err(e) = self.store.clear() {
            tracing::error!(error = %e, "Failed to clear session storage");
        }
        self.state.send_replace(AuthState::signed_out(expired));
    }
}
