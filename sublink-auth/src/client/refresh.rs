use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::client::auth_client::AccountClient;
use crate::client::token_storage::SessionStore;
use crate::common::Session;
use crate::error::AuthError;

type RefreshFuture = Shared<BoxFuture<'static, Result<Session, AuthError>>>;

/// Exchanges refresh tokens, at most one exchange at a time.
///
/// Callers arriving while an exchange is pending await the same future and
/// receive the same result. Refresh tokens are single use on the server, so a
/// second concurrent exchange with the old token would fail and look like an
/// expired session.
pub struct RefreshCoordinator {
    client: AccountClient,
    store: SessionStore,
    in_flight: Mutex<Option<RefreshFuture>>,
}

impl RefreshCoordinator {
    pub fn new(client: AccountClient, store: SessionStore) -> Self {
        Self {
            client,
            store,
            in_flight: Mutex::new(None),
        }
    }

    /// Refreshes `current`, or joins the exchange already in progress.
    ///
    /// Returns [`AuthError::RefreshExpired`] when the server rejects the
    /// refresh token and [`AuthError::RefreshFailed`] for everything else.
    pub async fn refresh(&self, current: &Session) -> Result<Session, AuthError> {
        let pending = {
            let mut slot = self.in_flight.lock();
            match slot.clone() {
                Some(pending) => {
                    tracing::debug!("Joining in-flight token refresh");
                    pending
                }
                None => {
                    let pending = Self::exchange(
                        self.client.clone(),
                        self.store.clone(),
                        current.clone(),
                    )
                    .boxed()
                    .shared();
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };

        let result = pending.clone().await;

        let mut slot = self.in_flight.lock();
        if slot.as_ref().is_some_and(|p| p.ptr_eq(&pending)) {
            *slot = None;
        }

        result
    }

    pub fn is_refreshing(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    async fn exchange(
        client: AccountClient,
        store: SessionStore,
        current: Session,
    ) -> Result<Session, AuthError> {
        tracing::info!("Refreshing access token");

        let grant = match client.refresh(&current.refresh_token).await {
            Ok(grant) => grant,
            Err(AuthError::RefreshExpired) => {
                tracing::warn!("Refresh token rejected by server");
                return Err(AuthError::RefreshExpired);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Token refresh failed");
                return Err(AuthError::RefreshFailed(e.to_string()));
            }
        };

        let session = grant.into_session(Utc::now(), current.user);
        store
            .save(&session)
            .map_err(|e| AuthError::RefreshFailed(e.to_string()))?;

        tracing::info!(expires_in = session.expires_in_secs, "Token refreshed");
        Ok(session)
    }
}
