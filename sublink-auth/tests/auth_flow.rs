use reqwest::Method;
use secrecy::SecretString;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use sublink_auth::testing::{MockAccountServer, MockReply, PROTECTED_PATH};
use sublink_auth::{
    keys, AccountClient, AppIdentity, AuthError, AuthPhase, AuthService, KeyValueStore,
    MemoryStore, Session, SessionStore,
};

fn service(server: &MockAccountServer, kv: Arc<MemoryStore>) -> Arc<AuthService> {
    let client = AccountClient::new(server.base_url(), Duration::from_secs(5)).unwrap();
    Arc::new(AuthService::new(
        client,
        SessionStore::new(kv),
        AppIdentity::Windows,
    ))
}

fn secret(value: &str) -> SecretString {
    SecretString::from(value.to_string())
}

/// Puts a session issued `age` ago straight into storage
fn seed_session(kv: &Arc<MemoryStore>, access: &str, refresh: &str, age: chrono::Duration) {
    let session = Session {
        access_token: access.to_string(),
        refresh_token: refresh.to_string(),
        token_type: "Bearer".to_string(),
        issued_at: chrono::Utc::now() - age,
        expires_in_secs: 3_600,
        user: None,
    };
    SessionStore::new(kv.clone()).save(&session).unwrap();
}

#[tokio::test]
async fn test_login_persists_session() {
    let server = MockAccountServer::start().await;
    server.set_login(MockReply::tokens("t1", "r1", 3_600));
    let kv = Arc::new(MemoryStore::new());
    let auth = service(&server, kv.clone());

    let user = auth.login("a@x.com", &secret("secret")).await.unwrap();

    assert!(auth.is_authenticated());
    assert_eq!(user.email.as_deref(), Some("a@x.com"));
    assert_eq!(user.app_id, Some(AppIdentity::Windows));
    assert_eq!(auth.access_token().as_deref(), Some("t1"));
    assert_eq!(kv.get(keys::EXPIRES_IN).unwrap().as_deref(), Some("3600"));
    assert_eq!(kv.get(keys::AUTHENTICATED).unwrap().as_deref(), Some("true"));

    // The server sees the app identity
    let body = server.last_login_body().unwrap();
    assert_eq!(
        body,
        json!({"email": "a@x.com", "password": "secret", "appId": "app_windows_v1"})
    );
}

#[tokio::test]
async fn test_login_without_expiry_defaults_to_three_hours() {
    let server = MockAccountServer::start().await;
    server.set_login(MockReply::json(
        200,
        json!({"accessToken": "t1", "refreshToken": "r1"}),
    ));
    let kv = Arc::new(MemoryStore::new());
    let auth = service(&server, kv.clone());

    auth.login("a@x.com", &secret("secret")).await.unwrap();

    assert_eq!(auth.session().unwrap().expires_in_secs, 10_800);
    assert_eq!(kv.get(keys::EXPIRES_IN).unwrap().as_deref(), Some("10800"));
}

#[tokio::test]
async fn test_login_with_absurd_expiry_survives_restart() {
    let server = MockAccountServer::start().await;
    server.set_login(MockReply::json(
        200,
        json!({"accessToken": "t1", "refreshToken": "r1", "expiresIn": 10_000_000_000_000_000u64}),
    ));
    let kv = Arc::new(MemoryStore::new());
    let auth = service(&server, kv.clone());

    auth.login("a@x.com", &secret("secret")).await.unwrap();
    assert_eq!(auth.session().unwrap().expires_in_secs, 10_800);
    assert!(auth.validate_session().await);

    // Restart from the same storage
    let restarted = service(&server, kv);
    assert!(restarted.is_authenticated());
    assert!(restarted.validate_session().await);
    assert_eq!(server.refresh_calls(), 0);
}

#[tokio::test]
async fn test_login_error_taxonomy() {
    let server = MockAccountServer::start().await;
    let auth = service(&server, Arc::new(MemoryStore::new()));

    server.set_login(MockReply::status(401));
    let err = auth.login("a@x.com", &secret("wrong")).await.unwrap_err();
    assert_eq!(err, AuthError::InvalidCredentials);

    server.set_login(MockReply::json(400, json!({"error": "Email is not registered"})));
    let err = auth.login("a@x.com", &secret("secret")).await.unwrap_err();
    assert_eq!(err, AuthError::BadRequest("Email is not registered".into()));
    assert_eq!(err.user_message(), "Email is not registered");

    server.set_login(MockReply::status(503));
    let err = auth.login("a@x.com", &secret("secret")).await.unwrap_err();
    assert_eq!(err, AuthError::ServerError(503));

    server.set_login(MockReply::json(200, json!({"refreshToken": "r1"})));
    let err = auth.login("a@x.com", &secret("secret")).await.unwrap_err();
    assert!(matches!(err, AuthError::ProtocolError(ref m) if m.contains("accessToken")));

    assert!(!auth.is_authenticated());
    assert_eq!(auth.state().phase, AuthPhase::Unauthenticated);
}

#[tokio::test]
async fn test_login_network_failure() {
    // Bind then drop a listener so the port is closed
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = AccountClient::new(format!("http://{}", addr), Duration::from_secs(2)).unwrap();
    let auth = AuthService::new(
        client,
        SessionStore::new(Arc::new(MemoryStore::new())),
        AppIdentity::Browser,
    );

    let err = auth.login("a@x.com", &secret("secret")).await.unwrap_err();
    assert!(err.is_network(), "unexpected error: {err:?}");
    assert!(!auth.is_authenticated());
}

#[tokio::test]
async fn test_empty_credentials_never_reach_server() {
    let server = MockAccountServer::start().await;
    let auth = service(&server, Arc::new(MemoryStore::new()));

    let err = auth.login("  ", &secret("secret")).await.unwrap_err();
    assert!(matches!(err, AuthError::BadRequest(_)));
    assert_eq!(server.login_calls(), 0);
}

#[tokio::test]
async fn test_logout_scopes_to_app_identity() {
    let server = MockAccountServer::start().await;
    let kv = Arc::new(MemoryStore::new());
    let auth = service(&server, kv.clone());

    auth.login("a@x.com", &secret("secret")).await.unwrap();
    auth.logout(false).await;

    auth.login("a@x.com", &secret("secret")).await.unwrap();
    auth.logout(true).await;

    assert_eq!(
        server.logout_app_ids(),
        vec![Some("app_windows_v1".to_string()), None]
    );
    assert!(!auth.is_authenticated());
    assert!(kv.get(keys::ACCESS_TOKEN).unwrap().is_none());
}

#[tokio::test]
async fn test_logout_clears_even_when_server_fails() {
    let server = MockAccountServer::start().await;
    server.set_logout(MockReply::status(500));
    let kv = Arc::new(MemoryStore::new());
    let auth = service(&server, kv.clone());

    auth.login("a@x.com", &secret("secret")).await.unwrap();
    auth.logout(false).await;

    assert_eq!(server.logout_calls(), 1);
    assert!(!auth.is_authenticated());
    assert!(SessionStore::new(kv).restore().is_none());
}

#[tokio::test]
async fn test_restore_is_offline_and_flags_stale() {
    let server = MockAccountServer::start().await;
    let kv = Arc::new(MemoryStore::new());
    seed_session(&kv, "old", "r-old", chrono::Duration::hours(2));

    let auth = service(&server, kv);

    assert!(auth.is_authenticated());
    assert!(auth.state().possibly_stale);
    assert_eq!(server.refresh_calls(), 0);
}

#[tokio::test]
async fn test_validate_refreshes_near_expiry() {
    let server = MockAccountServer::start().await;
    let kv = Arc::new(MemoryStore::new());
    // 58 minutes into a one hour token
    seed_session(&kv, "old", "r-old", chrono::Duration::minutes(58));
    let auth = service(&server, kv.clone());

    assert!(auth.validate_session().await);

    assert_eq!(server.refresh_tokens(), vec!["r-old".to_string()]);
    assert_eq!(auth.access_token().as_deref(), Some("access-2"));
    assert!(!auth.state().possibly_stale);
    assert_eq!(
        kv.get(keys::REFRESH_TOKEN).unwrap().as_deref(),
        Some("refresh-2")
    );
}

#[tokio::test]
async fn test_validate_skips_refresh_for_fresh_token() {
    let server = MockAccountServer::start().await;
    let kv = Arc::new(MemoryStore::new());
    seed_session(&kv, "fresh", "r-fresh", chrono::Duration::minutes(1));
    let auth = service(&server, kv);

    assert!(auth.validate_session().await);
    assert_eq!(server.refresh_calls(), 0);
}

#[tokio::test]
async fn test_validate_clears_session_when_refresh_fails() {
    let server = MockAccountServer::start().await;
    server.set_refresh(MockReply::status(502));
    let kv = Arc::new(MemoryStore::new());
    seed_session(&kv, "old", "r-old", chrono::Duration::hours(2));
    let auth = service(&server, kv.clone());

    assert!(!auth.validate_session().await);
    assert!(!auth.is_authenticated());
    assert!(kv.get(keys::ACCESS_TOKEN).unwrap().is_none());
}

#[tokio::test]
async fn test_refresh_expired_forces_logout() {
    let server = MockAccountServer::start().await;
    server.set_refresh(MockReply::status(401));
    let kv = Arc::new(MemoryStore::new());
    let auth = service(&server, kv.clone());
    auth.login("a@x.com", &secret("secret")).await.unwrap();
    let mut changes = auth.subscribe();

    server.revoke_token("access-1");
    let request = auth.request(Method::GET, PROTECTED_PATH).build().unwrap();
    let err = auth.send_authorized(request).await.unwrap_err();

    assert_eq!(err, AuthError::RefreshExpired);
    assert!(!auth.is_authenticated());
    for key in keys::SESSION {
        assert!(kv.get(key).unwrap().is_none(), "{key} left in storage");
    }

    // Subscribers learn why the session ended
    changes.changed().await.unwrap();
    let state = changes.borrow_and_update().clone();
    assert_eq!(state.phase, AuthPhase::Unauthenticated);
    assert!(state.expired);
}

#[tokio::test]
async fn test_unauthorized_request_is_retried_once() {
    let server = MockAccountServer::start().await;
    let auth = service(&server, Arc::new(MemoryStore::new()));
    auth.login("a@x.com", &secret("secret")).await.unwrap();

    server.revoke_token("access-1");
    let request = auth.request(Method::GET, PROTECTED_PATH).build().unwrap();
    let resp = auth.send_authorized(request).await.unwrap();

    assert!(resp.status().is_success());
    assert_eq!(server.protected_calls(), 2);
    assert_eq!(server.refresh_calls(), 1);
    assert_eq!(auth.access_token().as_deref(), Some("access-2"));
}

#[tokio::test]
async fn test_second_unauthorized_propagates() {
    let server = MockAccountServer::start().await;
    let auth = service(&server, Arc::new(MemoryStore::new()));
    auth.login("a@x.com", &secret("secret")).await.unwrap();

    // Refreshed tokens are not honoured either
    server.revoke_token("access-1");
    server.set_auto_accept(false);

    let request = auth.request(Method::GET, PROTECTED_PATH).build().unwrap();
    let err = auth.send_authorized(request).await.unwrap_err();

    assert_eq!(err, AuthError::Unauthorized);
    assert_eq!(server.protected_calls(), 2);
    assert_eq!(server.refresh_calls(), 1);
    // Not a refresh expiry, so the user stays signed in
    assert!(auth.is_authenticated());
}

#[tokio::test]
async fn test_failed_transparent_refresh_keeps_session() {
    let server = MockAccountServer::start().await;
    server.set_refresh(MockReply::status(500));
    let auth = service(&server, Arc::new(MemoryStore::new()));
    auth.login("a@x.com", &secret("secret")).await.unwrap();

    server.revoke_token("access-1");
    let request = auth.request(Method::GET, PROTECTED_PATH).build().unwrap();
    let err = auth.send_authorized(request).await.unwrap_err();

    assert_eq!(err, AuthError::Unauthorized);
    assert!(auth.is_authenticated());
    assert_eq!(auth.access_token().as_deref(), Some("access-1"));
    assert_eq!(auth.state().phase, AuthPhase::Authenticated);
}

#[tokio::test]
async fn test_concurrent_unauthorized_requests_share_one_refresh() {
    let server = MockAccountServer::start().await;
    server.set_refresh_delay(Duration::from_millis(200));
    let auth = service(&server, Arc::new(MemoryStore::new()));
    auth.login("a@x.com", &secret("secret")).await.unwrap();
    server.revoke_token("access-1");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let auth = auth.clone();
        handles.push(tokio::spawn(async move {
            let request = auth.request(Method::GET, PROTECTED_PATH).build().unwrap();
            auth.send_authorized(request).await.map(|r| r.status())
        }));
    }

    for handle in handles {
        let status = handle.await.unwrap().unwrap();
        assert!(status.is_success());
    }

    assert_eq!(server.refresh_calls(), 1);
    assert_eq!(server.refresh_tokens(), vec!["refresh-1".to_string()]);
    assert_eq!(auth.access_token().as_deref(), Some("access-2"));
    assert!(!auth.is_refreshing());
}

#[tokio::test]
async fn test_logout_during_refresh_wins() {
    let server = MockAccountServer::start().await;
    server.set_refresh_delay(Duration::from_millis(200));
    let kv = Arc::new(MemoryStore::new());
    let auth = service(&server, kv.clone());
    auth.login("a@x.com", &secret("secret")).await.unwrap();
    server.revoke_token("access-1");

    let pending = {
        let auth = auth.clone();
        tokio::spawn(async move {
            let request = auth.request(Method::GET, PROTECTED_PATH).build().unwrap();
            auth.send_authorized(request).await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    auth.logout(false).await;

    assert!(pending.await.unwrap().is_err());
    assert!(!auth.is_authenticated());
    assert!(kv.get(keys::ACCESS_TOKEN).unwrap().is_none());
}
