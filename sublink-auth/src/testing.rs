//! In-process stand-in for the account service.
//!
//! Serves the auth endpoints plus the subscription and traffic report
//! endpoints on an ephemeral port. Replies are configurable per endpoint and
//! every call is counted so tests can assert on network traffic.

use axum::{
    extract::{Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::client::auth_client::{LOGIN_PATH, LOGOUT_PATH, REFRESH_PATH};

pub const SUBSCRIPTION_PATH: &str = "/api/subscription";
pub const TRAFFIC_REPORT_PATH: &str = "/api/v1/traffic/report";
pub const PROTECTED_PATH: &str = "/api/protected";

/// Canned HTTP reply
#[derive(Debug, Clone)]
pub struct MockReply {
    pub status: u16,
    pub body: Value,
}

impl MockReply {
    pub fn json(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Value::Null,
        }
    }

    pub fn tokens(access: &str, refresh: &str, expires_in: u64) -> Self {
        Self::json(
            200,
            json!({
                "accessToken": access,
                "refreshToken": refresh,
                "tokenType": "Bearer",
                "expiresIn": expires_in,
            }),
        )
    }

    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        match self.body {
            Value::Null => status.into_response(),
            body => (status, Json(body)).into_response(),
        }
    }
}

struct MockState {
    login: Mutex<MockReply>,
    refresh: Mutex<MockReply>,
    refresh_delay: Mutex<Duration>,
    logout: Mutex<MockReply>,
    report: Mutex<MockReply>,
    subscription: Mutex<(u16, String)>,

    accepted: Mutex<HashSet<String>>,
    auto_accept: AtomicBool,

    login_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    logout_calls: AtomicUsize,
    report_calls: AtomicUsize,
    subscription_calls: AtomicUsize,
    protected_calls: AtomicUsize,

    last_login_body: Mutex<Option<Value>>,
    refresh_tokens: Mutex<Vec<String>>,
    logout_app_ids: Mutex<Vec<Option<String>>>,
    reports: Mutex<Vec<Value>>,
    subscription_tokens: Mutex<Vec<String>>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            login: Mutex::new(MockReply::tokens("access-1", "refresh-1", 3_600)),
            refresh: Mutex::new(MockReply::tokens("access-2", "refresh-2", 3_600)),
            refresh_delay: Mutex::new(Duration::ZERO),
            logout: Mutex::new(MockReply::json(200, json!({"success": true}))),
            report: Mutex::new(MockReply::json(
                200,
                json!({"status": "ok", "used": 10.0, "limit": 500.0}),
            )),
            subscription: Mutex::new((200, "proxies: []\n".to_string())),
            accepted: Mutex::new(HashSet::new()),
            auto_accept: AtomicBool::new(true),
            login_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            report_calls: AtomicUsize::new(0),
            subscription_calls: AtomicUsize::new(0),
            protected_calls: AtomicUsize::new(0),
            last_login_body: Mutex::new(None),
            refresh_tokens: Mutex::new(Vec::new()),
            logout_app_ids: Mutex::new(Vec::new()),
            reports: Mutex::new(Vec::new()),
            subscription_tokens: Mutex::new(Vec::new()),
        }
    }
}

impl MockState {
    /// Replies with `reply`, trusting any access token it hands out
    fn issue(&self, reply: MockReply) -> Response {
        if reply.status == 200 && self.auto_accept.load(Ordering::SeqCst) {
            if let Some(token) = reply.body.get("accessToken").and_then(Value::as_str) {
                self.accepted.lock().insert(token.to_string());
            }
        }
        reply.into_response()
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| self.accepted.lock().contains(token))
    }
}

type Shared = Arc<MockState>;

pub struct MockAccountServer {
    base_url: String,
    state: Shared,
    task: JoinHandle<()>,
}

impl MockAccountServer {
    pub async fn start() -> Self {
        let state: Shared = Arc::new(MockState::default());

        let app = Router::new()
            .route(LOGIN_PATH, post(login))
            .route(REFRESH_PATH, post(refresh))
            .route(LOGOUT_PATH, post(logout))
            .route(SUBSCRIPTION_PATH, get(subscription))
            .route(TRAFFIC_REPORT_PATH, post(report))
            .route(PROTECTED_PATH, get(protected))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock account server");
        let addr = listener.local_addr().expect("mock server address");

        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "Mock account server stopped");
            }
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
            task,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn set_login(&self, reply: MockReply) {
        *self.state.login.lock() = reply;
    }

    pub fn set_refresh(&self, reply: MockReply) {
        *self.state.refresh.lock() = reply;
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.state.refresh_delay.lock() = delay;
    }

    pub fn set_logout(&self, reply: MockReply) {
        *self.state.logout.lock() = reply;
    }

    pub fn set_report(&self, reply: MockReply) {
        *self.state.report.lock() = reply;
    }

    pub fn set_subscription(&self, status: u16, body: &str) {
        *self.state.subscription.lock() = (status, body.to_string());
    }

    /// When off, tokens handed out by login/refresh are not trusted by the
    /// bearer-checked endpoints
    pub fn set_auto_accept(&self, enabled: bool) {
        self.state.auto_accept.store(enabled, Ordering::SeqCst);
    }

    pub fn accept_token(&self, token: &str) {
        self.state.accepted.lock().insert(token.to_string());
    }

    pub fn revoke_token(&self, token: &str) {
        self.state.accepted.lock().remove(token);
    }

    pub fn login_calls(&self) -> usize {
        self.state.login_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.state.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn logout_calls(&self) -> usize {
        self.state.logout_calls.load(Ordering::SeqCst)
    }

    pub fn report_calls(&self) -> usize {
        self.state.report_calls.load(Ordering::SeqCst)
    }

    pub fn subscription_calls(&self) -> usize {
        self.state.subscription_calls.load(Ordering::SeqCst)
    }

    pub fn protected_calls(&self) -> usize {
        self.state.protected_calls.load(Ordering::SeqCst)
    }

    pub fn last_login_body(&self) -> Option<Value> {
        self.state.last_login_body.lock().clone()
    }

    pub fn refresh_tokens(&self) -> Vec<String> {
        self.state.refresh_tokens.lock().clone()
    }

    pub fn logout_app_ids(&self) -> Vec<Option<String>> {
        self.state.logout_app_ids.lock().clone()
    }

    /// Bodies of accepted traffic reports, oldest first
    pub fn reports(&self) -> Vec<Value> {
        self.state.reports.lock().clone()
    }

    pub fn subscription_tokens(&self) -> Vec<String> {
        self.state.subscription_tokens.lock().clone()
    }
}

impl Drop for MockAccountServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn login(State(state): State<Shared>, Json(body): Json<Value>) -> Response {
    state.login_calls.fetch_add(1, Ordering::SeqCst);
    *state.last_login_body.lock() = Some(body);

    let reply = state.login.lock().clone();
    state.issue(reply)
}

async fn refresh(State(state): State<Shared>, Json(body): Json<Value>) -> Response {
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);
    if let Some(token) = body.get("refreshToken").and_then(Value::as_str) {
        state.refresh_tokens.lock().push(token.to_string());
    }

    let delay = *state.refresh_delay.lock();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let reply = state.refresh.lock().clone();
    state.issue(reply)
}

async fn logout(
    State(state): State<Shared>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    state.logout_calls.fetch_add(1, Ordering::SeqCst);
    state
        .logout_app_ids
        .lock()
        .push(params.get("appId").cloned());

    state.logout.lock().clone().into_response()
}

async fn subscription(
    State(state): State<Shared>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    state.subscription_calls.fetch_add(1, Ordering::SeqCst);
    if let Some(token) = params.get("token") {
        state.subscription_tokens.lock().push(token.clone());
    }

    let (status, body) = state.subscription.lock().clone();
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, body).into_response()
}

async fn report(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    state.report_calls.fetch_add(1, Ordering::SeqCst);
    state.reports.lock().push(body);

    state.report.lock().clone().into_response()
}

async fn protected(State(state): State<Shared>, headers: HeaderMap) -> Response {
    state.protected_calls.fetch_add(1, Ordering::SeqCst);
    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({"ok": true})).into_response()
}
