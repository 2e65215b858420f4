use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use secrecy::SecretString;
use std::future::Future;
use std::sync::Arc;
use sublink_auth::{
    AccountClient, AppIdentity, AuthError, AuthService, AuthState, KeyValueStore, SessionStore,
    User,
};
use tokio::sync::mpsc;

use crate::background::BackgroundTaskManager;
use crate::config::Configuration;
use crate::core::ProfileImporter;
use crate::events::{AppEvent, EventSender};
use crate::sync::{ProxyImportResult, ProxySync};
use crate::traffic::{TrafficReporter, TrafficSample};

const SYNC_TASK: &str = "proxy-sync";
const REPORT_TASK: &str = "traffic-report";

/// Wires the session, traffic reporting and proxy sync together
pub struct App {
    auth: Arc<AuthService>,
    reporter: Arc<TrafficReporter>,
    sync: Arc<ProxySync>,
    events: EventSender,
    tasks: Mutex<BackgroundTaskManager>,
}

impl App {
    pub fn new(
        config: &Configuration,
        kv: Arc<dyn KeyValueStore>,
        importer: Arc<dyn ProfileImporter>,
        events: EventSender,
    ) -> Result<Self, AuthError> {
        let client = AccountClient::from_settings(&config.auth)?;
        tracing::info!(base_url = client.base_url(), "Account service selected");

        let auth = Arc::new(AuthService::new(
            client,
            SessionStore::new(kv.clone()),
            AppIdentity::current(),
        ));
        let reporter = Arc::new(TrafficReporter::new(
            auth.clone(),
            kv,
            &config.traffic,
            events.clone(),
        ));
        let sync = Arc::new(ProxySync::new(auth.clone(), importer));

        Ok(Self {
            auth,
            reporter,
            sync,
            events,
            tasks: Mutex::new(BackgroundTaskManager::new()),
        })
    }

    pub fn auth(&self) -> &Arc<AuthService> {
        &self.auth
    }

    pub fn reporter(&self) -> &Arc<TrafficReporter> {
        &self.reporter
    }

    pub fn sync(&self) -> &Arc<ProxySync> {
        &self.sync
    }

    /// Signs in and starts a fresh traffic session for the new login
    pub async fn login(&self, email: &str, password: &SecretString) -> Result<User, AuthError> {
        self.sync.reset();
        let user = self.auth.login(email, password).await?;
        self.reporter.reset_session();
        self.spawn_sync();
        Ok(user)
    }

    pub async fn logout(&self, all_devices: bool) {
        self.auth.logout(all_devices).await;
        self.reporter.reset_session();
        self.sync.reset();
    }

    /// Imports the subscription unless this session already did
    pub async fn sync_proxies(&self) -> Option<ProxyImportResult> {
        let result = self.sync.ensure_synced().await?;
        publish_sync(&self.events, &result);
        Some(result)
    }

    fn spawn_sync(&self) {
        let sync = self.sync.clone();
        let events = self.events.clone();
        self.tasks.lock().spawn(SYNC_TASK, async move {
            if let Some(result) = sync.ensure_synced().await {
                publish_sync(&events, &result);
            }
        });
    }

    /// Starts a background report unless one is already running
    fn spawn_report(&self) {
        let mut tasks = self.tasks.lock();
        if tasks.is_running(REPORT_TASK) {
            return;
        }
        let reporter = self.reporter.clone();
        tasks.spawn(REPORT_TASK, async move {
            reporter.report_if_due(Utc::now()).await;
        });
    }

    /// Reacts to a published auth state. Returns whether it is authenticated.
    pub fn on_auth_changed(&self, was_authenticated: bool, state: &AuthState) -> bool {
        let authenticated = state.is_authenticated();
        match (was_authenticated, authenticated) {
            (false, true) => {
                tracing::info!("Signed in, syncing proxy configuration");
                self.spawn_sync();
            }
            (true, false) => {
                tracing::info!(expired = state.expired, "Signed out, resetting session state");
                self.tasks.lock().cancel(SYNC_TASK);
                self.reporter.reset_session();
                self.sync.reset();
                if state.expired {
                    let _ = self.events.send(AppEvent::SessionExpired);
                }
            }
            _ => {}
        }
        authenticated
    }

    /// Runs until Ctrl-C
    pub async fn run(&self, samples: mpsc::UnboundedReceiver<TrafficSample>) -> Result<()> {
        self.run_until(samples, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            }
        })
        .await
    }

    /// Feeds samples to the reporter and follows auth changes until
    /// `shutdown` resolves, then flushes unreported traffic.
    pub async fn run_until(
        &self,
        mut samples: mpsc::UnboundedReceiver<TrafficSample>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let mut auth_changes = self.auth.subscribe();
        let mut authenticated = auth_changes.borrow_and_update().is_authenticated();
        if authenticated {
            self.spawn_sync();
        }

        tokio::pin!(shutdown);
        tracing::info!("Entering main event loop");

        loop {
            tokio::select! {
                changed = auth_changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = auth_changes.borrow_and_update().clone();
                    authenticated = self.on_auth_changed(authenticated, &state);
                }
                Some(sample) = samples.recv() => {
                    // Timed on arrival; reports run off the loop
                    if self.reporter.record_sample_at(sample, Utc::now()) {
                        self.spawn_report();
                    }
                }
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break;
                }
            }
        }

        if let Err(e) = self.reporter.force_report().await {
            tracing::warn!(error = %e, "Final traffic flush failed");
        }
        self.tasks.lock().cancel_all();
        Ok(())
    }
}

fn publish_sync(events: &EventSender, result: &ProxyImportResult) {
    let event = if result.success {
        AppEvent::ProxySynced {
            message: result.message.clone(),
        }
    } else {
        AppEvent::ProxySyncFailed {
            message: result.message.clone(),
        }
    };
    let _ = events.send(event);
}
