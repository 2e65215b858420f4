use chrono::{DateTime, Duration, SecondsFormat, Utc};
use parking_lot::Mutex;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use sublink_auth::{keys, AuthError, AuthService, KeyValueStore};
use thiserror::Error;

use super::{bytes_to_mb, TrafficSample, TrafficSession, BYTES_PER_MB};
use crate::config::TrafficConfig;
use crate::events::{AppEvent, EventSender};

pub const TRAFFIC_REPORT_PATH: &str = "/api/v1/traffic/report";

/// Minimum spacing between manual flushes
pub const FORCE_REPORT_COOLDOWN_SECS: i64 = 30;

/// Usage above this share of the limit raises a warning
pub const NEAR_QUOTA_PERCENT: f64 = 90.0;

#[derive(Error, Debug)]
pub enum TrafficError {
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Signed-in user has no email")]
    MissingEmail,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Invalid report response: {0}")]
    InvalidResponse(String),

    #[error("Report rejected by server: {0}")]
    Rejected(String),

    #[error("Report threshold must be non-negative, got {0}")]
    InvalidThreshold(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaStatus {
    Ok,
    OverQuota,
    Error,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QuotaReportResult {
    pub status: QuotaStatus,
    #[serde(default)]
    pub used: f64,
    #[serde(default)]
    pub limit: f64,
    #[serde(default)]
    pub message: Option<String>,
}

impl QuotaReportResult {
    pub fn usage_percent(&self) -> Option<f64> {
        (self.limit > 0.0).then(|| self.used / self.limit * 100.0)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TrafficReport<'a> {
    email: &'a str,
    session_id: &'a str,
    uploaded_mb: f64,
    downloaded_mb: f64,
    timestamp: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrafficStats {
    pub session_id: String,
    pub unreported_upload_mb: f64,
    pub unreported_download_mb: f64,
    pub total_mb: f64,
    pub threshold_mb: f64,
    /// Share of the threshold the unreported delta has reached, 0..=100
    pub progress_percent: f64,
}

struct ReporterSettings {
    threshold_mb: f64,
    enabled: bool,
}

/// Turns throughput samples into quota reports.
///
/// Reports are at-least-once: the acknowledged baseline only moves after the
/// server accepted a report, so a failed report is retried with the same
/// delta on the next trigger.
pub struct TrafficReporter {
    auth: Arc<AuthService>,
    kv: Arc<dyn KeyValueStore>,
    events: EventSender,
    session: Mutex<TrafficSession>,
    settings: Mutex<ReporterSettings>,
    report_gate: tokio::sync::Mutex<()>,
}

impl TrafficReporter {
    pub fn new(
        auth: Arc<AuthService>,
        kv: Arc<dyn KeyValueStore>,
        config: &TrafficConfig,
        events: EventSender,
    ) -> Self {
        let session = Self::restore(&kv).unwrap_or_else(|| {
            TrafficSession::new(auth.identity(), Utc::now())
        });
        tracing::info!(
            session_id = %session.session_id,
            threshold_mb = config.report_threshold_mb,
            enabled = config.enabled,
            "Traffic reporter ready"
        );

        Self {
            auth,
            kv,
            events,
            session: Mutex::new(session),
            settings: Mutex::new(ReporterSettings {
                threshold_mb: config.report_threshold_mb.max(0.0),
                enabled: config.enabled,
            }),
            report_gate: tokio::sync::Mutex::new(()),
        }
    }

    fn restore(kv: &Arc<dyn KeyValueStore>) -> Option<TrafficSession> {
        let raw = match kv.get(keys::TRAFFIC_STATE) {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read traffic state");
                return None;
            }
        };
        match serde_json::from_str::<TrafficSession>(&raw) {
            Ok(session) => {
                tracing::debug!(session_id = %session.session_id, "Restored traffic state");
                Some(session)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable traffic state");
                None
            }
        }
    }

    fn persist(&self, session: &TrafficSession) {
        let result = serde_json::to_string(session)
            .map_err(|e| e.to_string())
            .and_then(|json| {
                self.kv
                    .set(keys::TRAFFIC_STATE, json)
                    .map_err(|e| e.to_string())
            });
        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to persist traffic state");
        }
    }

    pub async fn on_sample(&self, sample: TrafficSample) -> Option<QuotaReportResult> {
        self.on_sample_at(sample, Utc::now()).await
    }

    /// Accounts one sample and reports when the unreported delta exceeds the
    /// threshold. Report failures are logged, never returned.
    pub async fn on_sample_at(
        &self,
        sample: TrafficSample,
        now: DateTime<Utc>,
    ) -> Option<QuotaReportResult> {
        if !self.record_sample_at(sample, now) {
            return None;
        }
        self.report_if_due(now).await
    }

    /// Accounts one sample without touching the network. Returns whether the
    /// unreported delta now exceeds the threshold.
    pub fn record_sample_at(&self, sample: TrafficSample, now: DateTime<Utc>) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let accepted = self.session.lock().record_sample(sample, now);
        accepted && self.is_report_due()
    }

    fn is_report_due(&self) -> bool {
        let delta_mb = self.session.lock().unreported_mb();
        delta_mb > 0.0 && delta_mb > self.threshold_mb()
    }

    /// Replaces the cumulative counters with externally measured totals, then
    /// applies the same trigger policy as [`Self::on_sample`].
    pub async fn update_counters(
        &self,
        upload_bytes: f64,
        download_bytes: f64,
    ) -> Option<QuotaReportResult> {
        if !self.is_enabled() {
            return None;
        }
        self.session
            .lock()
            .set_counters(upload_bytes, download_bytes);
        self.report_if_due(Utc::now()).await
    }

    /// Reports the unreported delta if it exceeds the threshold
    pub async fn report_if_due(&self, now: DateTime<Utc>) -> Option<QuotaReportResult> {
        if !self.is_report_due() {
            return None;
        }

        tracing::debug!(threshold = self.threshold_mb(), "Traffic threshold crossed");
        match self.flush(now).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(error = %e, "Traffic report failed, delta kept for retry");
                None
            }
        }
    }

    /// Reports the unreported delta and advances the baseline on success
    async fn flush(&self, now: DateTime<Utc>) -> Result<Option<QuotaReportResult>, TrafficError> {
        let Ok(_gate) = self.report_gate.try_lock() else {
            tracing::debug!("Traffic report already in flight");
            return Ok(None);
        };

        let snapshot = self.session.lock().clone();
        let (up, down) = snapshot.unreported();
        if up + down <= 0.0 {
            return Ok(None);
        }

        let result = self
            .send_report(&snapshot.session_id, bytes_to_mb(up), bytes_to_mb(down), now)
            .await?;

        let mut session = self.session.lock();
        if session.session_id == snapshot.session_id {
            session.mark_reported(snapshot.upload_bytes, snapshot.download_bytes, now);
            self.persist(&session);
        } else {
            tracing::debug!("Traffic session reset while reporting, baseline not moved");
        }

        Ok(Some(result))
    }

    /// Sends an ad hoc report for the current session. The acknowledged
    /// baseline is left alone.
    pub async fn report(
        &self,
        upload_mb: f64,
        download_mb: f64,
    ) -> Result<QuotaReportResult, TrafficError> {
        let session_id = self.session.lock().session_id.clone();
        self.send_report(&session_id, upload_mb, download_mb, Utc::now())
            .await
    }

    async fn send_report(
        &self,
        session_id: &str,
        upload_mb: f64,
        download_mb: f64,
        now: DateTime<Utc>,
    ) -> Result<QuotaReportResult, TrafficError> {
        if !self.auth.is_authenticated() {
            return Err(TrafficError::NotAuthenticated);
        }
        let email = self
            .auth
            .current_user()
            .and_then(|u| u.email)
            .ok_or(TrafficError::MissingEmail)?;

        let body = TrafficReport {
            email: &email,
            session_id,
            uploaded_mb: (upload_mb * 100.0).round() / 100.0,
            downloaded_mb: (download_mb * 100.0).round() / 100.0,
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        tracing::info!(
            session_id,
            uploaded_mb = body.uploaded_mb,
            downloaded_mb = body.downloaded_mb,
            "Reporting traffic"
        );

        let request = self
            .auth
            .request(Method::POST, TRAFFIC_REPORT_PATH)
            .json(&body)
            .build()
            .map_err(AuthError::from)?;
        let resp = self.auth.send_authorized(request).await?;

        let result: QuotaReportResult = resp
            .json()
            .await
            .map_err(|e| TrafficError::InvalidResponse(e.to_string()))?;

        self.handle_quota(&result)?;
        let _ = self.events.send(AppEvent::TrafficReported {
            uploaded_mb: body.uploaded_mb,
            downloaded_mb: body.downloaded_mb,
        });
        Ok(result)
    }

    fn handle_quota(&self, result: &QuotaReportResult) -> Result<(), TrafficError> {
        match result.status {
            QuotaStatus::Ok => {
                if let Some(percent) = result.usage_percent() {
                    tracing::debug!(percent, "Quota usage");
                    if percent > NEAR_QUOTA_PERCENT {
                        tracing::warn!(used = result.used, limit = result.limit, "Quota nearly used up");
                        let _ = self.events.send(AppEvent::QuotaWarning {
                            used: result.used,
                            limit: result.limit,
                            percent,
                        });
                    }
                }
                Ok(())
            }
            QuotaStatus::OverQuota => {
                tracing::warn!(used = result.used, limit = result.limit, "Quota exceeded");
                let _ = self.events.send(AppEvent::QuotaExceeded {
                    used: result.used,
                    limit: result.limit,
                });
                Ok(())
            }
            QuotaStatus::Error => {
                let message = result
                    .message
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string());
                tracing::error!(%message, "Traffic report returned an error status");
                Err(TrafficError::Rejected(message))
            }
        }
    }

    pub async fn force_report(&self) -> Result<Option<QuotaReportResult>, TrafficError> {
        self.force_report_at(Utc::now()).await
    }

    /// Flushes whatever is unreported. Does nothing when disabled, signed
    /// out, within the cooldown or when there is nothing to send.
    pub async fn force_report_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<QuotaReportResult>, TrafficError> {
        if !self.is_enabled() || !self.auth.is_authenticated() {
            tracing::debug!("Force report skipped: reporter disabled or signed out");
            return Ok(None);
        }

        let last_report_at = self.session.lock().last_report_at;
        if let Some(last) = last_report_at {
            if now - last < Duration::seconds(FORCE_REPORT_COOLDOWN_SECS) {
                tracing::warn!("Force report requested too soon after the previous one");
                return Ok(None);
            }
        }

        self.flush(now).await
    }

    /// Starts a fresh session id with zeroed counters
    pub fn reset_session(&self) {
        let fresh = TrafficSession::new(self.auth.identity(), Utc::now());
        tracing::info!(session_id = %fresh.session_id, "Traffic session reset");
        let mut session = self.session.lock();
        *session = fresh;
        self.persist(&session);
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.settings.lock().enabled = enabled;
        tracing::info!(enabled, "Traffic reporting toggled");
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.lock().enabled
    }

    pub fn set_threshold(&self, threshold_mb: f64) -> Result<(), TrafficError> {
        if !(threshold_mb >= 0.0) {
            return Err(TrafficError::InvalidThreshold(threshold_mb));
        }
        self.settings.lock().threshold_mb = threshold_mb;
        tracing::info!(threshold_mb, "Traffic report threshold updated");
        Ok(())
    }

    pub fn threshold_mb(&self) -> f64 {
        self.settings.lock().threshold_mb
    }

    pub fn session(&self) -> TrafficSession {
        self.session.lock().clone()
    }

    pub fn stats(&self) -> TrafficStats {
        let session = self.session.lock().clone();
        let threshold_mb = self.threshold_mb();
        let (up, down) = session.unreported();
        let unreported_mb = (up + down) / BYTES_PER_MB;

        let progress_percent = if threshold_mb > 0.0 {
            (unreported_mb / threshold_mb * 100.0).min(100.0)
        } else if unreported_mb > 0.0 {
            100.0
        } else {
            0.0
        };

        TrafficStats {
            session_id: session.session_id,
            unreported_upload_mb: bytes_to_mb(up),
            unreported_download_mb: bytes_to_mb(down),
            total_mb: bytes_to_mb(session.upload_bytes + session.download_bytes),
            threshold_mb,
            progress_percent,
        }
    }
}
