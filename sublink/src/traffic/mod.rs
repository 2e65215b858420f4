mod feed;
mod reporter;

pub use feed::{decode_samples, parse_sample};
pub use reporter::{
    QuotaReportResult, QuotaStatus, TrafficError, TrafficReporter, TrafficStats,
    FORCE_REPORT_COOLDOWN_SECS, NEAR_QUOTA_PERCENT, TRAFFIC_REPORT_PATH,
};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sublink_auth::AppIdentity;

pub const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Samples further apart than this are not integrated
pub const MAX_SAMPLE_GAP_SECS: f64 = 10.0;

const SESSION_SUFFIX_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// One reading of the core's instantaneous throughput, in bytes per second
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
pub struct TrafficSample {
    #[serde(default)]
    pub up: f64,
    #[serde(default)]
    pub down: f64,
}

/// Megabytes with two decimals, as sent on the wire
pub fn bytes_to_mb(bytes: f64) -> f64 {
    (bytes / BYTES_PER_MB * 100.0).round() / 100.0
}

/// `{app_id}-{unix_millis}-{6 base36 chars}`
pub fn new_session_id(app_id: AppIdentity, now: DateTime<Utc>) -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..6)
        .map(|_| {
            let idx = rng.random_range(0..SESSION_SUFFIX_ALPHABET.len());
            SESSION_SUFFIX_ALPHABET[idx] as char
        })
        .collect();
    format!("{}-{}-{}", app_id, now.timestamp_millis(), suffix)
}

/// Byte accounting for one reporting session.
///
/// Cumulative counters only grow through samples; `reported_*` trail them
/// and move only when the server has acknowledged a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSession {
    pub session_id: String,
    pub upload_bytes: f64,
    pub download_bytes: f64,
    pub reported_upload_bytes: f64,
    pub reported_download_bytes: f64,
    #[serde(skip)]
    pub last_sample_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_report_at: Option<DateTime<Utc>>,
}

impl TrafficSession {
    pub fn new(app_id: AppIdentity, now: DateTime<Utc>) -> Self {
        Self {
            session_id: new_session_id(app_id, now),
            upload_bytes: 0.0,
            download_bytes: 0.0,
            reported_upload_bytes: 0.0,
            reported_download_bytes: 0.0,
            last_sample_at: None,
            last_report_at: None,
        }
    }

    /// Integrates `sample` over the time since the previous one. Returns
    /// false when the gap is outside `(0, MAX_SAMPLE_GAP_SECS]`, in which case
    /// only the timestamp moves.
    pub fn record_sample(&mut self, sample: TrafficSample, now: DateTime<Utc>) -> bool {
        let previous = self.last_sample_at.replace(now);
        let Some(previous) = previous else {
            return false;
        };

        let elapsed = (now - previous).num_milliseconds() as f64 / 1000.0;
        if elapsed <= 0.0 || elapsed > MAX_SAMPLE_GAP_SECS {
            tracing::debug!(elapsed, "Ignoring traffic sample outside the integration window");
            return false;
        }

        self.upload_bytes += sample.up.max(0.0) * elapsed;
        self.download_bytes += sample.down.max(0.0) * elapsed;
        true
    }

    /// Overwrites the cumulative counters with totals measured elsewhere
    pub fn set_counters(&mut self, upload_bytes: f64, download_bytes: f64) {
        self.upload_bytes = upload_bytes;
        self.download_bytes = download_bytes;
    }

    /// Bytes not yet acknowledged, never negative
    pub fn unreported(&self) -> (f64, f64) {
        (
            (self.upload_bytes - self.reported_upload_bytes).max(0.0),
            (self.download_bytes - self.reported_download_bytes).max(0.0),
        )
    }

    pub fn unreported_mb(&self) -> f64 {
        let (up, down) = self.unreported();
        (up + down) / BYTES_PER_MB
    }

    pub fn mark_reported(&mut self, upload_bytes: f64, download_bytes: f64, at: DateTime<Utc>) {
        self.reported_upload_bytes = upload_bytes;
        self.reported_download_bytes = download_bytes;
        self.last_report_at = Some(at);
    }
}
