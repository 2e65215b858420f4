use tokio::sync::mpsc;

/// Observational signals for whoever drives the UI
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    /// Usage crossed the near-quota mark
    QuotaWarning {
        used: f64,
        limit: f64,
        percent: f64,
    },
    QuotaExceeded {
        used: f64,
        limit: f64,
    },
    TrafficReported {
        uploaded_mb: f64,
        downloaded_mb: f64,
    },
    /// The server stopped honouring the session and the user was signed out
    SessionExpired,
    ProxySynced {
        message: String,
    },
    ProxySyncFailed {
        message: String,
    },
}

pub type EventSender = mpsc::UnboundedSender<AppEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<AppEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
