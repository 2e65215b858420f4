use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Coarse classifier of the host the client runs on.
///
/// Sent as `appId` with every login and used to namespace traffic sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppIdentity {
    #[serde(rename = "app_android_v1")]
    Android,
    #[serde(rename = "app_ios_v1")]
    Ios,
    #[serde(rename = "app_mac_v1")]
    Mac,
    #[serde(rename = "app_windows_v1")]
    Windows,
    #[serde(rename = "app_browser_v1")]
    Browser,
}

/// Raw host signals inspected during detection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformSignals {
    /// Platform reported by the native shell, if we are running inside one
    pub native_platform: Option<String>,
    /// User agent of the embedding web view, when the host provides one
    pub user_agent: Option<String>,
}

impl PlatformSignals {
    pub fn from_env() -> Self {
        Self {
            native_platform: Some(std::env::consts::OS.to_string()),
            user_agent: std::env::var("SUBLINK_USER_AGENT").ok(),
        }
    }
}

static CURRENT: OnceLock<AppIdentity> = OnceLock::new();

impl AppIdentity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppIdentity::Android => "app_android_v1",
            AppIdentity::Ios => "app_ios_v1",
            AppIdentity::Mac => "app_mac_v1",
            AppIdentity::Windows => "app_windows_v1",
            AppIdentity::Browser => "app_browser_v1",
        }
    }

    /// Identity of this process, detected on first use and fixed afterwards
    pub fn current() -> Self {
        *CURRENT.get_or_init(|| {
            let identity = Self::detect(&PlatformSignals::from_env());
            tracing::info!(app_id = identity.as_str(), "Detected app identity");
            identity
        })
    }

    /// Native shell markers first, then user agent OS families, else browser.
    pub fn detect(signals: &PlatformSignals) -> Self {
        if let Some(platform) = signals.native_platform.as_deref() {
            let platform = platform.to_lowercase();
            if platform.contains("mac") || platform.contains("darwin") {
                return AppIdentity::Mac;
            }
            if platform.contains("win") {
                return AppIdentity::Windows;
            }
        }

        if let Some(agent) = signals.user_agent.as_deref() {
            let agent = agent.to_lowercase();
            if agent.contains("android") {
                return AppIdentity::Android;
            }
            if agent.contains("iphone") || agent.contains("ipad") || agent.contains("ios") {
                return AppIdentity::Ios;
            }
            if agent.contains("mac") {
                return AppIdentity::Mac;
            }
            if agent.contains("win") {
                return AppIdentity::Windows;
            }
        }

        AppIdentity::Browser
    }
}

impl fmt::Display for AppIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
