use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::AuthError;

pub const PRODUCTION_BASE_URL: &str = "https://api.101proxy.top";
pub const DEVELOPMENT_BASE_URL: &str = "http://localhost:8080";

/// Port the front-end dev server listens on
const DEV_PORT: &str = "9097";

/// `[auth]` section of the configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Explicit account service URL; wins over every other signal
    #[serde(default)]
    pub server_url: Option<String>,

    #[serde(default)]
    pub dev_mode: bool,

    /// Host (and port) the client is served from, when known
    #[serde(default)]
    pub dev_host: Option<String>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: None,
            dev_mode: false,
            dev_host: None,
            request_timeout_secs: default_request_timeout(),
            data_dir: None,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(url) = self.explicit_url() {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err("auth.server_url must be a valid HTTP(S) URL".to_string());
            }
        }
        if self.request_timeout_secs == 0 {
            return Err("auth.request_timeout_secs must be greater than zero".to_string());
        }
        Ok(())
    }

    fn explicit_url(&self) -> Option<&str> {
        self.server_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    /// Dev-mode flag, or a known development host/port
    pub fn is_development(&self) -> bool {
        if self.dev_mode {
            return true;
        }
        self.dev_host.as_deref().is_some_and(|host| {
            let host = host.trim().to_lowercase();
            host.starts_with("localhost")
                || host.starts_with("127.0.0.1")
                || host.ends_with(&format!(":{}", DEV_PORT))
        })
    }

    /// Account service base URL without a trailing slash
    pub fn base_url(&self) -> String {
        if let Some(url) = self.explicit_url() {
            return url.trim_end_matches('/').to_string();
        }
        if self.is_development() {
            DEVELOPMENT_BASE_URL.to_string()
        } else {
            PRODUCTION_BASE_URL.to_string()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Directory for persisted session and traffic state
    pub fn data_dir(&self) -> Result<PathBuf, AuthError> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_dir()
                .map(|dir| dir.join("sublink"))
                .ok_or_else(|| {
                    AuthError::Configuration("Could not find data directory".to_string())
                }),
        }
    }
}
