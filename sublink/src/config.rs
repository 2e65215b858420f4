use config::{Config, File};
use serde::Deserialize;
use std::path::PathBuf;
use sublink_auth::Settings;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Configuration {
    #[serde(default)]
    pub auth: Settings,

    #[serde(default)]
    pub traffic: TrafficConfig,

    #[serde(default)]
    pub core: CoreConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrafficConfig {
    /// Unreported megabytes that trigger a report; 0 reports every change
    #[serde(default = "default_report_threshold")]
    pub report_threshold_mb: f64,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CoreConfig {
    /// External controller address of the proxy core
    #[serde(default = "default_controller")]
    pub controller: String,

    #[serde(default)]
    pub secret: Option<String>,

    /// Where downloaded subscription profiles are written
    #[serde(default)]
    pub profiles_dir: Option<PathBuf>,
}

fn default_report_threshold() -> f64 {
    500.0
}

fn default_true() -> bool {
    true
}

fn default_controller() -> String {
    "127.0.0.1:9097".to_string()
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            report_threshold_mb: default_report_threshold(),
            enabled: default_true(),
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            controller: default_controller(),
            secret: None,
            profiles_dir: None,
        }
    }
}

impl Configuration {
    /// Layers `config.toml` (or `$SUBLINK_CONFIG`) under `SUBLINK__*`
    /// environment variables
    pub fn new() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("SUBLINK_CONFIG").unwrap_or_else(|_| "config.toml".to_string());

        Config::builder()
            .add_source(File::with_name(&config_path).required(false))
            .add_source(config::Environment::with_prefix("SUBLINK").separator("__"))
            .build()?
            .try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        self.auth.validate()?;

        if !(self.traffic.report_threshold_mb >= 0.0) {
            return Err("traffic.report_threshold_mb must be zero or positive".to_string());
        }
        if self.core.controller.trim().is_empty() {
            return Err("core.controller must not be empty".to_string());
        }
        Ok(())
    }
}
