//! Configuration for the channel exporter.

use std::path::Path;
use std::time::Duration;

use nixos_channels::{LoggingConfig, UpstreamConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Upper bound for every timeout setting, in seconds.
pub const MAX_TIMEOUT_SECS: u64 = 3600;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Path to the channels.json registry (default: "channels.json").
    #[serde(default = "default_channels_file")]
    pub channels_file: String,

    /// Channel status server settings.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Prometheus exporter settings.
    #[serde(default)]
    pub prometheus: PrometheusConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_channels_file() -> String {
    "channels.json".to_string()
}

/// How a scrape with collection errors is answered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandling {
    /// Serve the metrics that were collected, with the errors as comments.
    #[default]
    Continue,
    /// Answer with HTTP 500 and the error text only.
    HttpError,
}

/// Prometheus HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// Address to listen on (default: "0.0.0.0:9402").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for metrics endpoint (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,

    /// Behaviour when some channels could not be collected.
    #[serde(default)]
    pub error_handling: ErrorHandling,

    /// Time allowed to answer one HTTP request, scrape included (seconds).
    #[serde(default = "default_http_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_listen() -> String {
    "0.0.0.0:9402".to_string()
}

fn default_path() -> String {
    "/metrics".to_string()
}

fn default_http_request_timeout() -> u64 {
    30
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
            error_handling: ErrorHandling::default(),
            request_timeout_secs: default_http_request_timeout(),
        }
    }
}

impl PrometheusConfig {
    /// Time allowed to answer one HTTP request.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl ExporterConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ExporterConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channels_file.is_empty() {
            return Err(ConfigError::Validation(
                "channels_file must not be empty".to_string(),
            ));
        }

        check_timeout(
            "upstream.request_timeout_secs",
            self.upstream.request_timeout_secs,
        )?;
        check_timeout(
            "upstream.scrape_timeout_secs",
            self.upstream.scrape_timeout_secs,
        )?;
        check_timeout(
            "prometheus.request_timeout_secs",
            self.prometheus.request_timeout_secs,
        )?;

        // An empty base URL selects the default server.
        if !self.upstream.base_url.is_empty() {
            match Url::parse(&self.upstream.base_url) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => {}
                _ => {
                    return Err(ConfigError::Validation(format!(
                        "Invalid base URL: {}",
                        self.upstream.base_url
                    )));
                }
            }
        }

        if self
            .prometheus
            .listen
            .parse::<std::net::SocketAddr>()
            .is_err()
        {
            return Err(ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.prometheus.listen
            )));
        }

        if !self.prometheus.path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }

        if self.prometheus.path == "/health" {
            return Err(ConfigError::Validation(
                "Metrics path must not be /health".to_string(),
            ));
        }

        Ok(())
    }
}

fn check_timeout(field: &str, secs: u64) -> Result<(), ConfigError> {
    if secs == 0 || secs > MAX_TIMEOUT_SECS {
        return Err(ConfigError::Validation(format!(
            "{} must be between 1 and {}, got {}",
            field, MAX_TIMEOUT_SECS, secs
        )));
    }
    Ok(())
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            channels_file: default_channels_file(),
            upstream: UpstreamConfig::default(),
            prometheus: PrometheusConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
