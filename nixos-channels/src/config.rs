use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fetch::{DEFAULT_BASE_URL, DEFAULT_REQUEST_TIMEOUT};

/// Settings for talking to the upstream channel status server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the channel server (default: "https://nixos.org/").
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Timeout for a single revision request (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Upper bound on a whole scrape across all channels (seconds).
    #[serde(default = "default_scrape_timeout")]
    pub scrape_timeout_secs: u64,

    /// Cancel the remaining requests of a scrape as soon as one fails.
    #[serde(default)]
    pub fail_fast: bool,

    /// User-Agent header sent with every request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT.as_secs()
}

fn default_scrape_timeout() -> u64 {
    10
}

fn default_user_agent() -> String {
    format!("nixos-channel-exporter/{}", env!("CARGO_PKG_VERSION"))
}

impl UpstreamConfig {
    /// Timeout for a single revision request.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Deadline for a whole scrape.
    pub fn scrape_timeout(&self) -> Duration {
        Duration::from_secs(self.scrape_timeout_secs)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
            scrape_timeout_secs: default_scrape_timeout(),
            fail_fast: false,
            user_agent: default_user_agent(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive, e.g. "info" or "nixos_channels=debug".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}
