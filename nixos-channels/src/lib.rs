//! NixOS channel library
//!
//! Shared building blocks for the channel exporter:
//!
//! - [`registry`] - The validated, immutable channel registry (`channels.json`)
//! - [`fetch`] - Revision lookups against the channel status server
//! - [`config`] - Upstream and logging configuration sections
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod fetch;
pub mod registry;

pub use config::{LogFormat, LoggingConfig, UpstreamConfig};
pub use error::{Error, Result};
pub use fetch::{
    DEFAULT_BASE_URL, DEFAULT_REQUEST_TIMEOUT, FetchError, FetchResult, MAX_REVISION_LEN,
    RevisionFetcher, parse_http_date,
};
pub use registry::{Channel, Registry, RegistryError};

/// Initialize tracing with the given configuration.
///
/// `RUST_LOG` takes precedence over the configured level when set.
///
/// # Example
///
/// ```ignore
/// use nixos_channels::{LoggingConfig, LogFormat, init_tracing};
///
/// let config = LoggingConfig {
///     level: "debug".to_string(),
///     format: LogFormat::Json,
/// };
/// init_tracing(&config)?;
/// ```
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let result = match config.format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .try_init(),
    };

    result.map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))
}
