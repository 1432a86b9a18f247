use thiserror::Error;

use crate::fetch::FetchError;
use crate::registry::RegistryError;

/// Common error type for the channel library.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),
}

/// Result type alias using the channel library's Error.
pub type Result<T> = std::result::Result<T, Error>;
