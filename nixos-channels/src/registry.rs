//! The channel registry: which channels to track and what is expected of them.
//!
//! The registry is read from a `channels.json` document of the form
//!
//! ```json
//! {
//!   "channels": {
//!     "nixos-unstable": { "job": "nixos/trunk-combined/tested", "current": true }
//!   }
//! }
//! ```
//!
//! and validated once at start-up. After that it is never modified.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while loading a channel registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to read channels file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse channels data: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("empty key in channels")]
    EmptyName,

    #[error("channel {channel:?} has empty job value")]
    EmptyJob { channel: String },
}

/// An individual NixOS channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Hydra job that produces the channel. Carried but never exported.
    #[serde(default)]
    pub job: String,

    /// Whether the channel is expected to be a current release channel.
    #[serde(default)]
    pub current: bool,
}

impl Channel {
    /// Create a channel entry.
    pub fn new(job: impl Into<String>, current: bool) -> Self {
        Self {
            job: job.into(),
            current,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    channels: BTreeMap<String, Channel>,
}

/// Validated, immutable mapping from channel name to [`Channel`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registry {
    channels: BTreeMap<String, Channel>,
}

impl Registry {
    /// Build a registry from name/channel pairs, validating every entry.
    pub fn from_channels<I, S>(channels: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = (S, Channel)>,
        S: Into<String>,
    {
        let channels = channels
            .into_iter()
            .map(|(name, channel)| (name.into(), channel))
            .collect();

        let registry = Self { channels };
        registry.validate()?;
        Ok(registry)
    }

    /// Parse a registry from a JSON string.
    pub fn parse(content: &str) -> Result<Self, RegistryError> {
        let document: RegistryDocument = serde_json::from_str(content)?;
        Self::from_channels(document.channels)
    }

    /// Parse a registry from a JSON stream.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, RegistryError> {
        let document: RegistryDocument = serde_json::from_reader(reader)?;
        Self::from_channels(document.channels)
    }

    /// Load a registry from a JSON file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    fn validate(&self) -> Result<(), RegistryError> {
        for (name, channel) in &self.channels {
            if name.is_empty() {
                return Err(RegistryError::EmptyName);
            }

            if channel.job.is_empty() {
                return Err(RegistryError::EmptyJob {
                    channel: name.clone(),
                });
            }
        }

        Ok(())
    }

    /// Look up a channel by name.
    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    /// Number of registered channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether no channels are registered.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Iterate over channels in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Channel)> {
        self.channels
            .iter()
            .map(|(name, channel)| (name.as_str(), channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bad_json() {
        let result = Registry::parse("xxx");
        assert!(matches!(result, Err(RegistryError::Parse(_))));
    }

    #[test]
    fn test_parse_empty_channel_name() {
        let result = Registry::parse(r#"{"channels":{"":{}}}"#);
        assert!(matches!(result, Err(RegistryError::EmptyName)));
    }

    #[test]
    fn test_parse_empty_channel_job() {
        let result = Registry::parse(r#"{"channels":{"foo":{}}}"#);

        let err = result.unwrap_err();
        assert!(matches!(&err, RegistryError::EmptyJob { channel } if channel == "foo"));
        assert_eq!(err.to_string(), "channel \"foo\" has empty job value");
    }

    #[test]
    fn test_parse_ok() {
        let json = r#"
        {
          "channels": {
            "nixos-unstable": {
              "job": "nixos/trunk-combined/tested",
              "current": true
            },
            "nixos-unstable-small": {
              "job": "nixos/unstable-small/tested",
              "current": true
            },
            "nixpkgs-unstable": {
              "job": "nixpkgs/trunk/unstable",
              "current": false
            }
          }
        }
        "#;

        let registry = Registry::parse(json).unwrap();

        let expected = Registry::from_channels([
            (
                "nixos-unstable",
                Channel::new("nixos/trunk-combined/tested", true),
            ),
            (
                "nixos-unstable-small",
                Channel::new("nixos/unstable-small/tested", true),
            ),
            (
                "nixpkgs-unstable",
                Channel::new("nixpkgs/trunk/unstable", false),
            ),
        ])
        .unwrap();

        assert_eq!(registry, expected);
        assert_eq!(registry.len(), 3);
        assert!(!registry.get("nixos-unstable").unwrap().job.is_empty());
        assert!(!registry.get("nixpkgs-unstable").unwrap().current);
    }

    #[test]
    fn test_parse_missing_channels_is_empty() {
        let registry = Registry::parse("{}").unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_iter_is_name_ordered() {
        let registry = Registry::from_channels([
            ("b", Channel::new("job/b", false)),
            ("a", Channel::new("job/a", true)),
        ])
        .unwrap();

        let names: Vec<_> = registry.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channels.json");
        std::fs::write(
            &path,
            r#"{"channels":{"nixos-24.05":{"job":"nixos/release-24.05/tested","current":true}}}"#,
        )
        .unwrap();

        let registry = Registry::load_from_file(&path).unwrap();
        assert_eq!(
            registry.get("nixos-24.05"),
            Some(&Channel::new("nixos/release-24.05/tested", true))
        );
    }

    #[test]
    fn test_load_missing_file() {
        let result = Registry::load_from_file("/nonexistent/channels.json");
        assert!(matches!(result, Err(RegistryError::Io(_))));
    }
}
