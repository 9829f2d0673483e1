//! Operator configuration.
//!
//! Loaded from a TOML file when one exists, with every field defaulted so
//! a bare deployment needs no file at all. Command-line flags override
//! file values in `main`.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Errors loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Tunables for the controller loop.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct OperatorConfig {
    /// Namespace to watch; unset watches the whole cluster.
    pub namespace: Option<String>,
    /// Periodic re-reconcile interval for settled sessions, in seconds.
    pub resync_seconds: u64,
    /// Requeue delay after a failed reconcile, in seconds.
    pub error_requeue_seconds: u64,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            resync_seconds: 300,
            error_requeue_seconds: 5,
        }
    }
}

impl OperatorConfig {
    /// Parse a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Load from `path` when it exists, defaults otherwise.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = OperatorConfig::load(Path::new("/nonexistent/sidetrack.toml")).unwrap();
        assert_eq!(config, OperatorConfig::default());
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "namespace = \"bookinfo\"\nresync_seconds = 60").unwrap();

        let config = OperatorConfig::load(file.path()).unwrap();
        assert_eq!(config.namespace.as_deref(), Some("bookinfo"));
        assert_eq!(config.resync_seconds, 60);
        assert_eq!(config.error_requeue_seconds, 5);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "namespase = \"typo\"").unwrap();

        assert!(matches!(
            OperatorConfig::load(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }
}
