//! Client settings, validated eagerly at construction.
//!
//! Every recognized option is an explicit field with a default; nothing is
//! checked lazily inside individual operations.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use levelcache_transport::connector::ConnectorConfig;
use levelcache_transport::manager::ManagerConfig;
use levelcache_transport::session::{Credentials, Manifest, SessionConfig};

/// Configuration errors, raised at construction and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Key encoding other than utf8.
    #[error("only utf8 key encoding is supported")]
    UnsupportedKeyEncoding,

    /// Value encoding other than utf8 or json.
    #[error("unsupported value encoding: {0}")]
    UnsupportedValueEncoding(String),

    /// A sublevel was configured without the manifest needed to reach it.
    #[error("a manifest is required when using a sublevel")]
    SublevelRequiresManifest,

    /// The configured sublevel is not described by the manifest.
    #[error("sublevel {0:?} is not listed in the manifest")]
    SublevelNotInManifest(String),
}

/// How envelopes are encoded for the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodingMode {
    /// Envelope is serialized to a JSON text blob.
    #[default]
    Utf8,
    /// Envelope is passed as a structured value; the wire codec serializes it.
    Json,
}

impl FromStr for EncodingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "utf8" => Ok(EncodingMode::Utf8),
            "json" => Ok(EncodingMode::Json),
            other => Err(ConfigError::UnsupportedValueEncoding(other.to_string())),
        }
    }
}

impl fmt::Display for EncodingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingMode::Utf8 => f.write_str("utf8"),
            EncodingMode::Json => f.write_str("json"),
        }
    }
}

/// Settings for one cache client. Immutable once the client is started.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Remote store host (default: "localhost").
    pub host: String,
    /// Remote store port (default: 3000).
    pub port: u16,
    /// Key encoding; only utf8 is supported.
    pub key_encoding: EncodingMode,
    /// Envelope encoding mode.
    pub value_encoding: EncodingMode,
    /// Optional partition prefixed onto every storage key.
    pub partition: Option<String>,
    /// Optional nested namespace all operations are scoped under.
    pub sublevel: Option<String>,
    /// Namespace descriptor; required when a sublevel is configured.
    pub manifest: Option<Manifest>,
    /// Credentials forwarded to the remote store after each connect.
    pub auth: Option<Credentials>,
    /// Reconnect attempt ceiling; zero means unlimited retries.
    pub reconnect_attempts: u32,
    /// Connector tuning.
    pub connector: ConnectorConfig,
    /// Session tuning.
    pub session: SessionConfig,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3000,
            key_encoding: EncodingMode::Utf8,
            value_encoding: EncodingMode::Utf8,
            partition: None,
            sublevel: None,
            manifest: None,
            auth: None,
            reconnect_attempts: 0,
            connector: ConnectorConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl ClientSettings {
    /// Validates the settings. Run once at construction; failures are fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_encoding != EncodingMode::Utf8 {
            return Err(ConfigError::UnsupportedKeyEncoding);
        }
        if let Some(sublevel) = &self.sublevel {
            let Some(manifest) = &self.manifest else {
                return Err(ConfigError::SublevelRequiresManifest);
            };
            if !manifest.contains(sublevel) {
                return Err(ConfigError::SublevelNotInManifest(sublevel.clone()));
            }
        }
        Ok(())
    }

    /// Builds the connection-manager configuration for these settings.
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            host: self.host.clone(),
            port: self.port,
            reconnect_attempts: self.reconnect_attempts,
            auth: self.auth.clone(),
            manifest: self.manifest.clone(),
            connector: self.connector.clone(),
            session: self.session.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = ClientSettings::default();
        assert_eq!(settings.host, "localhost");
        assert_eq!(settings.port, 3000);
        assert_eq!(settings.key_encoding, EncodingMode::Utf8);
        assert_eq!(settings.value_encoding, EncodingMode::Utf8);
        assert!(settings.partition.is_none());
        assert!(settings.sublevel.is_none());
        assert!(settings.auth.is_none());
        assert_eq!(settings.reconnect_attempts, 0);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_encoding_mode_from_str() {
        assert_eq!("utf8".parse::<EncodingMode>().unwrap(), EncodingMode::Utf8);
        assert_eq!("json".parse::<EncodingMode>().unwrap(), EncodingMode::Json);
        assert_eq!(
            "binary".parse::<EncodingMode>().unwrap_err(),
            ConfigError::UnsupportedValueEncoding("binary".to_string())
        );
    }

    #[test]
    fn test_non_utf8_key_encoding_rejected() {
        let settings = ClientSettings {
            key_encoding: EncodingMode::Json,
            ..Default::default()
        };
        assert_eq!(
            settings.validate().unwrap_err(),
            ConfigError::UnsupportedKeyEncoding
        );
    }

    #[test]
    fn test_sublevel_requires_manifest() {
        let settings = ClientSettings {
            sublevel: Some("special".to_string()),
            ..Default::default()
        };
        assert_eq!(
            settings.validate().unwrap_err(),
            ConfigError::SublevelRequiresManifest
        );
    }

    #[test]
    fn test_sublevel_must_be_in_manifest() {
        let settings = ClientSettings {
            sublevel: Some("special".to_string()),
            manifest: Some(Manifest {
                sublevels: vec!["other".to_string()],
            }),
            ..Default::default()
        };
        assert_eq!(
            settings.validate().unwrap_err(),
            ConfigError::SublevelNotInManifest("special".to_string())
        );
    }

    #[test]
    fn test_manifest_without_sublevel_is_fine() {
        let settings = ClientSettings {
            manifest: Some(Manifest {
                sublevels: vec!["special".to_string()],
            }),
            ..Default::default()
        };
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_manager_config_carries_settings() {
        let settings = ClientSettings {
            host: "10.0.0.1".to_string(),
            port: 4170,
            reconnect_attempts: 3,
            ..Default::default()
        };
        let config = settings.manager_config();
        assert_eq!(config.host, "10.0.0.1");
        assert_eq!(config.port, 4170);
        assert_eq!(config.reconnect_attempts, 3);
    }
}
