//! Configuration parsing.
//!
//! A `saga.toml` names the database, tunes the projection-apply outbox and
//! lists the chain signing keys.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{Ed25519Keyring, SignerError};
use crate::outbox::{DEFAULT_PROCESSING_STALE_AFTER, OutboxSettings};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SagaConfig {
    /// Path of the `SQLite` journal database.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    #[serde(default)]
    pub outbox: OutboxConfig,

    #[serde(default)]
    pub signing: SigningConfig,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("saga.db")
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            outbox: OutboxConfig::default(),
            signing: SigningConfig::default(),
        }
    }
}

impl SagaConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a value is out of range.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.database_path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "database_path must not be empty".to_string(),
            ));
        }
        if self.outbox.batch_limit == 0 {
            return Err(ConfigError::Validation(
                "outbox.batch_limit must be positive".to_string(),
            ));
        }
        if self.outbox.poll_interval.is_zero() {
            return Err(ConfigError::Validation(
                "outbox.poll_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Projection-apply outbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboxConfig {
    /// Enqueue outbox rows on append.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Age after which a `processing` claim may be reclaimed.
    #[serde(default = "default_processing_stale_after", with = "humantime_serde")]
    pub processing_stale_after: Duration,

    /// Rows claimed per worker pass.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,

    /// Delay between worker passes.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

const fn default_true() -> bool {
    true
}

const fn default_processing_stale_after() -> Duration {
    DEFAULT_PROCESSING_STALE_AFTER
}

const fn default_batch_limit() -> usize {
    64
}

const fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            processing_stale_after: default_processing_stale_after(),
            batch_limit: default_batch_limit(),
            poll_interval: default_poll_interval(),
        }
    }
}

impl OutboxConfig {
    /// The store-level settings this configuration selects.
    #[must_use]
    pub const fn settings(&self) -> OutboxSettings {
        OutboxSettings {
            enabled: self.enabled,
            processing_stale_after: self.processing_stale_after,
        }
    }
}

/// Chain signing keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SigningConfig {
    /// Key new signatures are made with. Defaults to the first key.
    #[serde(default)]
    pub active_key_id: String,

    /// All keys, including retired ones kept for verification.
    #[serde(default)]
    pub keys: Vec<SigningKeyConfig>,
}

/// One Ed25519 key, as a hex-encoded 32-byte seed.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SigningKeyConfig {
    pub key_id: String,
    pub seed_hex: String,
}

impl fmt::Debug for SigningKeyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyConfig")
            .field("key_id", &self.key_id)
            .field("seed_hex", &"<redacted>")
            .finish()
    }
}

impl SigningConfig {
    /// Builds the keyring: the active key signs, every other key only
    /// verifies.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if there are no keys, a seed is
    /// malformed, a key id repeats, or the active key is not listed.
    pub fn build_keyring(&self) -> Result<Ed25519Keyring, ConfigError> {
        let first = self.keys.first().ok_or_else(|| {
            ConfigError::Validation("signing.keys must list at least one key".to_string())
        })?;
        let active_key_id = if self.active_key_id.trim().is_empty() {
            first.key_id.trim()
        } else {
            self.active_key_id.trim()
        };

        let active = self
            .keys
            .iter()
            .find(|key| key.key_id.trim() == active_key_id)
            .ok_or_else(|| {
                ConfigError::Validation(format!(
                    "active signing key {active_key_id:?} is not in signing.keys"
                ))
            })?;

        let keyring = Ed25519Keyring::new(active_key_id, parse_seed(active)?);
        for key in self.keys.iter().filter(|key| key.key_id.trim() != active_key_id) {
            let signing_key = parse_seed(key)?;
            keyring
                .insert_verifying_key(key.key_id.trim(), signing_key.verifying_key())
                .map_err(|err| ConfigError::Validation(err.to_string()))?;
        }
        Ok(keyring)
    }
}

fn parse_seed(key: &SigningKeyConfig) -> Result<ed25519_dalek::SigningKey, ConfigError> {
    if key.key_id.trim().is_empty() {
        return Err(ConfigError::Validation(
            "signing key_id must not be empty".to_string(),
        ));
    }
    Ed25519Keyring::signing_key_from_hex(&key.seed_hex).map_err(|err: SignerError| {
        ConfigError::Validation(format!("signing key {}: {err}", key.key_id))
    })
}

/// Configuration errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ChainSigner;

    const SAMPLE: &str = r#"
database_path = "/var/lib/saga/saga.db"

[outbox]
enabled = true
processing_stale_after = "2m"
batch_limit = 16
poll_interval = "500ms"

[signing]
active_key_id = "k2"

[[signing.keys]]
key_id = "k1"
seed_hex = "0101010101010101010101010101010101010101010101010101010101010101"

[[signing.keys]]
key_id = "k2"
seed_hex = "0202020202020202020202020202020202020202020202020202020202020202"
"#;

    #[test]
    fn parses_full_config() {
        let config = SagaConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/var/lib/saga/saga.db"));
        assert_eq!(config.outbox.processing_stale_after, Duration::from_secs(120));
        assert_eq!(config.outbox.poll_interval, Duration::from_millis(500));
        assert_eq!(config.outbox.batch_limit, 16);
        assert_eq!(config.signing.keys.len(), 2);
    }

    #[test]
    fn defaults_apply_to_empty_config() {
        let config = SagaConfig::from_toml("").unwrap();
        assert_eq!(config, SagaConfig::default());
        assert_eq!(config.outbox.settings(), OutboxSettings::default());
        assert_eq!(config.outbox.batch_limit, 64);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let err = SagaConfig::from_toml("[outbox]\nbatch_limit = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        let err = SagaConfig::from_toml("[outbox]\npoll_interval = \"0s\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        let err = SagaConfig::from_toml("database_path = 7").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn keyring_signs_with_active_and_verifies_retired() {
        let config = SagaConfig::from_toml(SAMPLE).unwrap();
        let keyring = config.signing.build_keyring().unwrap();
        assert_eq!(keyring.active_key_id().unwrap(), "k2");

        let retired = Ed25519Keyring::from_seed("k1", &[1; 32]);
        let (signature, key_id) = retired.sign_chain_hash("camp", "abcd").unwrap();
        keyring
            .verify_chain_hash("camp", "abcd", &signature, &key_id)
            .unwrap();
    }

    #[test]
    fn keyring_errors_are_validation_errors() {
        let mut signing = SigningConfig::default();
        assert!(matches!(
            signing.build_keyring(),
            Err(ConfigError::Validation(_))
        ));

        signing.keys.push(SigningKeyConfig {
            key_id: "k1".to_string(),
            seed_hex: "not-hex".to_string(),
        });
        assert!(matches!(
            signing.build_keyring(),
            Err(ConfigError::Validation(_))
        ));

        signing.keys[0].seed_hex = "03".repeat(32);
        signing.active_key_id = "missing".to_string();
        assert!(matches!(
            signing.build_keyring(),
            Err(ConfigError::Validation(_))
        ));

        signing.active_key_id.clear();
        assert_eq!(signing.build_keyring().unwrap().active_key_id().unwrap(), "k1");
    }

    #[test]
    fn debug_redacts_seeds() {
        let key = SigningKeyConfig {
            key_id: "k1".to_string(),
            seed_hex: "05".repeat(32),
        };
        assert!(!format!("{key:?}").contains("0505"));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = SagaConfig::from_toml(SAMPLE).unwrap();
        let rendered = config.to_toml().unwrap();
        assert_eq!(SagaConfig::from_toml(&rendered).unwrap(), config);
    }
}
