//! Subcommand implementations.

pub mod append;
pub mod events;
pub mod outbox;
pub mod verify;

use std::sync::Arc;

use anyhow::{Context, Result};
use saga_core::Store;
use saga_core::config::SagaConfig;
use saga_core::validate::DefaultEventValidator;
use serde::Serialize;

/// What a command needs from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Reads and outbox maintenance only.
    Read,
    /// Signing keys for verification and appends.
    Signed,
}

/// Opens the configured database.
pub fn open_store(config: &SagaConfig, access: Access) -> Result<Store> {
    let mut builder = Store::builder()
        .open(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?
        .outbox_settings(config.outbox.settings());

    if access == Access::Signed {
        let keyring = config
            .signing
            .build_keyring()
            .context("failed to load signing keys")?;
        builder = builder
            .signer(Arc::new(keyring))
            .validator(Arc::new(DefaultEventValidator::new()));
    }

    builder.build().context("failed to initialize journal store")
}

/// Prints `value` as pretty JSON on stdout.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render JSON")?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use saga_core::config::{SagaConfig, SigningKeyConfig};
    use tempfile::TempDir;

    /// A config pointing at a fresh database with one signing key.
    pub fn temp_config() -> (SagaConfig, TempDir) {
        let dir = TempDir::new().expect("failed to create temp dir");
        let mut config = SagaConfig {
            database_path: dir.path().join("saga.db"),
            ..SagaConfig::default()
        };
        config.signing.keys.push(SigningKeyConfig {
            key_id: "k1".to_string(),
            seed_hex: "11".repeat(32),
        });
        (config, dir)
    }
}
