//! Chain-hash signing contract and the bundled Ed25519 keyring.

use std::collections::HashMap;
use std::sync::RwLock;

use ed25519_dalek::{Signature, Signer as _, SigningKey, VerifyingKey};
use thiserror::Error;

/// Domain separator for chain-hash signatures.
const SIGNATURE_DOMAIN: &[u8] = b"saga-chain-signature-v1";

/// Errors from signing or verifying a chain hash.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SignerError {
    /// No key is registered under this id.
    #[error("unknown signing key id: {key_id}")]
    UnknownKey {
        /// The key id that was looked up.
        key_id: String,
    },

    /// The key is verify-only and cannot sign.
    #[error("key {key_id} has no private half")]
    NoSigningKey {
        /// The key id without a signing key.
        key_id: String,
    },

    /// A key with this id is already registered.
    #[error("key id already registered: {key_id}")]
    DuplicateKey {
        /// The duplicated key id.
        key_id: String,
    },

    /// The stored signature could not be decoded.
    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    /// The signature is well-formed but does not verify.
    #[error("signature verification failed for key {key_id}")]
    VerificationFailed {
        /// The key id the signature claims.
        key_id: String,
    },

    /// Key material could not be parsed.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// The keyring lock was poisoned.
    #[error("keyring lock poisoned")]
    LockPoisoned,
}

/// Signs and verifies chain hashes, scoped per campaign.
///
/// Implementations must report the key id used for each signature and keep
/// retired keys available for verification so history signed before a
/// rotation still verifies.
pub trait ChainSigner: Send + Sync {
    /// Signs `chain_hash` for `campaign_id`, returning `(signature, key_id)`.
    fn sign_chain_hash(
        &self,
        campaign_id: &str,
        chain_hash: &str,
    ) -> Result<(String, String), SignerError>;

    /// Verifies a signature produced by [`Self::sign_chain_hash`].
    fn verify_chain_hash(
        &self,
        campaign_id: &str,
        chain_hash: &str,
        signature: &str,
        key_id: &str,
    ) -> Result<(), SignerError>;
}

#[derive(Debug)]
struct KeyEntry {
    signing: Option<SigningKey>,
    verifying: VerifyingKey,
}

#[derive(Debug)]
struct KeyringState {
    active_key_id: String,
    keys: HashMap<String, KeyEntry>,
}

/// In-process Ed25519 keyring with one active signing key and any number of
/// verification keys.
#[derive(Debug)]
pub struct Ed25519Keyring {
    state: RwLock<KeyringState>,
}

impl Ed25519Keyring {
    /// Creates a keyring whose active key is `signing_key`.
    #[must_use]
    pub fn new(key_id: impl Into<String>, signing_key: SigningKey) -> Self {
        let key_id = key_id.into();
        let mut keys = HashMap::new();
        keys.insert(
            key_id.clone(),
            KeyEntry {
                verifying: signing_key.verifying_key(),
                signing: Some(signing_key),
            },
        );
        Self {
            state: RwLock::new(KeyringState {
                active_key_id: key_id,
                keys,
            }),
        }
    }

    /// Creates a keyring with a freshly generated active key.
    #[must_use]
    pub fn generate(key_id: impl Into<String>) -> Self {
        Self::new(key_id, SigningKey::generate(&mut rand::rngs::OsRng))
    }

    /// Creates a keyring from a 32-byte seed.
    #[must_use]
    pub fn from_seed(key_id: impl Into<String>, seed: &[u8; 32]) -> Self {
        Self::new(key_id, SigningKey::from_bytes(seed))
    }

    /// Parses a hex-encoded 32-byte seed into a signing key.
    pub fn signing_key_from_hex(seed_hex: &str) -> Result<SigningKey, SignerError> {
        let bytes = hex::decode(seed_hex.trim())
            .map_err(|e| SignerError::InvalidKey(format!("seed is not hex: {e}")))?;
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            SignerError::InvalidKey(format!("seed has length {}, expected 32", bytes.len()))
        })?;
        Ok(SigningKey::from_bytes(&seed))
    }

    /// Adds `signing_key` under `key_id` and makes it the active key.
    ///
    /// Previously active keys remain available for verification.
    pub fn rotate_to(
        &self,
        key_id: impl Into<String>,
        signing_key: SigningKey,
    ) -> Result<(), SignerError> {
        let key_id = key_id.into();
        let mut state = self.state.write().map_err(|_| SignerError::LockPoisoned)?;
        if state.keys.contains_key(&key_id) {
            return Err(SignerError::DuplicateKey { key_id });
        }
        state.keys.insert(
            key_id.clone(),
            KeyEntry {
                verifying: signing_key.verifying_key(),
                signing: Some(signing_key),
            },
        );
        tracing::info!(
            previous_key_id = %state.active_key_id,
            key_id = %key_id,
            "rotated chain signing key"
        );
        state.active_key_id = key_id;
        Ok(())
    }

    /// Adds a verify-only key, e.g. a retired key whose private half has been
    /// destroyed.
    pub fn insert_verifying_key(
        &self,
        key_id: impl Into<String>,
        verifying_key: VerifyingKey,
    ) -> Result<(), SignerError> {
        let key_id = key_id.into();
        let mut state = self.state.write().map_err(|_| SignerError::LockPoisoned)?;
        if state.keys.contains_key(&key_id) {
            return Err(SignerError::DuplicateKey { key_id });
        }
        state.keys.insert(
            key_id,
            KeyEntry {
                signing: None,
                verifying: verifying_key,
            },
        );
        Ok(())
    }

    /// The id of the key new signatures are made with.
    pub fn active_key_id(&self) -> Result<String, SignerError> {
        let state = self.state.read().map_err(|_| SignerError::LockPoisoned)?;
        Ok(state.active_key_id.clone())
    }

    /// The verifying key registered under `key_id`.
    pub fn verifying_key(&self, key_id: &str) -> Result<VerifyingKey, SignerError> {
        let state = self.state.read().map_err(|_| SignerError::LockPoisoned)?;
        state
            .keys
            .get(key_id)
            .map(|entry| entry.verifying)
            .ok_or_else(|| SignerError::UnknownKey {
                key_id: key_id.to_string(),
            })
    }
}

fn signing_message(campaign_id: &str, chain_hash: &str) -> Vec<u8> {
    let mut message =
        Vec::with_capacity(SIGNATURE_DOMAIN.len() + 8 + campaign_id.len() + chain_hash.len());
    message.extend_from_slice(SIGNATURE_DOMAIN);
    message.extend_from_slice(&(campaign_id.len() as u64).to_le_bytes());
    message.extend_from_slice(campaign_id.as_bytes());
    message.extend_from_slice(chain_hash.as_bytes());
    message
}

impl ChainSigner for Ed25519Keyring {
    fn sign_chain_hash(
        &self,
        campaign_id: &str,
        chain_hash: &str,
    ) -> Result<(String, String), SignerError> {
        let state = self.state.read().map_err(|_| SignerError::LockPoisoned)?;
        let key_id = state.active_key_id.clone();
        let entry = state
            .keys
            .get(&key_id)
            .ok_or_else(|| SignerError::UnknownKey {
                key_id: key_id.clone(),
            })?;
        let signing = entry
            .signing
            .as_ref()
            .ok_or_else(|| SignerError::NoSigningKey {
                key_id: key_id.clone(),
            })?;
        let signature = signing.sign(&signing_message(campaign_id, chain_hash));
        Ok((hex::encode(signature.to_bytes()), key_id))
    }

    fn verify_chain_hash(
        &self,
        campaign_id: &str,
        chain_hash: &str,
        signature: &str,
        key_id: &str,
    ) -> Result<(), SignerError> {
        let verifying = self.verifying_key(key_id)?;
        let bytes = hex::decode(signature)
            .map_err(|e| SignerError::MalformedSignature(format!("not hex: {e}")))?;
        let bytes: [u8; 64] = bytes.as_slice().try_into().map_err(|_| {
            SignerError::MalformedSignature(format!("length {}, expected 64", bytes.len()))
        })?;
        let signature = Signature::from_bytes(&bytes);
        verifying
            .verify_strict(&signing_message(campaign_id, chain_hash), &signature)
            .map_err(|_| SignerError::VerificationFailed {
                key_id: key_id.to_string(),
            })
    }
}
