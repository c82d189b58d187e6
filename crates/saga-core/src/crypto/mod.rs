//! Hash-chain and signature primitives for the event journal.
//!
//! - **Content hash**: BLAKE3 over a canonical, length-prefixed encoding of an
//!   event's fields (excluding its sequence and the chain/signature fields).
//! - **Chain hash**: BLAKE3 over the previous event's chain hash and this
//!   event's content hash. Tampering with any stored event changes the chain
//!   hash of every later event in the campaign.
//! - **Signatures**: a [`ChainSigner`] signs each chain hash, scoped to the
//!   campaign, and reports the key id it used so keys can rotate.
//!
//! The signer is the trust boundary: whoever holds the signing keys can
//! rewrite history undetected. [`Ed25519Keyring`] is the bundled signer.
//!
//! # Example
//!
//! ```rust
//! use saga_core::crypto::{ChainSigner, Ed25519Keyring, EventHasher};
//!
//! let chain_hash = EventHasher::chain_hash("", &EventHasher::hash_bytes(b"genesis"));
//! let keyring = Ed25519Keyring::generate("k1");
//! let (signature, key_id) = keyring.sign_chain_hash("camp-1", &chain_hash).unwrap();
//! keyring
//!     .verify_chain_hash("camp-1", &chain_hash, &signature, &key_id)
//!     .unwrap();
//! assert!(keyring
//!     .verify_chain_hash("camp-2", &chain_hash, &signature, &key_id)
//!     .is_err());
//! ```

mod hash;
mod keyring;

pub use hash::{EventHasher, HASH_HEX_LEN, hashes_equal};
pub use keyring::{ChainSigner, Ed25519Keyring, SignerError};
