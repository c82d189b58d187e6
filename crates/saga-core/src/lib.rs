//! Durable event journal and projection-apply outbox for the saga campaign
//! service.
//!
//! Every campaign mutation is recorded as an [`Event`] in a per-campaign,
//! hash-chained, signed, append-only journal. Projections (character sheets,
//! session state, ...) are rebuilt from that journal. Appends enqueue a
//! projection-apply outbox row in the same `SQLite` transaction, so "record
//! the fact" and "schedule its side effects" commit or roll back together.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use saga_core::context::CallContext;
//! use saga_core::crypto::Ed25519Keyring;
//! use saga_core::model::NewEvent;
//! use saga_core::validate::DefaultEventValidator;
//! use saga_core::Store;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Store::builder()
//!     .open("/var/lib/saga/saga.db")?
//!     .signer(Arc::new(Ed25519Keyring::generate("k1")))
//!     .validator(Arc::new(DefaultEventValidator::default()))
//!     .build()?;
//!
//! let ctx = CallContext::background();
//! let stored = store.append_event(
//!     &ctx,
//!     NewEvent::new("camp-1", "campaign.created", "user", br#"{"name":"Ashfall"}"#.to_vec()),
//! )?;
//! assert_eq!(stored.seq, 1);
//!
//! store.verify_event_integrity(&ctx)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod journal;
pub mod model;
pub mod outbox;
pub mod pagination;
pub mod validate;

pub use error::{IntegrityFailure, StoreError};
pub use journal::{Store, StoreBuilder};
pub use model::{Event, NewEvent, OutboxRow, OutboxStatus};
