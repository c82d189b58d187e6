//! Error taxonomy shared by the journal and the outbox.

use thiserror::Error;

use crate::crypto::SignerError;
use crate::validate::EventValidationError;

/// Errors returned by [`Store`](crate::Store) operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// A required collaborator (connection, signer, validator, applier) is
    /// missing. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// A caller-supplied argument is invalid (blank identifier, non-positive
    /// limit or sequence, unknown status filter).
    #[error("invalid argument: {0}")]
    Validation(String),

    /// The event validator rejected the event.
    #[error("event rejected: {0}")]
    InvalidEvent(#[from] EventValidationError),

    /// The requested row does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// Description of the missing row.
        what: String,
    },

    /// Journal verification found stored history that does not re-derive.
    #[error("integrity failure in campaign {campaign_id} at seq {seq}: {failure}")]
    Integrity {
        /// Campaign whose chain is broken.
        campaign_id: String,
        /// First sequence at which the chain breaks.
        seq: u64,
        /// What did not match.
        failure: IntegrityFailure,
    },

    /// Signing or key lookup failed.
    #[error("signer error: {0}")]
    Signer(#[from] SignerError),

    /// The call context was canceled before the operation started.
    #[error("operation canceled")]
    Canceled,

    /// The call context deadline passed before the operation started.
    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The connection mutex was poisoned by a panic in another thread.
    #[error("connection lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Returns `true` for the not-found sentinel.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` for journal integrity failures.
    #[must_use]
    pub const fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity { .. })
    }

    /// Returns `true` if retrying the same call may succeed.
    ///
    /// Only transient `SQLite` contention (`SQLITE_BUSY`/`SQLITE_LOCKED`)
    /// qualifies.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// The specific check that failed during integrity verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum IntegrityFailure {
    /// Sequences are not contiguous from 1.
    #[error("sequence gap: expected seq {expected}")]
    SequenceGap {
        /// The sequence that should have been found.
        expected: u64,
    },

    /// `prev_hash` does not equal the previous event's chain hash.
    #[error("prev_hash does not match previous chain hash")]
    PrevHashMismatch,

    /// The recomputed content hash differs from the stored one.
    #[error("content hash mismatch")]
    HashMismatch,

    /// The recomputed chain hash differs from the stored one.
    #[error("chain hash mismatch")]
    ChainHashMismatch,

    /// The stored signature does not verify.
    #[error("signature invalid: {details}")]
    SignatureInvalid {
        /// Signer-reported reason.
        details: String,
    },

    /// The sequence allocator does not point one past the last event.
    #[error("sequence counter mismatch: next_seq={next_seq}")]
    CounterMismatch {
        /// The stored `next_seq` value (0 when the counter row is missing).
        next_seq: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_is_retryable() {
        let err = StoreError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(err.is_retryable());
        assert!(!StoreError::Canceled.is_retryable());
    }

    #[test]
    fn integrity_error_names_campaign_and_seq() {
        let err = StoreError::Integrity {
            campaign_id: "camp-x".to_string(),
            seq: 4,
            failure: IntegrityFailure::ChainHashMismatch,
        };
        assert!(err.is_integrity());
        assert_eq!(
            err.to_string(),
            "integrity failure in campaign camp-x at seq 4: chain hash mismatch"
        );
    }
}
