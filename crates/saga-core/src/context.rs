//! Cancellation and deadline context passed to every store operation.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::StoreError;

/// Per-call cancellation context.
///
/// Store operations are synchronous; async callers share a
/// [`CancellationToken`] with the context and trip it from their own task.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// A context that is never canceled and has no deadline.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// A context canceled when `token` is canceled.
    #[must_use]
    pub const fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Returns a copy of this context that also expires after `timeout`.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Returns a copy of this context that also expires at `deadline`.
    ///
    /// An earlier existing deadline is kept.
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        Self {
            token: self.token.clone(),
            deadline: Some(deadline),
        }
    }

    /// The underlying cancellation token.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Fails with [`StoreError::Canceled`] or [`StoreError::DeadlineExceeded`]
    /// if the context is done.
    pub fn check(&self) -> Result<(), StoreError> {
        if self.token.is_cancelled() {
            return Err(StoreError::Canceled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(StoreError::DeadlineExceeded);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_context_is_live() {
        assert!(CallContext::background().check().is_ok());
    }

    #[test]
    fn canceled_token_fails_check() {
        let token = CancellationToken::new();
        let ctx = CallContext::with_token(token.clone());
        token.cancel();
        assert!(matches!(ctx.check(), Err(StoreError::Canceled)));
    }

    #[test]
    fn elapsed_deadline_fails_check() {
        let ctx = CallContext::background().with_deadline(Instant::now());
        assert!(matches!(ctx.check(), Err(StoreError::DeadlineExceeded)));
    }

    #[test]
    fn earlier_deadline_wins() {
        let now = Instant::now();
        let ctx = CallContext::background()
            .with_deadline(now)
            .with_timeout(Duration::from_secs(60));
        assert!(matches!(ctx.check(), Err(StoreError::DeadlineExceeded)));
    }
}
