//! Per-call cancellation and deadlines.

use crate::error::Error;

use std::time::Duration;

use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// Cancellation scope for one producer call.
///
/// A context is cancelled explicitly through its token or implicitly once its deadline
/// passes. Cancellation only ever affects the call the context was passed to; the
/// shared connection keeps running.
#[derive(Clone, Debug, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that expires `timeout` from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// A context that expires at `deadline`.
    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// A context cancelled together with `token`.
    #[must_use]
    pub const fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Cancel this context and every clone of it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The deadline, if one was set.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The error describing why this context is done, or `None` while it is live.
    #[must_use]
    pub fn err(&self) -> Option<Error> {
        if self.token.is_cancelled() {
            return Some(Error::Cancelled);
        }

        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Error::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is done, with the reason.
    ///
    /// Never resolves for a background context.
    pub async fn done(&self) -> Error {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    () = self.token.cancelled() => Error::Cancelled,
                    () = sleep_until(deadline) => Error::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                Error::Cancelled
            }
        }
    }
}
