//! Cooperative cancellation.
//!
//! A [`CancelToken`] is cancelled at most once: the first reason wins and
//! every waiter observes that same reason. Tokens may also be linked to a
//! plain [`CancellationToken`] ("signal") so abort-style callers and
//! token-style callers share one mechanism.

use crate::error::HttpError;
use crate::request::RequestConfig;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

const DEFAULT_CANCEL_MESSAGE: &str = "canceled";

/// Reason a request was cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct Cancel {
    message: String,
}

impl Cancel {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Default for Cancel {
    fn default() -> Self {
        Self::new(DEFAULT_CANCEL_MESSAGE)
    }
}

#[derive(Debug, Default)]
struct TokenInner {
    reason: OnceLock<Cancel>,
    signal: CancellationToken,
}

/// Cancellation token shared between the caller and in-flight requests.
///
/// Cloning is cheap; all clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    /// Create a token and hand its cancel function to `executor`.
    ///
    /// ```ignore
    /// let mut cancel = None;
    /// let token = CancelToken::new(|c| cancel = Some(c));
    /// ```
    pub fn new<F>(executor: F) -> Self
    where
        F: FnOnce(Canceller),
    {
        let token = Self::default();
        executor(Canceller {
            token: token.clone(),
        });
        token
    }

    /// Create a token together with its cancel function.
    #[must_use]
    pub fn source() -> CancelTokenSource {
        let token = Self::default();
        CancelTokenSource {
            canceller: Canceller {
                token: token.clone(),
            },
            token,
        }
    }

    /// Create a token that is also cancelled when `signal` fires.
    ///
    /// The link is one-way: cancelling the token never cancels `signal`.
    /// A parent-triggered cancellation reports the default reason.
    #[must_use]
    pub fn linked(signal: &CancellationToken) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                reason: OnceLock::new(),
                signal: signal.child_token(),
            }),
        }
    }

    /// The reason, once cancelled.
    #[must_use]
    pub fn reason(&self) -> Option<&Cancel> {
        if let Some(reason) = self.inner.reason.get() {
            return Some(reason);
        }
        // A linked parent fired without going through `cancel`.
        self.inner
            .signal
            .is_cancelled()
            .then(|| self.inner.reason.get_or_init(Cancel::default))
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Fail with `cancelled` if the token has fired.
    ///
    /// # Errors
    ///
    /// Returns a `cancelled` [`HttpError`] carrying the stored reason.
    pub fn throw_if_requested(&self) -> Result<(), HttpError> {
        match self.reason() {
            Some(reason) => Err(HttpError::cancelled(reason.clone())),
            None => Ok(()),
        }
    }

    /// Wait until the token is cancelled and return the reason.
    pub async fn cancelled(&self) -> Cancel {
        self.inner.signal.cancelled().await;
        self.reason().cloned().unwrap_or_default()
    }

    /// A signal that fires when this token is cancelled.
    #[must_use]
    pub fn signal(&self) -> CancellationToken {
        self.inner.signal.child_token()
    }

    fn cancel(&self, message: impl Into<String>) -> bool {
        if self.is_cancelled() || self.inner.reason.set(Cancel::new(message)).is_err() {
            return false;
        }
        self.inner.signal.cancel();
        tracing::debug!(
            reason = self.reason().map(Cancel::message),
            "cancel token fired"
        );
        true
    }
}

/// Cancel function handed out by [`CancelToken::new`].
#[derive(Debug, Clone)]
pub struct Canceller {
    token: CancelToken,
}

impl Canceller {
    /// Cancel the token. Only the first call has an effect.
    pub fn cancel(&self, message: impl Into<String>) -> bool {
        self.token.cancel(message)
    }
}

/// Token paired with its cancel function.
#[derive(Debug, Clone)]
pub struct CancelTokenSource {
    token: CancelToken,
    canceller: Canceller,
}

impl CancelTokenSource {
    #[must_use]
    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Cancel the token. Only the first call has an effect.
    pub fn cancel(&self, message: impl Into<String>) -> bool {
        self.canceller.cancel(message)
    }
}

/// Combined view of every cancellation handle a request carries.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    token: Option<CancelToken>,
    signal: Option<CancellationToken>,
}

impl Cancellation {
    #[must_use]
    pub fn from_config(config: &RequestConfig) -> Self {
        Self {
            token: config.cancel_token.clone(),
            signal: config.signal.clone(),
        }
    }

    /// `true` when any handle is present.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.token.is_some() || self.signal.is_some()
    }

    /// Fail with `cancelled` if any handle has fired.
    ///
    /// # Errors
    ///
    /// Returns a `cancelled` [`HttpError`].
    pub fn check(&self) -> Result<(), HttpError> {
        if let Some(token) = &self.token {
            token.throw_if_requested()?;
        }
        if self.signal.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(HttpError::cancelled(Cancel::default()));
        }
        Ok(())
    }

    /// Resolve when any handle fires. Never resolves when none is present.
    pub async fn cancelled(&self) -> Cancel {
        match (&self.token, &self.signal) {
            (Some(token), Some(signal)) => tokio::select! {
                reason = token.cancelled() => reason,
                () = signal.cancelled() => Cancel::default(),
            },
            (Some(token), None) => token.cancelled().await,
            (None, Some(signal)) => {
                signal.cancelled().await;
                Cancel::default()
            }
            (None, None) => std::future::pending().await,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::time::Duration;

    #[test]
    fn test_first_cancel_wins() {
        let source = CancelToken::source();
        let token = source.token();

        assert!(source.cancel("a"));
        assert!(!source.cancel("b"));

        assert_eq!(token.reason().unwrap().message(), "a");
    }

    #[test]
    fn test_executor_receives_canceller() {
        let mut canceller = None;
        let token = CancelToken::new(|c| canceller = Some(c));
        assert!(!token.is_cancelled());

        canceller.unwrap().cancel("stop");
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_throw_if_requested() {
        let source = CancelToken::source();
        let token = source.token();
        assert!(token.throw_if_requested().is_ok());

        source.cancel("bye");
        let err = token.throw_if_requested().unwrap_err();
        assert!(err.is_cancel());
        assert_eq!(err.code(), ErrorCode::Cancelled);
        assert_eq!(err.cancel_reason().unwrap().message(), "bye");
    }

    #[tokio::test]
    async fn test_all_waiters_observe_same_reason() {
        let source = CancelToken::source();
        let t1 = source.token();
        let t2 = source.token();

        let w1 = tokio::spawn(async move { t1.cancelled().await });
        let w2 = tokio::spawn(async move { t2.cancelled().await });

        tokio::time::sleep(Duration::from_millis(5)).await;
        source.cancel("first");
        source.cancel("second");

        assert_eq!(w1.await.unwrap().message(), "first");
        assert_eq!(w2.await.unwrap().message(), "first");
    }

    #[tokio::test]
    async fn test_linked_signal_cancels_token() {
        let signal = CancellationToken::new();
        let token = CancelToken::linked(&signal);

        signal.cancel();
        let reason = tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
        assert_eq!(reason.message(), DEFAULT_CANCEL_MESSAGE);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_linked_token_keeps_parent_reason_first() {
        let signal = CancellationToken::new();
        let token = CancelToken::linked(&signal);
        assert!(!token.is_cancelled());

        signal.cancel();
        assert!(token.is_cancelled());
        let canceller = Canceller {
            token: token.clone(),
        };
        assert!(!canceller.cancel("late"));
        assert_eq!(token.reason().unwrap().message(), DEFAULT_CANCEL_MESSAGE);
    }

    #[test]
    fn test_linked_token_holds_no_background_reference() {
        let signal = CancellationToken::new();
        let token = CancelToken::linked(&signal);
        let weak = Arc::downgrade(&token.inner);
        assert_eq!(Arc::strong_count(&token.inner), 1);

        drop(token);
        assert!(weak.upgrade().is_none());

        let survivor = CancelToken::linked(&signal);
        assert!(Canceller { token: survivor }.cancel("child only"));
        assert!(!signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancellation_prefers_whichever_fires() {
        let signal = CancellationToken::new();
        let config = RequestConfig {
            signal: Some(signal.clone()),
            ..RequestConfig::default()
        };
        let cancellation = Cancellation::from_config(&config);
        assert!(cancellation.is_armed());
        assert!(cancellation.check().is_ok());

        signal.cancel();
        assert!(cancellation.check().unwrap_err().is_cancel());
        assert_eq!(cancellation.cancelled().await, Cancel::default());
    }
}
