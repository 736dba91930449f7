//! Retry helper for transient device and transport failures.
//!
//! [`with_retry`] wraps a single fallible async operation (spawning an SSH
//! session, reading a line, installing a package) and re-invokes it while the
//! error is classified as retryable. Between attempts a `backoff` callback is
//! consulted; returning `true` aborts the loop, which is how launchers stop
//! retrying once a shutdown has been requested.
//!
//! For `retries = n - 1`, the operation is invoked at most `n` times and the
//! backoff callback at most `n - 1` times.
//!
//! # Example
//!
//! ```
//! use testlauncher::retry::{RetryError, RetryOptions, with_retry};
//!
//! # tokio_test::block_on(async {
//! let options = RetryOptions::new("connect").retries(2).wrap_errors(true);
//! let result: Result<(), RetryError<std::io::Error>> = with_retry(
//!     &options,
//!     || async { Err(std::io::Error::other("refused")) },
//!     |_| true,
//!     || false,
//! )
//! .await;
//!
//! assert!(matches!(result, Err(RetryError::RetriesExceeded { retries: 2, .. })));
//! # });
//! ```

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Outcome of a [`with_retry`] call that did not produce a value.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The underlying error, either non-retryable or surfaced unwrapped
    /// after the retries were exhausted.
    #[error("{0}")]
    Inner(E),

    /// Retries exhausted with wrapping enabled.
    #[error("{operation} still failing after {retries} retries")]
    RetriesExceeded {
        /// The configured retry count.
        retries: usize,
        /// Name of the operation that was retried.
        operation: String,
    },

    /// The backoff callback asked to stop retrying.
    #[error("retries of {operation} aborted")]
    Aborted {
        /// Name of the operation that was being retried.
        operation: String,
    },
}

impl<E> RetryError<E> {
    /// Returns the wrapped error, if this is [`RetryError::Inner`].
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// Settings for a single [`with_retry`] call.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Identity of the retried operation, used in logs and errors.
    pub operation: String,

    /// Number of retries after the first attempt.
    pub retries: usize,

    /// Surface [`RetryError::RetriesExceeded`] instead of the last error
    /// once retries are exhausted. Ignored when `retries` is zero.
    pub wrap_errors: bool,

    /// Delay before the first retry. Doubles after every retry.
    pub initial_delay: Duration,

    /// Upper bound for the exponential delay.
    pub max_delay: Duration,
}

impl RetryOptions {
    /// Options for `operation` with no retries and no delay.
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            retries: 0,
            wrap_errors: false,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Sets the number of retries.
    pub fn retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    /// Enables or disables error wrapping.
    pub fn wrap_errors(mut self, wrap: bool) -> Self {
        self.wrap_errors = wrap;
        self
    }

    /// Enables exponential backoff between attempts.
    pub fn backoff_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max.max(initial);
        self
    }
}

/// Runs `op`, retrying while `is_retryable` accepts the error.
///
/// After each retryable failure, if retries remain, `backoff` is called; a
/// `true` return aborts with [`RetryError::Aborted`]. Non-retryable errors
/// are returned immediately as [`RetryError::Inner`].
pub async fn with_retry<T, E, F, Fut, P, B>(
    options: &RetryOptions,
    mut op: F,
    is_retryable: P,
    mut backoff: B,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    B: FnMut() -> bool,
    E: std::fmt::Display,
{
    let mut failures = 0usize;
    let mut delay = options.initial_delay;

    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !is_retryable(&err) {
            return Err(RetryError::Inner(err));
        }

        failures += 1;
        if failures > options.retries {
            if options.wrap_errors && options.retries > 0 {
                return Err(RetryError::RetriesExceeded {
                    retries: options.retries,
                    operation: options.operation.clone(),
                });
            }
            return Err(RetryError::Inner(err));
        }

        debug!(
            "{} failed (attempt {}/{}): {}",
            options.operation,
            failures,
            options.retries + 1,
            err
        );

        if backoff() {
            return Err(RetryError::Aborted {
                operation: options.operation.clone(),
            });
        }

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(options.max_delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io;

    fn always_fails(calls: &Cell<usize>) -> impl Future<Output = Result<(), io::Error>> + '_ {
        calls.set(calls.get() + 1);
        async { Err(io::Error::other("boom")) }
    }

    #[tokio::test]
    async fn test_retries_exhausted_wrapped() {
        let calls = Cell::new(0);
        let backoffs = Cell::new(0);
        let options = RetryOptions::new("always_fails").retries(2).wrap_errors(true);

        let result = with_retry(
            &options,
            || always_fails(&calls),
            |_| true,
            || {
                backoffs.set(backoffs.get() + 1);
                false
            },
        )
        .await;

        assert_eq!(calls.get(), 3);
        assert_eq!(backoffs.get(), 2);
        match result {
            Err(RetryError::RetriesExceeded { retries, operation }) => {
                assert_eq!(retries, 2);
                assert_eq!(operation, "always_fails");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retries_exhausted_unwrapped() {
        let calls = Cell::new(0);
        let options = RetryOptions::new("always_fails").retries(2);

        let result = with_retry(&options, || always_fails(&calls), |_| true, || false).await;

        assert_eq!(calls.get(), 3);
        let inner = result.unwrap_err().into_inner().expect("original error");
        assert_eq!(inner.to_string(), "boom");
    }

    #[tokio::test]
    async fn test_zero_retries_raise_original_even_when_wrapping() {
        let calls = Cell::new(0);
        let options = RetryOptions::new("once").wrap_errors(true);

        let result = with_retry(&options, || always_fails(&calls), |_| true, || false).await;

        assert_eq!(calls.get(), 1);
        assert!(matches!(result, Err(RetryError::Inner(_))));
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_immediate() {
        let calls = Cell::new(0);
        let options = RetryOptions::new("strict").retries(5);

        let result = with_retry(&options, || always_fails(&calls), |_| false, || false).await;

        assert_eq!(calls.get(), 1);
        assert!(matches!(result, Err(RetryError::Inner(_))));
    }

    #[tokio::test]
    async fn test_backoff_aborts() {
        let calls = Cell::new(0);
        let options = RetryOptions::new("aborted").retries(5);

        let result = with_retry(&options, || always_fails(&calls), |_| true, || true).await;

        assert_eq!(calls.get(), 1);
        assert!(matches!(result, Err(RetryError::Aborted { .. })));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Cell::new(0);
        let options = RetryOptions::new("eventually")
            .retries(3)
            .backoff_delay(Duration::from_millis(1), Duration::from_millis(4));

        let result = with_retry(
            &options,
            || {
                calls.set(calls.get() + 1);
                let attempt = calls.get();
                async move {
                    if attempt < 3 {
                        Err(io::Error::other("transient"))
                    } else {
                        Ok(attempt)
                    }
                }
            },
            |_| true,
            || false,
        )
        .await;

        assert_eq!(result.unwrap(), 3);
    }
}
