//! Retry with exponential backoff and jitter.
//!
//! [`with_retry`] wraps one store operation. Each attempt runs the supplied
//! closure afresh, so each attempt acquires (and releases) its own pooled
//! connection; nothing is held while sleeping between attempts. Attempts are
//! strictly sequential.
//!
//! The delay before retry `n` (counting the first attempt as 1) is
//! `min(max_delay, initial_delay * backoff_factor^n)` scaled by a uniform
//! jitter in `[0.8, 1.2]`.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::{ErrorCategory, PersistenceError, StoreError, classify};

/// Lower bound of the jitter multiplier.
pub const JITTER_MIN: f64 = 0.8;
/// Upper bound of the jitter multiplier.
pub const JITTER_MAX: f64 = 1.2;

/// When and how long to wait before retrying a failed operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    backoff_factor: f64,
    max_delay: Duration,
}

impl RetryPolicy {
    /// Build a policy from explicit parameters.
    ///
    /// `max_attempts` is clamped to at least 1, `backoff_factor` to at
    /// least 1.0, and `initial_delay` down to `max_delay`.
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        backoff_factor: f64,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: initial_delay.min(max_delay),
            backoff_factor: if backoff_factor.is_finite() {
                backoff_factor.max(1.0)
            } else {
                1.0
            },
            max_delay,
        }
    }

    /// Build a policy from configuration.
    pub fn from_config(config: &RetryConfig) -> Self {
        let seconds = |value: f64| Duration::try_from_secs_f64(value).unwrap_or_default();
        Self::new(
            config.max_attempts,
            seconds(config.initial_delay_seconds),
            config.backoff_factor,
            seconds(config.max_delay_seconds),
        )
    }

    /// Total attempts allowed, including the first.
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Ceiling on the pre-jitter delay.
    pub const fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Whether to try again after attempt number `attempt` failed with a
    /// failure of `category`.
    pub const fn should_retry(&self, category: ErrorCategory, attempt: u32) -> bool {
        attempt < self.max_attempts && category.is_recoverable()
    }

    /// Delay before the retry following attempt `attempt`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let seconds = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        Duration::try_from_secs_f64(seconds)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before the retry following attempt `attempt`, with random
    /// jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = rand::rng().random_range(JITTER_MIN..=JITTER_MAX);
        self.delay_with_jitter(attempt, jitter)
    }

    /// Delay with a caller-chosen jitter, clamped to `[0.8, 1.2]`.
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let jitter = jitter.clamp(JITTER_MIN, JITTER_MAX);
        let base = self.base_delay(attempt);
        Duration::try_from_secs_f64(base.as_secs_f64() * jitter).unwrap_or(base)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Run `op`, retrying recoverable failures according to `policy`.
///
/// `operation` names the call in logs and in the returned error. Callers
/// attach sanitized arguments (session id, row counts) by running this
/// future inside a `tracing` span.
///
/// # Errors
///
/// Returns [`PersistenceError::Store`] carrying the classified failure of
/// the last attempt when the failure is not recoverable or attempts are
/// exhausted.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut op: F,
) -> Result<T, PersistenceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);
        let err = match op().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        let failure = classify(&err);
        if policy.should_retry(failure.category, attempt) {
            let delay = policy.delay(attempt);
            tracing::warn!(
                operation,
                attempt,
                max_attempts = policy.max_attempts(),
                category = %failure.category,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %failure.message,
                "Recoverable failure, retrying"
            );
            tokio::time::sleep(delay).await;
            continue;
        }

        if failure.category == ErrorCategory::Unknown {
            tracing::error!(
                operation,
                attempt,
                code = failure.code.as_deref().unwrap_or("none"),
                error = ?err,
                suggestion = failure.suggestion,
                "Unclassified persistence failure"
            );
        } else {
            tracing::error!(
                operation,
                attempt,
                category = %failure.category,
                recoverable = failure.is_recoverable(),
                error = %failure.message,
                suggestion = failure.suggestion,
                "Persistence operation failed"
            );
        }
        return Err(PersistenceError::Store {
            operation,
            attempts: attempt,
            failure,
        });
    }
}
