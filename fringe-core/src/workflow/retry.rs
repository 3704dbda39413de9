//! Retry policy: attempt budget, backoff shape, and the retryable
//! predicate.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{RetryConfig, RetryStrategy};
use crate::error::PipelineError;

/// Delay shape between attempts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backoff {
    /// `min(initial * 2^(retry - 1), max)` before the retry-th retry.
    Exponential { initial: Duration, max: Duration },
    Fixed(Duration),
    Immediate,
}

type RetryablePredicate = Arc<dyn Fn(&PipelineError) -> bool + Send + Sync>;

/// Per-stage retry policy.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    retryable: Option<RetryablePredicate>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("custom_predicate", &self.retryable.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Exponential { initial, max },
            retryable: None,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Fixed(delay),
            retryable: None,
        }
    }

    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Immediate,
            retryable: None,
        }
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self::immediate(1)
    }

    /// Override the default retryable predicate.
    pub fn with_retryable<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&PipelineError) -> bool + Send + Sync + 'static,
    {
        self.retryable = Some(Arc::new(predicate));
        self
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        match config.strategy {
            RetryStrategy::Exponential => Self::exponential(
                config.max_attempts,
                config.initial_delay(),
                config.max_delay(),
            ),
            RetryStrategy::Fixed => Self::fixed(config.max_attempts, config.initial_delay()),
            RetryStrategy::Immediate => Self::immediate(config.max_attempts),
            RetryStrategy::None => Self::none(),
        }
    }

    /// Delay before the `retry`-th retry (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Exponential { initial, max } => {
                let exponent = retry.saturating_sub(1).min(31);
                initial.saturating_mul(1u32 << exponent).min(max)
            }
            Backoff::Fixed(delay) => delay,
            Backoff::Immediate => Duration::ZERO,
        }
    }

    /// Whether `error` may be retried under this policy.
    pub fn is_retryable(&self, error: &PipelineError) -> bool {
        match &self.retryable {
            Some(predicate) => predicate(error),
            None => error.is_retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_and_caps() {
        let policy = RetryPolicy::exponential(
            5,
            Duration::from_millis(100),
            Duration::from_millis(350),
        );
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(350));
        assert_eq!(policy.delay(4), Duration::from_millis(350));
    }

    #[test]
    fn fixed_and_immediate_delays() {
        assert_eq!(
            RetryPolicy::fixed(3, Duration::from_secs(2)).delay(3),
            Duration::from_secs(2)
        );
        assert_eq!(RetryPolicy::immediate(3).delay(1), Duration::ZERO);
    }

    #[test]
    fn default_predicate_follows_error_classification() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable(&PipelineError::StoreUnavailable("busy".into())));
        assert!(policy.is_retryable(&PipelineError::Transient("flap".into())));
        assert!(!policy.is_retryable(&PipelineError::Fatal("bad input".into())));
        assert!(!policy.is_retryable(&PipelineError::ConstraintViolation("dup".into())));
    }

    #[test]
    fn custom_predicate_overrides_default() {
        let policy = RetryPolicy::immediate(3)
            .with_retryable(|e| matches!(e, PipelineError::Fatal(_)));
        assert!(policy.is_retryable(&PipelineError::Fatal("flaky".into())));
        assert!(!policy.is_retryable(&PipelineError::Transient("flap".into())));
    }

    #[test]
    fn strategy_none_means_single_attempt() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            strategy: RetryStrategy::None,
            max_attempts: 7,
            ..RetryConfig::default()
        });
        assert_eq!(policy.max_attempts, 1);
    }
}
