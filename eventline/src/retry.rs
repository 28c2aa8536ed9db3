//! Retry policies for subscriptions in the error state.
//!
//! The engine asks a [`RetryStrategy`] before every `setup`, `boot` and `run`
//! whether an errored subscription is due for another attempt. Strategies
//! are pure decisions over the subscription record; they never touch
//! storage.

use crate::clock::Clock;
use crate::subscription::{Status, Subscription};
use crate::types::Timestamp;
use std::sync::Arc;
use std::time::Duration;

/// Decides whether a failed subscription may be retried now.
pub trait RetryStrategy: Send + Sync {
    /// `true` if the engine should restore the subscription and try again.
    fn should_retry(&self, subscription: &Subscription) -> bool;

    /// `true` once the subscription will never be retried automatically.
    fn is_exhausted(&self, _subscription: &Subscription) -> bool {
        false
    }
}

/// Exponential backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Multiplier applied per further attempt.
    pub delay_factor: u32,
    /// Attempts after which the subscription stays in error.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            delay_factor: 2,
            max_attempts: 5,
        }
    }
}

impl RetryConfig {
    /// Sets the base delay.
    #[must_use]
    pub const fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Sets the delay factor.
    #[must_use]
    pub const fn with_delay_factor(mut self, delay_factor: u32) -> Self {
        self.delay_factor = delay_factor;
        self
    }

    /// Sets the attempt cap.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Backoff before retrying after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        self.base_delay
            .saturating_mul(self.delay_factor.saturating_pow(exponent))
    }
}

/// Backoff measured from the subscription's last save.
///
/// A subscription is due once `base_delay * delay_factor^(attempt - 1)` has
/// passed since it was last persisted. After `max_attempts` failures it is
/// never retried automatically again; an operator has to `reactivate` it.
pub struct ClockBasedRetryStrategy {
    clock: Arc<dyn Clock>,
    config: RetryConfig,
}

impl ClockBasedRetryStrategy {
    /// Creates the strategy.
    pub fn new(clock: Arc<dyn Clock>, config: RetryConfig) -> Self {
        Self { clock, config }
    }

    /// The configuration in use.
    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// When the subscription becomes due, or `None` if it never will.
    pub fn next_retry_at(&self, subscription: &Subscription) -> Option<Timestamp> {
        if subscription.status() != Status::Error {
            return None;
        }
        let attempt = subscription.retry_attempt();
        if attempt > self.config.max_attempts {
            return None;
        }
        let saved_at = subscription.last_saved_at()?;
        Some(saved_at.plus(self.config.delay_for(attempt)))
    }
}

impl std::fmt::Debug for ClockBasedRetryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockBasedRetryStrategy")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RetryStrategy for ClockBasedRetryStrategy {
    fn should_retry(&self, subscription: &Subscription) -> bool {
        self.next_retry_at(subscription)
            .is_some_and(|due| self.clock.now() >= due)
    }

    fn is_exhausted(&self, subscription: &Subscription) -> bool {
        subscription.status() == Status::Error
            && subscription.retry_attempt() > self.config.max_attempts
    }
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetryStrategy;

impl RetryStrategy for NoRetryStrategy {
    fn should_retry(&self, _subscription: &Subscription) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FrozenClock;
    use crate::subscription::{ErrorContext, RunMode};
    use crate::types::SubscriberId;
    use proptest::prelude::*;

    fn failed(clock: &FrozenClock, attempts: u32) -> Subscription {
        let mut sub = Subscription::new(
            SubscriberId::try_new("profile").unwrap(),
            "default",
            RunMode::FromBeginning,
        );
        sub.activate();
        for _ in 0..attempts {
            sub.fail("boom", ErrorContext::default(), clock.now());
        }
        sub.touch(clock.now());
        sub
    }

    #[test]
    fn waits_for_the_backoff_to_elapse() {
        let clock = Arc::new(FrozenClock::default());
        let strategy = ClockBasedRetryStrategy::new(clock.clone(), RetryConfig::default());
        let sub = failed(&clock, 1);

        assert!(!strategy.should_retry(&sub));
        clock.advance(Duration::from_secs(4));
        assert!(!strategy.should_retry(&sub));
        clock.advance(Duration::from_secs(1));
        assert!(strategy.should_retry(&sub));
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let clock = Arc::new(FrozenClock::default());
        let strategy = ClockBasedRetryStrategy::new(clock.clone(), RetryConfig::default());
        let sub = failed(&clock, 3);

        clock.advance(Duration::from_secs(19));
        assert!(!strategy.should_retry(&sub));
        clock.advance(Duration::from_secs(1));
        assert!(strategy.should_retry(&sub));
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let clock = Arc::new(FrozenClock::default());
        let config = RetryConfig::default().with_max_attempts(2);
        let strategy = ClockBasedRetryStrategy::new(clock.clone(), config);
        let sub = failed(&clock, 3);

        clock.advance(Duration::from_secs(3600));
        assert!(!strategy.should_retry(&sub));
        assert_eq!(strategy.next_retry_at(&sub), None);
        assert!(strategy.is_exhausted(&sub));
        assert!(!strategy.is_exhausted(&failed(&clock, 2)));
    }

    #[test]
    fn ignores_healthy_and_unsaved_subscriptions() {
        let clock = Arc::new(FrozenClock::default());
        let strategy = ClockBasedRetryStrategy::new(clock.clone(), RetryConfig::default());

        let mut healthy = failed(&clock, 0);
        healthy.activate();
        clock.advance(Duration::from_secs(3600));
        assert!(!strategy.should_retry(&healthy));

        let mut unsaved = Subscription::new(
            SubscriberId::try_new("audit").unwrap(),
            "default",
            RunMode::FromBeginning,
        );
        unsaved.fail("boom", ErrorContext::default(), clock.now());
        assert!(!strategy.should_retry(&unsaved));
    }

    #[test]
    fn no_retry_strategy_never_retries() {
        let clock = FrozenClock::default();
        assert!(!NoRetryStrategy.should_retry(&failed(&clock, 1)));
    }

    proptest! {
        #[test]
        fn delays_never_shrink(attempt in 1u32..64) {
            let config = RetryConfig::default();
            prop_assert!(config.delay_for(attempt + 1) >= config.delay_for(attempt));
        }
    }
}
