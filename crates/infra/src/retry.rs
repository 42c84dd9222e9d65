//! Retry policy: backoff schedule and the retry-or-fail decision.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use loadcache_core::{ErrorClass, LoadType, LoaderError};

use crate::config::LoaderConfig;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Executions allowed before the task fails with `RetriesExhausted`
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        }
    }
}

/// Outcome of a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then execute again.
    RetryAfter(Duration),
    /// Stop; the task fails with this classification.
    GiveUp(ErrorClass),
}

impl RetryPolicy {
    /// A single execution, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        }
    }

    /// Calculate delay after a given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * f64::from(attempt)).min(max_ms),
        };

        // Deterministic "jitter" derived from the attempt number.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((f64::from(attempt) * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms.max(base_ms)) as u64)
    }

    /// Check if another execution is allowed after `attempt` executions.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Decide what follows the `attempt`-th failed execution.
    pub fn decide(&self, attempt: u32, error: &LoaderError) -> RetryDecision {
        match error.class() {
            ErrorClass::Transient if self.should_retry(attempt) => {
                RetryDecision::RetryAfter(self.delay_for_attempt(attempt))
            }
            ErrorClass::Transient | ErrorClass::RetriesExhausted => {
                RetryDecision::GiveUp(ErrorClass::RetriesExhausted)
            }
            ErrorClass::Permanent => RetryDecision::GiveUp(ErrorClass::Permanent),
        }
    }
}

/// Per-type retry policy overrides on top of the configured default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryOverride {
    pub max_attempts: Option<u32>,
    pub backoff_base: Option<Duration>,
    pub backoff_max: Option<Duration>,
}

/// Resolves the retry policy for a load type.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicies {
    default: RetryPolicy,
    per_type: HashMap<LoadType, RetryPolicy>,
}

impl RetryPolicies {
    pub fn new(default: RetryPolicy) -> Self {
        Self {
            default,
            per_type: HashMap::new(),
        }
    }

    pub fn from_config(config: &LoaderConfig) -> Self {
        let default = RetryPolicy {
            max_attempts: config.max_attempts,
            base_delay: config.backoff_base,
            max_delay: config.backoff_max,
            strategy: BackoffStrategy::Exponential,
            jitter: config.backoff_jitter,
        };

        let mut policies = Self::new(default.clone());
        for (load_type, o) in &config.retry_overrides {
            policies = policies.with_policy(
                load_type.clone(),
                RetryPolicy {
                    max_attempts: o.max_attempts.unwrap_or(default.max_attempts),
                    base_delay: o.backoff_base.unwrap_or(default.base_delay),
                    max_delay: o.backoff_max.unwrap_or(default.max_delay),
                    ..default.clone()
                },
            );
        }
        policies
    }

    pub fn with_policy(mut self, load_type: LoadType, policy: RetryPolicy) -> Self {
        self.per_type.insert(load_type, policy);
        self
    }

    pub fn for_type(&self, load_type: &LoadType) -> &RetryPolicy {
        self.per_type.get(load_type).unwrap_or(&self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::exponential(
            5,
            Duration::from_millis(100),
            Duration::from_secs(10),
        );

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy::exponential(10, Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(500), Duration::from_secs(5));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn transient_errors_retry_until_exhausted() {
        let policy = RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(60));
        let err = LoaderError::transient("timeout");

        assert_eq!(
            policy.decide(1, &err),
            RetryDecision::RetryAfter(Duration::from_secs(1))
        );
        assert_eq!(
            policy.decide(2, &err),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(
            policy.decide(3, &err),
            RetryDecision::GiveUp(ErrorClass::RetriesExhausted)
        );
    }

    #[test]
    fn permanent_errors_fail_immediately() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(1, &LoaderError::permanent("not found")),
            RetryDecision::GiveUp(ErrorClass::Permanent)
        );
    }

    #[test]
    fn policies_resolve_overrides_per_type() {
        let item = LoadType::new("item").unwrap();
        let other = LoadType::new("other").unwrap();
        let policies = RetryPolicies::new(RetryPolicy::default())
            .with_policy(item.clone(), RetryPolicy::no_retry());

        assert_eq!(policies.for_type(&item).max_attempts, 1);
        assert_eq!(policies.for_type(&other).max_attempts, 5);
    }

    #[test]
    fn policies_from_config_apply_partial_overrides() {
        let item = LoadType::new("item").unwrap();
        let mut config = LoaderConfig::default();
        config.max_attempts = 4;
        config.retry_overrides.insert(
            item.clone(),
            RetryOverride {
                max_attempts: Some(9),
                ..Default::default()
            },
        );

        let policies = RetryPolicies::from_config(&config);
        let item_policy = policies.for_type(&item);
        assert_eq!(item_policy.max_attempts, 9);
        assert_eq!(item_policy.base_delay, config.backoff_base);
        assert_eq!(
            policies.for_type(&LoadType::new("x").unwrap()).max_attempts,
            4
        );
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 500,
                ..ProptestConfig::default()
            })]

            /// Property: backoff never exceeds the cap and never shrinks between attempts.
            #[test]
            fn exponential_backoff_is_monotone_and_capped(
                base_ms in 1u64..10_000,
                max_ms in 1u64..600_000,
                attempt in 1u32..64,
            ) {
                let policy = RetryPolicy::exponential(
                    u32::MAX,
                    Duration::from_millis(base_ms),
                    Duration::from_millis(max_ms.max(base_ms)),
                );

                let current = policy.delay_for_attempt(attempt);
                let next = policy.delay_for_attempt(attempt + 1);

                prop_assert!(current <= policy.max_delay);
                prop_assert!(next >= current);
            }

            /// Property: a permanent error never schedules a retry.
            #[test]
            fn permanent_never_retries(attempt in 0u32..100, max_attempts in 0u32..100) {
                let policy = RetryPolicy { max_attempts, ..Default::default() };
                prop_assert_eq!(
                    policy.decide(attempt, &LoaderError::permanent("x")),
                    RetryDecision::GiveUp(ErrorClass::Permanent)
                );
            }
        }
    }
}
