//! Reconnection backoff
//!
//! `BackoffPolicy` decides how long to wait before each reconnect attempt
//! and when to give up. Waiting goes through a `Scheduler` so the reconnect
//! loop can be driven without wall-clock sleeps.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Exponential backoff with a cap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffPolicy {
    /// Maximum number of reconnection attempts
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first attempt (ms)
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    /// Upper bound for any single delay (ms)
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> u64 {
    500
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
        }
    }
}

impl BackoffPolicy {
    /// Delay before `attempt` (1-based), or `None` once the budget is spent
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let exp = (attempt - 1).min(63) as i32;
        let delay = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exp);
        let capped = delay.min(self.max_delay_ms as f64);
        Some(Duration::from_millis(capped as u64))
    }

    /// All delays of a full retry budget, in order
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_attempts).filter_map(move |attempt| self.delay_for(attempt))
    }
}

/// Source of delays for retry loops
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

/// Real timer backed by `tokio::time`
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

#[async_trait]
impl Scheduler for TokioScheduler {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_defaults() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay_ms, 500);
        assert_eq!(policy.max_delay_ms, 30_000);
        assert_eq!(policy.multiplier, 2.0);
    }

    #[test]
    fn test_delays_grow_and_cap() {
        let policy = BackoffPolicy {
            max_attempts: 6,
            base_delay_ms: 1000,
            max_delay_ms: 5000,
            multiplier: 1.5,
        };
        let delays: Vec<u64> = policy.schedule().map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 1500, 2250, 3375, 5000, 5000]);
    }

    #[test]
    fn test_budget_exhausted() {
        let policy = BackoffPolicy {
            max_attempts: 2,
            ..Default::default()
        };
        assert!(policy.delay_for(0).is_none());
        assert!(policy.delay_for(2).is_some());
        assert!(policy.delay_for(3).is_none());
    }

    #[test]
    fn test_multiplier_below_one_never_shrinks() {
        let policy = BackoffPolicy {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 1000,
            multiplier: 0.5,
        };
        assert!(policy.schedule().all(|d| d == Duration::from_millis(100)));
    }
}
