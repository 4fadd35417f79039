//! Retry policy for store operations
//!
//! A single exponential-backoff policy governs every retryable failure. Only
//! connectivity-class errors are retried; session loss and node-level errors
//! are surfaced to the caller unchanged.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::store::StoreError;

/// Failure classes of the primitive store client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient: the request may or may not have reached the store
    Connectivity,
    /// The session is gone along with its ephemeral nodes and watches
    SessionLoss,
    /// The store answered and rejected the request
    NodeLevel,
}

impl ErrorClass {
    pub fn of(error: &StoreError) -> Self {
        match error {
            StoreError::ConnectionLoss | StoreError::OperationTimeout => Self::Connectivity,
            StoreError::SessionExpired | StoreError::Closed => Self::SessionLoss,
            StoreError::Multi { source, .. } => Self::of(source),
            StoreError::NoNode { .. }
            | StoreError::NodeExists { .. }
            | StoreError::BadVersion { .. }
            | StoreError::NotEmpty { .. }
            | StoreError::NoChildrenForEphemerals { .. }
            | StoreError::InvalidPath { .. } => Self::NodeLevel,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    Fail,
}

/// Backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Backoff multiplier
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> u64 {
    100
}

fn default_max_delay() -> u64 {
    5000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-indexed)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        let jitter_range = capped_delay * self.jitter.clamp(0.0, 1.0);
        let jitter = (rand::random::<f64>() - 0.5) * 2.0 * jitter_range;
        let final_delay = (capped_delay + jitter).max(0.0) as u64;

        Duration::from_millis(final_delay)
    }

    /// Decide what to do after `attempts` attempts have failed, the last one with `error`.
    pub fn decide(&self, error: &StoreError, attempts: u32) -> RetryDecision {
        match ErrorClass::of(error) {
            ErrorClass::Connectivity if attempts < self.max_attempts.max(1) => {
                RetryDecision::Retry(self.calculate_delay(attempts))
            }
            _ => RetryDecision::Fail,
        }
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 100,
            max_delay_ms: 500,
            multiplier: 2.0,
            jitter: 0.0, // deterministic
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay_ms, 100);
        assert_eq!(policy.max_delay_ms, 5000);
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.jitter, 0.1);
    }

    #[test]
    fn test_retry_delay_calculation() {
        let policy = no_jitter();

        assert_eq!(policy.calculate_delay(0), Duration::ZERO);
        assert_eq!(policy.calculate_delay(1).as_millis(), 100);
        assert_eq!(policy.calculate_delay(2).as_millis(), 200);
        assert_eq!(policy.calculate_delay(3).as_millis(), 400);

        // Capped
        assert_eq!(policy.calculate_delay(4).as_millis(), 500);
        assert_eq!(policy.calculate_delay(40).as_millis(), 500);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy {
            jitter: 0.5,
            ..no_jitter()
        };
        for _ in 0..100 {
            let delay = policy.calculate_delay(2).as_millis();
            assert!((100..=300).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            ErrorClass::of(&StoreError::ConnectionLoss),
            ErrorClass::Connectivity
        );
        assert_eq!(
            ErrorClass::of(&StoreError::OperationTimeout),
            ErrorClass::Connectivity
        );
        assert_eq!(
            ErrorClass::of(&StoreError::SessionExpired),
            ErrorClass::SessionLoss
        );
        assert_eq!(
            ErrorClass::of(&StoreError::Multi {
                index: 0,
                source: Box::new(StoreError::NodeExists {
                    path: "/a".to_string()
                }),
            }),
            ErrorClass::NodeLevel
        );
    }

    #[test]
    fn test_decide() {
        let policy = no_jitter();

        assert_eq!(
            policy.decide(&StoreError::ConnectionLoss, 1),
            RetryDecision::Retry(Duration::from_millis(100))
        );
        assert_eq!(
            policy.decide(&StoreError::ConnectionLoss, 4),
            RetryDecision::Fail
        );
        assert_eq!(
            policy.decide(&StoreError::SessionExpired, 1),
            RetryDecision::Fail
        );
        assert_eq!(
            policy.decide(
                &StoreError::NoNode {
                    path: "/a".to_string()
                },
                1
            ),
            RetryDecision::Fail
        );
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_attempts": 2}"#).unwrap();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.base_delay_ms, 100);
        assert_eq!(policy.jitter, 0.1);
    }
}
