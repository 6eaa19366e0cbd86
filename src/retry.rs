//! Bounded exponential backoff for transient step failures.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry settings applied to retryable step errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per step, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(with = "duration_secs")]
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// No retries at all
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Retries without sleeping, for tests and dry runs
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.saturating_sub(1).min(10)).unwrap_or(10);
        let multiplier = self.backoff_multiplier.powi(exp);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    #[must_use]
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Serialize `Duration` as whole or fractional seconds
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number of seconds"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_and_caps() {
        let config = RetryConfig::default();

        assert_eq!(config.delay_after_attempt(1), Duration::from_secs(5));
        assert_eq!(config.delay_after_attempt(2), Duration::from_secs(10));
        assert_eq!(config.delay_after_attempt(3), Duration::from_secs(20));
        assert_eq!(config.delay_after_attempt(100), config.max_delay);
    }

    #[test]
    fn test_should_retry() {
        let config = RetryConfig::default();
        assert!(config.should_retry(1));
        assert!(config.should_retry(3));
        assert!(!config.should_retry(4));

        assert!(!RetryConfig::disabled().should_retry(1));
    }

    #[test]
    fn test_immediate_never_sleeps() {
        let config = RetryConfig::immediate(3);
        assert_eq!(config.delay_after_attempt(1), Duration::ZERO);
        assert_eq!(config.delay_after_attempt(2), Duration::ZERO);
    }

    #[test]
    fn test_serde_seconds() {
        let json = r#"{"max_attempts": 2, "initial_delay": 0.5}"#;
        let config: RetryConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.initial_delay, Duration::from_millis(500));
        assert_eq!(config.max_delay, Duration::from_secs(60));

        assert!(serde_json::from_str::<RetryConfig>(r#"{"max_delay": -1}"#).is_err());
    }
}
