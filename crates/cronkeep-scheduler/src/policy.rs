//! Priority and retry policy for jobs.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// Upper bound on any single retry delay.
pub const MAX_RETRY_DELAY_SECS: u64 = 3600;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 60;
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Queue ordering class. `High` sorts first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Priority {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(SchedulerError::InvalidJob(format!(
                "priority must be high, normal, or low (got '{other}')"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    Linear,
    #[default]
    Exponential,
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryStrategy::Linear => write!(f, "linear"),
            RetryStrategy::Exponential => write!(f, "exponential"),
        }
    }
}

impl FromStr for RetryStrategy {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(RetryStrategy::Linear),
            "exponential" => Ok(RetryStrategy::Exponential),
            other => Err(SchedulerError::InvalidJob(format!(
                "retry strategy must be linear or exponential (got '{other}')"
            ))),
        }
    }
}

/// How many times a job is attempted and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_secs: u64,
    pub strategy: RetryStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay_secs: DEFAULT_RETRY_DELAY_SECS,
            strategy: RetryStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt `attempt` (1-based).
    ///
    /// Linear: the base delay. Exponential: `delay * 2^(attempt-1)`, capped
    /// at one hour.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let secs = match self.strategy {
            RetryStrategy::Linear => self.delay_secs,
            RetryStrategy::Exponential => {
                let exp = attempt.saturating_sub(1).min(63);
                self.delay_secs
                    .saturating_mul(1u64 << exp)
                    .min(MAX_RETRY_DELAY_SECS)
            }
        };
        Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_high_first() {
        let mut p = vec![Priority::Low, Priority::High, Priority::Normal];
        p.sort();
        assert_eq!(p, vec![Priority::High, Priority::Normal, Priority::Low]);
        assert!("urgent".parse::<Priority>().is_err());
        assert_eq!("low".parse::<Priority>().unwrap(), Priority::Low);
    }

    #[test]
    fn exponential_delay_doubles_then_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            delay_secs: 60,
            strategy: RetryStrategy::Exponential,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for(2), Duration::from_secs(120));
        assert_eq!(policy.delay_for(6), Duration::from_secs(1920));
        assert_eq!(policy.delay_for(7), Duration::from_secs(3600));
        assert_eq!(policy.delay_for(10), Duration::from_secs(3600));
        assert_eq!(policy.delay_for(200), Duration::from_secs(3600));
    }

    #[test]
    fn linear_delay_is_constant() {
        let policy = RetryPolicy {
            max_attempts: 3,
            delay_secs: 5,
            strategy: RetryStrategy::Linear,
        };
        assert_eq!(policy.delay_for(1), policy.delay_for(3));
    }
}
