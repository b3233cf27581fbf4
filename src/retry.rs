//! Retry backoff strategies.
//!
//! A queue derives its strategy from its configuration: a fixed `retry_delay_ms`, or an
//! exponential backoff when a multiplier is configured, either one optionally jittered.
//! The delay for redelivery `n` is
//! computed from the job's retry count, so a manual `RETRY_JOB`, which resets the count,
//! also resets the backoff.
//!
//! ```rust
//! use jobmesh::retry::RetryStrategy;
//! use std::time::Duration;
//!
//! // 100ms, 200ms, 400ms, capped at 1s
//! let strategy = RetryStrategy::exponential(
//!     Duration::from_millis(100),
//!     2.0,
//!     Some(Duration::from_secs(1)),
//! );
//! assert_eq!(strategy.calculate_delay(3), Duration::from_millis(400));
//! assert_eq!(strategy.calculate_delay(10), Duration::from_secs(1));
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Types of jitter that can be applied to retry delays.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JitterType {
    /// `delay ± rand(0, amount)`
    Additive(Duration),

    /// `delay * (1 ± rand(0, factor))`
    Multiplicative(f64),
}

impl JitterType {
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rand::thread_rng();

        match self {
            JitterType::Additive(jitter_amount) => {
                let jitter_millis = rng.gen_range(0..=jitter_amount.as_millis() as u64);
                let jitter = Duration::from_millis(jitter_millis);

                if rng.gen_bool(0.5) {
                    delay + jitter
                } else {
                    delay.saturating_sub(jitter)
                }
            }
            JitterType::Multiplicative(factor) => {
                let factor = factor.clamp(0.0, 1.0);
                let jitter_factor = rng.gen_range((1.0 - factor)..=(1.0 + factor));
                Duration::from_millis((delay.as_millis() as f64 * jitter_factor) as u64)
            }
        }
    }
}

/// Delay policy between redeliveries of a failed job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RetryStrategy {
    /// Same delay before every redelivery.
    Fixed(Duration),

    /// `base * multiplier^(attempt - 1)`, optionally capped and jittered.
    Exponential {
        base: Duration,
        multiplier: f64,
        max_delay: Option<Duration>,
        jitter: Option<JitterType>,
    },
}

impl RetryStrategy {
    /// Delay before redelivery number `attempt` (1-based).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::Fixed(delay) => *delay,

            RetryStrategy::Exponential {
                base,
                multiplier,
                max_delay,
                jitter,
            } => {
                let exponent = attempt.saturating_sub(1).min(63) as i32;
                let factor = multiplier.max(1.0).powi(exponent);
                let delay = match max_delay {
                    // Avoid overflowing Duration for large attempts
                    Some(max) if base.as_secs_f64() * factor >= max.as_secs_f64() => *max,
                    _ => Duration::try_from_secs_f64(base.as_secs_f64() * factor)
                        .unwrap_or(Duration::MAX),
                };

                match jitter {
                    Some(jitter_type) => cap(jitter_type.apply(delay), *max_delay),
                    None => delay,
                }
            }
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        RetryStrategy::Fixed(delay)
    }

    pub fn exponential(base: Duration, multiplier: f64, max_delay: Option<Duration>) -> Self {
        RetryStrategy::Exponential {
            base,
            multiplier,
            max_delay,
            jitter: None,
        }
    }

    pub fn exponential_with_jitter(
        base: Duration,
        multiplier: f64,
        max_delay: Option<Duration>,
        jitter: JitterType,
    ) -> Self {
        RetryStrategy::Exponential {
            base,
            multiplier,
            max_delay,
            jitter: Some(jitter),
        }
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::Fixed(Duration::from_secs(2))
    }
}

fn cap(delay: Duration, max_delay: Option<Duration>) -> Duration {
    match max_delay {
        Some(max) => delay.min(max),
        None => delay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_retry_strategy() {
        let strategy = RetryStrategy::fixed(Duration::from_millis(250));
        assert_eq!(strategy.calculate_delay(1), Duration::from_millis(250));
        assert_eq!(strategy.calculate_delay(9), Duration::from_millis(250));
        assert_eq!(
            RetryStrategy::fixed(Duration::ZERO).calculate_delay(1),
            Duration::ZERO
        );
    }

    #[test]
    fn test_exponential_retry_strategy() {
        let strategy = RetryStrategy::exponential(Duration::from_secs(1), 2.0, None);
        assert_eq!(strategy.calculate_delay(1), Duration::from_secs(1));
        assert_eq!(strategy.calculate_delay(2), Duration::from_secs(2));
        assert_eq!(strategy.calculate_delay(4), Duration::from_secs(8));
    }

    #[test]
    fn test_exponential_cap_survives_large_attempts() {
        let strategy = RetryStrategy::exponential(
            Duration::from_secs(1),
            10.0,
            Some(Duration::from_secs(60)),
        );
        assert_eq!(strategy.calculate_delay(500), Duration::from_secs(60));
    }

    #[test]
    fn test_multiplicative_jitter() {
        let jitter = JitterType::Multiplicative(0.2);
        let base_delay = Duration::from_secs(100);

        for _ in 0..100 {
            let jittered = jitter.apply(base_delay);
            assert!(jittered >= Duration::from_secs(80));
            assert!(jittered <= Duration::from_secs(120));
        }
    }

    #[test]
    fn test_jitter_respects_cap() {
        let strategy = RetryStrategy::exponential_with_jitter(
            Duration::from_secs(10),
            2.0,
            Some(Duration::from_secs(10)),
            JitterType::Additive(Duration::from_secs(5)),
        );
        for _ in 0..50 {
            assert!(strategy.calculate_delay(3) <= Duration::from_secs(10));
        }
    }
}
