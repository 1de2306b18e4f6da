//! Retry policy for side effects.
//!
//! The policy is recorded on the `SideEffectScheduled` event, so retry
//! decisions made during later decision cycles see exactly what the
//! orchestration asked for when it first made the call.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{FailureClass, SideEffectError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum BackoffStrategy {
    /// Retry immediately.
    None,
    Fixed {
        #[serde(with = "duration_millis")]
        delay: Duration,
    },
    /// `base * attempt`, capped at `max`.
    Linear {
        #[serde(with = "duration_millis")]
        base: Duration,
        #[serde(with = "duration_millis")]
        max: Duration,
    },
    /// `base * multiplier^(attempt - 1)`, capped at `max`.
    Exponential {
        #[serde(with = "duration_millis")]
        base: Duration,
        multiplier: f64,
        #[serde(with = "duration_millis")]
        max: Duration,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffStrategy {
    /// Delay to wait after failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed { delay } => *delay,
            BackoffStrategy::Linear { base, max } => base.saturating_mul(attempt).min(*max),
            BackoffStrategy::Exponential { base, multiplier, max } => {
                let exp = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                let millis = base.as_millis() as f64 * multiplier.powi(exp);
                let cap = max.as_millis() as f64;
                if !millis.is_finite() || millis >= cap {
                    *max
                } else {
                    Duration::from_millis(millis.max(0.0) as u64)
                }
            }
        }
    }
}

/// How many times a side effect is attempted and how failures are judged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    /// Per-attempt timeout.
    #[serde(default, with = "opt_duration_millis")]
    pub timeout: Option<Duration>,
    #[serde(default = "default_true")]
    pub retry_on_timeout: bool,
    /// Error codes that fail the call terminally even when classified retryable.
    #[serde(default)]
    pub non_retryable_codes: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::default(),
            timeout: None,
            retry_on_timeout: true,
            non_retryable_codes: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// `max_attempts` below 1 is raised to 1.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// Single attempt, no timeout. Used by `call_side_effect`.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffStrategy::None,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;
        self
    }

    pub fn with_non_retryable_code(mut self, code: impl Into<String>) -> Self {
        self.non_retryable_codes.push(code.into());
        self
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt)
    }

    pub fn has_attempts_remaining(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Whether failed attempt `attempt` should be followed by another one.
    pub fn should_retry(&self, attempt: u32, error: &SideEffectError) -> bool {
        if !self.has_attempts_remaining(attempt) {
            return false;
        }
        match error.class {
            FailureClass::Terminal => false,
            FailureClass::Timeout => self.retry_on_timeout,
            FailureClass::Retryable => error
                .code
                .as_ref()
                .map_or(true, |c| !self.non_retryable_codes.contains(c)),
        }
    }

    pub fn timeout_ms(&self) -> Option<u64> {
        self.timeout.map(crate::millis)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        crate::millis(*d).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod opt_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        d.map(crate::millis).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
