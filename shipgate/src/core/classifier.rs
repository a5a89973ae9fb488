//! Transient-vs-permanent failure classification and retry decisions.

use serde::{Deserialize, Serialize};

use crate::core::policy::{Policy, builtin_is_transient};
use crate::core::run::{BackgroundRun, can_retry};

/// Failure class of an error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
    /// Infrastructure-level and expected to succeed on retry.
    Transient,
    /// Anything else; must surface to a human or operator.
    Permanent,
}

/// True if `message` looks like a recoverable infrastructure failure
/// (timeouts, rate limits, 5xx, overload), using the built-in policy table.
pub fn is_transient_model_error(message: &str) -> bool {
    builtin_is_transient(message)
}

/// Classify `message` against a compiled policy.
pub fn classify_failure(message: &str, policy: &Policy) -> FailureClass {
    if policy.is_transient(message) {
        FailureClass::Transient
    } else {
        FailureClass::Permanent
    }
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before the first retry, in seconds.
    pub base_delay_secs: u64,
    /// Upper bound on any single delay, in seconds.
    pub max_delay_secs: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: 30,
            max_delay_secs: 15 * 60,
        }
    }
}

impl BackoffPolicy {
    /// Delay after the `attempt_count`-th attempt failed:
    /// `base * 2^(attempt_count - 1)`, saturating and capped.
    pub fn delay_secs(&self, attempt_count: u32) -> u64 {
        let exponent = attempt_count.saturating_sub(1).min(63);
        let factor = 1_u64 << exponent;
        self.base_delay_secs
            .saturating_mul(factor)
            .min(self.max_delay_secs)
    }
}

/// What the caller should do with a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RetryDecision {
    /// Re-queue with `retry` after the given delay.
    Retry { retry_after_seconds: u64 },
    /// Do not retry automatically; hand to a human or operator.
    Surface { class: FailureClass, reason: String },
}

/// Combine classification with the run's retry eligibility.
pub fn decide_retry(
    run: &BackgroundRun,
    message: &str,
    policy: &Policy,
    backoff: &BackoffPolicy,
) -> RetryDecision {
    let class = classify_failure(message, policy);
    if class == FailureClass::Permanent {
        return RetryDecision::Surface {
            class,
            reason: format!("permanent failure: {message}"),
        };
    }
    if !run.retryable {
        return RetryDecision::Surface {
            class,
            reason: format!("run '{}' is not retryable", run.id),
        };
    }
    if !can_retry(run) {
        return RetryDecision::Surface {
            class,
            reason: format!(
                "run '{}' exhausted {} of {} attempts",
                run.id, run.attempt_count, run.max_attempts
            ),
        };
    }
    RetryDecision::Retry {
        retry_after_seconds: backoff.delay_secs(run.attempt_count),
    }
}
