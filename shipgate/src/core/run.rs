//! Background run lifecycle state machine.
//!
//! [`transition`] is a pure function over an immutable run snapshot: it either
//! returns the [`RunMutation`] to persist or a [`TransitionError`] with a stable
//! code, and never touches the input. The current time is always injected.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Lifecycle status of a background run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// `succeeded` and `cancelled` never transition again. `failed` may be
    /// retried and is therefore not terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One asynchronous unit of pipeline work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundRun {
    pub id: String,
    pub status: RunStatus,
    pub progress: u8,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub retryable: bool,
    #[serde(default)]
    pub cancel_requested: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub output: Option<Value>,
}

impl BackgroundRun {
    /// A freshly scheduled run, as an external scheduler would create it.
    pub fn queued(id: impl Into<String>, max_attempts: u32, retryable: bool) -> Self {
        Self {
            id: id.into(),
            status: RunStatus::Queued,
            progress: 0,
            attempt_count: 0,
            max_attempts,
            retryable,
            cancel_requested: false,
            started_at: None,
            finished_at: None,
            next_retry_at: None,
            error_message: None,
            output: None,
        }
    }

    /// Check record-level invariants. Returns stable messages (empty on success).
    pub fn check_invariants(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.progress > 100 {
            errors.push(format!("{}: progress {} exceeds 100", self.id, self.progress));
        }
        if self.attempt_count > self.max_attempts {
            errors.push(format!(
                "{}: attempt_count {} exceeds max_attempts {}",
                self.id, self.attempt_count, self.max_attempts
            ));
        }
        errors
    }

    /// Produce the next record by applying `mutation`. The receiver is untouched.
    pub fn apply(&self, mutation: &RunMutation) -> BackgroundRun {
        let mut next = self.clone();
        next.status = mutation.status;
        if let Some(progress) = mutation.progress {
            next.progress = progress;
        }
        if let Some(attempt_count) = mutation.attempt_count {
            next.attempt_count = attempt_count;
        }
        if let Some(started_at) = mutation.started_at {
            next.started_at = Some(started_at);
        }
        if let Some(finished_at) = mutation.finished_at {
            next.finished_at = Some(finished_at);
        }
        if let Some(next_retry_at) = mutation.next_retry_at {
            next.next_retry_at = Some(next_retry_at);
        }
        if let Some(error_message) = &mutation.error_message {
            next.error_message = Some(error_message.clone());
        }
        if let Some(output) = &mutation.output {
            next.output = Some(output.clone());
        }
        next
    }
}

/// Canonical operation accepted by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOperation {
    Start,
    Complete { output: Option<Value> },
    Fail { error_message: String },
    Retry { retry_after_seconds: u64 },
    Cancel,
}

impl RunOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            RunOperation::Start => OperationKind::Start,
            RunOperation::Complete { .. } => OperationKind::Complete,
            RunOperation::Fail { .. } => OperationKind::Fail,
            RunOperation::Retry { .. } => OperationKind::Retry,
            RunOperation::Cancel => OperationKind::Cancel,
        }
    }
}

/// Operation name as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Start,
    Complete,
    Fail,
    Retry,
    Cancel,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Start => "start",
            OperationKind::Complete => "complete",
            OperationKind::Fail => "fail",
            OperationKind::Retry => "retry",
            OperationKind::Cancel => "cancel",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field changes produced by a successful transition. Absent fields are left
/// as they are.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMutation {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl RunMutation {
    fn status(status: RunStatus) -> Self {
        Self {
            status,
            progress: None,
            attempt_count: None,
            started_at: None,
            finished_at: None,
            next_retry_at: None,
            error_message: None,
            output: None,
        }
    }
}

/// Stable failure codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCode {
    InvalidTransition,
    MaxAttemptsReached,
    NotRetryable,
    InvalidPayload,
    InvalidRecord,
}

impl TransitionCode {
    pub fn as_str(self) -> &'static str {
        match self {
            TransitionCode::InvalidTransition => "invalid_transition",
            TransitionCode::MaxAttemptsReached => "max_attempts_reached",
            TransitionCode::NotRetryable => "not_retryable",
            TransitionCode::InvalidPayload => "invalid_payload",
            TransitionCode::InvalidRecord => "invalid_record",
        }
    }

    /// Policy blocks are terminal for the current attempt but open to human or
    /// policy-engine intervention; everything else is a protocol violation.
    pub fn is_policy_block(self) -> bool {
        matches!(self, TransitionCode::MaxAttemptsReached)
    }
}

impl fmt::Display for TransitionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected transition: stable code plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct TransitionError {
    pub code: TransitionCode,
    pub message: String,
}

impl TransitionError {
    pub fn new(code: TransitionCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn invalid(run: &BackgroundRun, op: OperationKind) -> Self {
        Self::new(
            TransitionCode::InvalidTransition,
            format!("cannot {op} run '{}' in status {}", run.id, run.status),
        )
    }
}

/// Compute the mutation for applying `op` to `run` at `now`.
pub fn transition(
    run: &BackgroundRun,
    op: &RunOperation,
    now: DateTime<Utc>,
) -> Result<RunMutation, TransitionError> {
    let violations = run.check_invariants();
    if !violations.is_empty() {
        return Err(TransitionError::new(
            TransitionCode::InvalidRecord,
            violations.join("; "),
        ));
    }

    match op {
        RunOperation::Start => {
            if run.status != RunStatus::Queued {
                return Err(TransitionError::invalid(run, OperationKind::Start));
            }
            if run.attempt_count >= run.max_attempts {
                return Err(TransitionError::new(
                    TransitionCode::MaxAttemptsReached,
                    format!(
                        "run '{}' used {} of {} attempts",
                        run.id, run.attempt_count, run.max_attempts
                    ),
                ));
            }
            Ok(RunMutation {
                attempt_count: Some(run.attempt_count + 1),
                started_at: Some(now),
                ..RunMutation::status(RunStatus::Running)
            })
        }
        RunOperation::Complete { output } => {
            if run.status != RunStatus::Running {
                return Err(TransitionError::invalid(run, OperationKind::Complete));
            }
            Ok(RunMutation {
                progress: Some(100),
                finished_at: Some(now),
                output: output.clone(),
                ..RunMutation::status(RunStatus::Succeeded)
            })
        }
        RunOperation::Fail { error_message } => {
            if run.status != RunStatus::Running {
                return Err(TransitionError::invalid(run, OperationKind::Fail));
            }
            Ok(RunMutation {
                finished_at: Some(now),
                error_message: Some(error_message.clone()),
                ..RunMutation::status(RunStatus::Failed)
            })
        }
        RunOperation::Retry {
            retry_after_seconds,
        } => {
            // Checked before status so a non-retryable run reports the same code
            // whatever state it is in.
            if !run.retryable {
                return Err(TransitionError::new(
                    TransitionCode::NotRetryable,
                    format!("run '{}' is not retryable", run.id),
                ));
            }
            if run.status != RunStatus::Failed {
                return Err(TransitionError::invalid(run, OperationKind::Retry));
            }
            let next_retry_at = retry_deadline(now, *retry_after_seconds)?;
            Ok(RunMutation {
                progress: Some(0),
                next_retry_at: Some(next_retry_at),
                ..RunMutation::status(RunStatus::Queued)
            })
        }
        RunOperation::Cancel => {
            if !matches!(run.status, RunStatus::Queued | RunStatus::Running) {
                return Err(TransitionError::invalid(run, OperationKind::Cancel));
            }
            Ok(RunMutation {
                finished_at: Some(now),
                ..RunMutation::status(RunStatus::Cancelled)
            })
        }
    }
}

fn retry_deadline(
    now: DateTime<Utc>,
    retry_after_seconds: u64,
) -> Result<DateTime<Utc>, TransitionError> {
    i64::try_from(retry_after_seconds)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|delay| now.checked_add_signed(delay))
        .ok_or_else(|| {
            TransitionError::new(
                TransitionCode::InvalidPayload,
                format!("retryAfterSeconds {retry_after_seconds} is out of range"),
            )
        })
}

/// Attempts left before `start` is refused.
pub fn attempts_remaining(run: &BackgroundRun) -> u32 {
    run.max_attempts.saturating_sub(run.attempt_count)
}

/// True if a failed run may be re-queued and started again.
pub fn can_retry(run: &BackgroundRun) -> bool {
    run.status == RunStatus::Failed && run.retryable && attempts_remaining(run) > 0
}

/// True if a queued run's retry delay (if any) has elapsed at `now`.
pub fn is_due(run: &BackgroundRun, now: DateTime<Utc>) -> bool {
    run.status == RunStatus::Queued && run.next_retry_at.is_none_or(|at| at <= now)
}
