//! Wire adapter for the background run API.
//!
//! Requests arrive either in the canonical `{"operation": ...}` shape or in the
//! legacy `{"status": "failed", "errorMessage": ...}` shape. Both are
//! normalized here into a single [`RunOperation`] so the state machine sees
//! exactly one input shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::run::{
    BackgroundRun, OperationKind, RunMutation, RunOperation, TransitionCode, TransitionError,
    transition,
};

/// Defaults applied while normalizing requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestDefaults {
    pub retry_after_seconds: u64,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            retry_after_seconds: 60,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
enum OperationRequest {
    Start,
    Complete {
        #[serde(default)]
        output: Option<Value>,
    },
    Fail {
        #[serde(rename = "errorMessage")]
        error_message: String,
    },
    Retry {
        #[serde(rename = "retryAfterSeconds", default)]
        retry_after_seconds: Option<u64>,
    },
    Cancel,
}

#[derive(Debug, Deserialize)]
struct LegacyStatusRequest {
    status: String,
    #[serde(rename = "errorMessage", default)]
    error_message: Option<String>,
}

const LEGACY_FALLBACK_ERROR: &str = "run failed without an error message";

/// Normalize a raw JSON request body into a canonical operation.
pub fn normalize_request(
    payload: &Value,
    defaults: &RequestDefaults,
) -> Result<RunOperation, TransitionError> {
    let Some(object) = payload.as_object() else {
        return Err(invalid_payload("request body must be a JSON object"));
    };

    if object.contains_key("operation") {
        let request: OperationRequest = serde_json::from_value(payload.clone())
            .map_err(|err| invalid_payload(format!("invalid operation request: {err}")))?;
        return Ok(match request {
            OperationRequest::Start => RunOperation::Start,
            OperationRequest::Complete { output } => RunOperation::Complete { output },
            OperationRequest::Fail { error_message } => RunOperation::Fail { error_message },
            OperationRequest::Retry {
                retry_after_seconds,
            } => RunOperation::Retry {
                retry_after_seconds: retry_after_seconds.unwrap_or(defaults.retry_after_seconds),
            },
            OperationRequest::Cancel => RunOperation::Cancel,
        });
    }

    if object.contains_key("status") {
        let legacy: LegacyStatusRequest = serde_json::from_value(payload.clone())
            .map_err(|err| invalid_payload(format!("invalid legacy request: {err}")))?;
        if legacy.status != "failed" {
            return Err(invalid_payload(format!(
                "legacy requests only support status 'failed', got '{}'",
                legacy.status
            )));
        }
        let error_message = legacy
            .error_message
            .filter(|message| !message.trim().is_empty())
            .unwrap_or_else(|| LEGACY_FALLBACK_ERROR.to_string());
        return Ok(RunOperation::Fail { error_message });
    }

    Err(invalid_payload(
        "request must carry 'operation' or a legacy 'status'",
    ))
}

fn invalid_payload(message: impl Into<String>) -> TransitionError {
    TransitionError::new(TransitionCode::InvalidPayload, message)
}

/// Response body of the background run API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunResponse {
    Applied {
        ok: bool,
        mutation: RunMutation,
        operation: OperationKind,
    },
    Rejected {
        ok: bool,
        code: TransitionCode,
        message: String,
    },
}

impl RunResponse {
    pub fn applied(mutation: RunMutation, operation: OperationKind) -> Self {
        RunResponse::Applied {
            ok: true,
            mutation,
            operation,
        }
    }

    pub fn rejected(err: TransitionError) -> Self {
        RunResponse::Rejected {
            ok: false,
            code: err.code,
            message: err.message,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, RunResponse::Applied { .. })
    }
}

/// Normalize `payload` and run it through the state machine.
pub fn handle_run_request(
    run: &BackgroundRun,
    payload: &Value,
    now: DateTime<Utc>,
    defaults: &RequestDefaults,
) -> RunResponse {
    let op = match normalize_request(payload, defaults) {
        Ok(op) => op,
        Err(err) => return RunResponse::rejected(err),
    };
    match transition(run, &op, now) {
        Ok(mutation) => RunResponse::applied(mutation, op.kind()),
        Err(err) => RunResponse::rejected(err),
    }
}
