//! Supervisor events: the append-only audit trail of a pipeline run.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Closed set of pipeline milestones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorEventKind {
    RunStarted,
    IntentClassified,
    RouteSelected,
    GateStarted,
    GatePassed,
    GateFailed,
    AutofixStarted,
    AutofixSucceeded,
    AutofixFailed,
    FallbackInvoked,
    RunCompleted,
}

impl SupervisorEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SupervisorEventKind::RunStarted => "run_started",
            SupervisorEventKind::IntentClassified => "intent_classified",
            SupervisorEventKind::RouteSelected => "route_selected",
            SupervisorEventKind::GateStarted => "gate_started",
            SupervisorEventKind::GatePassed => "gate_passed",
            SupervisorEventKind::GateFailed => "gate_failed",
            SupervisorEventKind::AutofixStarted => "autofix_started",
            SupervisorEventKind::AutofixSucceeded => "autofix_succeeded",
            SupervisorEventKind::AutofixFailed => "autofix_failed",
            SupervisorEventKind::FallbackInvoked => "fallback_invoked",
            SupervisorEventKind::RunCompleted => "run_completed",
        }
    }
}

impl fmt::Display for SupervisorEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable telemetry record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorEvent {
    pub event: SupervisorEventKind,
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub stage: String,
    pub summary: String,
    #[serde(default)]
    pub details: Map<String, Value>,
}

/// Build an event stamped at `now`.
pub fn create_event(
    event: SupervisorEventKind,
    run_id: &str,
    stage: &str,
    summary: impl Into<String>,
    details: Map<String, Value>,
    now: DateTime<Utc>,
) -> SupervisorEvent {
    SupervisorEvent {
        event,
        timestamp: now,
        run_id: run_id.to_string(),
        stage: stage.to_string(),
        summary: summary.into(),
        details,
    }
}

/// Render `[HH:MM:SS] <summary>` (UTC) for terminal and log display.
pub fn format_event(event: &SupervisorEvent) -> String {
    format!("[{}] {}", event.timestamp.format("%H:%M:%S"), event.summary)
}

/// In-memory, append-only event stream for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventRecorder {
    run_id: String,
    events: Vec<SupervisorEvent>,
}

impl EventRecorder {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            events: Vec::new(),
        }
    }

    /// Append an event and return a reference to it.
    pub fn record(
        &mut self,
        event: SupervisorEventKind,
        stage: &str,
        summary: impl Into<String>,
        details: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> &SupervisorEvent {
        let created = create_event(event, &self.run_id, stage, summary, details, now);
        self.events.push(created);
        &self.events[self.events.len() - 1]
    }

    pub fn events(&self) -> &[SupervisorEvent] {
        &self.events
    }

    pub fn kinds(&self) -> Vec<SupervisorEventKind> {
        self.events.iter().map(|event| event.event).collect()
    }

    pub fn into_events(self) -> Vec<SupervisorEvent> {
        self.events
    }
}

/// Build a details map from key/value pairs.
pub fn details<I, K>(pairs: I) -> Map<String, Value>
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs
        .into_iter()
        .map(|(key, value)| (key.into(), value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::at;
    use serde_json::json;

    #[test]
    fn format_renders_clock_time_and_summary() {
        let event = create_event(
            SupervisorEventKind::GatePassed,
            "run-1",
            "plan",
            "Plan approved",
            Map::new(),
            at(3_725),
        );
        // `at` is anchored at midnight UTC, so 3725s is 01:02:05.
        assert_eq!(format_event(&event), "[01:02:05] Plan approved");
    }

    #[test]
    fn events_serialize_as_snake_case_json_lines() {
        let event = create_event(
            SupervisorEventKind::FallbackInvoked,
            "run-7",
            "build",
            "retry scheduled",
            details([("retry_after_seconds", json!(30))]),
            at(0),
        );
        let line = serde_json::to_string(&event).expect("serialize");
        assert!(!line.contains('\n'));
        let value: Value = serde_json::from_str(&line).expect("parse");
        assert_eq!(value["event"], json!("fallback_invoked"));
        assert_eq!(value["run_id"], json!("run-7"));
        assert_eq!(value["details"]["retry_after_seconds"], json!(30));
        let back: SupervisorEvent = serde_json::from_str(&line).expect("deserialize");
        assert_eq!(back, event);
    }

    #[test]
    fn recorder_appends_in_order_with_its_run_id() {
        let mut recorder = EventRecorder::new("run-9");
        recorder.record(
            SupervisorEventKind::RunStarted,
            "run",
            "started",
            Map::new(),
            at(0),
        );
        let gate = recorder.record(
            SupervisorEventKind::GateStarted,
            "plan",
            "reviewing plan",
            Map::new(),
            at(1),
        );
        assert_eq!(gate.run_id, "run-9");
        assert_eq!(
            recorder.kinds(),
            vec![
                SupervisorEventKind::RunStarted,
                SupervisorEventKind::GateStarted
            ]
        );
        assert_eq!(recorder.into_events().len(), 2);
    }

    #[test]
    fn missing_details_deserialize_as_empty_map() {
        let raw = r#"{"event":"run_completed","timestamp":"2024-01-01T00:00:00Z","run_id":"r","stage":"run","summary":"done"}"#;
        let event: SupervisorEvent = serde_json::from_str(raw).expect("parse");
        assert!(event.details.is_empty());
    }
}
