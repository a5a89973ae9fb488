//! Supervisor event log as JSON lines, one file per run.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::events::{SupervisorEvent, format_event};

pub fn event_log_path(dir: &Path, run_id: &str) -> PathBuf {
    dir.join(format!("{run_id}.events.jsonl"))
}

/// Append events to `path`, creating it (and its parent) when needed.
pub fn append_events(path: &Path, events: &[SupervisorEvent]) -> Result<()> {
    if events.is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut buf = String::new();
    for event in events {
        buf.push_str(&serde_json::to_string(event).context("serialize supervisor event")?);
        buf.push('\n');
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open event log {}", path.display()))?;
    file.write_all(buf.as_bytes())
        .with_context(|| format!("append event log {}", path.display()))?;
    debug!(path = %path.display(), count = events.len(), "events appended");
    Ok(())
}

/// Read every event in `path`. Blank lines are skipped.
pub fn read_events(path: &Path) -> Result<Vec<SupervisorEvent>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read event log {}", path.display()))?;
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse {} line {}", path.display(), index + 1))
        })
        .collect()
}

/// Render an event log for terminals, one `[HH:MM:SS] summary` line each.
pub fn format_event_log(path: &Path) -> Result<String> {
    let events = read_events(path)?;
    Ok(events
        .iter()
        .map(format_event)
        .map(|line| line + "\n")
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::{EventRecorder, SupervisorEventKind};
    use crate::test_support::at;
    use serde_json::Map;

    fn sample_events() -> Vec<SupervisorEvent> {
        let mut recorder = EventRecorder::new("run-1");
        recorder.record(
            SupervisorEventKind::RunStarted,
            "run",
            "Attempt 1 started",
            Map::new(),
            at(0),
        );
        recorder.record(
            SupervisorEventKind::RunCompleted,
            "run",
            "Run succeeded",
            Map::new(),
            at(61),
        );
        recorder.into_events()
    }

    #[test]
    fn appends_accumulate_across_calls() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = event_log_path(&temp.path().join("logs"), "run-1");
        let events = sample_events();

        append_events(&path, &events[..1]).expect("first append");
        append_events(&path, &events[1..]).expect("second append");
        append_events(&path, &[]).expect("empty append");

        assert_eq!(read_events(&path).expect("read"), events);
        let contents = fs::read_to_string(&path).expect("raw");
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn formatted_log_has_one_line_per_event() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = event_log_path(temp.path(), "run-1");
        append_events(&path, &sample_events()).expect("append");
        assert_eq!(
            format_event_log(&path).expect("format"),
            "[00:00:00] Attempt 1 started\n[00:01:01] Run succeeded\n"
        );
    }

    #[test]
    fn corrupt_line_reports_its_number() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = event_log_path(temp.path(), "run-1");
        append_events(&path, &sample_events()).expect("append");
        let mut file = OpenOptions::new().append(true).open(&path).expect("open");
        file.write_all(b"{not json}\n").expect("write");

        let err = read_events(&path).expect_err("corrupt");
        assert!(format!("{err:#}").contains("line 3"));
    }
}
