//! Strict parsing of governance verdicts emitted by a validating actor.
//!
//! The reply must be exactly one JSON object, optionally wrapped in a single
//! ```` ```json ```` fence. Prose around the block, several blocks or a
//! non-object payload are rejected before schema validation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::validator_for;
use serde_json::Value;
use tracing::debug;

use crate::core::governance::GovernanceVerdict;

pub const VERDICT_SCHEMA: &str = include_str!("../../schemas/governance_verdict.schema.json");

const FENCE: &str = "```";

/// Return the JSON text of the single verdict block in `reply`.
pub fn extract_verdict_block(reply: &str) -> Result<&str> {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        bail!("verdict reply is empty");
    }

    let body = if let Some(rest) = trimmed.strip_prefix(FENCE) {
        let (info, inner) = rest
            .split_once('\n')
            .ok_or_else(|| anyhow!("verdict fence has no body"))?;
        if !info.trim().eq_ignore_ascii_case("json") {
            bail!("verdict fence must be tagged json, got '{}'", info.trim());
        }
        let inner = inner
            .strip_suffix(FENCE)
            .ok_or_else(|| anyhow!("verdict fence is not closed at the end of the reply"))?;
        if inner.contains(FENCE) {
            bail!("verdict reply must contain exactly one fenced block");
        }
        inner.trim()
    } else {
        if trimmed.contains(FENCE) {
            bail!("verdict reply has text outside its fenced block");
        }
        trimmed
    };

    if !(body.starts_with('{') && body.ends_with('}')) {
        bail!("verdict block must be a single JSON object with no surrounding text");
    }
    Ok(body)
}

/// Extract, schema-validate and deserialize a verdict.
pub fn parse_verdict(reply: &str) -> Result<GovernanceVerdict> {
    let block = extract_verdict_block(reply)?;
    let value: Value = serde_json::from_str(block).context("parse verdict json")?;
    validate_schema(&value)?;
    let verdict: GovernanceVerdict =
        serde_json::from_value(value).context("deserialize verdict")?;
    debug!(verdict = %verdict.verdict, areas = verdict.scope.affected_areas.len(), "verdict parsed");
    Ok(verdict)
}

/// Read a verdict reply from disk and parse it.
pub fn load_verdict(path: &Path) -> Result<GovernanceVerdict> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read verdict {}", path.display()))?;
    parse_verdict(&contents).with_context(|| format!("verdict {}", path.display()))
}

fn validate_schema(value: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(VERDICT_SCHEMA).context("parse verdict schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(value) {
        let messages = compiled
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "verdict schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::governance::VerdictKind;

    const APPROVED: &str = r#"{
  "verdict": "approved",
  "confidence": "high",
  "scope": {"intent": "add a footer", "affected_areas": ["src/components/Footer.tsx"]},
  "protected_invariants": [
    {"description": "routing unchanged", "scope": ["src/app/**"], "severity": "hard"}
  ]
}"#;

    #[test]
    fn bare_object_is_accepted() {
        let verdict = parse_verdict(APPROVED).expect("parse");
        assert_eq!(verdict.verdict, VerdictKind::Approved);
        assert_eq!(verdict.protected_invariants.len(), 1);
    }

    #[test]
    fn single_json_fence_is_accepted() {
        let reply = format!("\n```json\n{APPROVED}\n```\n");
        assert_eq!(parse_verdict(&reply).expect("parse").scope.intent, "add a footer");
    }

    #[test]
    fn surrounding_prose_is_rejected() {
        let replies = [
            format!("Here is my verdict:\n{APPROVED}"),
            format!("{APPROVED}\nLet me know if you need more."),
            format!("Sure!\n```json\n{APPROVED}\n```"),
            format!("```json\n{APPROVED}\n```\nThanks"),
            format!("```json\n{APPROVED}\n```\n```json\n{APPROVED}\n```"),
            format!("```\n{APPROVED}\n```"),
            format!("[{APPROVED}]"),
        ];
        for reply in replies {
            assert!(extract_verdict_block(&reply).is_err(), "{reply}");
        }
    }

    #[test]
    fn two_bare_objects_are_rejected() {
        let reply = format!("{APPROVED}\n{APPROVED}");
        let err = parse_verdict(&reply).expect_err("two objects");
        assert!(format!("{err:#}").contains("parse verdict json"));
    }

    #[test]
    fn schema_rejects_unknown_verdict_and_missing_invariants() {
        let unknown = APPROVED.replace("\"approved\"", "\"maybe\"");
        let err = parse_verdict(&unknown).expect_err("unknown verdict");
        assert!(err.to_string().contains("schema validation failed"));

        let missing = r#"{"verdict":"approved","confidence":"high","scope":{"intent":"x","affected_areas":["a"]}}"#;
        let err = parse_verdict(missing).expect_err("missing invariants");
        assert!(err.to_string().contains("protected_invariants"));
    }

    #[test]
    fn schema_rejects_unknown_fields() {
        let extra = APPROVED.replacen('{', "{\"execute\": \"rm -rf /\", ", 1);
        assert!(parse_verdict(&extra).is_err());
    }

    #[test]
    fn load_reads_from_disk() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("verdict.json");
        fs::write(&path, APPROVED).expect("write");
        assert_eq!(load_verdict(&path).expect("load").verdict, VerdictKind::Approved);
    }
}
