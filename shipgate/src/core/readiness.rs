//! Release readiness from governance and audit signals.

use serde::{Deserialize, Serialize};

use crate::core::governance::{InvariantViolation, Severity};

/// Governance and audit signals collected during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernanceSnapshot {
    pub auditor_passed: bool,
    pub preview_verified: bool,
    pub runtime_probe_passed: bool,
    #[serde(default)]
    pub runtime_hash: Option<String>,
    #[serde(default)]
    pub dependency_lock_hash: Option<String>,
    /// Automatic rescues performed during the run. Audit only.
    #[serde(default)]
    pub rescue_count: u32,
    pub requires_human_review: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Readiness {
    pub ready: bool,
    pub blockers: Vec<String>,
}

impl Readiness {
    fn from_blockers(blockers: Vec<String>) -> Self {
        Self {
            ready: blockers.is_empty(),
            blockers,
        }
    }
}

pub const BLOCKER_AUDITOR: &str = "auditor did not pass";
pub const BLOCKER_PREVIEW: &str = "preview not verified";
pub const BLOCKER_RUNTIME_PROBE: &str = "runtime probe did not pass";
pub const BLOCKER_HUMAN_REVIEW: &str = "human review required";

/// Ready iff the auditor passed, the preview is verified, the runtime probe
/// passed and no human review is pending. Blockers list every unmet condition.
pub fn evaluate_release_readiness(snapshot: &GovernanceSnapshot) -> Readiness {
    let mut blockers = Vec::new();
    if !snapshot.auditor_passed {
        blockers.push(BLOCKER_AUDITOR.to_string());
    }
    if !snapshot.preview_verified {
        blockers.push(BLOCKER_PREVIEW.to_string());
    }
    if !snapshot.runtime_probe_passed {
        blockers.push(BLOCKER_RUNTIME_PROBE.to_string());
    }
    if snapshot.requires_human_review {
        blockers.push(BLOCKER_HUMAN_REVIEW.to_string());
    }
    Readiness::from_blockers(blockers)
}

/// Add one blocker per hard invariant violation. Soft violations come back as
/// warnings and never affect readiness.
pub fn fold_invariant_violations(
    readiness: Readiness,
    violations: &[InvariantViolation],
) -> (Readiness, Vec<String>) {
    let mut blockers = readiness.blockers;
    let mut warnings = Vec::new();
    for violation in violations {
        let message = format!(
            "protected invariant '{}' touched by {}",
            violation.description,
            violation.paths.join(", ")
        );
        match violation.severity {
            Severity::Hard => blockers.push(message),
            Severity::Soft => warnings.push(message),
        }
    }
    (Readiness::from_blockers(blockers), warnings)
}
