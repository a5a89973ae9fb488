//! Governance gate protocol.
//!
//! A validating actor reviews a proposed plan or file structure and returns a
//! [`GovernanceVerdict`]. The same evaluator serves both gates:
//!
//! 1. [`validate_verdict`] collects protocol violations (missing intent, a
//!    verdict kind without its required field, ...). Any violation makes the
//!    verdict malformed and it must be rejected by the caller.
//! 2. [`evaluate_verdict`] turns a well-formed verdict into a [`GateDecision`],
//!    forcing escalation when the affected areas touch a critical path even if
//!    the reviewer approved.
//!
//! [`GateReview`] tracks the review lifecycle of a single artifact.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::path::{normalize_ship_path, path_matches_scope};
use crate::core::policy::{CriticalCategory, Policy};

/// Which artifact a gate reviews.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStage {
    Plan,
    Structure,
}

impl GateStage {
    pub fn as_str(self) -> &'static str {
        match self {
            GateStage::Plan => "plan",
            GateStage::Structure => "structure",
        }
    }
}

impl fmt::Display for GateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    Approved,
    ApprovedWithAmendments,
    Rejected,
    Escalate,
}

impl VerdictKind {
    pub fn as_str(self) -> &'static str {
        match self {
            VerdictKind::Approved => "approved",
            VerdictKind::ApprovedWithAmendments => "approved_with_amendments",
            VerdictKind::Rejected => "rejected",
            VerdictKind::Escalate => "escalate",
        }
    }
}

impl fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// What the proposal intends to do and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictScope {
    pub intent: String,
    pub affected_areas: Vec<String>,
}

/// Whether an invariant violation blocks shipping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Hard,
    Soft,
}

/// A property that must not change while the proposal is executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedInvariant {
    pub description: String,
    pub scope: Vec<String>,
    pub severity: Severity,
}

/// Structured output of a validating actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceVerdict {
    pub verdict: VerdictKind,
    pub confidence: Confidence,
    pub scope: VerdictScope,
    pub protected_invariants: Vec<ProtectedInvariant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amendments: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// One way a verdict breaks the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum ProtocolViolation {
    MissingIntent,
    MissingAffectedAreas,
    MissingAmendments,
    MissingRejectionReason,
    MissingEscalationReason,
    FieldNotAllowed {
        field: String,
        verdict: VerdictKind,
    },
    InvariantMissingDescription {
        index: usize,
    },
    InvariantMissingScope {
        index: usize,
    },
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolViolation::MissingIntent => f.write_str("scope.intent must not be empty"),
            ProtocolViolation::MissingAffectedAreas => {
                f.write_str("scope.affected_areas must not be empty")
            }
            ProtocolViolation::MissingAmendments => {
                f.write_str("approved_with_amendments requires at least one amendment")
            }
            ProtocolViolation::MissingRejectionReason => {
                f.write_str("rejected requires rejection_reason")
            }
            ProtocolViolation::MissingEscalationReason => {
                f.write_str("escalate requires escalation_reason")
            }
            ProtocolViolation::FieldNotAllowed { field, verdict } => {
                write!(f, "{field} is not allowed with verdict {verdict}")
            }
            ProtocolViolation::InvariantMissingDescription { index } => {
                write!(f, "protected_invariants[{index}].description must not be empty")
            }
            ProtocolViolation::InvariantMissingScope { index } => {
                write!(f, "protected_invariants[{index}].scope must not be empty")
            }
        }
    }
}

/// A verdict that failed protocol validation. Integrity failure: the gate must
/// not proceed on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed governance verdict: {}", join_violations(.violations))]
pub struct MalformedVerdict {
    pub violations: Vec<ProtocolViolation>,
}

fn join_violations(violations: &[ProtocolViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Collect every protocol violation in `verdict` (empty when well-formed).
pub fn validate_verdict(verdict: &GovernanceVerdict) -> Vec<ProtocolViolation> {
    let mut violations = Vec::new();

    if verdict.scope.intent.trim().is_empty() {
        violations.push(ProtocolViolation::MissingIntent);
    }
    // A rejected proposal changes nothing, so it may be scoped to nothing.
    let areas_present = verdict
        .scope
        .affected_areas
        .iter()
        .any(|area| !area.trim().is_empty());
    if !areas_present && verdict.verdict != VerdictKind::Rejected {
        violations.push(ProtocolViolation::MissingAffectedAreas);
    }

    let amendments = verdict
        .amendments
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter(|amendment| !amendment.trim().is_empty())
        .count();
    let has_rejection = non_blank(verdict.rejection_reason.as_deref());
    let has_escalation = non_blank(verdict.escalation_reason.as_deref());

    match verdict.verdict {
        VerdictKind::ApprovedWithAmendments if amendments == 0 => {
            violations.push(ProtocolViolation::MissingAmendments);
        }
        VerdictKind::Rejected if !has_rejection => {
            violations.push(ProtocolViolation::MissingRejectionReason);
        }
        VerdictKind::Escalate if !has_escalation => {
            violations.push(ProtocolViolation::MissingEscalationReason);
        }
        _ => {}
    }

    let mut not_allowed = |field: &str| {
        violations.push(ProtocolViolation::FieldNotAllowed {
            field: field.to_string(),
            verdict: verdict.verdict,
        });
    };
    if amendments > 0 && verdict.verdict != VerdictKind::ApprovedWithAmendments {
        not_allowed("amendments");
    }
    if has_rejection && verdict.verdict != VerdictKind::Rejected {
        not_allowed("rejection_reason");
    }
    if has_escalation && verdict.verdict != VerdictKind::Escalate {
        not_allowed("escalation_reason");
    }

    for (index, invariant) in verdict.protected_invariants.iter().enumerate() {
        if invariant.description.trim().is_empty() {
            violations.push(ProtocolViolation::InvariantMissingDescription { index });
        }
        if !invariant.scope.iter().any(|pattern| !pattern.trim().is_empty()) {
            violations.push(ProtocolViolation::InvariantMissingScope { index });
        }
    }

    violations
}

fn non_blank(value: Option<&str>) -> bool {
    value.is_some_and(|text| !text.trim().is_empty())
}

/// Critical categories touched by any affected area, sorted and deduplicated.
pub fn critical_categories(scope: &VerdictScope, policy: &Policy) -> Vec<CriticalCategory> {
    let mut hits = Vec::new();
    for area in &scope.affected_areas {
        let normalized = normalize_ship_path(area);
        for category in policy.critical_categories_for(&normalized) {
            if !hits.contains(&category) {
                hits.push(category);
            }
        }
    }
    hits.sort();
    hits
}

/// Outcome of a gate for a well-formed verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    Proceed,
    ProceedWithAmendments {
        amendments: Vec<String>,
    },
    Rejected {
        reason: String,
    },
    /// Human approval is required before execution continues.
    Escalate {
        reasons: Vec<String>,
        categories: Vec<CriticalCategory>,
    },
}

impl GateDecision {
    /// True if execution may continue without a human.
    pub fn may_proceed(&self) -> bool {
        matches!(
            self,
            GateDecision::Proceed | GateDecision::ProceedWithAmendments { .. }
        )
    }

    pub fn amendments(&self) -> &[String] {
        match self {
            GateDecision::ProceedWithAmendments { amendments } => amendments,
            _ => &[],
        }
    }
}

/// Validate `verdict` and derive the gate decision.
///
/// Escalation is mandatory when the affected areas hit a critical-path
/// category; an approving reviewer cannot waive it. Rejections stay rejections.
pub fn evaluate_verdict(
    verdict: &GovernanceVerdict,
    policy: &Policy,
) -> Result<GateDecision, MalformedVerdict> {
    let violations = validate_verdict(verdict);
    if !violations.is_empty() {
        return Err(MalformedVerdict { violations });
    }

    let categories = critical_categories(&verdict.scope, policy);
    let policy_reason = (!categories.is_empty()).then(|| {
        format!(
            "affected areas touch critical paths: {}",
            categories
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        )
    });

    let decision = match verdict.verdict {
        VerdictKind::Rejected => GateDecision::Rejected {
            reason: verdict.rejection_reason.clone().unwrap_or_default(),
        },
        VerdictKind::Escalate => {
            let mut reasons = vec![verdict.escalation_reason.clone().unwrap_or_default()];
            reasons.extend(policy_reason);
            GateDecision::Escalate {
                reasons,
                categories,
            }
        }
        VerdictKind::Approved | VerdictKind::ApprovedWithAmendments => match policy_reason {
            Some(reason) => GateDecision::Escalate {
                reasons: vec![reason],
                categories,
            },
            None if verdict.verdict == VerdictKind::Approved => GateDecision::Proceed,
            None => GateDecision::ProceedWithAmendments {
                amendments: verdict
                    .amendments
                    .clone()
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|amendment| !amendment.trim().is_empty())
                    .collect(),
            },
        },
    };
    Ok(decision)
}

/// Review lifecycle of one artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    Proposed,
    Reviewing,
    Approved,
    ApprovedWithAmendments,
    Rejected,
    Escalated,
}

impl GateState {
    pub fn as_str(self) -> &'static str {
        match self {
            GateState::Proposed => "proposed",
            GateState::Reviewing => "reviewing",
            GateState::Approved => "approved",
            GateState::ApprovedWithAmendments => "approved_with_amendments",
            GateState::Rejected => "rejected",
            GateState::Escalated => "escalated",
        }
    }
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{stage} gate cannot {action} from state {state}")]
pub struct GateError {
    pub stage: GateStage,
    pub state: GateState,
    pub action: &'static str,
}

/// Tracks one gate: proposed → reviewing → concluded, with human resolution
/// of escalations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateReview {
    pub stage: GateStage,
    pub state: GateState,
}

impl GateReview {
    pub fn new(stage: GateStage) -> Self {
        Self {
            stage,
            state: GateState::Proposed,
        }
    }

    pub fn begin_review(&mut self) -> Result<(), GateError> {
        self.expect_state(GateState::Proposed, "begin review")?;
        self.state = GateState::Reviewing;
        Ok(())
    }

    /// Record the decision reached for a well-formed verdict.
    pub fn conclude(&mut self, decision: &GateDecision) -> Result<GateState, GateError> {
        self.expect_state(GateState::Reviewing, "conclude")?;
        self.state = match decision {
            GateDecision::Proceed => GateState::Approved,
            GateDecision::ProceedWithAmendments { .. } => GateState::ApprovedWithAmendments,
            GateDecision::Rejected { .. } => GateState::Rejected,
            GateDecision::Escalate { .. } => GateState::Escalated,
        };
        Ok(self.state)
    }

    /// Apply a human decision to an escalated gate.
    pub fn resolve_escalation(&mut self, approved: bool) -> Result<GateState, GateError> {
        self.expect_state(GateState::Escalated, "resolve escalation")?;
        self.state = if approved {
            GateState::Approved
        } else {
            GateState::Rejected
        };
        Ok(self.state)
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, GateState::Approved | GateState::ApprovedWithAmendments)
    }

    fn expect_state(&self, expected: GateState, action: &'static str) -> Result<(), GateError> {
        if self.state == expected {
            return Ok(());
        }
        Err(GateError {
            stage: self.stage,
            state: self.state,
            action,
        })
    }
}

/// A protected invariant whose scope was touched by a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub description: String,
    pub severity: Severity,
    pub paths: Vec<String>,
}

/// Report every invariant whose scope matches at least one changed path.
///
/// Matched paths are normalized, sorted and deduplicated per invariant.
pub fn detect_invariant_violations<S: AsRef<str>>(
    invariants: &[ProtectedInvariant],
    changed_paths: &[S],
) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for invariant in invariants {
        let mut paths = changed_paths
            .iter()
            .map(|path| normalize_ship_path(path.as_ref()))
            .filter(|path| {
                invariant
                    .scope
                    .iter()
                    .any(|pattern| path_matches_scope(path, pattern))
            })
            .collect::<Vec<_>>();
        if paths.is_empty() {
            continue;
        }
        paths.sort();
        paths.dedup();
        violations.push(InvariantViolation {
            description: invariant.description.clone(),
            severity: invariant.severity,
            paths,
        });
    }
    violations
}
