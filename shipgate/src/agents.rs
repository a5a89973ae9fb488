//! Agent seams used by the pipeline.
//!
//! Each stage of a run is delegated to a trait object so orchestration stays
//! independent of the model backend. Tests use the scripted doubles in
//! `test_support`.
//!
//! The reviewer is the validating actor: it receives only a
//! [`ReviewWorkspace`], so it can inspect the project but never write to it or
//! run anything.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::governance::{GateDecision, GateStage};
use crate::core::trust_bundle::ShipFile;
use crate::io::workspace::ReviewWorkspace;

/// What the user asked to be built, plus release metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    pub project_name: String,
    pub target: String,
    pub workflow_mode: String,
    pub actor_user_id: String,
    pub prompt: String,
}

/// An artifact submitted to a governance gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// Classified intent, e.g. `new_feature` or `bug_fix`.
    pub intent: String,
    /// Execution route chosen for the intent, e.g. `scaffold` or `patch`.
    pub route: String,
    pub summary: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BuildOutput {
    pub files: Vec<ShipFile>,
}

/// Result of the external audit of built files.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AuditReport {
    pub passed: bool,
    pub preview_verified: bool,
    pub runtime_probe_passed: bool,
    pub runtime_hash: Option<String>,
    pub dependency_lock_hash: Option<String>,
    /// The auditor found something only a human may sign off.
    pub requires_human_review: bool,
    pub findings: Vec<String>,
}

pub trait Planner {
    fn plan(&self, request: &BuildRequest) -> Result<Proposal>;
}

pub trait Architect {
    /// Propose a file structure for an approved plan.
    fn structure(
        &self,
        request: &BuildRequest,
        plan: &Proposal,
        amendments: &[String],
    ) -> Result<Proposal>;
}

pub trait Reviewer {
    /// Return the raw reply containing one governance verdict block.
    fn review(
        &self,
        stage: GateStage,
        proposal: &Proposal,
        workspace: &dyn ReviewWorkspace,
    ) -> Result<String>;
}

pub trait Builder {
    fn build(
        &self,
        request: &BuildRequest,
        plan: &Proposal,
        structure: &Proposal,
        amendments: &[String],
    ) -> Result<BuildOutput>;

    /// Attempt to repair `output` given audit findings.
    fn autofix(&self, output: &BuildOutput, findings: &[String]) -> Result<BuildOutput>;
}

pub trait Auditor {
    fn audit(&self, files: &[ShipFile]) -> Result<AuditReport>;
}

/// Human decision on an escalated gate.
pub trait HumanApproval {
    fn approve(&self, stage: GateStage, decision: &GateDecision) -> Result<bool>;
}

/// Polled between stages; a concurrent actor may request cancellation.
pub trait CancelSignal {
    fn cancel_requested(&self, run_id: &str) -> bool;
}

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

/// Every agent a pipeline attempt needs.
pub struct PipelineAgents<'a> {
    pub planner: &'a dyn Planner,
    pub architect: &'a dyn Architect,
    pub reviewer: &'a dyn Reviewer,
    pub builder: &'a dyn Builder,
    pub auditor: &'a dyn Auditor,
    pub human: &'a dyn HumanApproval,
    pub cancel: &'a dyn CancelSignal,
    pub clock: &'a dyn Clock,
}
