//! Test-only fixtures and scripted agent doubles.
//!
//! Scripted agents answer from a queue. The last entry repeats once the queue
//! is down to one, so a single scripted answer serves every call.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tempfile::TempDir;

use crate::agents::{
    Architect, AuditReport, Auditor, BuildOutput, BuildRequest, Builder, CancelSignal, Clock,
    HumanApproval, PipelineAgents, Planner, Proposal, Reviewer,
};
use crate::core::classifier::BackoffPolicy;
use crate::core::governance::{
    Confidence, GateDecision, GateStage, GovernanceVerdict, VerdictKind, VerdictScope,
};
use crate::core::policy::Policy;
use crate::core::readiness::GovernanceSnapshot;
use crate::core::run::{BackgroundRun, RunStatus};
use crate::core::trust_bundle::{ShipFile, TrustBundleInput};
use crate::io::workspace::{MemoryReviewWorkspace, ReviewWorkspace};
use crate::pipeline::{AttemptOutcome, PipelineContext, SigningKey, run_attempt};

/// 2024-01-01T00:00:00Z. Midnight, so `at(3_725)` renders as `01:02:05`.
const EPOCH_SECS: i64 = 1_704_067_200;

pub const TEST_SECRET: &str = "test-signing-secret";
pub const TEST_KEY_ID: &str = "test-key";

/// Deterministic timestamp `secs` seconds after the test epoch.
pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(EPOCH_SECS + secs, 0).expect("valid test timestamp")
}

/// A run record in `status` with explicit attempt state.
pub fn run_in(status: RunStatus, attempt_count: u32, max_attempts: u32, retryable: bool) -> BackgroundRun {
    let mut run = BackgroundRun::queued("run-1", max_attempts, retryable);
    run.status = status;
    run.attempt_count = attempt_count;
    if status != RunStatus::Queued {
        run.started_at = Some(at(0));
    }
    run
}

/// A well-formed verdict of `kind` with no optional fields set.
pub fn verdict(kind: VerdictKind, affected_areas: &[&str]) -> GovernanceVerdict {
    GovernanceVerdict {
        verdict: kind,
        confidence: Confidence::High,
        scope: VerdictScope {
            intent: "add a marketing landing page".to_string(),
            affected_areas: affected_areas.iter().map(|area| (*area).to_string()).collect(),
        },
        protected_invariants: Vec::new(),
        amendments: None,
        rejection_reason: None,
        escalation_reason: None,
        notes: None,
    }
}

/// A reviewer reply wrapping `verdict` in a single json fence.
pub fn verdict_reply(verdict: &GovernanceVerdict) -> String {
    let body = serde_json::to_string_pretty(verdict).expect("serialize verdict");
    format!("```json\n{body}\n```\n")
}

pub fn passing_snapshot() -> GovernanceSnapshot {
    GovernanceSnapshot {
        auditor_passed: true,
        preview_verified: true,
        runtime_probe_passed: true,
        runtime_hash: Some("rt-abc123".to_string()),
        dependency_lock_hash: Some("lock-456def".to_string()),
        rescue_count: 0,
        requires_human_review: false,
    }
}

pub fn app_files() -> Vec<ShipFile> {
    vec![
        ShipFile::new(
            "src/app/page.tsx",
            "export default function Page() {\n  return <Header />;\n}\n",
        ),
        ShipFile::new(
            "src/components/Header.tsx",
            "export function Header() {\n  return <h1>Demo</h1>;\n}\n",
        ),
        ShipFile::new("package.json", "{\n  \"name\": \"demo-app\"\n}\n"),
    ]
}

pub fn bundle_input(governance: GovernanceSnapshot) -> TrustBundleInput {
    TrustBundleInput {
        project_name: "demo-app".to_string(),
        target: "vercel".to_string(),
        workflow_mode: "autopilot".to_string(),
        actor_user_id: "user-42".to_string(),
        governance,
        files: app_files(),
    }
}

pub fn build_request() -> BuildRequest {
    BuildRequest {
        project_name: "demo-app".to_string(),
        target: "vercel".to_string(),
        workflow_mode: "autopilot".to_string(),
        actor_user_id: "user-42".to_string(),
        prompt: "Build a landing page with a header".to_string(),
    }
}

pub fn proposal(summary: &str) -> Proposal {
    Proposal {
        intent: "new_feature".to_string(),
        route: "scaffold".to_string(),
        summary: summary.to_string(),
        body: format!("{summary}\n\n1. Create the page\n2. Add the header"),
    }
}

pub fn passing_report() -> AuditReport {
    AuditReport {
        passed: true,
        preview_verified: true,
        runtime_probe_passed: true,
        runtime_hash: Some("rt-abc123".to_string()),
        dependency_lock_hash: Some("lock-456def".to_string()),
        requires_human_review: false,
        findings: Vec::new(),
    }
}

pub fn failing_report(finding: &str) -> AuditReport {
    AuditReport {
        passed: false,
        findings: vec![finding.to_string()],
        ..passing_report()
    }
}

/// Answer queue shared by the scripted agents.
struct Script<T> {
    name: &'static str,
    queue: RefCell<VecDeque<T>>,
}

impl<T: Clone> Script<T> {
    fn new(name: &'static str, items: Vec<T>) -> Self {
        Self {
            name,
            queue: RefCell::new(items.into()),
        }
    }

    fn next(&self) -> Result<T> {
        let mut queue = self.queue.borrow_mut();
        if queue.len() > 1 {
            return queue
                .pop_front()
                .ok_or_else(|| anyhow!("scripted {} exhausted", self.name));
        }
        queue
            .front()
            .cloned()
            .ok_or_else(|| anyhow!("scripted {} has no answers", self.name))
    }
}

pub struct ScriptedPlanner {
    pub proposal: Proposal,
}

impl Planner for ScriptedPlanner {
    fn plan(&self, _request: &BuildRequest) -> Result<Proposal> {
        Ok(self.proposal.clone())
    }
}

pub struct ScriptedArchitect {
    pub proposal: Proposal,
}

impl Architect for ScriptedArchitect {
    fn structure(
        &self,
        _request: &BuildRequest,
        _plan: &Proposal,
        _amendments: &[String],
    ) -> Result<Proposal> {
        Ok(self.proposal.clone())
    }
}

/// Replies from a queue and records which files it could see.
pub struct ScriptedReviewer {
    replies: Script<String>,
    stages: RefCell<Vec<GateStage>>,
    seen_files: RefCell<Vec<Vec<String>>>,
}

impl ScriptedReviewer {
    pub fn new(replies: Vec<String>) -> Self {
        Self {
            replies: Script::new("reviewer", replies),
            stages: RefCell::new(Vec::new()),
            seen_files: RefCell::new(Vec::new()),
        }
    }

    pub fn stages(&self) -> Vec<GateStage> {
        self.stages.borrow().clone()
    }

    pub fn seen_files(&self) -> Vec<Vec<String>> {
        self.seen_files.borrow().clone()
    }
}

impl Reviewer for ScriptedReviewer {
    fn review(
        &self,
        stage: GateStage,
        _proposal: &Proposal,
        workspace: &dyn ReviewWorkspace,
    ) -> Result<String> {
        self.stages.borrow_mut().push(stage);
        self.seen_files.borrow_mut().push(workspace.list_files()?);
        self.replies.next()
    }
}

#[derive(Debug, Clone)]
pub enum ScriptedBuild {
    Files(Vec<ShipFile>),
    Error(String),
}

impl ScriptedBuild {
    pub fn files(files: Vec<ShipFile>) -> Self {
        ScriptedBuild::Files(files)
    }

    pub fn error(message: &str) -> Self {
        ScriptedBuild::Error(message.to_string())
    }
}

/// Builds from a queue; autofix returns its input unchanged.
pub struct ScriptedBuilder {
    builds: Script<ScriptedBuild>,
    build_calls: Cell<usize>,
    autofix_calls: Cell<usize>,
}

impl ScriptedBuilder {
    pub fn new(builds: Vec<ScriptedBuild>) -> Self {
        Self {
            builds: Script::new("builder", builds),
            build_calls: Cell::new(0),
            autofix_calls: Cell::new(0),
        }
    }

    pub fn build_calls(&self) -> usize {
        self.build_calls.get()
    }

    pub fn autofix_calls(&self) -> usize {
        self.autofix_calls.get()
    }
}

impl Builder for ScriptedBuilder {
    fn build(
        &self,
        _request: &BuildRequest,
        _plan: &Proposal,
        _structure: &Proposal,
        _amendments: &[String],
    ) -> Result<BuildOutput> {
        self.build_calls.set(self.build_calls.get() + 1);
        match self.builds.next()? {
            ScriptedBuild::Files(files) => Ok(BuildOutput { files }),
            ScriptedBuild::Error(message) => Err(anyhow!(message).context("build failed")),
        }
    }

    fn autofix(&self, output: &BuildOutput, _findings: &[String]) -> Result<BuildOutput> {
        self.autofix_calls.set(self.autofix_calls.get() + 1);
        Ok(output.clone())
    }
}

pub struct ScriptedAuditor {
    reports: Script<AuditReport>,
}

impl ScriptedAuditor {
    pub fn new(reports: Vec<AuditReport>) -> Self {
        Self {
            reports: Script::new("auditor", reports),
        }
    }
}

impl Auditor for ScriptedAuditor {
    fn audit(&self, _files: &[ShipFile]) -> Result<AuditReport> {
        self.reports.next()
    }
}

/// Answers every escalation with a fixed decision and records what it was asked.
pub struct ScriptedHuman {
    pub approve: bool,
    asked: RefCell<Vec<GateDecision>>,
}

impl ScriptedHuman {
    pub fn new(approve: bool) -> Self {
        Self {
            approve,
            asked: RefCell::new(Vec::new()),
        }
    }

    pub fn asked(&self) -> Vec<GateDecision> {
        self.asked.borrow().clone()
    }
}

impl HumanApproval for ScriptedHuman {
    fn approve(&self, _stage: GateStage, decision: &GateDecision) -> Result<bool> {
        self.asked.borrow_mut().push(decision.clone());
        Ok(self.approve)
    }
}

/// Requests cancellation once it has been polled more than `after` times.
pub struct CancelAfter {
    after: Option<usize>,
    polls: Cell<usize>,
}

impl CancelAfter {
    pub fn new(after: usize) -> Self {
        Self {
            after: Some(after),
            polls: Cell::new(0),
        }
    }

    pub fn never() -> Self {
        Self {
            after: None,
            polls: Cell::new(0),
        }
    }
}

impl CancelSignal for CancelAfter {
    fn cancel_requested(&self, _run_id: &str) -> bool {
        let polls = self.polls.get() + 1;
        self.polls.set(polls);
        self.after.is_some_and(|after| polls > after)
    }
}

/// Clock that advances by one second per reading.
pub struct StepClock {
    secs: Cell<i64>,
}

impl StepClock {
    pub fn new(start_secs: i64) -> Self {
        Self {
            secs: Cell::new(start_secs),
        }
    }

    pub fn set(&self, secs: i64) {
        self.secs.set(secs);
    }
}

impl Clock for StepClock {
    fn now(&self) -> DateTime<Utc> {
        let secs = self.secs.get();
        self.secs.set(secs + 1);
        at(secs)
    }
}

/// Every collaborator of a pipeline attempt, scripted.
pub struct PipelineFixture {
    pub request: BuildRequest,
    pub planner: ScriptedPlanner,
    pub architect: ScriptedArchitect,
    pub reviewer: ScriptedReviewer,
    pub builder: ScriptedBuilder,
    pub auditor: ScriptedAuditor,
    pub human: ScriptedHuman,
    pub cancel: CancelAfter,
    pub clock: StepClock,
    pub workspace: MemoryReviewWorkspace,
    pub policy: Policy,
    pub backoff: BackoffPolicy,
    pub max_autofix_rounds: u32,
}

impl PipelineFixture {
    /// Reviewer approves both gates, build and audit succeed.
    pub fn approving() -> Self {
        let approved = verdict(VerdictKind::Approved, &["src/app", "src/components"]);
        Self {
            request: build_request(),
            planner: ScriptedPlanner {
                proposal: proposal("Landing page plan"),
            },
            architect: ScriptedArchitect {
                proposal: proposal("Landing page structure"),
            },
            reviewer: ScriptedReviewer::new(vec![verdict_reply(&approved)]),
            builder: ScriptedBuilder::new(vec![ScriptedBuild::files(app_files())]),
            auditor: ScriptedAuditor::new(vec![passing_report()]),
            human: ScriptedHuman::new(true),
            cancel: CancelAfter::never(),
            clock: StepClock::new(0),
            workspace: MemoryReviewWorkspace::new(&app_files()),
            policy: Policy::builtin().expect("builtin policy"),
            backoff: BackoffPolicy::default(),
            max_autofix_rounds: 1,
        }
    }

    pub fn reviewer_replies(&mut self, replies: Vec<String>) {
        self.reviewer = ScriptedReviewer::new(replies);
    }

    pub fn auditor_reports(&mut self, reports: Vec<AuditReport>) {
        self.auditor = ScriptedAuditor::new(reports);
    }

    pub fn run(&self, run: &BackgroundRun) -> Result<AttemptOutcome> {
        let agents = PipelineAgents {
            planner: &self.planner,
            architect: &self.architect,
            reviewer: &self.reviewer,
            builder: &self.builder,
            auditor: &self.auditor,
            human: &self.human,
            cancel: &self.cancel,
            clock: &self.clock,
        };
        let ctx = PipelineContext {
            policy: &self.policy,
            backoff: self.backoff,
            signing: SigningKey {
                key_id: TEST_KEY_ID.to_string(),
                secret: TEST_SECRET.to_string(),
            },
            max_autofix_rounds: self.max_autofix_rounds,
            workspace: &self.workspace,
        };
        run_attempt(run, &self.request, &agents, &ctx)
    }
}

/// Temporary project directory seeded with [`app_files`].
pub struct TestProject {
    dir: TempDir,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp project")?;
        for file in app_files() {
            let path = dir.path().join(&file.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, &file.content)?;
        }
        Ok(Self { dir })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write `contents` to `relative`, creating parent directories.
    pub fn write(&self, relative: &str, contents: impl AsRef<[u8]>) -> Result<()> {
        let path = self.dir.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }
}
