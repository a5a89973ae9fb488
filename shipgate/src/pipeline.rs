//! Orchestration for a single pipeline attempt of a background run.
//!
//! One attempt walks `start → plan gate → structure gate → build → audit →
//! readiness → sign → complete`. Any agent error, rejected or denied gate,
//! malformed verdict or readiness block fails the run; transient agent
//! failures are re-queued with backoff while attempts remain. Cancellation is
//! polled between stages. Every milestone is recorded as a supervisor event.

use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::agents::{AuditReport, BuildOutput, BuildRequest, PipelineAgents, Proposal};
use crate::core::classifier::{BackoffPolicy, FailureClass, RetryDecision, decide_retry};
use crate::core::events::{EventRecorder, SupervisorEvent, SupervisorEventKind, details};
use crate::core::governance::{
    GateDecision, GateReview, GateStage, InvariantViolation, ProtectedInvariant,
    detect_invariant_violations, evaluate_verdict,
};
use crate::core::policy::Policy;
use crate::core::readiness::{GovernanceSnapshot, fold_invariant_violations};
use crate::core::run::{BackgroundRun, RunOperation, TransitionError, transition};
use crate::core::trust_bundle::{
    ShipFile, TrustBundle, TrustBundleInput, append_trust_bundle_artifacts,
    create_ship_trust_bundle, sign_ship_trust_bundle,
};
use crate::io::verdict::parse_verdict;
use crate::io::workspace::ReviewWorkspace;

/// HMAC key used to seal trust bundles.
#[derive(Clone)]
pub struct SigningKey {
    pub key_id: String,
    pub secret: String,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &self.key_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Shared, read-only inputs for an attempt.
pub struct PipelineContext<'a> {
    pub policy: &'a Policy,
    pub backoff: BackoffPolicy,
    pub signing: SigningKey,
    /// Autofix rounds allowed after a failed audit.
    pub max_autofix_rounds: u32,
    /// The project as the reviewer may inspect it.
    pub workspace: &'a dyn ReviewWorkspace,
}

/// Why an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    AgentError,
    GateRejected,
    EscalationDenied,
    MalformedVerdict,
    GateProtocol,
    ReleaseBlocked,
    BundleError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: String,
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptResult {
    Shipped {
        files: Vec<ShipFile>,
        bundle: TrustBundle,
        warnings: Vec<String>,
    },
    Failed {
        failure: StageFailure,
        decision: RetryDecision,
    },
    Cancelled {
        stage: String,
    },
    /// The state machine refused to start the run.
    Refused {
        error: TransitionError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptOutcome {
    /// Record to persist after the attempt.
    pub record: BackgroundRun,
    pub events: Vec<SupervisorEvent>,
    pub result: AttemptResult,
}

struct Shipped {
    files: Vec<ShipFile>,
    bundle: TrustBundle,
    warnings: Vec<String>,
}

enum Halt {
    Failed(StageFailure),
    Cancelled(String),
}

struct GateOutcome {
    amendments: Vec<String>,
    invariants: Vec<ProtectedInvariant>,
}

/// Drive one attempt of `run` and return the record to persist.
///
/// Returns `Err` only for internal inconsistencies (a transition the state
/// machine refuses mid-attempt). Domain failures come back as
/// [`AttemptResult`].
#[instrument(skip_all, fields(run_id = %run.id, attempt = run.attempt_count + 1))]
pub fn run_attempt(
    run: &BackgroundRun,
    request: &BuildRequest,
    agents: &PipelineAgents<'_>,
    ctx: &PipelineContext<'_>,
) -> Result<AttemptOutcome> {
    let mut recorder = EventRecorder::new(run.id.clone());
    let now = agents.clock.now();
    let started = match transition(run, &RunOperation::Start, now) {
        Ok(mutation) => run.apply(&mutation),
        Err(error) => {
            warn!(code = %error.code, "run refused to start");
            return Ok(AttemptOutcome {
                record: run.clone(),
                events: Vec::new(),
                result: AttemptResult::Refused { error },
            });
        }
    };
    info!(attempt = started.attempt_count, "attempt started");
    recorder.record(
        SupervisorEventKind::RunStarted,
        "run",
        format!(
            "Attempt {}/{} started",
            started.attempt_count, started.max_attempts
        ),
        details([
            ("attempt", json!(started.attempt_count)),
            ("max_attempts", json!(started.max_attempts)),
        ]),
        now,
    );

    let halted = Attempt {
        run_id: &started.id,
        request,
        agents,
        ctx,
        recorder: &mut recorder,
    }
    .execute();

    let now = agents.clock.now();
    let (record, result) = match halted {
        Ok(shipped) => {
            let output = json!({
                "files": shipped.files.len(),
                "keyId": ctx.signing.key_id,
                "warnings": shipped.warnings,
            });
            let mutation = transition(
                &started,
                &RunOperation::Complete {
                    output: Some(output),
                },
                now,
            )?;
            recorder.record(
                SupervisorEventKind::RunCompleted,
                "run",
                "Run succeeded",
                details([
                    ("status", json!("succeeded")),
                    ("files", json!(shipped.files.len())),
                ]),
                now,
            );
            info!(files = shipped.files.len(), "attempt shipped");
            (
                started.apply(&mutation),
                AttemptResult::Shipped {
                    files: shipped.files,
                    bundle: shipped.bundle,
                    warnings: shipped.warnings,
                },
            )
        }
        Err(Halt::Cancelled(stage)) => {
            let mutation = transition(&started, &RunOperation::Cancel, now)?;
            recorder.record(
                SupervisorEventKind::RunCompleted,
                &stage,
                format!("Run cancelled before {stage}"),
                details([("status", json!("cancelled"))]),
                now,
            );
            info!(stage = %stage, "attempt cancelled");
            (started.apply(&mutation), AttemptResult::Cancelled { stage })
        }
        Err(Halt::Failed(failure)) => fail_attempt(&started, failure, ctx, &mut recorder, now)?,
    };

    Ok(AttemptOutcome {
        record,
        events: recorder.into_events(),
        result,
    })
}

fn fail_attempt(
    started: &BackgroundRun,
    failure: StageFailure,
    ctx: &PipelineContext<'_>,
    recorder: &mut EventRecorder,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<(BackgroundRun, AttemptResult)> {
    let mutation = transition(
        started,
        &RunOperation::Fail {
            error_message: failure.message.clone(),
        },
        now,
    )?;
    let failed = started.apply(&mutation);

    // Only agent errors can be infrastructure hiccups; governance outcomes are final.
    let decision = match failure.kind {
        FailureKind::AgentError => decide_retry(&failed, &failure.message, ctx.policy, &ctx.backoff),
        _ => RetryDecision::Surface {
            class: FailureClass::Permanent,
            reason: failure.message.clone(),
        },
    };

    let record = match &decision {
        RetryDecision::Retry {
            retry_after_seconds,
        } => {
            let mutation = transition(
                &failed,
                &RunOperation::Retry {
                    retry_after_seconds: *retry_after_seconds,
                },
                now,
            )?;
            recorder.record(
                SupervisorEventKind::FallbackInvoked,
                &failure.stage,
                format!("Transient failure, retrying in {retry_after_seconds}s"),
                details([
                    ("retry_after_seconds", json!(retry_after_seconds)),
                    ("error", json!(failure.message)),
                ]),
                now,
            );
            warn!(stage = %failure.stage, retry_after_seconds, error = %failure.message, "attempt failed, retry scheduled");
            failed.apply(&mutation)
        }
        RetryDecision::Surface { class, reason } => {
            recorder.record(
                SupervisorEventKind::RunCompleted,
                "run",
                format!("Run failed: {}", failure.message),
                details([
                    ("status", json!("failed")),
                    ("kind", json!(failure.kind)),
                    ("class", json!(class)),
                    ("reason", json!(reason)),
                ]),
                now,
            );
            warn!(stage = %failure.stage, kind = ?failure.kind, error = %failure.message, "attempt failed");
            failed
        }
    };
    Ok((record, AttemptResult::Failed { failure, decision }))
}

struct Attempt<'a> {
    run_id: &'a str,
    request: &'a BuildRequest,
    agents: &'a PipelineAgents<'a>,
    ctx: &'a PipelineContext<'a>,
    recorder: &'a mut EventRecorder,
}

impl Attempt<'_> {
    fn execute(&mut self) -> Result<Shipped, Halt> {
        self.checkpoint("plan")?;
        let plan = self.agent("plan", self.agents.planner.plan(self.request))?;
        self.record(
            SupervisorEventKind::IntentClassified,
            "plan",
            format!("Intent classified as {}", plan.intent),
            details([("intent", json!(plan.intent))]),
        );
        self.record(
            SupervisorEventKind::RouteSelected,
            "plan",
            format!("Route selected: {}", plan.route),
            details([("route", json!(plan.route))]),
        );
        let plan_gate = self.gate(GateStage::Plan, &plan)?;

        self.checkpoint("structure")?;
        let structure = self.agent(
            "structure",
            self.agents
                .architect
                .structure(self.request, &plan, &plan_gate.amendments),
        )?;
        let structure_gate = self.gate(GateStage::Structure, &structure)?;

        self.checkpoint("build")?;
        let mut amendments = plan_gate.amendments;
        amendments.extend(structure_gate.amendments);
        let output = self.agent(
            "build",
            self.agents
                .builder
                .build(self.request, &plan, &structure, &amendments),
        )?;

        self.checkpoint("audit")?;
        let (report, rescue_count, output) = self.audit(output)?;

        // Both gates may restate the same invariant; report it once.
        let mut invariants = plan_gate.invariants;
        for invariant in structure_gate.invariants {
            if !invariants.contains(&invariant) {
                invariants.push(invariant);
            }
        }
        let changed = output
            .files
            .iter()
            .map(|file| file.path.as_str())
            .collect::<Vec<_>>();
        let violations = detect_invariant_violations(&invariants, &changed);
        debug!(violations = violations.len(), "invariants checked");

        self.checkpoint("release")?;
        self.release(&report, rescue_count, output, &violations)
    }

    fn gate(&mut self, stage: GateStage, proposal: &Proposal) -> Result<GateOutcome, Halt> {
        let name = stage.as_str();
        let mut review = GateReview::new(stage);
        review
            .begin_review()
            .map_err(|err| self.gate_failed(name, FailureKind::GateProtocol, err.to_string()))?;
        self.record(
            SupervisorEventKind::GateStarted,
            name,
            format!("Reviewing {name}: {}", proposal.summary),
            details([("intent", json!(proposal.intent))]),
        );

        let reply = self.agent(
            name,
            self.agents
                .reviewer
                .review(stage, proposal, self.ctx.workspace),
        )?;
        let verdict = parse_verdict(&reply).map_err(|err| {
            self.gate_failed(
                name,
                FailureKind::MalformedVerdict,
                format!("malformed {name} verdict: {err:#}"),
            )
        })?;
        let decision = evaluate_verdict(&verdict, self.ctx.policy).map_err(|err| {
            self.gate_failed(name, FailureKind::MalformedVerdict, format!("{name} gate: {err}"))
        })?;
        review
            .conclude(&decision)
            .map_err(|err| self.gate_failed(name, FailureKind::GateProtocol, err.to_string()))?;

        match &decision {
            GateDecision::Rejected { reason } => {
                return Err(self.gate_failed(
                    name,
                    FailureKind::GateRejected,
                    format!("{name} rejected: {reason}"),
                ));
            }
            GateDecision::Escalate { reasons, .. } => {
                let approved = self.agent(name, self.agents.human.approve(stage, &decision))?;
                review.resolve_escalation(approved).map_err(|err| {
                    self.gate_failed(name, FailureKind::GateProtocol, err.to_string())
                })?;
                if !approved {
                    return Err(self.gate_failed(
                        name,
                        FailureKind::EscalationDenied,
                        format!("{name} escalation denied: {}", reasons.join("; ")),
                    ));
                }
            }
            GateDecision::Proceed | GateDecision::ProceedWithAmendments { .. } => {}
        }

        let amendments = decision.amendments().to_vec();
        self.record(
            SupervisorEventKind::GatePassed,
            name,
            format!("{name} gate passed ({})", review.state),
            details([
                ("state", json!(review.state)),
                ("escalated", json!(matches!(decision, GateDecision::Escalate { .. }))),
                ("amendments", json!(amendments)),
            ]),
        );
        Ok(GateOutcome {
            amendments,
            invariants: verdict.protected_invariants,
        })
    }

    fn audit(&mut self, mut output: BuildOutput) -> Result<(AuditReport, u32, BuildOutput), Halt> {
        let mut report = self.agent("audit", self.agents.auditor.audit(&output.files))?;
        let mut rescues = 0;
        while !report.passed && rescues < self.ctx.max_autofix_rounds {
            rescues += 1;
            self.checkpoint("autofix")?;
            self.record(
                SupervisorEventKind::AutofixStarted,
                "autofix",
                format!("Autofix round {rescues} started"),
                details([("findings", json!(report.findings))]),
            );
            match self.agents.builder.autofix(&output, &report.findings) {
                Ok(fixed) => output = fixed,
                Err(err) => {
                    self.record(
                        SupervisorEventKind::AutofixFailed,
                        "autofix",
                        format!("Autofix round {rescues} failed: {err:#}"),
                        details([("round", json!(rescues))]),
                    );
                    break;
                }
            }
            report = self.agent("audit", self.agents.auditor.audit(&output.files))?;
            let (kind, verb) = if report.passed {
                (SupervisorEventKind::AutofixSucceeded, "succeeded")
            } else {
                (SupervisorEventKind::AutofixFailed, "did not clear the audit")
            };
            self.record(
                kind,
                "autofix",
                format!("Autofix round {rescues} {verb}"),
                details([("round", json!(rescues))]),
            );
        }
        Ok((report, rescues, output))
    }

    fn release(
        &mut self,
        report: &AuditReport,
        rescue_count: u32,
        output: BuildOutput,
        violations: &[InvariantViolation],
    ) -> Result<Shipped, Halt> {
        self.record(
            SupervisorEventKind::GateStarted,
            "release",
            "Evaluating release readiness",
            details([("violations", json!(violations.len()))]),
        );
        let governance = GovernanceSnapshot {
            auditor_passed: report.passed,
            preview_verified: report.preview_verified,
            runtime_probe_passed: report.runtime_probe_passed,
            runtime_hash: report.runtime_hash.clone(),
            dependency_lock_hash: report.dependency_lock_hash.clone(),
            rescue_count,
            requires_human_review: report.requires_human_review,
        };
        let mut bundle = create_ship_trust_bundle(&TrustBundleInput {
            project_name: self.request.project_name.clone(),
            target: self.request.target.clone(),
            workflow_mode: self.request.workflow_mode.clone(),
            actor_user_id: self.request.actor_user_id.clone(),
            governance,
            files: output.files.clone(),
        });
        let (readiness, warnings) = fold_invariant_violations(bundle.readiness.clone(), violations);
        bundle.readiness = readiness;
        if !bundle.readiness.ready {
            return Err(self.gate_failed(
                "release",
                FailureKind::ReleaseBlocked,
                format!("release blocked: {}", bundle.readiness.blockers.join("; ")),
            ));
        }

        let ctx = self.ctx;
        let signing = &ctx.signing;
        let signed = sign_ship_trust_bundle(&bundle, &signing.secret, &signing.key_id)
            .and_then(|signed| {
                append_trust_bundle_artifacts(output.files, &signed).map(|files| (signed, files))
            });
        let (signed, files) = signed.map_err(|err| {
            self.gate_failed(
                "release",
                FailureKind::BundleError,
                format!("trust bundle {}: {err}", err.code()),
            )
        })?;

        self.record(
            SupervisorEventKind::GatePassed,
            "release",
            format!("Release bundle signed with key {}", signing.key_id),
            details([
                ("files", json!(signed.file_manifest.len())),
                ("warnings", json!(warnings)),
            ]),
        );
        Ok(Shipped {
            files,
            bundle: signed,
            warnings,
        })
    }

    fn checkpoint(&self, stage: &str) -> Result<(), Halt> {
        if self.agents.cancel.cancel_requested(self.run_id) {
            return Err(Halt::Cancelled(stage.to_string()));
        }
        Ok(())
    }

    fn agent<T>(&self, stage: &str, result: Result<T>) -> Result<T, Halt> {
        result.map_err(|err| {
            Halt::Failed(StageFailure {
                stage: stage.to_string(),
                kind: FailureKind::AgentError,
                message: format!("{err:#}"),
            })
        })
    }

    fn gate_failed(&mut self, stage: &str, kind: FailureKind, message: String) -> Halt {
        self.record(
            SupervisorEventKind::GateFailed,
            stage,
            message.clone(),
            details([("kind", json!(kind))]),
        );
        Halt::Failed(StageFailure {
            stage: stage.to_string(),
            kind,
            message,
        })
    }

    fn record(
        &mut self,
        event: SupervisorEventKind,
        stage: &str,
        summary: impl Into<String>,
        details: serde_json::Map<String, serde_json::Value>,
    ) {
        let now = self.agents.clock.now();
        self.recorder.record(event, stage, summary, details, now);
    }
}
