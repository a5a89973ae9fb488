//! Governed build pipeline CLI.
//!
//! Drives background run records through the state machine, checks governance
//! verdicts and release readiness, and creates or verifies signed trust
//! bundles. Exit codes are listed in [`shipgate::exit_codes`].

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use shipgate::core::auth::authorize_worker;
use shipgate::core::classifier::classify_failure;
use shipgate::core::governance::{GateDecision, GateReview, GateStage, evaluate_verdict};
use shipgate::core::readiness::{GovernanceSnapshot, evaluate_release_readiness};
use shipgate::core::run::BackgroundRun;
use shipgate::core::run_request::{RunResponse, handle_run_request};
use shipgate::core::trust_bundle::{
    BundleError, TrustBundle, TrustBundleInput, append_trust_bundle_artifacts,
    create_ship_trust_bundle, ensure_shippable, sign_ship_trust_bundle,
};
use shipgate::exit_codes;
use shipgate::io::config::{CONFIG_FILE_NAME, ShipgateConfig, load_config, write_config};
use shipgate::io::event_log::format_event_log;
use shipgate::io::run_store::{compare_and_set, create_run, load_run, run_path};
use shipgate::io::verdict::load_verdict;
use shipgate::io::workspace::{collect_ship_files, write_ship_files};
use shipgate::logging;

#[derive(Parser)]
#[command(
    name = "shipgate",
    version,
    about = "Governed build pipeline: run records, verdicts and signed release bundles"
)]
struct Cli {
    /// Path to the config file.
    #[arg(long, global = true, default_value = CONFIG_FILE_NAME)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create or transition background run records.
    #[command(subcommand)]
    Run(RunCommand),
    /// Classify an error message as transient or permanent.
    Classify { message: String },
    /// Governance verdict checks.
    #[command(subcommand)]
    Verdict(VerdictCommand),
    /// Evaluate release readiness for a governance snapshot (JSON).
    Readiness { snapshot: PathBuf },
    /// Create or verify trust bundles.
    #[command(subcommand)]
    Bundle(BundleCommand),
    /// Supervisor event logs.
    #[command(subcommand)]
    Events(EventsCommand),
    /// Manage `shipgate.toml`.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum RunCommand {
    /// Create a queued run record at revision 1.
    Create {
        #[arg(long)]
        id: String,
        /// Record file. Defaults to `<artifact_dir>/<id>.json`.
        #[arg(long)]
        record: Option<PathBuf>,
        /// Defaults to `max_attempts_default` from config.
        #[arg(long)]
        max_attempts: Option<u32>,
        #[arg(long)]
        not_retryable: bool,
    },
    /// Apply an operation request (JSON) to a run record and print the response.
    Apply {
        record: PathBuf,
        request: PathBuf,
        /// Commit the mutation with a revision check.
        #[arg(long)]
        write: bool,
        /// Raw worker token.
        #[arg(long)]
        token: Option<String>,
        /// Full `Authorization` header value, e.g. `Bearer <token>`.
        #[arg(long)]
        authorization: Option<String>,
    },
}

#[derive(Subcommand)]
enum VerdictCommand {
    /// Parse a reviewer reply and print the gate decision.
    Check {
        file: PathBuf,
        #[arg(long, value_enum, default_value_t = StageArg::Plan)]
        stage: StageArg,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum StageArg {
    Plan,
    Structure,
}

impl From<StageArg> for GateStage {
    fn from(stage: StageArg) -> Self {
        match stage {
            StageArg::Plan => GateStage::Plan,
            StageArg::Structure => GateStage::Structure,
        }
    }
}

#[derive(Subcommand)]
enum BundleCommand {
    /// Sign a trust bundle for the files under `project_dir`.
    Create {
        project_dir: PathBuf,
        /// Bundle metadata and governance snapshot (JSON).
        #[arg(long)]
        input: PathBuf,
        /// Where to write the `.shipgate/` artifacts. Defaults to `project_dir`.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Verify signature, key and readiness of a trust bundle.
    Verify { bundle: PathBuf },
}

#[derive(Subcommand)]
enum EventsCommand {
    /// Render a `.events.jsonl` log as `[HH:MM:SS] summary` lines.
    Format { file: PathBuf },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write a default config file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = cli.config.as_path();
    match cli.command {
        Command::Config(ConfigCommand::Init { force }) => cmd_config_init(config, force),
        Command::Events(EventsCommand::Format { file }) => {
            print!("{}", format_event_log(&file)?);
            Ok(exit_codes::OK)
        }
        Command::Run(RunCommand::Create {
            id,
            record,
            max_attempts,
            not_retryable,
        }) => {
            let cfg = load_config(config)?;
            let record =
                record.unwrap_or_else(|| run_path(&cfg.artifact_dir(Path::new(".")), &id));
            let max_attempts = max_attempts.unwrap_or(cfg.max_attempts_default);
            cmd_run_create(&record, &id, max_attempts, !not_retryable)
        }
        Command::Run(RunCommand::Apply {
            record,
            request,
            write,
            token,
            authorization,
        }) => cmd_run_apply(
            &load_config(config)?,
            &record,
            &request,
            write,
            authorization.as_deref(),
            token.as_deref(),
        ),
        Command::Classify { message } => cmd_classify(&load_config(config)?, &message),
        Command::Verdict(VerdictCommand::Check { file, stage }) => {
            cmd_verdict_check(&load_config(config)?, &file, stage.into())
        }
        Command::Readiness { snapshot } => cmd_readiness(&snapshot),
        Command::Bundle(BundleCommand::Create {
            project_dir,
            input,
            out,
        }) => cmd_bundle_create(&load_config(config)?, &project_dir, &input, out.as_deref()),
        Command::Bundle(BundleCommand::Verify { bundle }) => {
            cmd_bundle_verify(&load_config(config)?, &bundle)
        }
    }
}

fn cmd_config_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &ShipgateConfig::default())?;
    info!(path = %path.display(), "config written");
    Ok(exit_codes::OK)
}

fn cmd_run_create(path: &Path, id: &str, max_attempts: u32, retryable: bool) -> Result<i32> {
    debug!(path = %path.display(), max_attempts, retryable, "creating run record");
    let stored = create_run(path, &BackgroundRun::queued(id, max_attempts, retryable))?;
    print_json(&stored)?;
    Ok(exit_codes::OK)
}

fn cmd_run_apply(
    cfg: &ShipgateConfig,
    record: &Path,
    request: &Path,
    write: bool,
    authorization: Option<&str>,
    token: Option<&str>,
) -> Result<i32> {
    // Unconfigured local use stays open; once tokens exist or one is presented,
    // the worker must authenticate.
    if !cfg.workers.tokens.is_empty() || authorization.is_some() || token.is_some() {
        if let Err(err) = authorize_worker(authorization, token, &cfg.workers.tokens) {
            print_json(&json!({"ok": false, "code": err.code(), "message": err.to_string()}))?;
            return Ok(exit_codes::INVALID);
        }
    }

    let stored = load_run(record)?;
    let payload: Value = read_json(request)?;
    let response = handle_run_request(
        &stored.record,
        &payload,
        Utc::now(),
        &cfg.request_defaults(),
    );
    print_json(&response)?;

    match &response {
        RunResponse::Applied { mutation, .. } => {
            if write {
                let next = stored.record.apply(mutation);
                let committed = compare_and_set(record, stored.revision, &next)?;
                info!(run_id = %next.id, revision = committed.revision, status = %next.status, "run record committed");
            }
            Ok(exit_codes::OK)
        }
        RunResponse::Rejected { code, .. } if code.is_policy_block() => Ok(exit_codes::BLOCKED),
        RunResponse::Rejected { .. } => Ok(exit_codes::INVALID),
    }
}

fn cmd_classify(cfg: &ShipgateConfig, message: &str) -> Result<i32> {
    let policy = cfg.policy()?;
    let class = classify_failure(message, &policy);
    print_json(&json!({"class": class, "policyVersion": policy.version()}))?;
    Ok(exit_codes::OK)
}

fn cmd_verdict_check(cfg: &ShipgateConfig, file: &Path, stage: GateStage) -> Result<i32> {
    let policy = cfg.policy()?;
    let verdict = match load_verdict(file) {
        Ok(verdict) => verdict,
        Err(err) => {
            eprintln!("{:#}", err);
            return Ok(exit_codes::INTEGRITY);
        }
    };
    let decision = match evaluate_verdict(&verdict, &policy) {
        Ok(decision) => decision,
        Err(err) => {
            eprintln!("{err}");
            return Ok(exit_codes::INTEGRITY);
        }
    };

    let mut review = GateReview::new(stage);
    review.begin_review()?;
    let state = review.conclude(&decision)?;
    print_json(&json!({"stage": stage, "state": state, "decision": decision}))?;
    Ok(match decision {
        GateDecision::Proceed | GateDecision::ProceedWithAmendments { .. } => exit_codes::OK,
        GateDecision::Rejected { .. } | GateDecision::Escalate { .. } => exit_codes::BLOCKED,
    })
}

fn cmd_readiness(snapshot: &Path) -> Result<i32> {
    let snapshot: GovernanceSnapshot = read_json(snapshot)?;
    let readiness = evaluate_release_readiness(&snapshot);
    print_json(&readiness)?;
    Ok(if readiness.ready {
        exit_codes::OK
    } else {
        exit_codes::BLOCKED
    })
}

fn cmd_bundle_create(
    cfg: &ShipgateConfig,
    project_dir: &Path,
    input: &Path,
    out: Option<&Path>,
) -> Result<i32> {
    let mut input: TrustBundleInput = read_json(input)?;
    input.files = collect_ship_files(project_dir)?;
    let bundle = create_ship_trust_bundle(&input);
    // Only a ready bundle is ever signed or written.
    if !bundle.readiness.ready {
        warn!(blockers = ?bundle.readiness.blockers, "trust bundle not ready; nothing written");
        print_json(&json!({
            "ok": false,
            "files": bundle.file_manifest.len(),
            "readiness": bundle.readiness,
        }))?;
        return Ok(exit_codes::BLOCKED);
    }

    let secret = cfg.signing_secret()?;
    let signed = sign_ship_trust_bundle(&bundle, &secret, &cfg.signing.key_id)
        .context("sign trust bundle")?;
    let artifacts =
        append_trust_bundle_artifacts(Vec::new(), &signed).context("render bundle artifacts")?;
    let out = out.unwrap_or(project_dir);
    write_ship_files(out, &artifacts)?;
    info!(files = signed.file_manifest.len(), out = %out.display(), "trust bundle written");

    print_json(&json!({
        "ok": true,
        "files": signed.file_manifest.len(),
        "keyId": cfg.signing.key_id,
        "readiness": signed.readiness,
    }))?;
    Ok(exit_codes::OK)
}

fn cmd_bundle_verify(cfg: &ShipgateConfig, path: &Path) -> Result<i32> {
    let bundle: TrustBundle = read_json(path)?;
    let secret = cfg.signing_secret()?;
    match ensure_shippable(&bundle, &secret, &cfg.signing.key_id) {
        Ok(()) => {
            print_json(&json!({"ok": true, "files": bundle.file_manifest.len()}))?;
            Ok(exit_codes::OK)
        }
        Err(err) => {
            print_json(&json!({"ok": false, "code": err.code(), "message": err.to_string()}))?;
            Ok(bundle_exit_code(&err))
        }
    }
}

fn bundle_exit_code(err: &BundleError) -> i32 {
    if err.is_integrity_failure() {
        exit_codes::INTEGRITY
    } else if matches!(err, BundleError::NotReady { .. }) {
        exit_codes::BLOCKED
    } else {
        exit_codes::INVALID
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config_init() {
        let cli = Cli::parse_from(["shipgate", "config", "init"]);
        assert!(matches!(
            cli.command,
            Command::Config(ConfigCommand::Init { force: false })
        ));
        assert_eq!(cli.config, PathBuf::from(CONFIG_FILE_NAME));
    }

    #[test]
    fn parse_run_apply_with_write_and_token() {
        let cli = Cli::parse_from([
            "shipgate",
            "run",
            "apply",
            "run.json",
            "req.json",
            "--write",
            "--token",
            "tok",
            "--config",
            "custom.toml",
        ]);
        assert_eq!(cli.config, PathBuf::from("custom.toml"));
        match cli.command {
            Command::Run(RunCommand::Apply {
                write,
                token,
                authorization,
                ..
            }) => {
                assert!(write);
                assert_eq!(token.as_deref(), Some("tok"));
                assert!(authorization.is_none());
            }
            _ => panic!("expected run apply"),
        }
    }

    #[test]
    fn parse_verdict_check_stage() {
        let cli = Cli::parse_from(["shipgate", "verdict", "check", "v.json", "--stage", "structure"]);
        match cli.command {
            Command::Verdict(VerdictCommand::Check { stage, .. }) => {
                assert_eq!(GateStage::from(stage), GateStage::Structure);
            }
            _ => panic!("expected verdict check"),
        }
    }

    #[test]
    fn bundle_errors_map_to_exit_codes() {
        assert_eq!(bundle_exit_code(&BundleError::Unsigned), exit_codes::INTEGRITY);
        assert_eq!(
            bundle_exit_code(&BundleError::NotReady {
                blockers: vec!["preview not verified".to_string()]
            }),
            exit_codes::BLOCKED
        );
        assert_eq!(bundle_exit_code(&BundleError::EmptySecret), exit_codes::INVALID);
    }
}
