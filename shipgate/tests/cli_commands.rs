//! CLI tests for `shipgate`.
//!
//! Spawns the binary and verifies exit codes and persisted artifacts for run
//! records and trust bundles.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::{Value, json};

use shipgate::core::run::RunStatus;
use shipgate::core::trust_bundle::{RELEASE_CHECKLIST_PATH, TRUST_BUNDLE_PATH};
use shipgate::exit_codes;
use shipgate::io::run_store::load_run;
use shipgate::test_support::{TestProject, bundle_input, passing_snapshot};

const SECRET_ENV: &str = "SHIPGATE_SIGNING_SECRET";

fn shipgate(config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_shipgate"))
        .args(args)
        .arg("--config")
        .arg(config)
        .env(SECRET_ENV, "cli-secret")
        .env_remove("RUST_LOG")
        .output()
        .expect("run shipgate")
}

fn write_json(path: &Path, value: &Value) {
    fs::write(path, serde_json::to_string_pretty(value).expect("json")).expect("write json");
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("utf-8 path")
}

#[test]
fn run_apply_walks_the_state_machine() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = temp.path().join("shipgate.toml");
    let record = temp.path().join("runs/run-1.json");
    let request = temp.path().join("request.json");

    let out = shipgate(
        &config,
        &["run", "create", "--id", "run-1", "--record", path_str(&record), "--max-attempts", "1"],
    );
    assert_eq!(out.status.code(), Some(exit_codes::OK));

    let apply = |body: Value| {
        write_json(&request, &body);
        shipgate(
            &config,
            &["run", "apply", path_str(&record), path_str(&request), "--write"],
        )
    };

    assert_eq!(apply(json!({"operation": "start"})).status.code(), Some(exit_codes::OK));
    let out = apply(json!({"status": "failed", "errorMessage": "HTTP 503"}));
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let response: Value = serde_json::from_slice(&out.stdout).expect("response json");
    assert_eq!(response["operation"], json!("fail"));

    let stored = load_run(&record).expect("load run");
    assert_eq!(stored.revision, 3);
    assert_eq!(stored.record.status, RunStatus::Failed);
    assert_eq!(stored.record.error_message.as_deref(), Some("HTTP 503"));

    // Invalid transition: nothing is written.
    let out = apply(json!({"operation": "complete"}));
    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
    let response: Value = serde_json::from_slice(&out.stdout).expect("response json");
    assert_eq!(response["code"], json!("invalid_transition"));
    assert_eq!(load_run(&record).expect("reload").revision, 3);

    // Re-queued but out of attempts: starting is a policy block.
    assert_eq!(apply(json!({"operation": "retry"})).status.code(), Some(exit_codes::OK));
    let out = apply(json!({"operation": "start"}));
    assert_eq!(out.status.code(), Some(exit_codes::BLOCKED));
}

#[test]
fn run_apply_requires_configured_worker_token() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = temp.path().join("shipgate.toml");
    fs::write(&config, "[workers]\ntokens = [\"tok-1\"]\n").expect("write config");
    let record = temp.path().join("run-1.json");
    let request = temp.path().join("request.json");
    write_json(&request, &json!({"operation": "start"}));

    let out = shipgate(&config, &["run", "create", "--id", "run-1", "--record", path_str(&record)]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));

    let apply = ["run", "apply", path_str(&record), path_str(&request)];
    let out = shipgate(&config, &apply);
    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
    let response: Value = serde_json::from_slice(&out.stdout).expect("response json");
    assert_eq!(response["code"], json!("missing_token"));

    let mut with_token = apply.to_vec();
    with_token.extend(["--authorization", "Bearer tok-1"]);
    assert_eq!(shipgate(&config, &with_token).status.code(), Some(exit_codes::OK));
}

#[test]
fn bundle_create_then_verify_detects_tampering() {
    let project = TestProject::new().expect("project");
    let temp = tempfile::tempdir().expect("tempdir");
    let config = temp.path().join("shipgate.toml");
    let input = temp.path().join("input.json");
    write_json(
        &input,
        &serde_json::to_value(bundle_input(passing_snapshot())).expect("input json"),
    );

    let out = shipgate(
        &config,
        &["bundle", "create", path_str(project.root()), "--input", path_str(&input)],
    );
    assert_eq!(
        out.status.code(),
        Some(exit_codes::OK),
        "{}",
        String::from_utf8_lossy(&out.stderr)
    );
    let bundle_path = project.root().join(TRUST_BUNDLE_PATH);
    assert!(project.root().join(RELEASE_CHECKLIST_PATH).exists());

    let verify = ["bundle", "verify", path_str(&bundle_path)];
    assert_eq!(shipgate(&config, &verify).status.code(), Some(exit_codes::OK));

    let mut bundle: Value =
        serde_json::from_str(&fs::read_to_string(&bundle_path).expect("read bundle"))
            .expect("bundle json");
    bundle["projectName"] = json!("someone-else");
    write_json(&bundle_path, &bundle);
    let out = shipgate(&config, &verify);
    assert_eq!(out.status.code(), Some(exit_codes::INTEGRITY));
    let response: Value = serde_json::from_slice(&out.stdout).expect("response json");
    assert_eq!(response["code"], json!("signature_mismatch"));
}

#[test]
fn unready_bundle_is_neither_signed_nor_written() {
    let project = TestProject::new().expect("project");
    let temp = tempfile::tempdir().expect("tempdir");
    let config = temp.path().join("shipgate.toml");
    let input = temp.path().join("input.json");
    let mut snapshot = passing_snapshot();
    snapshot.preview_verified = false;
    write_json(
        &input,
        &serde_json::to_value(bundle_input(snapshot)).expect("input json"),
    );

    let out = shipgate(
        &config,
        &["bundle", "create", path_str(project.root()), "--input", path_str(&input)],
    );
    assert_eq!(out.status.code(), Some(exit_codes::BLOCKED));
    let response: Value = serde_json::from_slice(&out.stdout).expect("response json");
    assert_eq!(response["ok"], json!(false));
    assert!(response.get("keyId").is_none());
    let blockers = response["readiness"]["blockers"].to_string();
    assert!(blockers.contains("preview not verified"), "{blockers}");

    assert!(!project.root().join(TRUST_BUNDLE_PATH).exists());
    assert!(!project.root().join(RELEASE_CHECKLIST_PATH).exists());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(!stdout.contains("signature"), "{stdout}");
}

#[test]
fn bundle_create_manifests_binary_assets() {
    let project = TestProject::new().expect("project");
    project
        .write("public/logo.png", b"\x89PNG\xff\xfe\x00")
        .expect("write logo");
    let temp = tempfile::tempdir().expect("tempdir");
    let config = temp.path().join("shipgate.toml");
    let input = temp.path().join("input.json");
    write_json(
        &input,
        &serde_json::to_value(bundle_input(passing_snapshot())).expect("input json"),
    );

    let out = shipgate(
        &config,
        &["bundle", "create", path_str(project.root()), "--input", path_str(&input)],
    );
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let bundle_path = project.root().join(TRUST_BUNDLE_PATH);
    let bundle: Value =
        serde_json::from_slice(&fs::read(&bundle_path).expect("read bundle")).expect("bundle json");
    let manifest = bundle["fileManifest"].as_array().expect("manifest");
    assert!(
        manifest
            .iter()
            .any(|entry| entry["path"] == json!("public/logo.png")),
        "{manifest:?}"
    );
    let verify = ["bundle", "verify", path_str(&bundle_path)];
    assert_eq!(shipgate(&config, &verify).status.code(), Some(exit_codes::OK));
}

#[test]
fn verdict_check_exit_codes_follow_the_decision() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = temp.path().join("shipgate.toml");
    let verdict = temp.path().join("verdict.json");

    let approved = json!({
        "verdict": "approved",
        "confidence": "high",
        "scope": {"intent": "add footer", "affected_areas": ["src/components/Footer.tsx"]},
        "protected_invariants": []
    });
    write_json(&verdict, &approved);
    let check = ["verdict", "check", path_str(&verdict), "--stage", "structure"];
    let out = shipgate(&config, &check);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let response: Value = serde_json::from_slice(&out.stdout).expect("response json");
    assert_eq!(response["state"], json!("approved"));
    assert_eq!(response["stage"], json!("structure"));

    let mut critical = approved.clone();
    critical["scope"]["affected_areas"] = json!(["src/lib/stripe.ts"]);
    write_json(&verdict, &critical);
    assert_eq!(shipgate(&config, &check).status.code(), Some(exit_codes::BLOCKED));

    fs::write(&verdict, "Looks fine to me.").expect("write prose");
    assert_eq!(shipgate(&config, &check).status.code(), Some(exit_codes::INTEGRITY));
}

#[test]
fn config_init_refuses_to_overwrite() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = temp.path().join("shipgate.toml");
    assert_eq!(shipgate(&config, &["config", "init"]).status.code(), Some(exit_codes::OK));
    assert!(config.exists());
    assert_eq!(
        shipgate(&config, &["config", "init"]).status.code(),
        Some(exit_codes::INVALID)
    );
    assert_eq!(
        shipgate(&config, &["config", "init", "--force"]).status.code(),
        Some(exit_codes::OK)
    );
}
