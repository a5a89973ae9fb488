//! Release trust bundle: file manifest, readiness and keyed signature.
//!
//! The bundle is assembled by [`create_ship_trust_bundle`] and sealed by
//! [`sign_ship_trust_bundle`] as two explicit steps. Signing does not enforce
//! readiness; [`ensure_shippable`] is the check callers run before shipping.
//!
//! The signature is HMAC-SHA256 (lowercase hex) over [`canonical_json`]: the
//! bundle without its `signature` field, object keys sorted recursively and no
//! insignificant whitespace.

use hmac::{Hmac, Mac};
use minijinja::{Environment, context};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::path::normalize_ship_path;
use crate::core::readiness::{GovernanceSnapshot, Readiness, evaluate_release_readiness};

type HmacSha256 = Hmac<Sha256>;

/// Format version carried in every bundle and covered by the signature.
pub const BUNDLE_VERSION: u32 = 1;

pub const TRUST_BUNDLE_PATH: &str = ".shipgate/trust-bundle.json";
pub const FILE_MANIFEST_PATH: &str = ".shipgate/file-manifest.json";
pub const RELEASE_CHECKLIST_PATH: &str = ".shipgate/RELEASE_CHECKLIST.md";

const RELEASE_CHECKLIST_TEMPLATE: &str = include_str!("../templates/release_checklist.md");

/// A file produced by the pipeline and about to ship. Content is raw bytes so
/// binary assets (images, fonts, wasm) are hashed like any other file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipFile {
    pub path: String,
    pub content: Vec<u8>,
}

impl ShipFile {
    pub fn new(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileManifestEntry {
    pub path: String,
    pub content_hash: String,
}

/// Everything needed to assemble a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustBundleInput {
    pub project_name: String,
    pub target: String,
    pub workflow_mode: String,
    pub actor_user_id: String,
    pub governance: GovernanceSnapshot,
    #[serde(default)]
    pub files: Vec<ShipFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleSignature {
    pub key_id: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustBundle {
    pub bundle_version: u32,
    pub project_name: String,
    pub target: String,
    pub workflow_mode: String,
    pub actor_user_id: String,
    pub governance: GovernanceSnapshot,
    pub file_manifest: Vec<FileManifestEntry>,
    pub readiness: Readiness,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<BundleSignature>,
}

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("signing secret must not be empty")]
    EmptySecret,
    #[error("signing key id must not be empty")]
    EmptyKeyId,
    #[error("trust bundle is not signed")]
    Unsigned,
    #[error("trust bundle signature does not match its contents")]
    SignatureMismatch,
    #[error("trust bundle signed with key '{actual}', expected '{expected}'")]
    KeyMismatch { expected: String, actual: String },
    #[error("unsupported bundle version {0}")]
    UnsupportedVersion(u32),
    #[error("trust bundle is not ready to ship: {}", .blockers.join("; "))]
    NotReady { blockers: Vec<String> },
    #[error("failed to serialize trust bundle: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to render release checklist: {0}")]
    Render(#[from] minijinja::Error),
}

impl BundleError {
    /// Stable snake_case code for wire and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            BundleError::EmptySecret => "empty_secret",
            BundleError::EmptyKeyId => "empty_key_id",
            BundleError::Unsigned => "unsigned",
            BundleError::SignatureMismatch => "signature_mismatch",
            BundleError::KeyMismatch { .. } => "key_mismatch",
            BundleError::UnsupportedVersion(_) => "unsupported_version",
            BundleError::NotReady { .. } => "not_ready",
            BundleError::Serialize(_) => "serialize_failed",
            BundleError::Render(_) => "render_failed",
        }
    }

    /// Integrity failures mean the bundle cannot be trusted at all, as opposed
    /// to a trustworthy bundle that is not ready.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            BundleError::Unsigned
                | BundleError::SignatureMismatch
                | BundleError::KeyMismatch { .. }
                | BundleError::UnsupportedVersion(_)
        )
    }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Manifest sorted by normalized path. A later file with the same normalized
/// path replaces an earlier one.
pub fn build_file_manifest(files: &[ShipFile]) -> Vec<FileManifestEntry> {
    let mut manifest: Vec<FileManifestEntry> = Vec::with_capacity(files.len());
    for file in files {
        let path = normalize_ship_path(&file.path);
        let entry = FileManifestEntry {
            content_hash: content_hash(&file.content),
            path,
        };
        match manifest.iter_mut().find(|existing| existing.path == entry.path) {
            Some(existing) => *existing = entry,
            None => manifest.push(entry),
        }
    }
    manifest.sort_by(|a, b| a.path.cmp(&b.path));
    manifest
}

/// Assemble an unsigned bundle.
pub fn create_ship_trust_bundle(input: &TrustBundleInput) -> TrustBundle {
    TrustBundle {
        bundle_version: BUNDLE_VERSION,
        project_name: input.project_name.clone(),
        target: input.target.clone(),
        workflow_mode: input.workflow_mode.clone(),
        actor_user_id: input.actor_user_id.clone(),
        governance: input.governance.clone(),
        file_manifest: build_file_manifest(&input.files),
        readiness: evaluate_release_readiness(&input.governance),
        signature: None,
    }
}

/// Canonical signing bytes: `signature` removed, keys sorted, compact.
pub fn canonical_json(bundle: &TrustBundle) -> Result<String, BundleError> {
    let mut value = serde_json::to_value(bundle)?;
    if let Value::Object(map) = &mut value {
        map.remove("signature");
    }
    let mut out = String::new();
    write_canonical(&value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) -> Result<(), BundleError> {
    match value {
        Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();
            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                if let Some(inner) = map.get(key) {
                    write_canonical(inner, out)?;
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

fn keyed_mac(secret: &str, payload: &str) -> Result<HmacSha256, BundleError> {
    if secret.is_empty() {
        return Err(BundleError::EmptySecret);
    }
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| BundleError::EmptySecret)?;
    mac.update(payload.as_bytes());
    Ok(mac)
}

/// Return a copy of `bundle` carrying `{keyId, signature}`. Any earlier
/// signature is replaced.
pub fn sign_ship_trust_bundle(
    bundle: &TrustBundle,
    secret: &str,
    key_id: &str,
) -> Result<TrustBundle, BundleError> {
    if key_id.trim().is_empty() {
        return Err(BundleError::EmptyKeyId);
    }
    let payload = canonical_json(bundle)?;
    let mac = keyed_mac(secret, &payload)?;
    let mut signed = bundle.clone();
    signed.signature = Some(BundleSignature {
        key_id: key_id.to_string(),
        signature: hex::encode(mac.finalize().into_bytes()),
    });
    Ok(signed)
}

/// Recompute the signature and compare in constant time.
pub fn verify_ship_trust_bundle(bundle: &TrustBundle, secret: &str) -> Result<(), BundleError> {
    if bundle.bundle_version != BUNDLE_VERSION {
        return Err(BundleError::UnsupportedVersion(bundle.bundle_version));
    }
    let Some(signature) = &bundle.signature else {
        return Err(BundleError::Unsigned);
    };
    let expected = hex::decode(&signature.signature).map_err(|_| BundleError::SignatureMismatch)?;
    let payload = canonical_json(bundle)?;
    keyed_mac(secret, &payload)?
        .verify_slice(&expected)
        .map_err(|_| BundleError::SignatureMismatch)
}

/// Gate for production shipping: valid signature, expected key, ready.
pub fn ensure_shippable(
    bundle: &TrustBundle,
    secret: &str,
    key_id: &str,
) -> Result<(), BundleError> {
    verify_ship_trust_bundle(bundle, secret)?;
    let signed_with = bundle
        .signature
        .as_ref()
        .map(|signature| signature.key_id.as_str())
        .unwrap_or_default();
    if signed_with != key_id {
        return Err(BundleError::KeyMismatch {
            expected: key_id.to_string(),
            actual: signed_with.to_string(),
        });
    }
    if !bundle.readiness.ready {
        return Err(BundleError::NotReady {
            blockers: bundle.readiness.blockers.clone(),
        });
    }
    Ok(())
}

/// Render the human-readable checklist for a signed bundle.
pub fn render_release_checklist(bundle: &TrustBundle) -> Result<String, BundleError> {
    let key_id = bundle
        .signature
        .as_ref()
        .map(|signature| signature.key_id.as_str())
        .ok_or(BundleError::Unsigned)?;
    let rendered = Environment::new().render_str(
        RELEASE_CHECKLIST_TEMPLATE,
        context! {
            project_name => &bundle.project_name,
            target => &bundle.target,
            workflow_mode => &bundle.workflow_mode,
            actor_user_id => &bundle.actor_user_id,
            bundle_version => bundle.bundle_version,
            key_id => key_id,
            governance => &bundle.governance,
            ready => bundle.readiness.ready,
            blockers => &bundle.readiness.blockers,
            manifest => &bundle.file_manifest,
        },
    )?;
    Ok(rendered)
}

/// Append the trust-bundle JSON, the manifest JSON and the checklist to
/// `files`. Earlier copies at the artifact paths are dropped first.
pub fn append_trust_bundle_artifacts(
    files: Vec<ShipFile>,
    signed: &TrustBundle,
) -> Result<Vec<ShipFile>, BundleError> {
    if signed.signature.is_none() {
        return Err(BundleError::Unsigned);
    }
    let bundle_json = serde_json::to_string_pretty(signed)?;
    let manifest_json = serde_json::to_string_pretty(&signed.file_manifest)?;
    let checklist = render_release_checklist(signed)?;

    let artifact_paths = [TRUST_BUNDLE_PATH, FILE_MANIFEST_PATH, RELEASE_CHECKLIST_PATH];
    let mut out = files
        .into_iter()
        .filter(|file| !artifact_paths.contains(&normalize_ship_path(&file.path).as_str()))
        .collect::<Vec<_>>();
    out.push(ShipFile::new(TRUST_BUNDLE_PATH, bundle_json + "\n"));
    out.push(ShipFile::new(FILE_MANIFEST_PATH, manifest_json + "\n"));
    out.push(ShipFile::new(RELEASE_CHECKLIST_PATH, checklist + "\n"));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{bundle_input, passing_snapshot};

    const SECRET: &str = "test-secret";
    const KEY_ID: &str = "ci-2024";

    fn signed() -> TrustBundle {
        let bundle = create_ship_trust_bundle(&bundle_input(passing_snapshot()));
        sign_ship_trust_bundle(&bundle, SECRET, KEY_ID).expect("sign")
    }

    #[test]
    fn content_hash_is_lowercase_hex_sha256() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn manifest_hashes_binary_content() {
        const LOGO: [u8; 7] = [0x89, 0x50, 0x4e, 0x47, 0xff, 0xfe, 0x00];
        let logo = ShipFile::new("public/logo.png", LOGO.to_vec());
        assert!(std::str::from_utf8(&logo.content).is_err());
        let manifest = build_file_manifest(std::slice::from_ref(&logo));
        assert_eq!(
            manifest,
            vec![FileManifestEntry {
                path: "public/logo.png".to_string(),
                content_hash: content_hash(&LOGO),
            }]
        );
    }

    #[test]
    fn manifest_is_sorted_normalized_and_last_write_wins() {
        let files = vec![
            ShipFile::new("src\\b.ts", "b"),
            ShipFile::new("/src/a.ts", "first"),
            ShipFile::new("src//a.ts", "second"),
        ];
        let manifest = build_file_manifest(&files);
        assert_eq!(
            manifest,
            vec![
                FileManifestEntry {
                    path: "src/a.ts".to_string(),
                    content_hash: content_hash(b"second"),
                },
                FileManifestEntry {
                    path: "src/b.ts".to_string(),
                    content_hash: content_hash(b"b"),
                },
            ]
        );
    }

    #[test]
    fn created_bundle_is_unsigned_and_carries_readiness() {
        let mut snapshot = passing_snapshot();
        snapshot.preview_verified = false;
        let bundle = create_ship_trust_bundle(&bundle_input(snapshot));
        assert_eq!(bundle.bundle_version, BUNDLE_VERSION);
        assert!(bundle.signature.is_none());
        assert!(!bundle.readiness.ready);
    }

    #[test]
    fn canonical_json_sorts_keys_and_drops_signature() {
        let bundle = signed();
        let canonical = canonical_json(&bundle).expect("canonical");
        assert!(!canonical.contains("signature"));
        assert!(canonical.starts_with("{\"actorUserId\":"));
        let actor = canonical.find("\"actorUserId\"").expect("actor");
        let version = canonical.find("\"bundleVersion\"").expect("version");
        let workflow = canonical.find("\"workflowMode\"").expect("workflow");
        assert!(actor < version && version < workflow);
    }

    #[test]
    fn signing_is_deterministic() {
        let a = signed();
        let b = signed();
        assert_eq!(a.signature, b.signature);
        let signature = a.signature.expect("signed");
        assert_eq!(signature.key_id, KEY_ID);
        assert_eq!(signature.signature.len(), 64);
        assert!(signature.signature.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    /// Any single-field change produces a different signature.
    #[test]
    fn every_field_change_changes_signature() {
        let base = create_ship_trust_bundle(&bundle_input(passing_snapshot()));
        let original = sign_ship_trust_bundle(&base, SECRET, KEY_ID)
            .expect("sign")
            .signature
            .expect("signature");

        let mutations: [fn(&mut TrustBundle); 9] = [
            |b: &mut TrustBundle| b.bundle_version += 1,
            |b: &mut TrustBundle| b.project_name.push('x'),
            |b: &mut TrustBundle| b.target.push('x'),
            |b: &mut TrustBundle| b.workflow_mode.push('x'),
            |b: &mut TrustBundle| b.actor_user_id.push('x'),
            |b: &mut TrustBundle| b.governance.rescue_count += 1,
            |b: &mut TrustBundle| b.governance.runtime_hash = Some("other".to_string()),
            |b: &mut TrustBundle| b.file_manifest[0].content_hash.push('0'),
            |b: &mut TrustBundle| b.readiness.blockers.push("late blocker".to_string()),
        ];
        for (index, mutate) in mutations.iter().enumerate() {
            let mut changed = base.clone();
            mutate(&mut changed);
            let signature = sign_ship_trust_bundle(&changed, SECRET, KEY_ID)
                .expect("sign")
                .signature
                .expect("signature");
            assert_ne!(signature.signature, original.signature, "mutation {index}");
        }
    }

    #[test]
    fn signing_rejects_empty_secret_and_key_id() {
        let bundle = create_ship_trust_bundle(&bundle_input(passing_snapshot()));
        assert!(matches!(
            sign_ship_trust_bundle(&bundle, "", KEY_ID),
            Err(BundleError::EmptySecret)
        ));
        assert!(matches!(
            sign_ship_trust_bundle(&bundle, SECRET, " "),
            Err(BundleError::EmptyKeyId)
        ));
    }

    #[test]
    fn verify_accepts_untouched_and_rejects_tampered_bundle() {
        let bundle = signed();
        verify_ship_trust_bundle(&bundle, SECRET).expect("valid");

        let mut tampered = bundle.clone();
        tampered.readiness.ready = false;
        let err = verify_ship_trust_bundle(&tampered, SECRET).expect_err("tampered");
        assert_eq!(err.code(), "signature_mismatch");
        assert!(err.is_integrity_failure());

        let err = verify_ship_trust_bundle(&bundle, "other-secret").expect_err("wrong secret");
        assert!(matches!(err, BundleError::SignatureMismatch));

        let mut unsigned = bundle;
        unsigned.signature = None;
        assert!(matches!(
            verify_ship_trust_bundle(&unsigned, SECRET),
            Err(BundleError::Unsigned)
        ));
    }

    #[test]
    fn verify_treats_garbage_signature_as_mismatch() {
        let mut bundle = signed();
        if let Some(signature) = &mut bundle.signature {
            signature.signature = "not-hex".to_string();
        }
        assert!(matches!(
            verify_ship_trust_bundle(&bundle, SECRET),
            Err(BundleError::SignatureMismatch)
        ));
    }

    #[test]
    fn ensure_shippable_checks_key_and_readiness() {
        let bundle = signed();
        ensure_shippable(&bundle, SECRET, KEY_ID).expect("shippable");

        let err = ensure_shippable(&bundle, SECRET, "other-key").expect_err("wrong key");
        assert_eq!(err.code(), "key_mismatch");

        let mut snapshot = passing_snapshot();
        snapshot.auditor_passed = false;
        let blocked = create_ship_trust_bundle(&bundle_input(snapshot));
        let blocked = sign_ship_trust_bundle(&blocked, SECRET, KEY_ID).expect("sign");
        let err = ensure_shippable(&blocked, SECRET, KEY_ID).expect_err("not ready");
        assert_eq!(err.code(), "not_ready");
        assert!(!err.is_integrity_failure());
    }

    #[test]
    fn artifacts_are_appended_once() {
        let bundle = signed();
        let files = vec![ShipFile::new("src/index.ts", "export {}")];
        let first = append_trust_bundle_artifacts(files, &bundle).expect("append");
        assert_eq!(first.len(), 4);
        let paths = first.iter().map(|f| f.path.as_str()).collect::<Vec<_>>();
        assert_eq!(
            paths,
            vec![
                "src/index.ts",
                TRUST_BUNDLE_PATH,
                FILE_MANIFEST_PATH,
                RELEASE_CHECKLIST_PATH
            ]
        );

        let second = append_trust_bundle_artifacts(first, &bundle).expect("append again");
        assert_eq!(second.len(), 4);

        let embedded: TrustBundle =
            serde_json::from_slice(&second[1].content).expect("bundle json");
        assert_eq!(embedded, bundle);
        verify_ship_trust_bundle(&embedded, SECRET).expect("embedded bundle verifies");
    }

    #[test]
    fn append_requires_signed_bundle() {
        let bundle = create_ship_trust_bundle(&bundle_input(passing_snapshot()));
        assert!(matches!(
            append_trust_bundle_artifacts(Vec::new(), &bundle),
            Err(BundleError::Unsigned)
        ));
    }

    #[test]
    fn checklist_lists_blockers_and_files() {
        let mut snapshot = passing_snapshot();
        snapshot.runtime_probe_passed = false;
        let bundle = create_ship_trust_bundle(&bundle_input(snapshot));
        let bundle = sign_ship_trust_bundle(&bundle, SECRET, KEY_ID).expect("sign");
        let checklist = render_release_checklist(&bundle).expect("render");
        assert!(checklist.contains("# Release checklist: demo-app"));
        assert!(checklist.contains("[ ] Runtime probe passed"));
        assert!(checklist.contains("[x] Auditor passed"));
        assert!(checklist.contains("NOT ready to ship"));
        assert!(checklist.contains("- runtime probe did not pass"));
        assert!(checklist.contains("`src/app/page.tsx` sha256:"));
        assert!(checklist.contains(KEY_ID));
    }
}
