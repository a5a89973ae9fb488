//! Shipgate configuration stored in `shipgate.toml` at the project root.

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::core::classifier::BackoffPolicy;
use crate::core::policy::{Policy, PolicyTable};
use crate::core::run_request::RequestDefaults;

pub const CONFIG_FILE_NAME: &str = "shipgate.toml";

/// Shipgate configuration (TOML).
///
/// Edited by humans; every section is optional and missing fields fall back
/// to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShipgateConfig {
    /// `max_attempts` for runs created by this tool.
    pub max_attempts_default: u32,

    /// Delay used when a `retry` request omits `retryAfterSeconds`.
    pub retry_after_secs_default: u64,

    /// Where run records and event logs live, relative to the project root.
    pub artifact_dir: PathBuf,

    pub backoff: BackoffPolicy,
    pub signing: SigningConfig,
    pub workers: WorkerConfig,

    /// Replaces the built-in policy table when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyTable>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SigningConfig {
    pub key_id: String,
    /// Environment variable holding the HMAC secret. Secrets never live in the
    /// config file.
    pub secret_env: String,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            key_id: "local".to_string(),
            secret_env: "SHIPGATE_SIGNING_SECRET".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Tokens allowed to drive the run API. Empty denies every worker.
    pub tokens: Vec<String>,
}

impl Default for ShipgateConfig {
    fn default() -> Self {
        Self {
            max_attempts_default: 3,
            retry_after_secs_default: RequestDefaults::default().retry_after_seconds,
            artifact_dir: PathBuf::from(".shipgate").join("runs"),
            backoff: BackoffPolicy::default(),
            signing: SigningConfig::default(),
            workers: WorkerConfig::default(),
            policy: None,
        }
    }
}

impl ShipgateConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts_default == 0 {
            return Err(anyhow!("max_attempts_default must be > 0"));
        }
        if self.backoff.base_delay_secs == 0 {
            return Err(anyhow!("backoff.base_delay_secs must be > 0"));
        }
        if self.backoff.max_delay_secs < self.backoff.base_delay_secs {
            return Err(anyhow!(
                "backoff.max_delay_secs must be >= backoff.base_delay_secs"
            ));
        }
        if self.signing.key_id.trim().is_empty() {
            return Err(anyhow!("signing.key_id must not be empty"));
        }
        if self.signing.secret_env.trim().is_empty() {
            return Err(anyhow!("signing.secret_env must not be empty"));
        }
        if self.artifact_dir.as_os_str().is_empty() {
            return Err(anyhow!("artifact_dir must not be empty"));
        }
        self.policy().context("invalid [policy] table")?;
        Ok(())
    }

    /// Compile the configured policy table, or the built-in one.
    pub fn policy(&self) -> Result<Policy> {
        let table = self.policy.clone().unwrap_or_default();
        Ok(table.compile()?)
    }

    pub fn request_defaults(&self) -> RequestDefaults {
        RequestDefaults {
            retry_after_seconds: self.retry_after_secs_default,
        }
    }

    /// Read the signing secret from the configured environment variable.
    pub fn signing_secret(&self) -> Result<String> {
        let secret = env::var(&self.signing.secret_env)
            .with_context(|| format!("read signing secret from ${}", self.signing.secret_env))?;
        if secret.is_empty() {
            return Err(anyhow!("${} is empty", self.signing.secret_env));
        }
        Ok(secret)
    }

    pub fn artifact_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.artifact_dir)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ShipgateConfig::default()`.
pub fn load_config(path: &Path) -> Result<ShipgateConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let cfg = ShipgateConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ShipgateConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ShipgateConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` to a fresh temp file next to `path` and rename it into
/// place.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    tmp.write_all(contents.as_bytes())
        .with_context(|| format!("write temp file for {}", path.display()))?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
