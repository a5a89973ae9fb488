//! Versioned policy tables for failure classification and mandatory escalation.
//!
//! Policy is data: the transient-error substrings and the critical-path rules
//! live in a [`PolicyTable`] that can be serialized, overridden from config and
//! compiled once into a [`Policy`]. Transition and gate logic never embed these
//! literals directly.

use std::fmt;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version tag of the built-in policy table.
pub const BUILTIN_POLICY_VERSION: &str = "2025-02";

/// Substrings (lowercase) that mark an error message as a transient
/// infrastructure failure.
pub const BUILTIN_TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "rate limit",
    "too many requests",
    "500",
    "502",
    "503",
    "service unavailable",
    "model overloaded",
    "temporarily unavailable",
];

/// Critical-path categories whose touch forces human approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticalCategory {
    Authentication,
    Payments,
    UserDataDeletion,
    SchemaMigration,
    Security,
    ProductionDeployment,
}

impl CriticalCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            CriticalCategory::Authentication => "authentication",
            CriticalCategory::Payments => "payments",
            CriticalCategory::UserDataDeletion => "user_data_deletion",
            CriticalCategory::SchemaMigration => "schema_migration",
            CriticalCategory::Security => "security",
            CriticalCategory::ProductionDeployment => "production_deployment",
        }
    }
}

impl fmt::Display for CriticalCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One critical-path rule: a category plus the case-insensitive regexes that
/// identify it in a normalized path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticalPathRule {
    pub category: CriticalCategory,
    pub patterns: Vec<String>,
}

/// Serializable policy table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyTable {
    pub version: String,
    pub transient_error_patterns: Vec<String>,
    pub critical_paths: Vec<CriticalPathRule>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PolicyTable {
    /// The built-in table shipped with this crate.
    pub fn builtin() -> Self {
        Self {
            version: BUILTIN_POLICY_VERSION.to_string(),
            transient_error_patterns: BUILTIN_TRANSIENT_PATTERNS
                .iter()
                .map(|pattern| (*pattern).to_string())
                .collect(),
            critical_paths: builtin_critical_paths(),
        }
    }

    /// Compile regexes and lowercase substrings. Fails on an invalid regex or an
    /// empty table section.
    pub fn compile(&self) -> Result<Policy, PolicyError> {
        if self.transient_error_patterns.is_empty() {
            return Err(PolicyError::EmptySection("transient_error_patterns"));
        }
        if self.critical_paths.is_empty() {
            return Err(PolicyError::EmptySection("critical_paths"));
        }

        let transient = self
            .transient_error_patterns
            .iter()
            .map(|pattern| pattern.trim().to_lowercase())
            .filter(|pattern| !pattern.is_empty())
            .collect::<Vec<_>>();

        let mut critical = Vec::new();
        for rule in &self.critical_paths {
            for pattern in &rule.patterns {
                let regex = RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|source| PolicyError::InvalidPattern {
                        category: rule.category,
                        pattern: pattern.clone(),
                        source: Box::new(source),
                    })?;
                critical.push((rule.category, regex));
            }
        }

        Ok(Policy {
            version: self.version.clone(),
            transient,
            critical,
        })
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy section '{0}' must not be empty")]
    EmptySection(&'static str),
    #[error("invalid {category} pattern '{pattern}': {source}")]
    InvalidPattern {
        category: CriticalCategory,
        pattern: String,
        source: Box<regex::Error>,
    },
}

/// Compiled, immutable policy. Cheap to share across workers by reference.
#[derive(Debug, Clone)]
pub struct Policy {
    version: String,
    transient: Vec<String>,
    critical: Vec<(CriticalCategory, Regex)>,
}

impl Policy {
    pub fn builtin() -> Result<Self, PolicyError> {
        PolicyTable::builtin().compile()
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// True if the lowercased message contains any transient pattern.
    pub fn is_transient(&self, message: &str) -> bool {
        let lowered = message.to_lowercase();
        self.transient
            .iter()
            .any(|pattern| lowered.contains(pattern.as_str()))
    }

    /// Critical categories hit by a single normalized path, in table order,
    /// without duplicates.
    pub fn critical_categories_for(&self, path: &str) -> Vec<CriticalCategory> {
        let mut hits = Vec::new();
        for (category, regex) in &self.critical {
            if !hits.contains(category) && regex.is_match(path) {
                hits.push(*category);
            }
        }
        hits
    }
}

/// Matches the transient substrings of the built-in table without compiling
/// regexes.
pub fn builtin_is_transient(message: &str) -> bool {
    let lowered = message.to_lowercase();
    BUILTIN_TRANSIENT_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
}

fn builtin_critical_paths() -> Vec<CriticalPathRule> {
    let rule = |category, patterns: &[&str]| CriticalPathRule {
        category,
        patterns: patterns.iter().map(|p| (*p).to_string()).collect(),
    };
    vec![
        rule(
            CriticalCategory::Authentication,
            &[
                r"auth(n|z|entication|orization)?([/_.-]|$)",
                r"log-?in|log-?out|sign-?in|sign-?up",
                r"session",
                r"oauth|sso|saml",
                r"permission|rbac|acl(/|\.|$)|role",
                r"password|credential|jwt",
            ],
        ),
        rule(
            CriticalCategory::Payments,
            &[
                r"payment|billing|checkout|invoice",
                r"stripe|paypal|subscription|pricing|refund",
            ],
        ),
        rule(
            CriticalCategory::UserDataDeletion,
            &[
                r"delete-?(user|account)|(user|account)-?delet",
                r"gdpr|erasure|purge|data-?retention",
            ],
        ),
        rule(
            CriticalCategory::SchemaMigration,
            &[r"migration|migrate", r"schema\.(sql|prisma)$|\.sql$"],
        ),
        rule(
            CriticalCategory::Security,
            &[
                r"secur|secret|crypto|encrypt",
                r"csrf|cors|api-?key|private-?key",
                r"(^|/)\.env(\.|$)",
            ],
        ),
        rule(
            CriticalCategory::ProductionDeployment,
            &[
                r"deploy",
                r"\.github/workflows/",
                r"(^|/)dockerfile$|docker-compose",
                r"vercel\.json|netlify\.toml|fly\.toml",
                r"terraform|kubernetes|k8s|helm",
                r"production|(^|/|\.)prod(/|\.|$)",
            ],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> Policy {
        Policy::builtin().expect("builtin policy compiles")
    }

    #[test]
    fn builtin_table_compiles_with_version() {
        let policy = policy();
        assert_eq!(policy.version(), BUILTIN_POLICY_VERSION);
    }

    #[test]
    fn transient_matching_is_case_insensitive() {
        let policy = policy();
        assert!(policy.is_transient("Request TIMED OUT after 30s"));
        assert!(policy.is_transient("Rate Limit exceeded"));
        assert!(!policy.is_transient("invalid api key"));
    }

    #[test]
    fn critical_categories_cover_each_area() {
        let policy = policy();
        let cases = [
            ("src/auth/login.ts", CriticalCategory::Authentication),
            ("app/api/stripe/webhook.ts", CriticalCategory::Payments),
            ("src/jobs/delete-user.ts", CriticalCategory::UserDataDeletion),
            ("supabase/migrations/001_init.sql", CriticalCategory::SchemaMigration),
            (".env.local", CriticalCategory::Security),
            (".github/workflows/deploy.yml", CriticalCategory::ProductionDeployment),
        ];
        for (path, expected) in cases {
            let hits = policy.critical_categories_for(path);
            assert!(hits.contains(&expected), "{path} should hit {expected}, got {hits:?}");
        }
    }

    #[test]
    fn ordinary_paths_hit_no_category() {
        let policy = policy();
        for path in ["src/components/Button.tsx", "README.md", "src/lib/format.ts"] {
            assert!(policy.critical_categories_for(path).is_empty(), "{path}");
        }
    }

    #[test]
    fn auth_matches_whole_segments_only() {
        let policy = policy();
        for path in [
            "src/auth/session.ts",
            "src/lib/auth.ts",
            "app/api/authz/route.ts",
            "src/authentication/index.ts",
            "src/hooks/useAuth.tsx",
        ] {
            assert!(
                policy
                    .critical_categories_for(path)
                    .contains(&CriticalCategory::Authentication),
                "{path}"
            );
        }
        for path in [
            "src/components/AuthorCard.tsx",
            "content/authors/jane.md",
            "src/blog/author-bio.tsx",
        ] {
            assert!(policy.critical_categories_for(path).is_empty(), "{path}");
        }
    }

    #[test]
    fn compile_rejects_invalid_regex() {
        let mut table = PolicyTable::builtin();
        table.critical_paths[0].patterns.push("(unclosed".to_string());
        let err = table.compile().expect_err("invalid regex");
        assert!(err.to_string().contains("authentication"));
    }

    #[test]
    fn compile_rejects_empty_sections() {
        let mut table = PolicyTable::builtin();
        table.transient_error_patterns.clear();
        assert!(matches!(
            table.compile(),
            Err(PolicyError::EmptySection("transient_error_patterns"))
        ));
    }

    #[test]
    fn table_round_trips_through_toml() {
        let table = PolicyTable::builtin();
        let encoded = toml::to_string(&table).expect("encode");
        let decoded: PolicyTable = toml::from_str(&encoded).expect("decode");
        assert_eq!(decoded, table);
    }
}
