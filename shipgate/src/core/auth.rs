//! Worker authorization for the background run API.

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("no worker tokens are configured")]
    NoTokensConfigured,
    #[error("request carries no worker token")]
    MissingToken,
    #[error("authorization header must use the Bearer scheme")]
    MalformedAuthorization,
    #[error("worker token is not recognized")]
    UnknownToken,
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::NoTokensConfigured => "no_tokens_configured",
            AuthError::MissingToken => "missing_token",
            AuthError::MalformedAuthorization => "malformed_authorization",
            AuthError::UnknownToken => "unknown_token",
        }
    }
}

/// Accept `Authorization: Bearer <token>` or a raw worker-token header. The
/// authorization header wins when both are present. An empty allowlist denies.
pub fn authorize_worker(
    authorization_header: Option<&str>,
    token_header: Option<&str>,
    allowlist: &[String],
) -> Result<(), AuthError> {
    if allowlist.iter().all(|token| token.is_empty()) {
        return Err(AuthError::NoTokensConfigured);
    }

    let presented = match (non_empty(authorization_header), non_empty(token_header)) {
        (Some(header), _) => bearer_token(header).ok_or(AuthError::MalformedAuthorization)?,
        (None, Some(raw)) => raw,
        (None, None) => return Err(AuthError::MissingToken),
    };

    // Every entry is compared so timing does not reveal which one matched.
    let matched = allowlist
        .iter()
        .filter(|token| !token.is_empty())
        .fold(false, |found, token| found | tokens_equal(presented, token));
    if matched {
        Ok(())
    } else {
        Err(AuthError::UnknownToken)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|text| !text.is_empty())
}

fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    non_empty(Some(token))
}

/// Constant-time equality over fixed-length digests.
fn tokens_equal(a: &str, b: &str) -> bool {
    let left = Sha256::digest(a.as_bytes());
    let right = Sha256::digest(b.as_bytes());
    left.iter()
        .zip(right.iter())
        .fold(0_u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
