//! Bearer token rejection kinds.

use std::fmt;
use thiserror::Error;

/// Which claim check rejected an otherwise well-signed token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimKind {
    Issuer,
    Audience,
    Expired,
    NotYetValid,
    MissingScope,
}

impl fmt::Display for ClaimKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimKind::Issuer => write!(f, "issuer"),
            ClaimKind::Audience => write!(f, "audience"),
            ClaimKind::Expired => write!(f, "expired"),
            ClaimKind::NotYetValid => write!(f, "not-yet-valid"),
            ClaimKind::MissingScope => write!(f, "missing-scope"),
        }
    }
}

/// Why a bearer token was not accepted.
///
/// The variants are for internal logging only. Callers on the request path map
/// every variant to the same unauthorized response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("malformed token: {0}")]
    MalformedToken(String),

    #[error("unknown signing key: {0}")]
    UnknownSigningKey(String),

    #[error("signature invalid")]
    SignatureInvalid,

    #[error("claim rejected: {0}")]
    ClaimRejected(ClaimKind),

    #[error("JWKS refresh rate limit exceeded")]
    KeyFetchRateLimited,

    #[error("JWKS fetch failed: {0}")]
    KeyFetchNetworkError(String),
}

impl ValidationError {
    /// Short stable label for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::MalformedToken(_) => "malformed_token",
            ValidationError::UnknownSigningKey(_) => "unknown_signing_key",
            ValidationError::SignatureInvalid => "signature_invalid",
            ValidationError::ClaimRejected(_) => "claim_rejected",
            ValidationError::KeyFetchRateLimited => "key_fetch_rate_limited",
            ValidationError::KeyFetchNetworkError(_) => "key_fetch_network_error",
        }
    }

    /// Rate-limit and network failures may succeed on a later, independent request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ValidationError::KeyFetchRateLimited | ValidationError::KeyFetchNetworkError(_)
        )
    }
}
