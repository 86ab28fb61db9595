//! Session data model: token set, session state, pending sign-in requests.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;

/// Relying-party session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    SignedOut,
    Authenticating,
    Authenticated,
    Renewing,
    Expired,
}

impl SessionState {
    /// Whether a token set is current in this state.
    pub fn has_token_set(&self) -> bool {
        matches!(self, SessionState::Authenticated | SessionState::Renewing)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::SignedOut => write!(f, "signed_out"),
            SessionState::Authenticating => write!(f, "authenticating"),
            SessionState::Authenticated => write!(f, "authenticated"),
            SessionState::Renewing => write!(f, "renewing"),
            SessionState::Expired => write!(f, "expired"),
        }
    }
}

/// Tokens obtained from one authorization response.
///
/// Immutable: a renewal produces a new `TokenSet` that replaces this one whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenSet {
    id_token: Option<String>,
    access_token: Option<String>,
    token_type: String,
    expires_at: DateTime<Utc>,
    scope: BTreeSet<String>,
    raw_claims: Map<String, Value>,
}

impl TokenSet {
    pub fn new(
        id_token: Option<String>,
        access_token: Option<String>,
        token_type: String,
        expires_at: DateTime<Utc>,
        scope: BTreeSet<String>,
        raw_claims: Map<String, Value>,
    ) -> Self {
        Self {
            id_token,
            access_token,
            token_type,
            expires_at,
            scope,
            raw_claims,
        }
    }

    pub fn id_token(&self) -> Option<&str> {
        self.id_token.as_deref()
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Seconds until expiry; negative once expired.
    pub fn expires_in(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds()
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn scope(&self) -> &BTreeSet<String> {
        &self.scope
    }

    pub fn claims(&self) -> &Map<String, Value> {
        &self.raw_claims
    }

    pub fn subject(&self) -> Option<&str> {
        self.raw_claims.get("sub").and_then(Value::as_str)
    }
}

/// How the authorization request was carried to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigninKind {
    Redirect,
    Popup,
    Silent,
}

/// Outstanding authorization request, matched to its callback by `state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigninRequest {
    pub state: String,
    pub nonce: String,
    pub kind: SigninKind,
    pub redirect_uri: String,
    pub scope: String,
    pub response_type: String,
    pub created_at: DateTime<Utc>,
}

impl SigninRequest {
    pub fn new(kind: SigninKind, redirect_uri: String, scope: String, response_type: String) -> Self {
        Self {
            state: uuid::Uuid::new_v4().simple().to_string(),
            nonce: uuid::Uuid::new_v4().simple().to_string(),
            kind,
            redirect_uri,
            scope,
            response_type,
            created_at: Utc::now(),
        }
    }

    /// True when the response type asks for the given token (`id_token`, `token`).
    pub fn expects(&self, token: &str) -> bool {
        self.response_type.split_whitespace().any(|t| t == token)
    }

    pub fn is_stale(&self, max_age: Duration) -> bool {
        Utc::now() - self.created_at > max_age
    }
}
