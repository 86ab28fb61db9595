//! Bearer token validation.

use anyhow::anyhow;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use super::config::OidcConfig;
use super::error::{ClaimKind, ValidationError};
use super::jwks::JwksCache;

/// Audience can be a single string or array of strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    #[default]
    None,
    Single(String),
    Multiple(Vec<String>),
}

impl Audience {
    pub fn contains(&self, aud: &str) -> bool {
        match self {
            Audience::None => false,
            Audience::Single(s) => s == aud,
            Audience::Multiple(v) => v.iter().any(|a| a == aud),
        }
    }
}

/// Decoded token payload, exactly as signed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Claims(Map<String, Value>);

impl Claims {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn subject(&self) -> Option<&str> {
        self.get("sub").and_then(Value::as_str)
    }

    pub fn issuer(&self) -> Option<&str> {
        self.get("iss").and_then(Value::as_str)
    }

    pub fn audience(&self) -> Audience {
        self.get("aud")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    /// Scopes from a space-separated string or a JSON array.
    pub fn scopes(&self) -> Vec<String> {
        match self.get("scope") {
            Some(Value::String(s)) => s.split_whitespace().map(String::from).collect(),
            Some(Value::Array(arr)) => arr
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

#[derive(Deserialize)]
struct RawHeader {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
}

/// Per-request bearer token validator.
pub struct TokenValidator {
    algorithm: Algorithm,
    validation: Validation,
    required_scopes: Vec<String>,
    jwks: Arc<JwksCache>,
}

impl TokenValidator {
    pub fn new(config: &OidcConfig, jwks: Arc<JwksCache>) -> anyhow::Result<Self> {
        config.validate().map_err(|e| anyhow!(e))?;
        let algorithm = config.allowed_algorithm().map_err(|e| anyhow!(e))?;

        let mut validation = Validation::new(algorithm);
        validation.leeway = config.clock_skew_secs;
        validation.validate_nbf = true;
        validation.set_issuer(&[&config.issuer]);
        validation.set_audience(&[&config.audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);

        Ok(Self {
            algorithm,
            validation,
            required_scopes: config.required_scopes.clone(),
            jwks,
        })
    }

    /// Validate a bearer token and return its claims.
    pub async fn validate(&self, token: &str) -> Result<Claims, ValidationError> {
        let header = parse_header(token)?;

        debug!(kid = ?header.kid, alg = %header.alg, "Validating bearer token");

        // Only the configured asymmetric algorithm is ever considered.
        let alg = Algorithm::from_str(&header.alg).map_err(|_| ValidationError::SignatureInvalid)?;
        if alg != self.algorithm {
            return Err(ValidationError::SignatureInvalid);
        }

        let key = self.jwks.get(header.kid.as_deref()).await?;
        if key.algorithm.is_some_and(|key_alg| key_alg != alg) {
            return Err(ValidationError::SignatureInvalid);
        }

        let claims = decode::<Claims>(token, key.decoding_key(), &self.validation)
            .map_err(map_jwt_error)?
            .claims;

        if !self.required_scopes.is_empty() {
            let scopes = claims.scopes();
            if let Some(missing) = self.required_scopes.iter().find(|s| !scopes.contains(s)) {
                debug!(scope = %missing, "Token missing required scope");
                return Err(ValidationError::ClaimRejected(ClaimKind::MissingScope));
            }
        }

        debug!(sub = ?claims.subject(), "Bearer token validated");
        Ok(claims)
    }
}

/// Read the JOSE header without trusting `alg`, so unknown names like `none` are
/// reported as a signature problem rather than a parse problem.
fn parse_header(token: &str) -> Result<RawHeader, ValidationError> {
    let (encoded, _) = token
        .split_once('.')
        .ok_or_else(|| ValidationError::MalformedToken("not a JWS compact token".to_string()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| ValidationError::MalformedToken(format!("header encoding: {}", e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ValidationError::MalformedToken(format!("header JSON: {}", e)))
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> ValidationError {
    match err.kind() {
        ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => ValidationError::SignatureInvalid,
        ErrorKind::ExpiredSignature => ValidationError::ClaimRejected(ClaimKind::Expired),
        ErrorKind::ImmatureSignature => ValidationError::ClaimRejected(ClaimKind::NotYetValid),
        ErrorKind::InvalidIssuer => ValidationError::ClaimRejected(ClaimKind::Issuer),
        ErrorKind::InvalidAudience => ValidationError::ClaimRejected(ClaimKind::Audience),
        ErrorKind::MissingRequiredClaim(claim) => match claim.as_str() {
            "iss" => ValidationError::ClaimRejected(ClaimKind::Issuer),
            "aud" => ValidationError::ClaimRejected(ClaimKind::Audience),
            _ => ValidationError::ClaimRejected(ClaimKind::Expired),
        },
        other => ValidationError::MalformedToken(format!("{:?}", other)),
    }
}
