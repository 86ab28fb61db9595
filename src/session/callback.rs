//! Authorization response handling.
//!
//! The provider returns tokens in the URL fragment (implicit flow) or, for
//! errors, sometimes in the query. This module turns that URL into an
//! [`AuthorizeResponse`], reads JWT payloads without verifying them (the
//! relying party trusts the channel, the resource server verifies signatures),
//! and derives the token set's expiry once.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;

use super::error::SessionError;

/// Claims that describe the protocol exchange rather than the user.
pub const PROTOCOL_CLAIMS: &[&str] = &["nonce", "at_hash", "iat", "nbf", "exp", "aud", "iss", "c_hash"];

/// Parameters of one authorization response.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AuthorizeResponse {
    pub state: Option<String>,
    pub id_token: Option<String>,
    pub access_token: Option<String>,
    pub token_type: Option<String>,
    pub expires_in: Option<u64>,
    pub scope: Option<String>,
    pub session_state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl AuthorizeResponse {
    /// Parse the response carried by a callback URL.
    ///
    /// The fragment wins over the query; a URL carrying neither is malformed.
    pub fn from_url(url: &str) -> Result<Self, SessionError> {
        let (without_fragment, fragment) = match url.split_once('#') {
            Some((head, fragment)) => (head, Some(fragment)),
            None => (url, None),
        };
        let query = without_fragment.split_once('?').map(|(_, q)| q);

        let raw = match (fragment, query) {
            (Some(f), _) if !f.is_empty() => f,
            (_, Some(q)) if !q.is_empty() => q,
            _ => {
                return Err(SessionError::CallbackParse(
                    "no authorization response in callback URL".to_string(),
                ))
            }
        };

        let mut params = parse_params(raw)?;

        let expires_in = match params.remove("expires_in") {
            Some(value) => Some(value.parse::<u64>().map_err(|_| {
                SessionError::CallbackParse(format!("invalid expires_in: {}", value))
            })?),
            None => None,
        };

        Ok(Self {
            state: params.remove("state"),
            id_token: params.remove("id_token"),
            access_token: params.remove("access_token"),
            token_type: params.remove("token_type"),
            expires_in,
            scope: params.remove("scope"),
            session_state: params.remove("session_state"),
            error: params.remove("error"),
            error_description: params.remove("error_description"),
        })
    }
}

fn parse_params(raw: &str) -> Result<HashMap<String, String>, SessionError> {
    let mut params = HashMap::new();
    for pair in raw.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = decode_component(key)?;
        let value = decode_component(value)?;
        if params.insert(key.clone(), value).is_some() {
            return Err(SessionError::CallbackParse(format!("duplicate parameter: {}", key)));
        }
    }
    Ok(params)
}

fn decode_component(raw: &str) -> Result<String, SessionError> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .map_err(|_| SessionError::CallbackParse("invalid percent-encoding".to_string()))
}

/// The callback URL with the response removed, used to rewrite history.
pub fn strip_response(url: &str) -> String {
    let without_fragment = url.split('#').next().unwrap_or(url);
    without_fragment.split('?').next().unwrap_or(without_fragment).to_string()
}

/// Append URL-encoded query parameters to `base`.
pub fn with_query(base: &str, params: &[(&str, &str)]) -> String {
    let mut url = base.to_string();
    let mut separator = if base.contains('?') { '&' } else { '?' };
    for (key, value) in params {
        url.push(separator);
        url.push_str(key);
        url.push('=');
        url.push_str(&urlencoding::encode(value));
        separator = '&';
    }
    url
}

/// Decode a JWT payload without verifying the signature.
pub fn decode_jwt_payload(token: &str) -> Result<Map<String, Value>, SessionError> {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next()) {
        (Some(_), Some(payload)) => payload,
        _ => return Err(SessionError::CallbackParse("token is not a JWT".to_string())),
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| SessionError::CallbackParse(format!("invalid token payload encoding: {}", e)))?;

    match serde_json::from_slice(&bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(SessionError::CallbackParse("token payload is not an object".to_string())),
        Err(e) => Err(SessionError::CallbackParse(format!("invalid token payload: {}", e))),
    }
}

pub fn filter_protocol_claims(claims: &mut Map<String, Value>) {
    for claim in PROTOCOL_CLAIMS {
        claims.remove(*claim);
    }
}

/// Absolute expiry of a freshly acquired token set.
///
/// Prefers the access token's own `exp`, then `expires_in` relative to `now`,
/// then the id token's `exp`.
pub fn derive_expires_at(
    access_token: Option<&str>,
    expires_in: Option<u64>,
    id_claims: &Map<String, Value>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, SessionError> {
    let access_exp = access_token
        .and_then(|token| decode_jwt_payload(token).ok())
        .and_then(|claims| exp_of(&claims));
    if let Some(exp) = access_exp {
        return Ok(exp);
    }

    if let Some(secs) = expires_in {
        return i64::try_from(secs)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .ok_or_else(|| SessionError::CallbackParse("invalid expires_in".to_string()));
    }

    exp_of(id_claims).ok_or_else(|| {
        SessionError::CallbackParse("response carries no token lifetime".to_string())
    })
}

fn exp_of(claims: &Map<String, Value>) -> Option<DateTime<Utc>> {
    let exp = claims.get("exp")?.as_i64()?;
    Utc.timestamp_opt(exp, 0).single()
}
