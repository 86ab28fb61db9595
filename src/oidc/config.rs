//! Resource-server token validation configuration.

use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Path of the key set under the issuer, as published by IdentityServer.
pub const JWKS_PATH: &str = ".well-known/openid-configuration/jwks";

/// Bearer token validation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OidcConfig {
    /// Token issuer (iss claim). Must match exactly.
    /// Example: "http://localhost:5000"
    #[serde(default)]
    pub issuer: String,

    /// Expected audience (aud claim).
    #[serde(default)]
    pub audience: String,

    /// JWKS endpoint URL. Derived from the issuer when empty.
    #[serde(default)]
    pub jwks_url: String,

    /// The single accepted signing algorithm.
    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    /// Required OAuth scopes. Token must carry all listed scopes.
    #[serde(default)]
    pub required_scopes: Vec<String>,

    /// Clock skew tolerance in seconds for exp/nbf validation.
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: u64,

    /// Age after which the cached key set is refreshed on next lookup.
    #[serde(default = "default_jwks_cache_ttl")]
    pub jwks_cache_ttl_secs: u64,

    /// Maximum JWKS fetches per window.
    #[serde(default = "default_jwks_requests")]
    pub jwks_requests_per_window: u32,

    /// Rate-limit window length in seconds.
    #[serde(default = "default_jwks_window")]
    pub jwks_window_secs: u64,

    /// HTTP timeout for a single JWKS fetch.
    #[serde(default = "default_jwks_fetch_timeout")]
    pub jwks_fetch_timeout_secs: u64,
}

fn default_algorithm() -> String {
    "RS256".to_string()
}

fn default_clock_skew() -> u64 {
    30
}

fn default_jwks_cache_ttl() -> u64 {
    600 // 10 minutes
}

fn default_jwks_requests() -> u32 {
    2
}

fn default_jwks_window() -> u64 {
    60
}

fn default_jwks_fetch_timeout() -> u64 {
    10
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            issuer: String::new(),
            audience: String::new(),
            jwks_url: String::new(),
            algorithm: default_algorithm(),
            required_scopes: Vec::new(),
            clock_skew_secs: default_clock_skew(),
            jwks_cache_ttl_secs: default_jwks_cache_ttl(),
            jwks_requests_per_window: default_jwks_requests(),
            jwks_window_secs: default_jwks_window(),
            jwks_fetch_timeout_secs: default_jwks_fetch_timeout(),
        }
    }
}

impl OidcConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.issuer.is_empty() {
            return Err("OIDC issuer is required".to_string());
        }

        if self.audience.is_empty() {
            return Err("OIDC audience is required".to_string());
        }

        let jwks_url = self.effective_jwks_url();
        if !jwks_url.starts_with("https://") && !jwks_url.starts_with("http://") {
            return Err("OIDC jwks_url must be a valid HTTP(S) URL".to_string());
        }

        self.allowed_algorithm()?;

        if self.jwks_window_secs == 0 {
            return Err("jwks_window_secs must be greater than zero".to_string());
        }

        Ok(())
    }

    /// Explicit JWKS URL, or the issuer's well-known key set location.
    pub fn effective_jwks_url(&self) -> String {
        if self.jwks_url.is_empty() {
            format!("{}/{}", self.issuer.trim_end_matches('/'), JWKS_PATH)
        } else {
            self.jwks_url.clone()
        }
    }

    /// Parse the configured algorithm, refusing symmetric ones.
    pub fn allowed_algorithm(&self) -> Result<Algorithm, String> {
        let alg = Algorithm::from_str(&self.algorithm)
            .map_err(|_| format!("Unsupported algorithm: {}", self.algorithm))?;
        match alg {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => Err(format!(
                "Symmetric algorithm {} is not allowed for bearer tokens",
                self.algorithm
            )),
            alg => Ok(alg),
        }
    }

    pub fn jwks_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.jwks_cache_ttl_secs)
    }

    pub fn jwks_window(&self) -> Duration {
        Duration::from_secs(self.jwks_window_secs)
    }
}

/// JSON overlay, typically loaded from a file given on the command line.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct OidcConfigJson {
    pub issuer: Option<String>,
    pub audience: Option<String>,
    pub jwks_url: Option<String>,
    pub algorithm: Option<String>,
    #[serde(default)]
    pub required_scopes: Vec<String>,
    pub clock_skew_secs: Option<u64>,
    pub jwks_cache_ttl_secs: Option<u64>,
    pub jwks_requests_per_window: Option<u32>,
    pub jwks_window_secs: Option<u64>,
    pub jwks_fetch_timeout_secs: Option<u64>,
}

impl OidcConfigJson {
    /// Apply JSON config to existing config.
    pub fn apply_to(&self, config: &mut OidcConfig) {
        if let Some(ref issuer) = self.issuer {
            config.issuer = issuer.clone();
        }
        if let Some(ref audience) = self.audience {
            config.audience = audience.clone();
        }
        if let Some(ref jwks_url) = self.jwks_url {
            config.jwks_url = jwks_url.clone();
        }
        if let Some(ref algorithm) = self.algorithm {
            config.algorithm = algorithm.clone();
        }
        if !self.required_scopes.is_empty() {
            config.required_scopes = self.required_scopes.clone();
        }
        if let Some(skew) = self.clock_skew_secs {
            config.clock_skew_secs = skew;
        }
        if let Some(ttl) = self.jwks_cache_ttl_secs {
            config.jwks_cache_ttl_secs = ttl;
        }
        if let Some(requests) = self.jwks_requests_per_window {
            config.jwks_requests_per_window = requests;
        }
        if let Some(window) = self.jwks_window_secs {
            config.jwks_window_secs = window;
        }
        if let Some(timeout) = self.jwks_fetch_timeout_secs {
            config.jwks_fetch_timeout_secs = timeout;
        }
    }
}
