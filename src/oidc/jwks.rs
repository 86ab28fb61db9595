//! JWKS (JSON Web Key Set) fetching and caching.
//!
//! The key set is fetched wholesale and swapped in atomically. Lookups read an
//! immutable snapshot; refreshes are serialized behind a single gate so that
//! concurrent misses share one outstanding fetch.

use anyhow::{Context, Result};
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::OidcConfig;
use super::error::ValidationError;
use super::limiter::RefreshLimiter;

/// JWKS response from the endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// Individual JSON Web Key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type (RSA, EC)
    pub kty: String,
    /// Key ID
    #[serde(default)]
    pub kid: Option<String>,
    /// Algorithm
    #[serde(default)]
    pub alg: Option<String>,
    /// Key use (sig, enc)
    #[serde(rename = "use", default)]
    pub key_use: Option<String>,

    // RSA parameters
    /// RSA modulus (base64url)
    #[serde(default)]
    pub n: Option<String>,
    /// RSA exponent (base64url)
    #[serde(default)]
    pub e: Option<String>,

    // EC parameters
    /// EC curve
    #[serde(default)]
    pub crv: Option<String>,
    /// EC x coordinate (base64url)
    #[serde(default)]
    pub x: Option<String>,
    /// EC y coordinate (base64url)
    #[serde(default)]
    pub y: Option<String>,
}

impl Jwk {
    /// Convert to a DecodingKey.
    fn to_decoding_key(&self) -> Result<DecodingKey> {
        match self.kty.as_str() {
            "RSA" => {
                let n = self.n.as_deref().context("RSA key missing 'n'")?;
                let e = self.e.as_deref().context("RSA key missing 'e'")?;
                DecodingKey::from_rsa_components(n, e).context("Failed to create RSA DecodingKey")
            }
            "EC" => {
                let crv = self.crv.as_deref().context("EC key missing 'crv'")?;
                if crv != "P-256" && crv != "P-384" {
                    anyhow::bail!("Unsupported EC curve: {}", crv);
                }
                let x = self.x.as_deref().context("EC key missing 'x'")?;
                let y = self.y.as_deref().context("EC key missing 'y'")?;
                DecodingKey::from_ec_components(x, y).context("Failed to create EC DecodingKey")
            }
            kty => anyhow::bail!("Unsupported key type: {}", kty),
        }
    }

    fn algorithm(&self) -> Result<Option<Algorithm>> {
        self.alg
            .as_deref()
            .map(|alg| Algorithm::from_str(alg).with_context(|| format!("Unknown JWK alg: {}", alg)))
            .transpose()
    }
}

/// One signing key, immutable once inserted.
pub struct SigningKey {
    pub kid: Option<String>,
    /// Algorithm the key is published for, if the JWK declares one.
    pub algorithm: Option<Algorithm>,
    pub fetched_at: Instant,
    key: DecodingKey,
}

impl SigningKey {
    pub fn decoding_key(&self) -> &DecodingKey {
        &self.key
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .field("fetched_at", &self.fetched_at)
            .finish_non_exhaustive()
    }
}

/// Ordered key set in publication order, looked up by key id.
#[derive(Debug, Default)]
pub struct KeySet {
    keys: Vec<Arc<SigningKey>>,
    fetched_at: Option<Instant>,
}

impl KeySet {
    fn from_jwks(jwks: Jwks, fetched_at: Instant) -> Result<Self, ValidationError> {
        let mut keys = Vec::with_capacity(jwks.keys.len());
        for jwk in jwks.keys {
            // Skip encryption keys
            if jwk.key_use.as_deref() == Some("enc") {
                continue;
            }

            let parsed = jwk
                .to_decoding_key()
                .and_then(|key| Ok((key, jwk.algorithm()?)));
            match parsed {
                Ok((key, algorithm)) => {
                    debug!(kid = ?jwk.kid, kty = %jwk.kty, "Loaded JWK");
                    keys.push(Arc::new(SigningKey {
                        kid: jwk.kid,
                        algorithm,
                        fetched_at,
                        key,
                    }));
                }
                Err(e) => {
                    warn!(
                        kid = ?jwk.kid,
                        kty = %jwk.kty,
                        error = %e,
                        "Failed to parse JWK, skipping"
                    );
                }
            }
        }

        if keys.is_empty() {
            return Err(ValidationError::KeyFetchNetworkError(
                "no usable signing keys in JWKS".to_string(),
            ));
        }

        Ok(Self {
            keys,
            fetched_at: Some(fetched_at),
        })
    }

    /// Find by key id; a token without `kid` gets the first published key.
    pub fn find(&self, kid: Option<&str>) -> Option<Arc<SigningKey>> {
        match kid {
            Some(kid) => self
                .keys
                .iter()
                .find(|k| k.kid.as_deref() == Some(kid))
                .cloned(),
            None => self.keys.first().cloned(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.is_some_and(|at| at.elapsed() < ttl)
    }
}

/// Source of the published key set.
#[async_trait]
pub trait JwksFetcher: Send + Sync {
    async fn fetch(&self) -> Result<Jwks, ValidationError>;
}

/// Fetches the key set over HTTP.
pub struct HttpJwksFetcher {
    jwks_url: String,
    http_client: reqwest::Client,
}

impl HttpJwksFetcher {
    pub fn new(jwks_url: String, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            jwks_url,
            http_client,
        })
    }
}

#[async_trait]
impl JwksFetcher for HttpJwksFetcher {
    async fn fetch(&self) -> Result<Jwks, ValidationError> {
        debug!(url = %self.jwks_url, "Fetching JWKS");

        let response = self
            .http_client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| ValidationError::KeyFetchNetworkError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ValidationError::KeyFetchNetworkError(format!(
                "JWKS endpoint returned status {}",
                response.status()
            )));
        }

        response
            .json::<Jwks>()
            .await
            .map_err(|e| ValidationError::KeyFetchNetworkError(format!("Failed to parse JWKS: {}", e)))
    }
}

/// Outcome of the most recent fetch, handed to callers that queued behind it.
#[derive(Default)]
struct LastRefresh {
    error: Option<ValidationError>,
}

/// Process-wide JWKS cache.
pub struct JwksCache {
    current: RwLock<Arc<KeySet>>,
    /// Serializes refreshes; holds the result of the last attempt.
    refresh_gate: Mutex<LastRefresh>,
    /// Number of completed fetch attempts.
    attempts: AtomicU64,
    limiter: RefreshLimiter,
    fetcher: Arc<dyn JwksFetcher>,
    ttl: Duration,
}

impl JwksCache {
    pub fn new(
        fetcher: Arc<dyn JwksFetcher>,
        ttl: Duration,
        requests_per_window: u32,
        window: Duration,
    ) -> Self {
        Self {
            current: RwLock::new(Arc::new(KeySet::default())),
            refresh_gate: Mutex::new(LastRefresh::default()),
            attempts: AtomicU64::new(0),
            limiter: RefreshLimiter::new(requests_per_window, window),
            fetcher,
            ttl,
        }
    }

    /// Build a cache fetching over HTTP from the configured JWKS URL.
    pub fn from_config(config: &OidcConfig) -> Result<Self> {
        let fetcher = HttpJwksFetcher::new(
            config.effective_jwks_url(),
            Duration::from_secs(config.jwks_fetch_timeout_secs),
        )?;
        Ok(Self::new(
            Arc::new(fetcher),
            config.jwks_cache_ttl(),
            config.jwks_requests_per_window,
            config.jwks_window(),
        ))
    }

    /// Resolve a signing key.
    ///
    /// A miss (or a stale set) triggers one wholesale refresh followed by one
    /// retry. Callers arriving while a refresh is in flight wait for it instead
    /// of fetching again.
    pub async fn get(&self, kid: Option<&str>) -> Result<Arc<SigningKey>, ValidationError> {
        let (seen, snapshot) = self.observe();
        self.resolve(kid, seen, &snapshot).await
    }

    /// Fetch counter and key set, in that order: a fetch that lands after the
    /// counter was read counts as already done for this lookup.
    fn observe(&self) -> (u64, Arc<KeySet>) {
        let seen = self.attempts.load(Ordering::Acquire);
        (seen, self.snapshot())
    }

    async fn resolve(
        &self,
        kid: Option<&str>,
        seen: u64,
        snapshot: &KeySet,
    ) -> Result<Arc<SigningKey>, ValidationError> {
        let cached = snapshot.find(kid);
        if let Some(ref key) = cached {
            if snapshot.is_fresh(self.ttl) {
                return Ok(Arc::clone(key));
            }
        }

        debug!(kid = ?kid, stale = cached.is_some(), "Key not usable from cache, refreshing JWKS");
        match self.refresh_after(seen).await {
            Ok(set) => set.find(kid).ok_or_else(|| {
                ValidationError::UnknownSigningKey(kid.unwrap_or("<none>").to_string())
            }),
            Err(e) => match cached {
                Some(key) => {
                    warn!(kid = ?kid, error = %e, "JWKS refresh failed, serving stale key");
                    Ok(key)
                }
                None => Err(e),
            },
        }
    }

    /// Best-effort initial fetch.
    pub async fn warm(&self) -> Result<(), ValidationError> {
        let seen = self.attempts.load(Ordering::Acquire);
        self.refresh_after(seen).await.map(|_| ())
    }

    /// Current immutable key set.
    pub fn snapshot(&self) -> Arc<KeySet> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Number of fetches performed so far.
    pub fn fetch_count(&self) -> u64 {
        self.attempts.load(Ordering::Acquire)
    }

    async fn refresh_after(&self, seen: u64) -> Result<Arc<KeySet>, ValidationError> {
        let mut last = self.refresh_gate.lock().await;

        // Someone else completed a fetch while we were waiting for the gate.
        if self.attempts.load(Ordering::Acquire) != seen {
            return match &last.error {
                Some(e) => Err(e.clone()),
                None => Ok(self.snapshot()),
            };
        }

        if !self.limiter.try_acquire() {
            warn!("JWKS refresh rate limit exceeded");
            return Err(ValidationError::KeyFetchRateLimited);
        }

        let result = match self.fetcher.fetch().await {
            Ok(jwks) => KeySet::from_jwks(jwks, Instant::now()).map(Arc::new),
            Err(e) => Err(e),
        };

        match &result {
            Ok(set) => {
                match self.current.write() {
                    Ok(mut guard) => *guard = Arc::clone(set),
                    Err(poisoned) => *poisoned.into_inner() = Arc::clone(set),
                }
                info!(key_count = set.len(), "JWKS cache refreshed");
                last.error = None;
            }
            Err(e) => {
                warn!(error = %e, "JWKS refresh failed");
                last.error = Some(e.clone());
            }
        }
        self.attempts.fetch_add(1, Ordering::AcqRel);

        result
    }
}
