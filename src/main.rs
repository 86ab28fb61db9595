//! Protected API
//!
//! Serves `/` to anyone and `/me` to callers presenting a bearer access token
//! issued by the configured OpenID Connect provider.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use implicit_oidc::oidc::{router, JwksCache, OidcConfig, OidcConfigJson, TokenValidator};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "implicit-oidc-api")]
#[command(about = "API protected by bearer tokens from an OpenID Connect provider")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:5002", env = "LISTEN_ADDR")]
    listen: String,

    /// Expected token issuer
    #[arg(long, default_value = "http://localhost:5000", env = "OIDC_ISSUER")]
    issuer: String,

    /// Expected token audience
    #[arg(long, default_value = "api1", env = "OIDC_AUDIENCE")]
    audience: String,

    /// JWKS URL (defaults to the issuer's well-known key set)
    #[arg(long, env = "OIDC_JWKS_URL")]
    jwks_url: Option<String>,

    /// JSON file overriding validation settings
    #[arg(long, env = "OIDC_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, env = "API_VERBOSE")]
    verbose: bool,
}

impl Args {
    /// Command line values, overlaid with the JSON config file if given.
    fn oidc_config(&self) -> Result<OidcConfig> {
        let mut config = OidcConfig {
            issuer: self.issuer.clone(),
            audience: self.audience.clone(),
            jwks_url: self.jwks_url.clone().unwrap_or_default(),
            ..Default::default()
        };

        if let Some(path) = &self.config {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            let overlay: OidcConfigJson = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?;
            overlay.apply_to(&mut config);
        }

        config
            .validate()
            .map_err(|e| anyhow!("Invalid OIDC configuration: {}", e))?;

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "{}={},implicit_oidc={}",
            env!("CARGO_CRATE_NAME"),
            log_level,
            log_level
        ))
        .json()
        .init();

    info!("Starting protected API");

    let config = args.oidc_config()?;

    info!(
        issuer = %config.issuer,
        audience = %config.audience,
        jwks_url = %config.effective_jwks_url(),
        required_scopes = config.required_scopes.len(),
        "Configuration loaded"
    );

    let jwks = Arc::new(JwksCache::from_config(&config)?);
    if let Err(e) = jwks.warm().await {
        warn!(error = %e, "Initial JWKS fetch failed, keys will be fetched on first request");
    }

    let validator = Arc::new(TokenValidator::new(&config, jwks)?);
    let app = router(validator);

    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;

    info!(addr = %args.listen, "Listening");
    axum::serve(listener, app).await.context("API server failed")?;

    Ok(())
}
