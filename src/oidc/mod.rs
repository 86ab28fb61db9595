//! Resource-server side: bearer token validation against a rotating JWKS.
//!
//! Provides token validation using JSON Web Key Sets (JWKS) with rate-limited,
//! single-flight refresh on key rotation.

pub mod config;
pub mod error;
pub mod jwks;
pub mod limiter;
pub mod middleware;
pub mod validator;

pub use config::{OidcConfig, OidcConfigJson};
pub use error::{ClaimKind, ValidationError};
pub use jwks::{HttpJwksFetcher, Jwks, JwksCache, JwksFetcher, KeySet, SigningKey};
pub use middleware::{router, ApiState};
pub use validator::{Audience, Claims, TokenValidator};
