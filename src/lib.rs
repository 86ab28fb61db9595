//! OpenID Connect implicit-flow client session management and bearer-token
//! validation.
//!
//! - [`session`]: relying-party side. Signs the user in through the provider,
//!   keeps the token set current with silent renewal, and signs out.
//! - [`oidc`]: resource-server side. Validates bearer access tokens against the
//!   provider's published signing keys and guards an axum router.

pub mod oidc;
pub mod session;

pub use oidc::{JwksCache, OidcConfig, TokenValidator, ValidationError};
pub use session::{ClientConfig, SessionError, SessionEvent, SessionManager, SessionState, SessionStore, TokenSet};
