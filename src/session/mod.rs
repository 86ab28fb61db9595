//! Relying-party side: implicit-flow sign-in, silent renewal and sign-out.
//!
//! The [`SessionManager`] owns the state machine. It reads and writes a
//! [`SessionStore`] (in memory or redb-backed), talks to the browser through a
//! [`UserAgent`] and to the provider through a [`ProviderClient`], and reports
//! transitions on an [`EventBus`].

pub mod callback;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod provider;
pub mod store;
pub mod types;

pub use callback::AuthorizeResponse;
pub use cleanup::{spawn_cleanup_task, DEFAULT_CLEANUP_INTERVAL_SECS};
pub use config::ClientConfig;
pub use error::SessionError;
pub use events::{EventBus, SessionEvent};
pub use manager::{SessionManager, SigninArgs};
pub use provider::{ChannelUserAgent, HttpProviderClient, NavigationRequest, ProviderClient, UserAgent};
pub use store::SessionStore;
pub use types::{SessionState, SigninKind, SigninRequest, TokenSet};
