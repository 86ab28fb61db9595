//! Relying-party session errors.

use thiserror::Error;

use super::types::SessionState;

/// Failure of a session transition.
///
/// Every variant is delivered twice: as the `Err` of the operation's future and
/// as the payload of the matching event on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("callback could not be processed: {0}")]
    CallbackParse(String),

    #[error("sign-in rejected by provider: {error}")]
    SigninRejected {
        error: String,
        description: Option<String>,
    },

    #[error("silent renewal timed out")]
    RenewalTimeout,

    #[error("silent renewal rejected by provider: {error}")]
    RenewalRejected {
        error: String,
        description: Option<String>,
    },

    #[error("token revocation failed: {0}")]
    RevocationFailed(String),

    #[error("userinfo request failed: {0}")]
    UserInfo(String),

    #[error("user agent navigation failed: {0}")]
    Navigation(String),

    #[error("{operation} is not allowed while {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("session changed before the operation completed")]
    Superseded,

    #[error("session storage error: {0}")]
    Storage(String),
}

impl SessionError {
    /// Short stable label for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::CallbackParse(_) => "callback_parse",
            SessionError::SigninRejected { .. } => "signin_rejected",
            SessionError::RenewalTimeout => "renewal_timeout",
            SessionError::RenewalRejected { .. } => "renewal_rejected",
            SessionError::RevocationFailed(_) => "revocation_failed",
            SessionError::UserInfo(_) => "userinfo",
            SessionError::Navigation(_) => "navigation",
            SessionError::InvalidState { .. } => "invalid_state",
            SessionError::Superseded => "superseded",
            SessionError::Storage(_) => "storage",
        }
    }

    pub(crate) fn storage(err: anyhow::Error) -> Self {
        SessionError::Storage(format!("{:#}", err))
    }
}
