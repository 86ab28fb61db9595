//! Session lifecycle notifications.

use tokio::sync::broadcast;
use tracing::debug;

use super::error::SessionError;
use super::types::TokenSet;

/// Default number of undelivered events kept per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A new token set became current (sign-in or renewal).
    UserLoaded(TokenSet),
    /// The token set was removed locally (sign-out or revocation).
    UserUnloaded,
    AccessTokenExpiring,
    AccessTokenExpired,
    SilentRenewError(SessionError),
    SigninError(SessionError),
    /// The provider reported that the end-user session ended elsewhere.
    UserSignedOut,
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::UserLoaded(_) => "user_loaded",
            SessionEvent::UserUnloaded => "user_unloaded",
            SessionEvent::AccessTokenExpiring => "access_token_expiring",
            SessionEvent::AccessTokenExpired => "access_token_expired",
            SessionEvent::SilentRenewError(_) => "silent_renew_error",
            SessionEvent::SigninError(_) => "signin_error",
            SessionEvent::UserSignedOut => "user_signed_out",
        }
    }
}

/// Fan-out of [`SessionEvent`]s to any number of observers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Deliver `event` to current subscribers. Having none is fine.
    pub fn emit(&self, event: SessionEvent) {
        let name = event.name();
        let delivered = self.sender.send(event).unwrap_or(0);
        debug!(event = name, subscribers = delivered, "Session event");
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
