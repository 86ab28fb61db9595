//! Collaborators at the edge of the session manager.
//!
//! [`UserAgent`] stands for the browser: it performs navigations and reports
//! back the URL the provider redirected to. [`ProviderClient`] covers the two
//! back-channel calls the relying party makes directly (revocation, userinfo).

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::config::ClientConfig;
use super::error::SessionError;

/// The browsing context the relying party runs in.
#[async_trait]
pub trait UserAgent: Send + Sync {
    /// Full-page navigation away from the application.
    async fn navigate(&self, url: &str) -> Result<(), SessionError>;

    /// Open a popup and resolve with the callback URL it lands on.
    async fn open_popup(&self, url: &str, features: &str) -> Result<String, SessionError>;

    /// Load `url` in a hidden frame and resolve with the callback URL it lands on.
    async fn load_silent_frame(&self, url: &str) -> Result<String, SessionError>;

    /// Rewrite the current location without a history entry.
    async fn replace_location(&self, url: &str) -> Result<(), SessionError>;
}

/// A navigation handed to the host over [`ChannelUserAgent`].
#[derive(Debug)]
pub enum NavigationRequest {
    Redirect {
        url: String,
    },
    Popup {
        url: String,
        features: String,
        /// Completed with the callback URL, or an error message. Dropping it
        /// means the user closed the popup.
        reply: oneshot::Sender<Result<String, String>>,
    },
    SilentFrame {
        url: String,
        reply: oneshot::Sender<Result<String, String>>,
    },
    ReplaceLocation {
        url: String,
    },
}

impl NavigationRequest {
    pub fn url(&self) -> &str {
        match self {
            NavigationRequest::Redirect { url }
            | NavigationRequest::Popup { url, .. }
            | NavigationRequest::SilentFrame { url, .. }
            | NavigationRequest::ReplaceLocation { url } => url,
        }
    }
}

/// [`UserAgent`] that forwards every navigation to a host loop over a channel.
///
/// The host (webview shell, test harness) receives [`NavigationRequest`]s and
/// completes popup and frame loads through their reply channel.
#[derive(Clone)]
pub struct ChannelUserAgent {
    requests: mpsc::UnboundedSender<NavigationRequest>,
}

impl ChannelUserAgent {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NavigationRequest>) {
        let (requests, rx) = mpsc::unbounded_channel();
        (Self { requests }, rx)
    }

    fn send(&self, request: NavigationRequest) -> Result<(), SessionError> {
        self.requests
            .send(request)
            .map_err(|_| SessionError::Navigation("user agent is gone".to_string()))
    }

    async fn round_trip(
        &self,
        reply: oneshot::Receiver<Result<String, String>>,
        closed: &str,
    ) -> Result<String, SessionError> {
        match reply.await {
            Ok(Ok(url)) => Ok(url),
            Ok(Err(message)) => Err(SessionError::Navigation(message)),
            Err(_) => Err(SessionError::Navigation(closed.to_string())),
        }
    }
}

#[async_trait]
impl UserAgent for ChannelUserAgent {
    async fn navigate(&self, url: &str) -> Result<(), SessionError> {
        self.send(NavigationRequest::Redirect { url: url.to_string() })
    }

    async fn open_popup(&self, url: &str, features: &str) -> Result<String, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(NavigationRequest::Popup {
            url: url.to_string(),
            features: features.to_string(),
            reply,
        })?;
        self.round_trip(rx, "popup window was closed").await
    }

    async fn load_silent_frame(&self, url: &str) -> Result<String, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(NavigationRequest::SilentFrame {
            url: url.to_string(),
            reply,
        })?;
        self.round_trip(rx, "silent renewal frame was discarded").await
    }

    async fn replace_location(&self, url: &str) -> Result<(), SessionError> {
        self.send(NavigationRequest::ReplaceLocation { url: url.to_string() })
    }
}

/// Back-channel calls to the provider.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn revoke_access_token(&self, access_token: &str) -> Result<(), SessionError>;

    async fn user_info(&self, access_token: &str) -> Result<Map<String, Value>, SessionError>;
}

/// [`ProviderClient`] over HTTP.
pub struct HttpProviderClient {
    client_id: String,
    revocation_endpoint: String,
    userinfo_endpoint: String,
    http_client: reqwest::Client,
}

impl HttpProviderClient {
    pub fn new(config: &ClientConfig, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client_id: config.client_id.clone(),
            revocation_endpoint: config.revocation_endpoint(),
            userinfo_endpoint: config.userinfo_endpoint(),
            http_client,
        })
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn revoke_access_token(&self, access_token: &str) -> Result<(), SessionError> {
        debug!(url = %self.revocation_endpoint, "Revoking access token");

        let response = self
            .http_client
            .post(&self.revocation_endpoint)
            .form(&[
                ("token", access_token),
                ("token_type_hint", "access_token"),
                ("client_id", self.client_id.as_str()),
            ])
            .send()
            .await
            .map_err(|e| SessionError::RevocationFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SessionError::RevocationFailed(format!(
                "revocation endpoint returned status {}",
                response.status()
            )));
        }

        Ok(())
    }

    async fn user_info(&self, access_token: &str) -> Result<Map<String, Value>, SessionError> {
        debug!(url = %self.userinfo_endpoint, "Loading user info");

        let response = self
            .http_client
            .get(&self.userinfo_endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| SessionError::UserInfo(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SessionError::UserInfo(format!(
                "userinfo endpoint returned status {}",
                response.status()
            )));
        }

        response
            .json::<Map<String, Value>>()
            .await
            .map_err(|e| SessionError::UserInfo(format!("Failed to parse userinfo: {}", e)))
    }
}
