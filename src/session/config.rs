//! Relying-party client configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Browser client registration and session behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Provider base URL. Example: "http://localhost:5000"
    #[serde(default)]
    pub authority: String,

    #[serde(default)]
    pub client_id: String,

    /// Callback target for full-page sign-in.
    #[serde(default)]
    pub redirect_uri: String,

    /// Callback target for popup sign-in. Falls back to `redirect_uri`.
    #[serde(default)]
    pub popup_redirect_uri: Option<String>,

    /// Callback target loaded in the hidden renewal frame.
    #[serde(default)]
    pub silent_redirect_uri: Option<String>,

    #[serde(default)]
    pub post_logout_redirect_uri: Option<String>,

    #[serde(default = "default_response_type")]
    pub response_type: String,

    #[serde(default = "default_scope")]
    pub scope: String,

    /// Window features passed to the user agent when opening the popup.
    #[serde(default = "default_popup_window_features")]
    pub popup_window_features: String,

    /// Renew silently when the access token is about to expire.
    #[serde(default = "default_true")]
    pub automatic_silent_renew: bool,

    #[serde(default = "default_silent_renew_timeout")]
    pub silent_renew_timeout_secs: u64,

    /// Lead time before expiry at which the expiring notification fires.
    #[serde(default = "default_expiring_notification")]
    pub expiring_notification_secs: u64,

    #[serde(default = "default_true")]
    pub revoke_access_token_on_signout: bool,

    /// Merge userinfo claims into the token set at acquisition.
    #[serde(default = "default_true")]
    pub load_user_info: bool,

    /// Strip protocol claims (nonce, at_hash, exp, ...) from the profile.
    #[serde(default)]
    pub filter_protocol_claims: bool,

    /// Age after which an unanswered sign-in request is discarded.
    #[serde(default = "default_stale_state_age")]
    pub stale_state_age_secs: u64,

    #[serde(default)]
    pub authorization_endpoint: Option<String>,

    #[serde(default)]
    pub revocation_endpoint: Option<String>,

    #[serde(default)]
    pub end_session_endpoint: Option<String>,

    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
}

fn default_response_type() -> String {
    "id_token token".to_string()
}

fn default_scope() -> String {
    "openid profile email api1".to_string()
}

fn default_popup_window_features() -> String {
    "menubar=yes,location=yes,toolbar=yes,width=1200,height=800,left=100,top=100,resizable=yes"
        .to_string()
}

fn default_true() -> bool {
    true
}

fn default_silent_renew_timeout() -> u64 {
    10
}

fn default_expiring_notification() -> u64 {
    60
}

fn default_stale_state_age() -> u64 {
    300 // 5 minutes
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            authority: String::new(),
            client_id: String::new(),
            redirect_uri: String::new(),
            popup_redirect_uri: None,
            silent_redirect_uri: None,
            post_logout_redirect_uri: None,
            response_type: default_response_type(),
            scope: default_scope(),
            popup_window_features: default_popup_window_features(),
            automatic_silent_renew: true,
            silent_renew_timeout_secs: default_silent_renew_timeout(),
            expiring_notification_secs: default_expiring_notification(),
            revoke_access_token_on_signout: true,
            load_user_info: true,
            filter_protocol_claims: false,
            stale_state_age_secs: default_stale_state_age(),
            authorization_endpoint: None,
            revocation_endpoint: None,
            end_session_endpoint: None,
            userinfo_endpoint: None,
        }
    }
}

impl ClientConfig {
    /// Presence checks only; URLs are handed to the user agent as given.
    pub fn validate(&self) -> Result<(), String> {
        if self.authority.is_empty() {
            return Err("authority is required".to_string());
        }

        if self.client_id.is_empty() {
            return Err("client_id is required".to_string());
        }

        if self.redirect_uri.is_empty() {
            return Err("redirect_uri is required".to_string());
        }

        if self.automatic_silent_renew && self.silent_redirect_uri.is_none() {
            return Err("silent_redirect_uri is required when automatic_silent_renew is enabled".to_string());
        }

        if self.response_type.split_whitespace().next().is_none() {
            return Err("response_type must not be empty".to_string());
        }

        Ok(())
    }

    pub fn authorization_endpoint(&self) -> String {
        self.endpoint(&self.authorization_endpoint, "connect/authorize")
    }

    pub fn revocation_endpoint(&self) -> String {
        self.endpoint(&self.revocation_endpoint, "connect/revocation")
    }

    pub fn end_session_endpoint(&self) -> String {
        self.endpoint(&self.end_session_endpoint, "connect/endsession")
    }

    pub fn userinfo_endpoint(&self) -> String {
        self.endpoint(&self.userinfo_endpoint, "connect/userinfo")
    }

    pub fn popup_redirect_uri(&self) -> &str {
        self.popup_redirect_uri.as_deref().unwrap_or(&self.redirect_uri)
    }

    pub fn silent_redirect_uri(&self) -> &str {
        self.silent_redirect_uri.as_deref().unwrap_or(&self.redirect_uri)
    }

    pub fn silent_renew_timeout(&self) -> Duration {
        Duration::from_secs(self.silent_renew_timeout_secs)
    }

    pub fn expiring_notification(&self) -> Duration {
        Duration::from_secs(self.expiring_notification_secs)
    }

    pub fn stale_state_age(&self) -> chrono::Duration {
        i64::try_from(self.stale_state_age_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    fn endpoint(&self, explicit: &Option<String>, path: &str) -> String {
        match explicit {
            Some(url) => url.clone(),
            None => format!("{}/{}", self.authority.trim_end_matches('/'), path),
        }
    }
}
