//! Relying-party session state machine.
//!
//! Drives sign-in (redirect, popup), callback processing, silent renewal,
//! sign-out and revocation over a [`SessionStore`], and reports every outcome
//! both through the returned future and on the [`EventBus`].
//!
//! Each transition takes an epoch from the store when it starts and commits
//! with a compare-and-set on that epoch, so a result that arrives after the
//! session moved on (sign-out during renewal, a newer sign-in) is discarded.

use anyhow::anyhow;
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::callback::{
    derive_expires_at, decode_jwt_payload, filter_protocol_claims, strip_response, with_query,
    AuthorizeResponse,
};
use super::cleanup::spawn_cleanup_task;
use super::config::ClientConfig;
use super::error::SessionError;
use super::events::{EventBus, SessionEvent};
use super::provider::{ProviderClient, UserAgent};
use super::store::{InvalidTransition, SessionStore};
use super::types::{SessionState, SigninKind, SigninRequest, TokenSet};

/// States an interactive sign-in may start from.
const INTERACTIVE_FROM: &[SessionState] = &[SessionState::SignedOut, SessionState::Expired];

/// States a silent renewal may start from.
const RENEW_FROM: &[SessionState] = &[SessionState::Authenticated, SessionState::Expired];

/// States a redirect callback may arrive in. After a full-page redirect the
/// host usually starts fresh, so the pending request is what matters.
const CALLBACK_FROM: &[SessionState] = &[
    SessionState::Authenticating,
    SessionState::SignedOut,
    SessionState::Expired,
];

/// Per-call overrides for an interactive sign-in.
#[derive(Debug, Clone, Default)]
pub struct SigninArgs {
    pub scope: Option<String>,
    pub response_type: Option<String>,
}

/// Handle to one relying-party session. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    store: Arc<SessionStore>,
    events: EventBus,
    agent: Arc<dyn UserAgent>,
    provider: Arc<dyn ProviderClient>,
    /// The one live expiry timer, if a token set is current.
    expiry_timer: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let slot = self.expiry_timer.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = slot.take() {
            timer.abort();
        }
    }
}

impl SessionManager {
    /// Create a manager over `store`.
    ///
    /// Must be called from within a Tokio runtime: a token set resumed from a
    /// persistent store gets its expiry timer armed immediately.
    pub fn new(
        config: ClientConfig,
        store: Arc<SessionStore>,
        agent: Arc<dyn UserAgent>,
        provider: Arc<dyn ProviderClient>,
    ) -> anyhow::Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow!("Invalid client configuration: {}", e))?;

        let manager = Self {
            inner: Arc::new(Inner {
                config,
                store,
                events: EventBus::default(),
                agent,
                provider,
                expiry_timer: Mutex::new(None),
            }),
        };

        if manager.state() == SessionState::Authenticated {
            if let Some(user) = manager.get_user() {
                info!(subject = user.subject().unwrap_or_default(), "Resuming stored session");
                manager.arm_expiry_timer(manager.inner.store.epoch(), &user);
            }
        }

        Ok(manager)
    }

    pub fn state(&self) -> SessionState {
        self.inner.store.state()
    }

    /// The current token set, if any.
    pub fn get_user(&self) -> Option<TokenSet> {
        self.inner.store.user()
    }

    /// Subscribe to session events from now on.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.inner.store
    }

    /// Start evicting sign-in requests older than `stale_state_age_secs`,
    /// checking every `interval_secs`. The host owns the returned handle.
    pub fn spawn_cleanup(&self, interval_secs: u64) -> JoinHandle<()> {
        spawn_cleanup_task(
            Arc::clone(&self.inner.store),
            interval_secs,
            self.inner.config.stale_state_age(),
        )
    }

    /// Navigate the current browsing context to the authorization endpoint.
    ///
    /// Completes once the navigation is handed off; the session stays
    /// `Authenticating` until [`signin_redirect_callback`](Self::signin_redirect_callback).
    pub async fn signin_redirect(&self, args: SigninArgs) -> Result<(), SessionError> {
        let epoch = self.begin("signin_redirect", INTERACTIVE_FROM, SessionState::Authenticating)?;
        let request = self.interactive_request(SigninKind::Redirect, self.inner.config.redirect_uri.clone(), &args);

        let result = async {
            self.save_request(&request)?;
            let url = self.authorize_url(&request, &[]);
            info!(kind = "redirect", "Starting sign-in");
            self.inner.agent.navigate(&url).await
        }
        .await;

        result.map_err(|e| {
            self.discard_request(&request);
            self.signin_failed(epoch, e)
        })
    }

    /// Process the URL the provider redirected back to.
    pub async fn signin_redirect_callback(&self, url: &str) -> Result<TokenSet, SessionError> {
        let epoch = self.begin("signin_redirect_callback", CALLBACK_FROM, SessionState::Authenticating)?;

        // Tokens must not stay in history, whatever the outcome.
        if let Err(e) = self.inner.agent.replace_location(&strip_response(url)).await {
            warn!(error = %e, "Failed to clear callback URL");
        }

        match self.complete_signin(url, SigninKind::Redirect).await {
            Ok(user) => self.install(epoch, user).map_err(|e| self.signin_failed(epoch, e)),
            Err(e) => Err(self.signin_failed(epoch, e)),
        }
    }

    /// Sign in through a popup window, leaving the current page in place.
    pub async fn signin_popup(&self, args: SigninArgs) -> Result<TokenSet, SessionError> {
        let epoch = self.begin("signin_popup", INTERACTIVE_FROM, SessionState::Authenticating)?;
        let redirect_uri = self.inner.config.popup_redirect_uri().to_string();
        let request = self.interactive_request(SigninKind::Popup, redirect_uri, &args);

        let result = async {
            self.save_request(&request)?;
            let url = self.authorize_url(&request, &[]);
            info!(kind = "popup", "Starting sign-in");
            let callback = self
                .inner
                .agent
                .open_popup(&url, &self.inner.config.popup_window_features)
                .await?;
            self.complete_signin(&callback, SigninKind::Popup).await
        }
        .await;

        match result {
            Ok(user) => self.install(epoch, user).map_err(|e| self.signin_failed(epoch, e)),
            Err(e) => {
                self.discard_request(&request);
                Err(self.signin_failed(epoch, e))
            }
        }
    }

    /// Repeat the authorization request in a hidden frame with `prompt=none`.
    ///
    /// The current token set stays in place while renewing. Failure or timeout
    /// moves the session to `Expired`.
    pub async fn signin_silent(&self) -> Result<TokenSet, SessionError> {
        let id_token_hint = self.get_user().and_then(|u| u.id_token().map(str::to_string));
        let epoch = self.begin("signin_silent", RENEW_FROM, SessionState::Renewing)?;
        let config = &self.inner.config;
        let request = SigninRequest::new(
            SigninKind::Silent,
            config.silent_redirect_uri().to_string(),
            config.scope.clone(),
            config.response_type.clone(),
        );

        info!("Starting silent renewal");

        let attempt = async {
            self.save_request(&request)?;
            let mut extra = vec![("prompt", "none")];
            if let Some(hint) = &id_token_hint {
                extra.push(("id_token_hint", hint.as_str()));
            }
            let url = self.authorize_url(&request, &extra);
            let callback = self.inner.agent.load_silent_frame(&url).await?;
            self.complete_signin(&callback, SigninKind::Silent).await
        };

        let result = match tokio::time::timeout(config.silent_renew_timeout(), attempt).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::RenewalTimeout),
        };

        match result {
            Ok(user) => self.install(epoch, user).map_err(|e| self.renewal_failed(epoch, e)),
            Err(e) => {
                self.discard_request(&request);
                Err(self.renewal_failed(epoch, e))
            }
        }
    }

    /// Sign out locally, revoke the access token, then navigate to the
    /// provider's end-session endpoint.
    ///
    /// Always proceeds: an in-flight renewal is invalidated and a failed
    /// revocation is only logged.
    pub async fn signout_redirect(&self) -> Result<(), SessionError> {
        let snapshot = self.get_user();
        let previous = match self.inner.store.clear(SessionState::SignedOut) {
            Ok(previous) => previous,
            Err(e) => {
                // Memory is cleared; only the persisted copy may linger.
                warn!(error = %e, "Failed to remove persisted session");
                snapshot
            }
        };
        self.cancel_expiry_timer();

        if let Some(user) = &previous {
            if self.inner.config.revoke_access_token_on_signout {
                if let Some(access_token) = user.access_token() {
                    if let Err(e) = self.inner.provider.revoke_access_token(access_token).await {
                        warn!(kind = e.kind(), error = %e, "Access token revocation failed, signing out locally");
                    }
                }
            }
            info!("User unloaded");
            self.inner.events.emit(SessionEvent::UserUnloaded);
        }

        let mut params = Vec::new();
        if let Some(id_token) = previous.as_ref().and_then(TokenSet::id_token) {
            params.push(("id_token_hint", id_token));
        }
        if let Some(post_logout) = &self.inner.config.post_logout_redirect_uri {
            params.push(("post_logout_redirect_uri", post_logout.as_str()));
        }
        let url = with_query(&self.inner.config.end_session_endpoint(), &params);

        self.inner.agent.navigate(&url).await
    }

    /// Revoke the current access token at the provider and drop the token set.
    ///
    /// On failure the session is left as it was.
    pub async fn revoke_access_token(&self) -> Result<(), SessionError> {
        let epoch = self.inner.store.epoch();
        let Some(user) = self.get_user() else {
            debug!("No token set to revoke");
            return Ok(());
        };
        let Some(access_token) = user.access_token() else {
            debug!("Token set carries no access token");
            return Ok(());
        };

        if let Err(e) = self.inner.provider.revoke_access_token(access_token).await {
            warn!(kind = e.kind(), error = %e, "Access token revocation failed");
            return Err(e);
        }

        match self.inner.store.reset_if_epoch(epoch, SessionState::SignedOut) {
            Ok(true) => {
                self.cancel_expiry_timer();
                info!("Access token revoked");
                self.inner.events.emit(SessionEvent::UserUnloaded);
                Ok(())
            }
            Ok(false) => {
                debug!("Session changed during revocation, keeping newer state");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Failed to remove persisted session after revocation");
                self.cancel_expiry_timer();
                self.inner.events.emit(SessionEvent::UserUnloaded);
                Ok(())
            }
        }
    }

    /// The provider reported that the end-user session ended elsewhere.
    pub async fn handle_external_signout(&self) -> Result<(), SessionError> {
        if let Err(e) = self.inner.store.clear(SessionState::SignedOut) {
            warn!(error = %e, "Failed to remove persisted session");
        }
        self.cancel_expiry_timer();

        info!("User signed out at the provider");
        self.inner.events.emit(SessionEvent::UserSignedOut);
        Ok(())
    }

    /// Start a transition. A refusal leaves the session untouched and is
    /// reported on the bus as a sign-in or renewal error.
    fn begin(
        &self,
        operation: &'static str,
        allowed: &[SessionState],
        next: SessionState,
    ) -> Result<u64, SessionError> {
        self.inner.store.begin(allowed, next).map_err(|e| {
            let error = match e.downcast_ref::<InvalidTransition>() {
                Some(InvalidTransition(state)) => SessionError::InvalidState {
                    operation,
                    state: *state,
                },
                None => SessionError::storage(e),
            };
            debug!(operation, kind = error.kind(), error = %error, "Transition refused");
            let event = match next {
                SessionState::Renewing => SessionEvent::SilentRenewError(error.clone()),
                _ => SessionEvent::SigninError(error.clone()),
            };
            self.inner.events.emit(event);
            error
        })
    }

    fn interactive_request(&self, kind: SigninKind, redirect_uri: String, args: &SigninArgs) -> SigninRequest {
        let config = &self.inner.config;
        SigninRequest::new(
            kind,
            redirect_uri,
            args.scope.clone().unwrap_or_else(|| config.scope.clone()),
            args.response_type
                .clone()
                .unwrap_or_else(|| config.response_type.clone()),
        )
    }

    fn save_request(&self, request: &SigninRequest) -> Result<(), SessionError> {
        self.inner
            .store
            .save_request(request)
            .map_err(SessionError::storage)
    }

    fn discard_request(&self, request: &SigninRequest) {
        if let Err(e) = self.inner.store.take_request(&request.state) {
            debug!(error = %e, "Failed to discard sign-in request");
        }
    }

    fn authorize_url(&self, request: &SigninRequest, extra: &[(&str, &str)]) -> String {
        let config = &self.inner.config;
        let mut params = vec![
            ("client_id", config.client_id.as_str()),
            ("redirect_uri", request.redirect_uri.as_str()),
            ("response_type", request.response_type.as_str()),
            ("scope", request.scope.as_str()),
            ("state", request.state.as_str()),
            ("nonce", request.nonce.as_str()),
        ];
        params.extend_from_slice(extra);
        with_query(&config.authorization_endpoint(), &params)
    }

    /// Turn a callback URL into a token set for the matching pending request.
    async fn complete_signin(&self, url: &str, kind: SigninKind) -> Result<TokenSet, SessionError> {
        let response = AuthorizeResponse::from_url(url)?;

        let state = response
            .state
            .as_deref()
            .ok_or_else(|| SessionError::CallbackParse("response carries no state".to_string()))?;
        let request = self
            .inner
            .store
            .take_request(state)
            .map_err(SessionError::storage)?
            .ok_or_else(|| SessionError::CallbackParse("no matching sign-in request".to_string()))?;

        if request.kind != kind {
            return Err(SessionError::CallbackParse(format!(
                "response belongs to a {:?} sign-in",
                request.kind
            )));
        }

        if let Some(error) = response.error {
            let description = response.error_description;
            return Err(match kind {
                SigninKind::Silent => SessionError::RenewalRejected { error, description },
                SigninKind::Redirect | SigninKind::Popup => SessionError::SigninRejected { error, description },
            });
        }

        let id_claims = match &response.id_token {
            Some(id_token) => {
                let claims = decode_jwt_payload(id_token)?;
                if claims.get("nonce").and_then(Value::as_str) != Some(request.nonce.as_str()) {
                    return Err(SessionError::CallbackParse("nonce mismatch".to_string()));
                }
                claims
            }
            None if request.expects("id_token") => {
                return Err(SessionError::CallbackParse("response carries no id_token".to_string()))
            }
            None => Map::new(),
        };

        if request.expects("token") && response.access_token.is_none() {
            return Err(SessionError::CallbackParse("response carries no access_token".to_string()));
        }

        let expires_at = derive_expires_at(
            response.access_token.as_deref(),
            response.expires_in,
            &id_claims,
            Utc::now(),
        )?;

        let mut claims = id_claims;
        if self.inner.config.load_user_info {
            if let Some(access_token) = response.access_token.as_deref() {
                let user_info = self.inner.provider.user_info(access_token).await?;
                merge_user_info(&mut claims, user_info)?;
            }
        }
        if self.inner.config.filter_protocol_claims {
            filter_protocol_claims(&mut claims);
        }

        let scope = response
            .scope
            .as_deref()
            .unwrap_or(&request.scope)
            .split_whitespace()
            .map(str::to_string)
            .collect();

        Ok(TokenSet::new(
            response.id_token,
            response.access_token,
            response.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_at,
            scope,
            claims,
        ))
    }

    /// Commit `user` if the session is still at `epoch`, then re-arm the timer.
    fn install(&self, epoch: u64, user: TokenSet) -> Result<TokenSet, SessionError> {
        match self.inner.store.replace_if_epoch(epoch, user.clone()) {
            Ok(Some(new_epoch)) => {
                self.arm_expiry_timer(new_epoch, &user);
                info!(
                    subject = user.subject().unwrap_or_default(),
                    expires_at = %user.expires_at(),
                    "User loaded"
                );
                self.inner.events.emit(SessionEvent::UserLoaded(user.clone()));
                Ok(user)
            }
            Ok(None) => Err(SessionError::Superseded),
            Err(e) => Err(SessionError::storage(e)),
        }
    }

    fn signin_failed(&self, epoch: u64, error: SessionError) -> SessionError {
        if error == SessionError::Superseded {
            debug!("Discarding sign-in result, session changed meanwhile");
            return error;
        }

        warn!(kind = error.kind(), error = %error, "Sign-in failed");
        match self.inner.store.reset_if_epoch(epoch, SessionState::SignedOut) {
            Ok(true) => self.inner.events.emit(SessionEvent::SigninError(error.clone())),
            Ok(false) => debug!("Sign-in failure superseded by a later transition"),
            Err(e) => {
                warn!(error = %e, "Failed to remove persisted session after sign-in failure");
                self.inner.events.emit(SessionEvent::SigninError(error.clone()));
            }
        }
        error
    }

    fn renewal_failed(&self, epoch: u64, error: SessionError) -> SessionError {
        if error == SessionError::Superseded {
            debug!("Discarding renewal result, session changed meanwhile");
            return error;
        }

        warn!(kind = error.kind(), error = %error, "Silent renewal failed");
        let expired = match self.inner.store.expire_if_epoch(epoch) {
            Ok(expired) => expired,
            Err(e) => {
                warn!(error = %e, "Failed to remove persisted session after renewal failure");
                true
            }
        };
        if expired {
            self.cancel_expiry_timer();
            self.inner.events.emit(SessionEvent::SilentRenewError(error.clone()));
        } else {
            debug!("Renewal failure superseded by a later transition");
        }
        error
    }

    /// Arm the single expiry timer for `user`, cancelling the previous one.
    fn arm_expiry_timer(&self, epoch: u64, user: &TokenSet) {
        let remaining = (user.expires_at() - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let until_expiring = remaining.saturating_sub(self.inner.config.expiring_notification());
        let until_expired = remaining - until_expiring;

        debug!(
            epoch,
            expiring_in_secs = until_expiring.as_secs(),
            "Arming expiry timer"
        );

        let timer = tokio::spawn(run_expiry_timer(
            Arc::downgrade(&self.inner),
            epoch,
            until_expiring,
            until_expired,
        ));
        self.replace_timer(Some(timer));
    }

    fn cancel_expiry_timer(&self) {
        self.replace_timer(None);
    }

    fn replace_timer(&self, next: Option<JoinHandle<()>>) {
        let mut slot = self
            .inner
            .expiry_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = std::mem::replace(&mut *slot, next) {
            previous.abort();
        }
    }
}

async fn run_expiry_timer(inner: Weak<Inner>, epoch: u64, until_expiring: Duration, until_expired: Duration) {
    tokio::time::sleep(until_expiring).await;

    let Some(strong) = inner.upgrade() else {
        return;
    };
    if strong.store.epoch() != epoch {
        return;
    }

    info!("Access token expiring");
    strong.events.emit(SessionEvent::AccessTokenExpiring);

    if strong.config.automatic_silent_renew {
        let manager = SessionManager { inner: strong };
        // Detached from the timer: installing the renewed set aborts this task.
        tokio::spawn(async move {
            if let Err(e) = manager.signin_silent().await {
                debug!(kind = e.kind(), "Automatic silent renewal did not complete");
            }
        });
        return;
    }
    drop(strong);

    tokio::time::sleep(until_expired).await;

    let Some(strong) = inner.upgrade() else {
        return;
    };
    match strong.store.expire_if_epoch(epoch) {
        Ok(true) => {
            info!("Access token expired");
            strong.events.emit(SessionEvent::AccessTokenExpired);
        }
        Ok(false) => {}
        Err(e) => warn!(error = %e, "Failed to expire session"),
    }
}

fn merge_user_info(claims: &mut Map<String, Value>, user_info: Map<String, Value>) -> Result<(), SessionError> {
    if let (Some(expected), Some(actual)) = (claims.get("sub"), user_info.get("sub")) {
        if expected != actual {
            return Err(SessionError::UserInfo("userinfo subject does not match id_token".to_string()));
        }
    }
    claims.extend(user_info);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::provider::{ChannelUserAgent, NavigationRequest};
    use async_trait::async_trait;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    const REDIRECT_URI: &str = "http://localhost:5003/callback.html";
    const SILENT_URI: &str = "http://localhost:5003/silent.html";

    #[derive(Default)]
    struct MockProvider {
        revoked: Mutex<Vec<String>>,
        fail_revoke: AtomicBool,
        user_info: Mutex<Option<Map<String, Value>>>,
    }

    #[async_trait]
    impl ProviderClient for MockProvider {
        async fn revoke_access_token(&self, access_token: &str) -> Result<(), SessionError> {
            self.revoked.lock().unwrap().push(access_token.to_string());
            if self.fail_revoke.load(Ordering::SeqCst) {
                return Err(SessionError::RevocationFailed("status 500".to_string()));
            }
            Ok(())
        }

        async fn user_info(&self, _access_token: &str) -> Result<Map<String, Value>, SessionError> {
            self.user_info
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| SessionError::UserInfo("status 401".to_string()))
        }
    }

    struct Harness {
        manager: SessionManager,
        host: mpsc::UnboundedReceiver<NavigationRequest>,
        provider: Arc<MockProvider>,
        events: broadcast::Receiver<SessionEvent>,
    }

    fn client_config() -> ClientConfig {
        ClientConfig {
            authority: "http://localhost:5000".to_string(),
            client_id: "js".to_string(),
            redirect_uri: REDIRECT_URI.to_string(),
            silent_redirect_uri: Some(SILENT_URI.to_string()),
            post_logout_redirect_uri: Some("http://localhost:5003/index.html".to_string()),
            automatic_silent_renew: false,
            load_user_info: false,
            ..Default::default()
        }
    }

    fn harness(config: ClientConfig) -> Harness {
        let (agent, host) = ChannelUserAgent::new();
        let provider = Arc::new(MockProvider::default());
        let manager = SessionManager::new(
            config,
            Arc::new(SessionStore::in_memory()),
            Arc::new(agent),
            Arc::clone(&provider) as Arc<dyn ProviderClient>,
        )
        .unwrap();
        let events = manager.events();
        Harness {
            manager,
            host,
            provider,
            events,
        }
    }

    fn unsigned_jwt(claims: &Value) -> String {
        format!(
            "{}.{}.c2ln",
            URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap())
        )
    }

    fn query_param(url: &str, name: &str) -> Option<String> {
        let (_, query) = url.split_once('?')?;
        query.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == name).then(|| urlencoding::decode(value).unwrap().into_owned())
        })
    }

    fn callback_url(base: &str, authorize_url: &str, expires_in: u64) -> String {
        let state = query_param(authorize_url, "state").unwrap();
        let nonce = query_param(authorize_url, "nonce").unwrap();
        let id_token = unsigned_jwt(&json!({
            "iss": "http://localhost:5000",
            "aud": "js",
            "sub": "818727",
            "name": "Alice Smith",
            "nonce": nonce,
            "exp": Utc::now().timestamp() + expires_in as i64,
        }));
        format!(
            "{}#id_token={}&access_token=at-{}&token_type=Bearer&expires_in={}&scope=openid%20profile%20api1&state={}",
            base, id_token, state, expires_in, state
        )
    }

    fn event_names(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        names
    }

    async fn next_url(host: &mut mpsc::UnboundedReceiver<NavigationRequest>) -> String {
        host.recv().await.unwrap().url().to_string()
    }

    async fn sign_in(h: &mut Harness, expires_in: u64) -> TokenSet {
        h.manager.signin_redirect(SigninArgs::default()).await.unwrap();
        let authorize = next_url(&mut h.host).await;
        let user = h
            .manager
            .signin_redirect_callback(&callback_url(REDIRECT_URI, &authorize, expires_in))
            .await
            .unwrap();
        assert_eq!(next_url(&mut h.host).await, REDIRECT_URI);
        user
    }

    /// Run a silent renewal and answer its frame with `answer(authorize_url)`.
    async fn renew_with(
        h: &mut Harness,
        answer: impl FnOnce(&str) -> Result<String, String>,
    ) -> Result<TokenSet, SessionError> {
        let manager = h.manager.clone();
        let renewal = tokio::spawn(async move { manager.signin_silent().await });
        match h.host.recv().await.unwrap() {
            NavigationRequest::SilentFrame { url, reply } => {
                reply.send(answer(&url)).unwrap();
            }
            other => panic!("unexpected navigation: {:?}", other),
        }
        renewal.await.unwrap()
    }

    #[tokio::test]
    async fn test_signin_redirect_flow() {
        let mut h = harness(client_config());

        h.manager.signin_redirect(SigninArgs::default()).await.unwrap();
        assert_eq!(h.manager.state(), SessionState::Authenticating);

        let authorize = next_url(&mut h.host).await;
        assert!(authorize.starts_with("http://localhost:5000/connect/authorize?"));
        assert_eq!(query_param(&authorize, "client_id").as_deref(), Some("js"));
        assert_eq!(query_param(&authorize, "redirect_uri").as_deref(), Some(REDIRECT_URI));
        assert_eq!(query_param(&authorize, "response_type").as_deref(), Some("id_token token"));
        assert_eq!(query_param(&authorize, "scope").as_deref(), Some("openid profile email api1"));
        assert_eq!(query_param(&authorize, "prompt"), None);

        let user = h
            .manager
            .signin_redirect_callback(&callback_url(REDIRECT_URI, &authorize, 3600))
            .await
            .unwrap();

        assert_eq!(h.manager.state(), SessionState::Authenticated);
        assert_eq!(h.manager.get_user(), Some(user.clone()));
        assert_eq!(user.subject(), Some("818727"));
        assert_eq!(user.claims()["name"], "Alice Smith");
        assert!(user.scope().contains("api1"));
        assert!(user.expires_in() > 3590);
        assert_eq!(event_names(&mut h.events), vec!["user_loaded"]);

        // Fragment is cleared from the location.
        assert_eq!(next_url(&mut h.host).await, REDIRECT_URI);
    }

    #[tokio::test]
    async fn test_signin_args_override() {
        let mut h = harness(client_config());

        h.manager
            .signin_redirect(SigninArgs {
                scope: Some("openid".to_string()),
                response_type: Some("id_token".to_string()),
            })
            .await
            .unwrap();

        let authorize = next_url(&mut h.host).await;
        assert_eq!(query_param(&authorize, "scope").as_deref(), Some("openid"));
        assert_eq!(query_param(&authorize, "response_type").as_deref(), Some("id_token"));
    }

    #[tokio::test]
    async fn test_callback_cannot_be_replayed() {
        let mut h = harness(client_config());
        h.manager.signin_redirect(SigninArgs::default()).await.unwrap();
        let authorize = next_url(&mut h.host).await;
        let callback = callback_url(REDIRECT_URI, &authorize, 3600);

        h.manager.signin_redirect_callback(&callback).await.unwrap();
        h.manager.handle_external_signout().await.unwrap();
        event_names(&mut h.events);

        let err = h.manager.signin_redirect_callback(&callback).await.unwrap_err();
        assert!(matches!(err, SessionError::CallbackParse(_)));
        assert_eq!(h.manager.state(), SessionState::SignedOut);
        assert!(h.manager.get_user().is_none());
        assert_eq!(event_names(&mut h.events), vec!["signin_error"]);
    }

    #[tokio::test]
    async fn test_nonce_mismatch_rejected() {
        let mut h = harness(client_config());
        h.manager.signin_redirect(SigninArgs::default()).await.unwrap();
        let authorize = next_url(&mut h.host).await;
        let tampered = authorize.replace("nonce=", "nonce=x");

        let err = h
            .manager
            .signin_redirect_callback(&callback_url(REDIRECT_URI, &tampered, 3600))
            .await
            .unwrap_err();

        assert_eq!(err, SessionError::CallbackParse("nonce mismatch".to_string()));
        assert_eq!(h.manager.state(), SessionState::SignedOut);
    }

    #[tokio::test]
    async fn test_provider_error_rejects_signin() {
        let mut h = harness(client_config());
        h.manager.signin_redirect(SigninArgs::default()).await.unwrap();
        let authorize = next_url(&mut h.host).await;
        let state = query_param(&authorize, "state").unwrap();

        let err = h
            .manager
            .signin_redirect_callback(&format!(
                "{}#error=access_denied&error_description=User%20denied&state={}",
                REDIRECT_URI, state
            ))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            SessionError::SigninRejected {
                error: "access_denied".to_string(),
                description: Some("User denied".to_string()),
            }
        );
        assert_eq!(h.manager.state(), SessionState::SignedOut);
        assert_eq!(event_names(&mut h.events), vec!["signin_error"]);
    }

    #[tokio::test]
    async fn test_signin_refused_while_authenticated() {
        let mut h = harness(client_config());
        sign_in(&mut h, 3600).await;

        let err = h.manager.signin_redirect(SigninArgs::default()).await.unwrap_err();
        assert_eq!(
            err,
            SessionError::InvalidState {
                operation: "signin_redirect",
                state: SessionState::Authenticated,
            }
        );
        assert_eq!(h.manager.state(), SessionState::Authenticated);
        assert_eq!(event_names(&mut h.events), vec!["user_loaded", "signin_error"]);
    }

    #[tokio::test]
    async fn test_renewal_refused_while_signed_out() {
        let mut h = harness(client_config());

        let err = h.manager.signin_silent().await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidState { operation: "signin_silent", .. }));
        assert_eq!(h.manager.state(), SessionState::SignedOut);
        assert_eq!(event_names(&mut h.events), vec!["silent_renew_error"]);
    }

    #[tokio::test]
    async fn test_out_of_range_lifetime_fails_signin() {
        let mut h = harness(client_config());
        h.manager.signin_redirect(SigninArgs::default()).await.unwrap();
        let authorize = next_url(&mut h.host).await;
        let callback = callback_url(REDIRECT_URI, &authorize, 3600)
            .replace("expires_in=3600", "expires_in=18446744073709551615");

        let err = h.manager.signin_redirect_callback(&callback).await.unwrap_err();

        assert_eq!(err, SessionError::CallbackParse("invalid expires_in".to_string()));
        assert_eq!(h.manager.state(), SessionState::SignedOut);
        assert!(h.manager.get_user().is_none());
        assert_eq!(event_names(&mut h.events), vec!["signin_error"]);
    }

    #[tokio::test]
    async fn test_signin_popup() {
        let mut h = harness(client_config());
        let manager = h.manager.clone();
        let signin = tokio::spawn(async move { manager.signin_popup(SigninArgs::default()).await });

        match h.host.recv().await.unwrap() {
            NavigationRequest::Popup { url, features, reply } => {
                assert!(features.contains("width=1200"));
                reply.send(Ok(callback_url(REDIRECT_URI, &url, 3600))).unwrap();
            }
            other => panic!("unexpected navigation: {:?}", other),
        }

        let user = signin.await.unwrap().unwrap();
        assert_eq!(user.subject(), Some("818727"));
        assert_eq!(h.manager.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn test_popup_closed() {
        let mut h = harness(client_config());
        let manager = h.manager.clone();
        let signin = tokio::spawn(async move { manager.signin_popup(SigninArgs::default()).await });

        drop(h.host.recv().await.unwrap());

        let err = signin.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Navigation(_)));
        assert_eq!(h.manager.state(), SessionState::SignedOut);
        assert_eq!(h.manager.store().pending_requests(), 0);
        assert_eq!(event_names(&mut h.events), vec!["signin_error"]);
    }

    #[tokio::test]
    async fn test_silent_renewal_replaces_token_set() {
        let mut h = harness(client_config());
        let first = sign_in(&mut h, 3600).await;
        event_names(&mut h.events);

        let second = renew_with(&mut h, |url| {
            assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A5003%2Fsilent.html"));
            assert_eq!(query_param(url, "prompt").as_deref(), Some("none"));
            assert_eq!(query_param(url, "id_token_hint").as_deref(), first.id_token());
            Ok(callback_url(SILENT_URI, url, 3600))
        })
        .await
        .unwrap();

        assert_ne!(first.access_token(), second.access_token());
        assert_eq!(h.manager.get_user(), Some(second));
        assert_eq!(h.manager.state(), SessionState::Authenticated);
        assert_eq!(event_names(&mut h.events), vec!["user_loaded"]);
    }

    #[tokio::test]
    async fn test_silent_renewal_rejected() {
        let mut h = harness(client_config());
        sign_in(&mut h, 3600).await;
        event_names(&mut h.events);

        let err = renew_with(&mut h, |url| {
            let state = query_param(url, "state").unwrap();
            Ok(format!("{}#error=login_required&state={}", SILENT_URI, state))
        })
        .await
        .unwrap_err();

        assert_eq!(
            err,
            SessionError::RenewalRejected {
                error: "login_required".to_string(),
                description: None,
            }
        );
        assert_eq!(h.manager.state(), SessionState::Expired);
        assert!(h.manager.get_user().is_none());
        assert_eq!(event_names(&mut h.events), vec!["silent_renew_error"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_renewal_times_out() {
        let mut h = harness(client_config());
        sign_in(&mut h, 3600).await;
        event_names(&mut h.events);

        let manager = h.manager.clone();
        let renewal = tokio::spawn(async move { manager.signin_silent().await });
        // Keep the frame alive but never answer.
        let _frame = h.host.recv().await.unwrap();

        let err = renewal.await.unwrap().unwrap_err();
        assert_eq!(err, SessionError::RenewalTimeout);
        assert_eq!(h.manager.state(), SessionState::Expired);
        assert_eq!(h.manager.store().pending_requests(), 0);
        assert_eq!(event_names(&mut h.events), vec!["silent_renew_error"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacing_token_set_rearms_single_timer() {
        let mut h = harness(client_config());
        sign_in(&mut h, 100).await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        renew_with(&mut h, |url| Ok(callback_url(SILENT_URI, url, 100)))
            .await
            .unwrap();
        event_names(&mut h.events);

        // The first token's notification (t=40) never fires.
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert!(event_names(&mut h.events).is_empty());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(event_names(&mut h.events), vec!["access_token_expiring"]);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(event_names(&mut h.events), vec!["access_token_expired"]);
        assert_eq!(h.manager.state(), SessionState::Expired);
        assert!(h.manager.get_user().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiring_triggers_automatic_renewal() {
        let mut h = harness(ClientConfig {
            automatic_silent_renew: true,
            ..client_config()
        });
        sign_in(&mut h, 3600).await;
        event_names(&mut h.events);

        tokio::time::sleep(Duration::from_secs(3541)).await;

        match h.host.recv().await.unwrap() {
            NavigationRequest::SilentFrame { url, reply } => {
                reply.send(Ok(callback_url(SILENT_URI, &url, 3600))).unwrap();
            }
            other => panic!("unexpected navigation: {:?}", other),
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            event_names(&mut h.events),
            vec!["access_token_expiring", "user_loaded"]
        );
        assert_eq!(h.manager.state(), SessionState::Authenticated);
        assert!(h.manager.get_user().unwrap().expires_in() > 3590);
    }

    #[tokio::test]
    async fn test_signout_invalidates_inflight_renewal() {
        let mut h = harness(client_config());
        let user = sign_in(&mut h, 3600).await;
        event_names(&mut h.events);

        let manager = h.manager.clone();
        let renewal = tokio::spawn(async move { manager.signin_silent().await });
        let (frame_url, reply) = match h.host.recv().await.unwrap() {
            NavigationRequest::SilentFrame { url, reply } => (url, reply),
            other => panic!("unexpected navigation: {:?}", other),
        };
        assert_eq!(h.manager.state(), SessionState::Renewing);

        h.manager.signout_redirect().await.unwrap();
        let end_session = next_url(&mut h.host).await;
        assert!(end_session.starts_with("http://localhost:5000/connect/endsession?"));
        assert_eq!(query_param(&end_session, "id_token_hint").as_deref(), user.id_token());
        assert_eq!(
            query_param(&end_session, "post_logout_redirect_uri").as_deref(),
            Some("http://localhost:5003/index.html")
        );

        // The renewal completes after sign-out.
        reply.send(Ok(callback_url(SILENT_URI, &frame_url, 3600))).unwrap();
        assert_eq!(renewal.await.unwrap().unwrap_err(), SessionError::Superseded);

        assert_eq!(h.manager.state(), SessionState::SignedOut);
        assert!(h.manager.get_user().is_none());
        assert_eq!(event_names(&mut h.events), vec!["user_unloaded"]);
        assert_eq!(
            *h.provider.revoked.lock().unwrap(),
            vec![user.access_token().unwrap().to_string()]
        );
    }

    #[tokio::test]
    async fn test_signout_survives_revocation_failure() {
        let mut h = harness(client_config());
        sign_in(&mut h, 3600).await;
        h.provider.fail_revoke.store(true, Ordering::SeqCst);

        h.manager.signout_redirect().await.unwrap();

        assert_eq!(h.manager.state(), SessionState::SignedOut);
        assert!(h.manager.get_user().is_none());
        assert!(next_url(&mut h.host).await.contains("connect/endsession"));
    }

    #[tokio::test]
    async fn test_signout_with_failing_storage_still_clears() {
        let mut h = harness(client_config());
        let user = sign_in(&mut h, 3600).await;
        event_names(&mut h.events);

        let manager = h.manager.clone();
        let renewal = tokio::spawn(async move { manager.signin_silent().await });
        let (frame_url, reply) = match h.host.recv().await.unwrap() {
            NavigationRequest::SilentFrame { url, reply } => (url, reply),
            other => panic!("unexpected navigation: {:?}", other),
        };

        h.manager.store().set_fail_writes(true);
        h.manager.signout_redirect().await.unwrap();
        h.manager.store().set_fail_writes(false);

        assert_eq!(h.manager.state(), SessionState::SignedOut);
        assert!(h.manager.get_user().is_none());
        let end_session = next_url(&mut h.host).await;
        assert_eq!(query_param(&end_session, "id_token_hint").as_deref(), user.id_token());

        reply.send(Ok(callback_url(SILENT_URI, &frame_url, 3600))).unwrap();
        assert_eq!(renewal.await.unwrap().unwrap_err(), SessionError::Superseded);
        assert!(h.manager.get_user().is_none());
        assert_eq!(event_names(&mut h.events), vec!["user_unloaded"]);
    }

    #[tokio::test]
    async fn test_revoke_access_token() {
        let mut h = harness(client_config());
        sign_in(&mut h, 3600).await;
        event_names(&mut h.events);

        h.provider.fail_revoke.store(true, Ordering::SeqCst);
        let err = h.manager.revoke_access_token().await.unwrap_err();
        assert!(matches!(err, SessionError::RevocationFailed(_)));
        assert_eq!(h.manager.state(), SessionState::Authenticated);
        assert!(h.manager.get_user().is_some());

        h.provider.fail_revoke.store(false, Ordering::SeqCst);
        h.manager.revoke_access_token().await.unwrap();
        assert_eq!(h.manager.state(), SessionState::SignedOut);
        assert!(h.manager.get_user().is_none());
        assert_eq!(event_names(&mut h.events), vec!["user_unloaded"]);
        assert_eq!(h.provider.revoked.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_external_signout() {
        let mut h = harness(client_config());
        sign_in(&mut h, 3600).await;
        event_names(&mut h.events);

        h.manager.handle_external_signout().await.unwrap();

        assert_eq!(h.manager.state(), SessionState::SignedOut);
        assert!(h.manager.get_user().is_none());
        assert_eq!(event_names(&mut h.events), vec!["user_signed_out"]);
        assert!(h.provider.revoked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_user_info_merged_and_protocol_claims_filtered() {
        let mut h = harness(ClientConfig {
            load_user_info: true,
            filter_protocol_claims: true,
            ..client_config()
        });
        *h.provider.user_info.lock().unwrap() = Some(
            json!({"sub": "818727", "email": "alice@example.com"})
                .as_object()
                .unwrap()
                .clone(),
        );

        let user = sign_in(&mut h, 3600).await;

        assert_eq!(user.claims()["email"], "alice@example.com");
        assert_eq!(user.claims()["name"], "Alice Smith");
        for claim in ["nonce", "exp", "aud", "iss"] {
            assert!(!user.claims().contains_key(claim), "{} should be filtered", claim);
        }
        // Filtering does not touch the derived expiry.
        assert!(user.expires_in() > 3590);
    }

    #[test]
    fn test_merge_user_info_subject_mismatch() {
        let mut claims = json!({"sub": "818727"}).as_object().unwrap().clone();
        let other = json!({"sub": "88421113"}).as_object().unwrap().clone();

        assert!(matches!(
            merge_user_info(&mut claims, other),
            Err(SessionError::UserInfo(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_uses_stale_state_age() {
        let h = harness(ClientConfig {
            stale_state_age_secs: 120,
            ..client_config()
        });
        let store = h.manager.store();

        let mut abandoned = SigninRequest::new(
            SigninKind::Popup,
            REDIRECT_URI.to_string(),
            "openid".to_string(),
            "id_token token".to_string(),
        );
        abandoned.created_at = Utc::now() - chrono::Duration::seconds(180);
        let mut recent = abandoned.clone();
        recent.state = "recent".to_string();
        recent.created_at = Utc::now() - chrono::Duration::seconds(60);
        store.save_request(&abandoned).unwrap();
        store.save_request(&recent).unwrap();

        let cleanup = h.manager.spawn_cleanup(1);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        cleanup.abort();

        assert_eq!(store.pending_requests(), 1);
        assert!(store.take_request("recent").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let (agent, _host) = ChannelUserAgent::new();
        let result = SessionManager::new(
            ClientConfig::default(),
            Arc::new(SessionStore::in_memory()),
            Arc::new(agent),
            Arc::new(MockProvider::default()),
        );
        assert!(result.is_err());
    }
}
