//! End-to-end relying-party flow: sign-in, expiry notification, failed renewal.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use implicit_oidc::session::{
    ChannelUserAgent, ClientConfig, NavigationRequest, ProviderClient, SessionError, SessionEvent,
    SessionManager, SessionState, SessionStore, SigninArgs,
};

const CALLBACK: &str = "http://localhost:5003/callback.html";
const SILENT: &str = "http://localhost:5003/silent.html";

struct NoopProvider;

#[async_trait]
impl ProviderClient for NoopProvider {
    async fn revoke_access_token(&self, _access_token: &str) -> Result<(), SessionError> {
        Ok(())
    }

    async fn user_info(&self, _access_token: &str) -> Result<Map<String, Value>, SessionError> {
        Ok(Map::new())
    }
}

fn param(url: &str, name: &str) -> String {
    let (_, query) = url.split_once('?').unwrap();
    query
        .split('&')
        .find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == name).then(|| urlencoding::decode(value).unwrap().into_owned())
        })
        .unwrap()
}

fn id_token(nonce: &str, expires_in: i64) -> String {
    let claims = json!({
        "iss": "http://localhost:5000",
        "aud": "js",
        "sub": "88421113",
        "name": "Bob Smith",
        "email": "BobSmith@email.com",
        "nonce": nonce,
        "exp": Utc::now().timestamp() + expires_in,
    });
    format!(
        "{}.{}.sig",
        URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","kid":"signing-key-1"}"#),
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap())
    )
}

fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

async fn next(host: &mut mpsc::UnboundedReceiver<NavigationRequest>) -> NavigationRequest {
    host.recv().await.expect("user agent channel closed")
}

#[tokio::test(start_paused = true)]
async fn signin_then_failed_renewal_expires_session() {
    let (agent, mut host) = ChannelUserAgent::new();
    let manager = SessionManager::new(
        ClientConfig {
            authority: "http://localhost:5000".to_string(),
            client_id: "js".to_string(),
            redirect_uri: CALLBACK.to_string(),
            silent_redirect_uri: Some(SILENT.to_string()),
            ..Default::default()
        },
        Arc::new(SessionStore::in_memory()),
        Arc::new(agent),
        Arc::new(NoopProvider),
    )
    .unwrap();
    let mut events = manager.events();

    assert_eq!(manager.state(), SessionState::SignedOut);

    // Sign in.
    manager.signin_redirect(SigninArgs::default()).await.unwrap();
    let authorize = match next(&mut host).await {
        NavigationRequest::Redirect { url } => url,
        other => panic!("expected redirect, got {:?}", other),
    };
    let state = param(&authorize, "state");
    let nonce = param(&authorize, "nonce");

    let callback = format!(
        "{}#id_token={}&access_token=opaque-access-token&token_type=Bearer&expires_in=3600&scope=openid%20profile%20email%20api1&state={}",
        CALLBACK,
        id_token(&nonce, 3600),
        state
    );
    let user = manager.signin_redirect_callback(&callback).await.unwrap();

    assert_eq!(manager.state(), SessionState::Authenticated);
    let stored = manager.get_user().unwrap();
    assert_eq!(stored, user);
    assert_eq!(stored.subject(), Some("88421113"));
    assert_eq!(stored.claims()["name"], "Bob Smith");
    assert_eq!(stored.claims()["email"], "BobSmith@email.com");
    assert_eq!(stored.access_token(), Some("opaque-access-token"));
    assert!(matches!(next(&mut host).await, NavigationRequest::ReplaceLocation { url } if url == CALLBACK));
    assert!(matches!(drain(&mut events).as_slice(), [SessionEvent::UserLoaded(_)]));

    // Nothing happens before the renewal window.
    tokio::time::sleep(Duration::from_secs(3500)).await;
    assert!(drain(&mut events).is_empty());
    assert!(host.try_recv().is_err());

    // At expires_in - 60 a silent renewal is attempted.
    tokio::time::sleep(Duration::from_secs(41)).await;
    let (frame_url, reply) = match next(&mut host).await {
        NavigationRequest::SilentFrame { url, reply } => (url, reply),
        other => panic!("expected silent renewal, got {:?}", other),
    };
    assert!(frame_url.starts_with("http://localhost:5000/connect/authorize?"));
    assert_eq!(param(&frame_url, "prompt"), "none");
    assert_eq!(param(&frame_url, "redirect_uri"), SILENT);
    assert_eq!(manager.state(), SessionState::Renewing);

    // The provider refuses.
    reply
        .send(Ok(format!(
            "{}#error=login_required&state={}",
            SILENT,
            param(&frame_url, "state")
        )))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(manager.state(), SessionState::Expired);
    assert!(manager.get_user().is_none());

    let seen = drain(&mut events);
    assert!(matches!(seen.first(), Some(SessionEvent::AccessTokenExpiring)));
    let renew_errors: Vec<_> = seen
        .iter()
        .filter(|e| matches!(e, SessionEvent::SilentRenewError(_)))
        .collect();
    assert_eq!(renew_errors.len(), 1);
    assert_eq!(
        renew_errors[0],
        &SessionEvent::SilentRenewError(SessionError::RenewalRejected {
            error: "login_required".to_string(),
            description: None,
        })
    );

    // No timer is left to fire later.
    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert!(drain(&mut events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn renewal_that_never_answers_times_out_once() {
    let (agent, mut host) = ChannelUserAgent::new();
    let manager = SessionManager::new(
        ClientConfig {
            authority: "http://localhost:5000".to_string(),
            client_id: "js".to_string(),
            redirect_uri: CALLBACK.to_string(),
            silent_redirect_uri: Some(SILENT.to_string()),
            silent_renew_timeout_secs: 5,
            ..Default::default()
        },
        Arc::new(SessionStore::in_memory()),
        Arc::new(agent),
        Arc::new(NoopProvider),
    )
    .unwrap();
    let mut events = manager.events();

    manager.signin_redirect(SigninArgs::default()).await.unwrap();
    let authorize = next(&mut host).await;
    let callback = format!(
        "{}#id_token={}&access_token=at&token_type=Bearer&expires_in=120&state={}",
        CALLBACK,
        id_token(&param(authorize.url(), "nonce"), 120),
        param(authorize.url(), "state")
    );
    manager.signin_redirect_callback(&callback).await.unwrap();
    next(&mut host).await;

    // Renewal starts at t=60; hold the frame open without answering.
    tokio::time::sleep(Duration::from_secs(61)).await;
    let _frame = next(&mut host).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(manager.state(), SessionState::Expired);
    let renew_errors: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::SilentRenewError(SessionError::RenewalTimeout)))
        .collect();
    assert_eq!(renew_errors.len(), 1);
}
