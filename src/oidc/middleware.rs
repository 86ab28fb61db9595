//! Bearer authentication for the protected API.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use std::sync::Arc;
use tracing::{debug, warn};

use super::validator::{Claims, TokenValidator};

/// Shared state for the bearer layer.
#[derive(Clone)]
pub struct ApiState {
    pub validator: Arc<TokenValidator>,
}

/// `/` is public; `/me` echoes the caller's validated claims.
pub fn router(validator: Arc<TokenValidator>) -> Router {
    let state = ApiState { validator };

    let protected = Router::new()
        .route("/me", get(me))
        .route_layer(middleware::from_fn_with_state(state, require_bearer));

    Router::new().route("/", get(root)).merge(protected)
}

async fn root() -> &'static str {
    "Hello"
}

async fn me(Extension(claims): Extension<Claims>) -> Json<Claims> {
    Json(claims)
}

/// Validates the bearer token and stores its claims as a request extension.
pub async fn require_bearer(State(state): State<ApiState>, mut req: Request, next: Next) -> Response {
    let Some(token) = extract_bearer_token(req.headers()) else {
        return unauthorized(false);
    };

    match state.validator.validate(&token).await {
        Ok(claims) => {
            req.extensions_mut().insert(claims);
            next.run(req).await
        }
        Err(e) => {
            if e.is_transient() {
                warn!(kind = e.kind(), error = %e, "Bearer token rejected");
            } else {
                debug!(kind = e.kind(), error = %e, "Bearer token rejected");
            }
            unauthorized(true)
        }
    }
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

fn unauthorized(token_presented: bool) -> Response {
    let challenge = if token_presented {
        r#"Bearer error="invalid_token""#
    } else {
        "Bearer"
    };
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, challenge)],
        Json(serde_json::json!({ "error": "unauthorized" })),
    )
        .into_response()
}
