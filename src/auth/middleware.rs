use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::config::AuthConfig;
use crate::error::ErrorResponse;
use crate::state::AppState;

/// Realm sent in `WWW-Authenticate`
pub const AUTH_REALM: &str = "cam-relay";

/// Basic auth middleware; a no-op unless `auth.enabled`
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let config = state.config.get();
    let raw_path = request.uri().path();
    // Mounted under /api, where Axum strips the prefix for the inner router
    let path = raw_path.strip_prefix("/api").unwrap_or(raw_path);

    if !config.auth.enabled || is_public_endpoint(path) {
        return next.run(request).await;
    }

    if check_basic_auth(request.headers(), &config.auth) {
        return next.run(request).await;
    }

    unauthorized_response("Authentication required")
}

/// Decode `Authorization: Basic ...` into `(username, password)`
pub fn parse_basic_auth(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

pub fn check_basic_auth(headers: &HeaderMap, auth: &AuthConfig) -> bool {
    match parse_basic_auth(headers) {
        Some((user, pass)) => {
            let user_ok = user.as_bytes().ct_eq(auth.username.as_bytes());
            let pass_ok = pass.as_bytes().ct_eq(auth.password.as_bytes());
            (user_ok & pass_ok).into()
        }
        None => false,
    }
}

fn unauthorized_response(message: &str) -> Response {
    let body = ErrorResponse {
        success: false,
        message: message.to_string(),
    };
    let mut response = (StatusCode::UNAUTHORIZED, Json(body)).into_response();
    if let Ok(challenge) = HeaderValue::from_str(&format!("Basic realm=\"{}\"", AUTH_REALM)) {
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, challenge);
    }
    response
}

/// Endpoints reachable without credentials
fn is_public_endpoint(path: &str) -> bool {
    matches!(path, "/ping")
}
