//! Basic authentication middleware
//!
//! Credentials are checked against the admin user of the active config, so a
//! reload that changes them takes effect on the next request.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use tracing::{debug, warn};

use crate::api::state::ApiState;

/// Authentication middleware
///
/// An empty admin user and password disable the check.
pub async fn basic_auth(
    State(state): State<ApiState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let config = state.manager.config().await.map_err(|e| {
        warn!("cannot read admin credentials: {e}");
        AuthError::Unavailable
    })?;

    if config.admin_user.is_empty() && config.admin_pwd.is_empty() {
        return Ok(next.run(request).await);
    }

    let header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MissingCredentials)?;

    let (user, password) = decode_basic(header).ok_or(AuthError::InvalidFormat)?;
    if user != config.admin_user || password != config.admin_pwd {
        debug!("rejected credentials for {user}");
        return Err(AuthError::InvalidCredentials);
    }

    Ok(next.run(request).await)
}

/// Split a `Basic <base64 user:password>` header value
fn decode_basic(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// Authentication errors
#[derive(Debug)]
pub enum AuthError {
    MissingCredentials,
    InvalidFormat,
    InvalidCredentials,
    Unavailable,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        if let AuthError::Unavailable = self {
            return (StatusCode::SERVICE_UNAVAILABLE, "hub is shutting down").into_response();
        }

        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, r#"Basic realm="Restricted""#)],
            "Unauthorized",
        )
            .into_response()
    }
}
