//! Inbound authentication
//!
//! The `/v1` POST endpoints require `Authorization: Bearer <key>` matching
//! the configured upstream API key. Failures come back as OpenAI-style 401
//! error envelopes.

use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};

use crate::state::AppState;

/// Verify the bearer token on an incoming request.
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    let Some(header_value) = header_value else {
        tracing::warn!("Missing Authorization header");
        return unauthorized("Missing Authorization header", "missing_authorization");
    };

    let mut parts = header_value.split_whitespace();
    let token = match (parts.next(), parts.next(), parts.next()) {
        (Some(scheme), Some(token), None) if scheme.eq_ignore_ascii_case("bearer") => token,
        _ => {
            tracing::warn!("Invalid Authorization header format");
            return unauthorized(
                "Invalid Authorization header format. Expected: Bearer <token>",
                "invalid_authorization_format",
            );
        }
    };

    if token != state.config.llm.api_key {
        tracing::warn!("Invalid API key provided");
        return unauthorized("Invalid API key", "invalid_api_key");
    }

    next.run(request).await
}

fn unauthorized(message: &str, code: &str) -> Response {
    let body = Json(serde_json::json!({
        "error": {
            "message": message,
            "type": "authentication_error",
            "code": code,
        }
    }));
    let mut response = (StatusCode::UNAUTHORIZED, body).into_response();
    response
        .headers_mut()
        .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
    response
}
