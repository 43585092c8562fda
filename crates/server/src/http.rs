//! HTTP endpoints
//!
//! Router assembly plus the service-info, health, and cache/token ops
//! endpoints. The `/v1` POST endpoints sit behind bearer auth; everything
//! else is open.

use axum::{
    extract::State,
    middleware,
    routing::{get, post},
    Json, Router,
};
use std::time::{SystemTime, UNIX_EPOCH};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::auth_middleware;
use crate::state::AppState;
use crate::{chat, speech};

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/audio/speech", post(speech::create_speech))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .merge(protected)
        .route("/", get(root_info))
        .route("/health", get(health))
        .route("/cache/stats", get(cache_stats))
        .route("/cache/clear", post(clear_cache))
        .route("/tokens/stats", get(token_stats))
        .route("/v1/models", get(list_models))
        .route("/v1/audio/models", get(speech::list_tts_models))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// OpenAI-style error envelope.
pub(crate) fn error_body(message: &str, error_type: &str, code: &str) -> serde_json::Value {
    serde_json::json!({
        "error": {
            "message": message,
            "type": error_type,
            "code": code,
        }
    })
}

/// Service info
async fn root_info() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "tts-proxy",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "TTS accelerating proxy with token rotation and LLM chat forwarding",
    }))
}

/// Health check with cache and client statistics
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "cache_stats": state.cache.stats(),
        "tts_client_stats": state.tts_client.stats(),
    }))
}

/// Cache statistics
async fn cache_stats(State(state): State<AppState>) -> Json<tts_proxy_pipeline::CacheStats> {
    Json(state.cache.stats())
}

/// Drop all cache entries and segment mappings
async fn clear_cache(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.cache.clear();
    Json(serde_json::json!({
        "status": "success",
        "message": "Cache cleared",
    }))
}

/// Token rotation statistics
async fn token_stats(State(state): State<AppState>) -> Json<tts_proxy_pipeline::RotatorStats> {
    Json(state.rotator.stats())
}

/// `GET /v1/models` - OpenAI compatible model listing
async fn list_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    let created = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    Json(serde_json::json!({
        "object": "list",
        "data": [
            {
                "id": state.config.tts.default_model,
                "object": "model",
                "created": created,
                "owned_by": "tts-proxy",
            }
        ]
    }))
}
