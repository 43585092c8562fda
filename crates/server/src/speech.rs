//! Speech synthesis endpoint
//!
//! Answers from the TTS cache: segment concatenation first, then the direct
//! entry (waiting on any in-flight generation), then on-demand synthesis.

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::http::error_body;
use crate::state::AppState;

/// OpenAI-compatible speech request
#[derive(Debug, Deserialize)]
pub struct SpeechRequest {
    /// TTS model; falls back to the configured default
    pub model: Option<String>,
    /// Text to synthesize
    pub input: String,
}

/// `POST /v1/audio/speech`
pub async fn create_speech(
    State(state): State<AppState>,
    Json(request): Json<SpeechRequest>,
) -> Response {
    let text = request.input.trim();
    if text.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(error_body(
                "Input text cannot be empty",
                "invalid_request_error",
                "invalid_input",
            )),
        )
            .into_response();
    }

    let model = request
        .model
        .unwrap_or_else(|| state.config.tts.default_model.clone());

    tracing::info!(
        "TTS request: model={}, text_len={}",
        model,
        text.chars().count()
    );

    let audio = state
        .cache
        .get(text, &model, state.config.tts.request_timeout(), true)
        .await;

    match audio {
        Some(audio) => Response::builder()
            .header("Content-Type", "audio/wav")
            .header("Content-Disposition", "attachment; filename=speech.wav")
            .body(audio.to_vec().into())
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(error_body(
                "Failed to generate audio",
                "server_error",
                "generation_failed",
            )),
        )
            .into_response(),
    }
}

/// `GET /v1/audio/models`
pub async fn list_tts_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "object": "list",
        "data": [
            {
                "id": state.config.tts.default_model,
                "object": "model",
                "owned_by": "tts-proxy",
            }
        ]
    }))
}
