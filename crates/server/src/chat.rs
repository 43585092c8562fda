//! Chat completions reverse proxy
//!
//! Forwards the request to the LLM upstream and relays the SSE stream to the
//! client unchanged. While the reply streams, the sentence splitter runs over
//! the delta content and every completed sentence is submitted to the TTS
//! cache, so the audio for the full reply is (mostly) ready by the time the
//! client asks to speak it.

use axum::{
    body::{Body, Bytes},
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::convert::Infallible;
use tokio::sync::mpsc;

use tts_proxy_llm::extract_content_from_sse;
use tts_proxy_pipeline::StreamingSplitter;

use crate::http::error_body;
use crate::state::AppState;

/// `POST /v1/chat/completions`
pub async fn chat_completions(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let tts_enabled = body
        .get("tts_enabled")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let tts_model = body
        .get("tts_model")
        .and_then(|v| v.as_str())
        .unwrap_or(&state.config.tts.default_model)
        .to_string();
    let is_stream = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);

    if is_stream {
        stream_response(state, body, tts_enabled, tts_model)
    } else {
        // The upstream is still consumed in streaming mode and aggregated,
        // so speculative synthesis starts before the reply is complete.
        match aggregate_response(state, body, tts_enabled, tts_model).await {
            Ok(response) => Json(response).into_response(),
            Err(message) => {
                tracing::error!("Chat request failed: {}", message);
                (
                    StatusCode::BAD_GATEWAY,
                    Json(error_body(
                        &format!("Upstream request failed: {}", message),
                        "upstream_error",
                        "upstream_failed",
                    )),
                )
                    .into_response()
            }
        }
    }
}

/// Relay the upstream SSE stream while splitting sentences for TTS.
fn stream_response(
    state: AppState,
    body: serde_json::Value,
    tts_enabled: bool,
    tts_model: String,
) -> Response {
    let (tx, mut rx) = mpsc::channel::<String>(64);

    let llm = state.llm.clone();
    tokio::spawn(async move {
        if let Err(e) = llm.stream_chat(body, tx.clone()).await {
            tracing::error!("Stream error: {}", e);
            let error_event = serde_json::json!({
                "error": { "message": e.to_string(), "type": "upstream_error" }
            });
            let _ = tx.send(format!("data: {}", error_event)).await;
        }
    });

    let cache = state.cache.clone();
    let splitter_config = state.config.splitter.clone();

    let stream = async_stream::stream! {
        let mut splitter = StreamingSplitter::new(splitter_config.max_len, splitter_config.min_len);
        let mut full_content = String::new();
        let mut segments: Vec<String> = Vec::new();

        while let Some(line) = rx.recv().await {
            if tts_enabled {
                if let Some(content) = extract_content_from_sse(&line) {
                    full_content.push_str(&content);
                    for sentence in splitter.feed(&content) {
                        if !sentence.is_empty() {
                            cache.submit(&sentence, &tts_model);
                            segments.push(sentence);
                        }
                    }
                }
            }
            yield Ok::<Bytes, Infallible>(Bytes::from(format!("{}\n\n", line)));
        }

        if tts_enabled {
            if let Some(remaining) = splitter.flush() {
                cache.submit(&remaining, &tts_model);
                segments.push(remaining);
            }

            let full_content = full_content.trim();
            if !full_content.is_empty() && !segments.is_empty() {
                cache.submit_with_segments(full_content, &segments, &tts_model);
                tracing::debug!(
                    "Registered segment mapping for streaming response: full_len={}, segments={}",
                    full_content.chars().count(),
                    segments.len()
                );
            }
        }
    };

    Response::builder()
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Aggregate the upstream stream into a single chat.completion response.
async fn aggregate_response(
    state: AppState,
    body: serde_json::Value,
    tts_enabled: bool,
    tts_model: String,
) -> Result<serde_json::Value, String> {
    let (tx, mut rx) = mpsc::channel::<String>(64);

    let llm = state.llm.clone();
    let upstream = tokio::spawn(async move { llm.stream_chat(body, tx).await });

    let mut splitter = StreamingSplitter::new(
        state.config.splitter.max_len,
        state.config.splitter.min_len,
    );
    let mut full_content = String::new();
    let mut segments: Vec<String> = Vec::new();
    let mut full_response: Option<serde_json::Value> = None;

    while let Some(line) = rx.recv().await {
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        if data == "[DONE]" {
            continue;
        }
        let Ok(chunk) = serde_json::from_str::<serde_json::Value>(data) else {
            continue;
        };

        if full_response.is_none() {
            full_response = Some(serde_json::json!({
                "id": chunk.get("id"),
                "object": "chat.completion",
                "created": chunk.get("created"),
                "model": chunk.get("model"),
                "choices": [{
                    "index": 0,
                    "message": { "role": "assistant", "content": "" },
                    "finish_reason": null,
                }],
                "usage": null,
            }));
        }

        if let Some(content) = extract_content_from_sse(&line) {
            full_content.push_str(&content);

            if tts_enabled {
                for sentence in splitter.feed(&content) {
                    if !sentence.is_empty() {
                        state.cache.submit(&sentence, &tts_model);
                        segments.push(sentence);
                    }
                }
            }
        }

        let finish_reason = chunk
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("finish_reason"))
            .filter(|reason| !reason.is_null());
        if let (Some(reason), Some(response)) = (finish_reason, full_response.as_mut()) {
            response["choices"][0]["finish_reason"] = reason.clone();
        }
    }

    match upstream.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e.to_string()),
        Err(e) => return Err(e.to_string()),
    }

    if tts_enabled {
        if let Some(remaining) = splitter.flush() {
            state.cache.submit(&remaining, &tts_model);
            segments.push(remaining);
        }

        let trimmed = full_content.trim();
        if !trimmed.is_empty() && !segments.is_empty() {
            state.cache.submit_with_segments(trimmed, &segments, &tts_model);
        }
    }

    let mut response = full_response.ok_or_else(|| "No response from upstream".to_string())?;
    response["choices"][0]["message"]["content"] = serde_json::Value::String(full_content);

    Ok(response)
}
