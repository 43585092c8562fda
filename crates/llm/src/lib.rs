//! Chat-completion upstream proxy
//!
//! Forwards chat requests to the configured OpenAI-compatible upstream and
//! exposes the response as a stream of SSE lines, plus the helper that pulls
//! delta text out of those lines for the speculative TTS path.

pub mod proxy;

pub use proxy::{extract_content_from_sse, ChatProxyClient, ChatProxyConfig};

use thiserror::Error;

/// LLM proxy errors
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("API error: {0}")]
    Api(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout")]
    Timeout,
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Network(err.to_string())
        }
    }
}
