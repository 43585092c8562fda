//! Speculative synthesis pipeline
//!
//! The write path feeds streamed LLM output through the sentence splitter and
//! submits each sentence to the cache, which runs synthesis in the background
//! against the TTS upstream. The read path answers speech requests from the
//! cache, stitching per-sentence audio together when a segment mapping exists.

pub mod cache;
pub mod rotator;
pub mod splitter;
pub mod tts_client;

pub use cache::{CacheStats, TtsCache, TtsCacheConfig};
pub use rotator::{RotatorStats, TokenRotator, TokenStatsSnapshot};
pub use splitter::StreamingSplitter;
pub use tts_client::{TtsBackend, TtsClient, TtsClientConfig, TtsClientStats};

use thiserror::Error;

/// Synthesis pipeline errors
#[derive(Error, Debug)]
pub enum TtsError {
    #[error("Token pool cannot be empty")]
    EmptyTokenPool,

    #[error("Network error: {0}")]
    Network(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Request timeout")]
    Timeout,

    #[error("All synthesis attempts failed: {0}")]
    UpstreamExhausted(String),
}

impl From<reqwest::Error> for TtsError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TtsError::Timeout
        } else {
            TtsError::Network(err.to_string())
        }
    }
}
