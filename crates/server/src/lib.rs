//! TTS proxy server
//!
//! OpenAI-compatible HTTP surface: a chat-completion reverse proxy that
//! speculatively synthesizes TTS for the streamed reply, and a speech
//! endpoint that answers from the cache.

pub mod auth;
pub mod chat;
pub mod http;
pub mod speech;
pub mod state;

pub use http::create_router;
pub use state::AppState;

use thiserror::Error;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Startup error: {0}")]
    Startup(String),
}
