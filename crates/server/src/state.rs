//! Application state
//!
//! Every upstream collaborator is constructed once at startup and shared by
//! reference through the handlers; there are no ambient globals.

use std::sync::Arc;

use tts_proxy_config::Settings;
use tts_proxy_llm::{ChatProxyClient, ChatProxyConfig};
use tts_proxy_pipeline::{TokenRotator, TtsCache, TtsCacheConfig, TtsClient, TtsClientConfig};

use crate::ServerError;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub rotator: Arc<TokenRotator>,
    pub tts_client: Arc<TtsClient>,
    pub cache: Arc<TtsCache>,
    pub llm: Arc<ChatProxyClient>,
}

impl AppState {
    /// Wire up rotator, TTS client, cache, and LLM proxy from settings.
    pub fn from_settings(config: Settings) -> Result<Self, ServerError> {
        let rotator = Arc::new(
            TokenRotator::new(config.tts.token_list())
                .map_err(|e| ServerError::Startup(e.to_string()))?,
        );

        let tts_client = Arc::new(
            TtsClient::new(
                TtsClientConfig {
                    api_url: config.tts.api_url.clone(),
                    default_voice: config.tts.default_voice.clone(),
                    default_model: config.tts.default_model.clone(),
                    timeout: config.tts.request_timeout(),
                    retry_count: config.tts.retry_count,
                },
                Arc::clone(&rotator),
            )
            .map_err(|e| ServerError::Startup(e.to_string()))?,
        );

        let cache = Arc::new(TtsCache::new(
            Arc::clone(&tts_client) as Arc<dyn tts_proxy_pipeline::TtsBackend>,
            TtsCacheConfig {
                max_size: config.cache.max_size,
                ttl: config.cache.ttl(),
                cleanup_interval: config.cache.cleanup_interval(),
            },
        ));

        let llm = Arc::new(
            ChatProxyClient::new(ChatProxyConfig {
                base_url: config.llm.base_url.clone(),
                api_key: config.llm.api_key.clone(),
                timeout: config.llm.timeout(),
            })
            .map_err(|e| ServerError::Startup(e.to_string()))?,
        );

        Ok(Self {
            config: Arc::new(config),
            rotator,
            tts_client,
            cache,
            llm,
        })
    }
}
