//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ConfigError;

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// TTS upstream configuration
    #[serde(default)]
    pub tts: TtsUpstreamConfig,

    /// LLM upstream configuration (chat completion proxy)
    #[serde(default)]
    pub llm: LlmUpstreamConfig,

    /// Cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Sentence splitter configuration
    #[serde(default)]
    pub splitter: SplitterConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

/// TTS upstream (speech synthesis) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsUpstreamConfig {
    /// Base URL of the TTS API
    #[serde(default)]
    pub api_url: String,

    /// API tokens, comma-separated
    #[serde(default)]
    pub api_tokens: String,

    /// Default voice passed in every synthesis request
    #[serde(default = "default_voice")]
    pub default_voice: String,

    /// Default TTS model
    #[serde(default = "default_tts_model")]
    pub default_model: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_tts_timeout")]
    pub request_timeout_secs: u64,

    /// Retries after the first failed attempt
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
}

impl Default for TtsUpstreamConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_tokens: String::new(),
            default_voice: default_voice(),
            default_model: default_tts_model(),
            request_timeout_secs: default_tts_timeout(),
            retry_count: default_retry_count(),
        }
    }
}

impl TtsUpstreamConfig {
    /// Parse the comma-separated token list.
    pub fn token_list(&self) -> Vec<String> {
        self.api_tokens
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// Request timeout as a Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_voice() -> String {
    "默认".to_string()
}

fn default_tts_model() -> String {
    "gsv-v4".to_string()
}

fn default_tts_timeout() -> u64 {
    60
}

fn default_retry_count() -> u32 {
    2
}

/// LLM upstream (chat completion) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmUpstreamConfig {
    /// Base URL of the chat completion API
    #[serde(default)]
    pub base_url: String,

    /// API key, also used to authenticate inbound requests
    #[serde(default)]
    pub api_key: String,

    /// Request timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for LlmUpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

impl LlmUpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_llm_timeout() -> u64 {
    120
}

/// TTS cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cache entries
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,

    /// Entry time-to-live in seconds
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    /// Background cleanup interval in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_cache_max_size(),
            ttl_secs: default_cache_ttl(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

fn default_cache_max_size() -> usize {
    1000
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_cleanup_interval() -> u64 {
    300
}

/// Sentence splitter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitterConfig {
    /// Soft maximum effective length before a separator forces a cut
    #[serde(default = "default_splitter_max_len")]
    pub max_len: usize,

    /// Hard minimum effective length below which terminators are ignored
    #[serde(default = "default_splitter_min_len")]
    pub min_len: usize,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            max_len: default_splitter_max_len(),
            min_len: default_splitter_min_len(),
        }
    }
}

fn default_splitter_max_len() -> usize {
    40
}

fn default_splitter_min_len() -> usize {
    5
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Default log level when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit logs as JSON
    #[serde(default)]
    pub log_json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tts.api_url.trim().is_empty() {
            return Err(ConfigError::MissingField("tts.api_url".to_string()));
        }
        if self.tts.token_list().is_empty() {
            return Err(ConfigError::MissingField("tts.api_tokens".to_string()));
        }
        if self.llm.base_url.trim().is_empty() {
            return Err(ConfigError::MissingField("llm.base_url".to_string()));
        }
        if self.llm.api_key.trim().is_empty() {
            return Err(ConfigError::MissingField("llm.api_key".to_string()));
        }
        if self.cache.max_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.max_size".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.splitter.min_len > self.splitter.max_len {
            return Err(ConfigError::InvalidValue {
                field: "splitter.min_len".to_string(),
                message: format!(
                    "min_len {} exceeds max_len {}",
                    self.splitter.min_len, self.splitter.max_len
                ),
            });
        }
        Ok(())
    }
}

/// Load settings from config files and environment variables.
///
/// Priority: env vars > config/{env}.yaml > config/default.yaml > defaults.
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    builder = builder.add_source(File::with_name("config/default").required(false));

    if let Some(env_name) = env {
        builder =
            builder.add_source(File::with_name(&format!("config/{}", env_name)).required(false));
    }

    builder = builder.add_source(
        Environment::with_prefix("TTS_PROXY")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let settings: Settings = config.try_deserialize()?;

    settings.validate()?;

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_settings() -> Settings {
        let mut settings = Settings::default();
        settings.tts.api_url = "https://tts.example.com".to_string();
        settings.tts.api_tokens = "tok-a, tok-b,tok-c".to_string();
        settings.llm.base_url = "https://llm.example.com".to_string();
        settings.llm.api_key = "sk-test".to_string();
        settings
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 8000);
        assert_eq!(settings.cache.max_size, 1000);
        assert_eq!(settings.cache.ttl_secs, 3600);
        assert_eq!(settings.cache.cleanup_interval_secs, 300);
        assert_eq!(settings.splitter.max_len, 40);
        assert_eq!(settings.splitter.min_len, 5);
        assert_eq!(settings.tts.request_timeout_secs, 60);
        assert_eq!(settings.tts.retry_count, 2);
    }

    #[test]
    fn test_token_list_parsing() {
        let settings = valid_settings();
        assert_eq!(settings.tts.token_list(), vec!["tok-a", "tok-b", "tok-c"]);

        let mut empty = Settings::default();
        empty.tts.api_tokens = " , ,".to_string();
        assert!(empty.tts.token_list().is_empty());
    }

    #[test]
    fn test_validation() {
        assert!(valid_settings().validate().is_ok());

        // Empty token pool is fatal
        let mut settings = valid_settings();
        settings.tts.api_tokens = String::new();
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::MissingField(f)) if f == "tts.api_tokens"
        ));

        let mut settings = valid_settings();
        settings.cache.max_size = 0;
        assert!(settings.validate().is_err());

        let mut settings = valid_settings();
        settings.splitter.min_len = 100;
        assert!(settings.validate().is_err());
    }
}
