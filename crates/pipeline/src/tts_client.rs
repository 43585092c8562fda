//! TTS upstream client
//!
//! Synthesizes one text into WAV bytes by calling the speech API. The request
//! body is fixed apart from the `input` field; voice, model, and inference
//! hyperparameters come from configuration. Each attempt is bound to a token
//! from the rotator, and failures rotate to a fresh token with exponential
//! backoff.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::rotator::{RotatorStats, TokenRotator};
use crate::TtsError;

/// Synthesis backend seam.
///
/// The cache engine only needs "text in, WAV bytes out"; tests substitute a
/// local implementation for the HTTP client.
#[async_trait]
pub trait TtsBackend: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, TtsError>;
}

/// TTS client configuration
#[derive(Debug, Clone)]
pub struct TtsClientConfig {
    /// Base URL of the speech API
    pub api_url: String,
    /// Voice passed in every request
    pub default_voice: String,
    /// Model passed in every request
    pub default_model: String,
    /// Per-request timeout
    pub timeout: Duration,
    /// Retries after the first failed attempt
    pub retry_count: u32,
}

impl Default for TtsClientConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            default_voice: "默认".to_string(),
            default_model: "gsv-v4".to_string(),
            timeout: Duration::from_secs(60),
            retry_count: 2,
        }
    }
}

/// Fixed synthesis request body; only `input` varies between requests.
#[derive(Debug, Serialize)]
struct SpeechRequestBody<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'static str,
    speed: u32,
    instructions: &'static str,
    other_params: OtherParams,
}

/// Inference hyperparameters forwarded verbatim to the upstream engine.
#[derive(Debug, Serialize)]
struct OtherParams {
    text_lang: &'static str,
    prompt_lang: &'static str,
    emotion: &'static str,
    top_k: u32,
    top_p: u32,
    temperature: u32,
    text_split_method: &'static str,
    batch_size: u32,
    batch_threshold: f64,
    split_bucket: bool,
    fragment_interval: f64,
    parallel_infer: bool,
    repetition_penalty: f64,
    sample_steps: u32,
    if_sr: bool,
    seed: i64,
}

impl Default for OtherParams {
    fn default() -> Self {
        Self {
            text_lang: "中英混合",
            prompt_lang: "中文",
            emotion: "默认",
            top_k: 10,
            top_p: 1,
            temperature: 1,
            text_split_method: "按标点符号切",
            batch_size: 1,
            batch_threshold: 0.75,
            split_bucket: true,
            fragment_interval: 0.3,
            parallel_infer: true,
            repetition_penalty: 1.35,
            sample_steps: 16,
            if_sr: false,
            seed: -1,
        }
    }
}

#[derive(Debug, Default)]
struct ClientCounters {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    total_response_time: f64,
}

/// HTTP client for the TTS upstream.
pub struct TtsClient {
    config: TtsClientConfig,
    rotator: Arc<TokenRotator>,
    client: Client,
    counters: Mutex<ClientCounters>,
}

impl TtsClient {
    /// Create a client with its own connection pool.
    pub fn new(config: TtsClientConfig, rotator: Arc<TokenRotator>) -> Result<Self, TtsError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| TtsError::Network(e.to_string()))?;

        Ok(Self {
            config: TtsClientConfig {
                api_url: config.api_url.trim_end_matches('/').to_string(),
                ..config
            },
            rotator,
            client,
            counters: Mutex::new(ClientCounters::default()),
        })
    }

    fn build_request_body<'a>(&'a self, text: &'a str) -> SpeechRequestBody<'a> {
        SpeechRequestBody {
            model: &self.config.default_model,
            input: text,
            voice: &self.config.default_voice,
            response_format: "wav",
            speed: 1,
            instructions: "默认",
            other_params: OtherParams::default(),
        }
    }

    /// Synthesize `text`, retrying with fresh tokens on failure.
    ///
    /// Waits `0.5 × 2^attempt` seconds between attempts. After
    /// `retry_count + 1` failed attempts the last error surfaces as
    /// [`TtsError::UpstreamExhausted`]; the caller must not retry further.
    pub async fn synthesize(&self, text: &str) -> Result<Vec<u8>, TtsError> {
        self.counters.lock().total_requests += 1;

        let mut last_error: Option<TtsError> = None;

        for attempt in 0..=self.config.retry_count {
            let token = self.rotator.next_token();

            match self.do_request(text, &token).await {
                Ok(audio) => {
                    self.counters.lock().successful_requests += 1;
                    self.rotator.report_success(&token);
                    return Ok(audio);
                }
                Err(e) => {
                    self.rotator.report_failure(&token, Some(&e.to_string()));
                    tracing::warn!(
                        "TTS request failed (attempt {}/{}): error={}",
                        attempt + 1,
                        self.config.retry_count + 1,
                        e
                    );
                    last_error = Some(e);

                    if attempt < self.config.retry_count {
                        let backoff = 0.5 * 2f64.powi(attempt as i32);
                        tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                    }
                }
            }
        }

        self.counters.lock().failed_requests += 1;
        Err(TtsError::UpstreamExhausted(
            last_error.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    /// Perform a single synthesis attempt with the given token.
    async fn do_request(&self, text: &str, token: &str) -> Result<Vec<u8>, TtsError> {
        let start = Instant::now();

        let url = format!("{}/v1/audio/speech", self.config.api_url);
        let body = self.build_request_body(text);

        tracing::debug!("TTS request: url={}, text_len={}", url, text.chars().count());

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text: String = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(200)
                .collect();
            return Err(TtsError::Api(format!("HTTP {}: {}", status, error_text)));
        }

        let audio = response.bytes().await?.to_vec();

        let response_time = start.elapsed().as_secs_f64();
        self.counters.lock().total_response_time += response_time;

        tracing::debug!(
            "TTS request successful: text_len={}, response_time={:.2}s, audio_size={}",
            text.chars().count(),
            response_time,
            audio.len()
        );

        Ok(audio)
    }

    /// Probe the upstream with a short synthesis request.
    pub async fn health_check(&self) -> bool {
        match self.synthesize("测试").await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Health check failed: {}", e);
                false
            }
        }
    }

    /// Request statistics, including the rotator's token stats.
    pub fn stats(&self) -> TtsClientStats {
        let counters = self.counters.lock();
        let avg_response_time = if counters.successful_requests > 0 {
            counters.total_response_time / counters.successful_requests as f64
        } else {
            0.0
        };

        TtsClientStats {
            api_url: self.config.api_url.clone(),
            default_voice: self.config.default_voice.clone(),
            default_model: self.config.default_model.clone(),
            total_requests: counters.total_requests,
            successful_requests: counters.successful_requests,
            failed_requests: counters.failed_requests,
            success_rate: if counters.total_requests > 0 {
                counters.successful_requests as f64 / counters.total_requests as f64
            } else {
                0.0
            },
            avg_response_time,
            token_stats: self.rotator.stats(),
        }
    }

    /// Default model used when a request does not name one.
    pub fn default_model(&self) -> &str {
        &self.config.default_model
    }
}

#[async_trait]
impl TtsBackend for TtsClient {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, TtsError> {
        TtsClient::synthesize(self, text).await
    }
}

/// Client statistics for the ops endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct TtsClientStats {
    pub api_url: String,
    pub default_voice: String,
    pub default_model: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub avg_response_time: f64,
    pub token_stats: RotatorStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> TtsClient {
        let rotator = Arc::new(TokenRotator::new(vec!["test-token-0001".to_string()]).unwrap());
        TtsClient::new(
            TtsClientConfig {
                api_url: "https://tts.example.com/".to_string(),
                default_voice: "voice-a".to_string(),
                default_model: "model-a".to_string(),
                ..Default::default()
            },
            rotator,
        )
        .unwrap()
    }

    #[test]
    fn test_api_url_trailing_slash_trimmed() {
        let client = client();
        assert_eq!(client.config.api_url, "https://tts.example.com");
    }

    #[test]
    fn test_request_body_shape() {
        let client = client();
        let body = serde_json::to_value(client.build_request_body("你好")).unwrap();

        assert_eq!(body["model"], "model-a");
        assert_eq!(body["input"], "你好");
        assert_eq!(body["voice"], "voice-a");
        assert_eq!(body["response_format"], "wav");
        assert_eq!(body["speed"], 1);
        assert_eq!(body["instructions"], "默认");

        let params = &body["other_params"];
        assert_eq!(params["text_lang"], "中英混合");
        assert_eq!(params["prompt_lang"], "中文");
        assert_eq!(params["emotion"], "默认");
        assert_eq!(params["top_k"], 10);
        assert_eq!(params["top_p"], 1);
        assert_eq!(params["temperature"], 1);
        assert_eq!(params["text_split_method"], "按标点符号切");
        assert_eq!(params["batch_size"], 1);
        assert_eq!(params["batch_threshold"], 0.75);
        assert_eq!(params["split_bucket"], true);
        assert_eq!(params["fragment_interval"], 0.3);
        assert_eq!(params["parallel_infer"], true);
        assert_eq!(params["repetition_penalty"], 1.35);
        assert_eq!(params["sample_steps"], 16);
        assert_eq!(params["if_sr"], false);
        assert_eq!(params["seed"], -1);
    }

    #[test]
    fn test_only_input_varies() {
        let client = client();
        let a = serde_json::to_value(client.build_request_body("a")).unwrap();
        let mut b = serde_json::to_value(client.build_request_body("b")).unwrap();

        b["input"] = serde_json::Value::String("a".to_string());
        assert_eq!(a, b);
    }

    #[test]
    fn test_stats_initial() {
        let client = client();
        let stats = client.stats();
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.avg_response_time, 0.0);
        assert_eq!(stats.token_stats.total_tokens, 1);
    }
}
