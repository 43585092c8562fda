//! Upstream chat-completion client
//!
//! Requests are always made in streaming mode; the caller receives raw SSE
//! data lines over a channel and decides whether to relay them verbatim or
//! aggregate them into a single response.

use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::LlmError;

/// Proxy client configuration
#[derive(Debug, Clone)]
pub struct ChatProxyConfig {
    /// Base URL of the chat-completion upstream
    pub base_url: String,
    /// Bearer key for the upstream
    pub api_key: String,
    /// Request timeout
    pub timeout: Duration,
}

/// Client for the chat-completion upstream.
pub struct ChatProxyClient {
    config: ChatProxyConfig,
    client: Client,
}

impl ChatProxyClient {
    pub fn new(config: ChatProxyConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Network(e.to_string()))?;

        Ok(Self {
            config: ChatProxyConfig {
                base_url: config.base_url.trim_end_matches('/').to_string(),
                ..config
            },
            client,
        })
    }

    /// Stream a chat completion, sending each non-empty SSE line to `tx`.
    ///
    /// The request body is forced to `stream: true` and the proxy-specific
    /// `tts_enabled` / `tts_model` fields are stripped before forwarding.
    /// Returns once the upstream stream ends or the receiver goes away.
    pub async fn stream_chat(
        &self,
        mut body: serde_json::Value,
        tx: mpsc::Sender<String>,
    ) -> Result<(), LlmError> {
        if let Some(object) = body.as_object_mut() {
            object.insert("stream".to_string(), serde_json::Value::Bool(true));
            object.remove("tts_enabled");
            object.remove("tts_model");
        }

        let url = format!("{}/v1/chat/completions", self.config.base_url);
        tracing::debug!("Streaming chat request to {}", url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("HTTP {}: {}", status, error_text)));
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| LlmError::Network(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(line_end) = buffer.find('\n') {
                let line = buffer[..line_end].trim().to_string();
                buffer = buffer[line_end + 1..].to_string();

                if line.is_empty() {
                    continue;
                }

                if tx.send(line).await.is_err() {
                    // Client went away; stop pulling from upstream
                    return Ok(());
                }
            }
        }

        let tail = buffer.trim().to_string();
        if !tail.is_empty() {
            let _ = tx.send(tail).await;
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

/// Extract the delta text content from an SSE data line.
///
/// Returns `None` for non-data lines, the `[DONE]` sentinel, unparseable
/// payloads, and chunks without content.
pub fn extract_content_from_sse(line: &str) -> Option<String> {
    let data = line.strip_prefix("data: ")?;

    if data == "[DONE]" {
        return None;
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk.choices.into_iter().next().and_then(|c| c.delta.content),
        Err(_) => {
            tracing::warn!("Failed to parse SSE data: {}", data);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_content() {
        let line = r#"data: {"id":"c1","choices":[{"index":0,"delta":{"content":"你好"}}]}"#;
        assert_eq!(extract_content_from_sse(line).as_deref(), Some("你好"));
    }

    #[test]
    fn test_extract_ignores_non_data_lines() {
        assert_eq!(extract_content_from_sse(": keep-alive"), None);
        assert_eq!(extract_content_from_sse("event: ping"), None);
        assert_eq!(extract_content_from_sse(""), None);
    }

    #[test]
    fn test_extract_done_sentinel() {
        assert_eq!(extract_content_from_sse("data: [DONE]"), None);
    }

    #[test]
    fn test_extract_missing_content() {
        let role_only = r#"data: {"choices":[{"index":0,"delta":{"role":"assistant"}}]}"#;
        assert_eq!(extract_content_from_sse(role_only), None);

        let no_choices = r#"data: {"id":"c1","choices":[]}"#;
        assert_eq!(extract_content_from_sse(no_choices), None);
    }

    #[test]
    fn test_extract_bad_json() {
        assert_eq!(extract_content_from_sse("data: {not json"), None);
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = ChatProxyClient::new(ChatProxyConfig {
            base_url: "https://llm.example.com/".to_string(),
            api_key: "sk-test".to_string(),
            timeout: Duration::from_secs(10),
        })
        .unwrap();
        assert_eq!(client.config.base_url, "https://llm.example.com");
    }
}
