//! Anthropic Messages API backend.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::error::{error_from_status, parse_retry_after, LlmError};
use super::{transport_error, Completion, CompletionBackend, CompletionRequest};
use crate::cost::TokenUsage;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API backend.
///
/// Retries are not performed here; rate limits surface as
/// `LlmErrorKind::RateLimited` for the caller's retry loop.
pub struct AnthropicBackend {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl AnthropicBackend {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            endpoint: base_url.unwrap_or_else(|| ANTHROPIC_API_URL.to_string()),
        }
    }
}

#[async_trait]
impl CompletionBackend for AnthropicBackend {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let body = MessagesRequest {
            model: &request.model,
            max_tokens: request.max_output_tokens,
            system: (!request.system.is_empty()).then_some(request.system.as_str()),
            temperature: Some(request.temperature),
            messages: vec![Message {
                role: "user",
                content: &request.prompt,
            }],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(e, request.timeout))?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let text = response
            .text()
            .await
            .map_err(|e| transport_error(e, request.timeout))?;

        if !status.is_success() {
            return Err(error_from_status(status.as_u16(), &text, retry_after));
        }

        let parsed: MessagesResponse = serde_json::from_str(&text).map_err(|e| {
            LlmError::parse_error(format!("Failed to parse response: {}, body: {}", e, text))
        })?;

        let content: String = parsed
            .content
            .iter()
            .filter(|block| block.block_type == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();
        if content.trim().is_empty() {
            return Err(LlmError::parse_error(format!(
                "No text content in response (stop_reason: {})",
                parsed.stop_reason.as_deref().unwrap_or("unknown")
            )));
        }

        let usage = parsed
            .usage
            .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens))
            .unwrap_or_default();

        Ok(Completion {
            text: content,
            usage,
            model: parsed.model.unwrap_or_else(|| request.model.clone()),
        })
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    model: Option<String>,
    stop_reason: Option<String>,
    usage: Option<MessagesUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_omits_empty_system() {
        let body = MessagesRequest {
            model: "claude-haiku-4-5",
            max_tokens: 100,
            system: None,
            temperature: Some(0.3),
            messages: vec![Message {
                role: "user",
                content: "hi",
            }],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("system").is_none());
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["max_tokens"], 100);
    }

    #[test]
    fn response_joins_text_blocks() {
        let raw = r#"{
            "content": [{"type": "text", "text": "{\"a\""}, {"type": "text", "text": ": 1}"}],
            "model": "claude-haiku-4-5-20251001",
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 12, "output_tokens": 5}
        }"#;
        let parsed: MessagesResponse = serde_json::from_str(raw).unwrap();
        let text: String = parsed
            .content
            .iter()
            .filter_map(|b| b.text.as_deref())
            .collect();
        assert_eq!(text, "{\"a\": 1}");
        assert_eq!(parsed.usage.unwrap().output_tokens, 5);
    }
}
