//! OpenAI-compatible chat completions backend (OpenAI, OpenRouter, local gateways).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::error::{error_from_status, parse_retry_after, LlmError};
use super::{transport_error, Completion, CompletionBackend, CompletionRequest};
use crate::cost::TokenUsage;

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

pub struct OpenAiCompatBackend {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl OpenAiCompatBackend {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            endpoint: base_url.unwrap_or_else(|| OPENAI_API_URL.to_string()),
        }
    }

    fn build_request<'a>(request: &'a CompletionRequest) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(2);
        if !request.system.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: &request.system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });
        ChatRequest {
            model: &request.model,
            messages,
            max_tokens: Some(request.max_output_tokens),
            temperature: Some(request.temperature),
            response_format: request.structured_output.then(|| ResponseFormat {
                format_type: "json_object",
            }),
        }
    }
}

#[async_trait]
impl CompletionBackend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let body = Self::build_request(request);

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
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

        let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
            LlmError::parse_error(format!("Failed to parse response: {}, body: {}", e, text))
        })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::parse_error("No choices in response".to_string()))?;
        let content = choice
            .message
            .content
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                LlmError::parse_error(format!(
                    "Empty message content (finish_reason: {})",
                    choice.finish_reason.as_deref().unwrap_or("unknown")
                ))
            })?;

        Ok(Completion {
            text: content,
            usage: parsed
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
                .unwrap_or_default(),
            model: parsed.model.unwrap_or_else(|| request.model.clone()),
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    model: Option<String>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}
