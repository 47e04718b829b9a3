//! Completion backends.
//!
//! Every agent talks to a language model through [`CompletionBackend`]: a
//! single prompt in, a single text completion out. The Planner and Generator
//! share one backend; the Supervisor is given a second, independently
//! configured one so that verification does not reuse the generator's model.

mod anthropic;
mod error;
mod openai;

pub use anthropic::AnthropicBackend;
pub use error::{
    classify_http_status, error_from_status, parse_retry_after, parse_retry_hint, LlmError,
    LlmErrorKind,
};
pub use openai::OpenAiCompatBackend;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{BackendConfig, Provider};
use crate::cost::TokenUsage;

/// A single completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// System instructions
    pub system: String,
    /// User turn
    pub prompt: String,
    pub model: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
    /// Ask the provider for a JSON object response where supported
    pub structured_output: bool,
    /// Hard ceiling for the HTTP exchange
    pub timeout: Duration,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            model: model.into(),
            max_output_tokens: 4096,
            temperature: 0.2,
            structured_output: true,
            timeout: Duration::from_secs(90),
        }
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Backend response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
    /// Model that actually served the request
    pub model: String,
}

/// Trait for text-completion backends.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Backend identity, used to tag ledger entries.
    fn name(&self) -> &str;

    /// Issue one completion call.
    ///
    /// # Errors
    /// `RateLimited` carries the provider's suggested delay when one was
    /// given. A request exceeding `request.timeout` fails with `Timeout`.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError>;
}

/// Build a backend from configuration.
pub fn backend_from_config(config: &BackendConfig) -> Arc<dyn CompletionBackend> {
    match config.provider {
        Provider::Anthropic => Arc::new(AnthropicBackend::new(
            config.api_key.clone(),
            config.base_url.clone(),
        )),
        Provider::OpenAi => Arc::new(OpenAiCompatBackend::new(
            config.api_key.clone(),
            config.base_url.clone(),
        )),
    }
}

/// Map a reqwest transport failure onto our error kinds.
pub(crate) fn transport_error(err: reqwest::Error, timeout: Duration) -> LlmError {
    if err.is_timeout() {
        LlmError::timeout(timeout)
    } else if err.is_connect() {
        LlmError::unavailable(None, format!("Connection failed: {}", err))
    } else {
        LlmError::unavailable(None, format!("Request failed: {}", err))
    }
}
