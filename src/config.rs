//! Configuration management for flowsmith.
//!
//! Configuration is read from environment variables:
//! - `FLOWSMITH_GENERATOR_PROVIDER` - Optional. `anthropic` or `openai`. Defaults to `anthropic`.
//! - `FLOWSMITH_GENERATOR_API_KEY` - Required unless `ANTHROPIC_API_KEY` is set. Key for the planner/generator backend.
//! - `FLOWSMITH_GENERATOR_MODEL` - Optional. Defaults to `claude-haiku-4-5`.
//! - `FLOWSMITH_GENERATOR_BASE_URL` - Optional. Endpoint override.
//! - `FLOWSMITH_SUPERVISOR_PROVIDER` - Optional. Defaults to `anthropic`.
//! - `FLOWSMITH_SUPERVISOR_API_KEY` - Required unless `ANTHROPIC_API_KEY` is set. Key for the verifier backend.
//! - `FLOWSMITH_SUPERVISOR_MODEL` - Optional. Defaults to `claude-sonnet-4-5`.
//! - `FLOWSMITH_SUPERVISOR_BASE_URL` - Optional. Endpoint override.
//! - `FLOWSMITH_MAX_OUTPUT_TOKENS` - Optional. Planner/generator output cap. Defaults to `8000`.
//! - `FLOWSMITH_SUPERVISOR_MAX_OUTPUT_TOKENS` - Optional. Defaults to `2000`.
//! - `FLOWSMITH_MAX_ROUNDS` - Optional. Supervision rounds per request. Defaults to `3`.
//! - `FLOWSMITH_AUTO_FIX` - Optional. Structural auto-fix pass. Defaults to `true`.
//! - `FLOWSMITH_TIMEOUT_SIMPLE_SECS` / `FLOWSMITH_TIMEOUT_MEDIUM_SECS` / `FLOWSMITH_TIMEOUT_COMPLEX_SECS` -
//!   Optional. Per-call bounds by complexity tier. Default `60` / `90` / `120`.
//! - `FLOWSMITH_RATE_LIMIT_DELAY_MS` - Optional. Backoff when the provider suggests none. Defaults to `5000`.
//! - `FLOWSMITH_CATALOG_PATH` - Optional. JSON document catalog used by the CLI retriever.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::complexity::TimeoutPolicy;
use crate::retry::RetryPolicy;
use crate::util::env_var_bool;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Completion provider wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
    /// OpenAI chat completions and compatible gateways
    OpenAi,
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Provider::Anthropic),
            "openai" | "openrouter" | "openai-compat" => Ok(Provider::OpenAi),
            other => Err(format!("unknown provider '{}'", other)),
        }
    }
}

/// One completion backend's connection settings.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub provider: Provider,
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
    pub max_output_tokens: u32,
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend shared by the Planner and Generator
    pub generator: BackendConfig,

    /// Independent verifier backend used by the Supervisor
    pub supervisor: BackendConfig,

    /// Supervision rounds per request (1 initial + retries)
    pub max_rounds: u32,

    /// Whether a failed structural validation gets one regeneration pass
    pub auto_fix: bool,

    /// Per-call time bounds by complexity tier
    pub timeouts: TimeoutPolicy,

    /// Rate-limit / parse-error retry policy
    pub retry: RetryPolicy,

    /// Document catalog for the bundled retriever
    pub catalog_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let shared_key = std::env::var("ANTHROPIC_API_KEY").ok();

        let generator = BackendConfig {
            provider: parse_env("FLOWSMITH_GENERATOR_PROVIDER", Provider::Anthropic)?,
            api_key: std::env::var("FLOWSMITH_GENERATOR_API_KEY")
                .ok()
                .or_else(|| shared_key.clone())
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| {
                    ConfigError::MissingEnvVar("FLOWSMITH_GENERATOR_API_KEY".to_string())
                })?,
            model: std::env::var("FLOWSMITH_GENERATOR_MODEL")
                .unwrap_or_else(|_| "claude-haiku-4-5".to_string()),
            base_url: std::env::var("FLOWSMITH_GENERATOR_BASE_URL").ok(),
            max_output_tokens: parse_env("FLOWSMITH_MAX_OUTPUT_TOKENS", 8000)?,
        };

        let supervisor = BackendConfig {
            provider: parse_env("FLOWSMITH_SUPERVISOR_PROVIDER", Provider::Anthropic)?,
            api_key: std::env::var("FLOWSMITH_SUPERVISOR_API_KEY")
                .ok()
                .or(shared_key)
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| {
                    ConfigError::MissingEnvVar("FLOWSMITH_SUPERVISOR_API_KEY".to_string())
                })?,
            model: std::env::var("FLOWSMITH_SUPERVISOR_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4-5".to_string()),
            base_url: std::env::var("FLOWSMITH_SUPERVISOR_BASE_URL").ok(),
            max_output_tokens: parse_env("FLOWSMITH_SUPERVISOR_MAX_OUTPUT_TOKENS", 2000)?,
        };

        let max_rounds: u32 = parse_env("FLOWSMITH_MAX_ROUNDS", 3)?;
        if max_rounds == 0 {
            return Err(ConfigError::InvalidValue(
                "FLOWSMITH_MAX_ROUNDS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let timeouts = TimeoutPolicy {
            simple: Duration::from_secs(parse_env("FLOWSMITH_TIMEOUT_SIMPLE_SECS", 60)?),
            medium: Duration::from_secs(parse_env("FLOWSMITH_TIMEOUT_MEDIUM_SECS", 90)?),
            complex: Duration::from_secs(parse_env("FLOWSMITH_TIMEOUT_COMPLEX_SECS", 120)?),
        };

        let retry = RetryPolicy {
            default_delay: Duration::from_millis(parse_env("FLOWSMITH_RATE_LIMIT_DELAY_MS", 5000)?),
            ..RetryPolicy::default()
        };

        Ok(Self {
            generator,
            supervisor,
            max_rounds,
            auto_fix: env_var_bool("FLOWSMITH_AUTO_FIX", true),
            timeouts,
            retry,
            catalog_path: std::env::var("FLOWSMITH_CATALOG_PATH").ok().map(PathBuf::from),
        })
    }

    /// Create a config with explicit backends and default pipeline settings.
    pub fn new(generator: BackendConfig, supervisor: BackendConfig) -> Self {
        Self {
            generator,
            supervisor,
            max_rounds: 3,
            auto_fix: true,
            timeouts: TimeoutPolicy::default(),
            retry: RetryPolicy::default(),
            catalog_path: None,
        }
    }
}

fn parse_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        _ => Ok(default),
    }
}
