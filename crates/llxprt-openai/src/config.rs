//! OpenAI adapter configuration.

use std::time::Duration;

use llxprt_core::RetryOptions;

/// Environment variable overriding the default base URL.
pub const BASE_URL_ENV: &str = "OPENAI_BASE_URL";

/// Configuration for the chat-completions adapter.
///
/// Credentials resolve per call (explicit key → `OPENAI_API_KEY` /
/// `LLXPRT_API_KEY` → OAuth).
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// Default model when neither settings nor config name one.
    pub model: String,
    /// Base URL; `OPENAI_BASE_URL` overrides the built-in default.
    pub base_url: String,
    /// Request timeout. `None` uses reqwest's default.
    pub timeout: Option<Duration>,
    /// Retry policy applied around every HTTP call.
    pub retry: RetryOptions,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        let base_url = std::env::var(BASE_URL_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        Self {
            model: "gpt-4o".into(),
            base_url,
            timeout: None,
            retry: RetryOptions::default(),
        }
    }
}
