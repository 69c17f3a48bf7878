//! Responses adapter configuration.

use std::time::Duration;

use llxprt_core::RetryOptions;

/// Ephemeral setting carrying the server-side thread id between calls.
pub const PREVIOUS_RESPONSE_ID_KEY: &str = "previous-response-id";

/// Configuration for the Responses-API adapter.
#[derive(Debug, Clone)]
pub struct ResponsesConfig {
    /// Default model when neither settings nor config name one.
    pub model: String,
    /// Base URL; `OPENAI_BASE_URL` overrides the built-in default.
    pub base_url: String,
    /// Request timeout. `None` uses reqwest's default.
    pub timeout: Option<Duration>,
    /// Retry policy applied around every HTTP call.
    pub retry: RetryOptions,
}

impl Default for ResponsesConfig {
    fn default() -> Self {
        let base_url = std::env::var("OPENAI_BASE_URL")
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ResponsesConfig::default();
        assert_eq!(config.model, "gpt-4o");
        assert!(config.base_url.starts_with("http"));
    }
}
