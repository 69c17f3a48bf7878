//! Gemini adapter configuration.

use std::time::Duration;

use llxprt_core::RetryOptions;

/// Configuration for the Gemini adapter.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    /// Default model when neither settings nor config name one.
    pub model: String,
    /// Base URL; override for proxies or testing.
    pub base_url: String,
    /// Request timeout. `None` uses reqwest's default.
    pub timeout: Option<Duration>,
    /// Retry policy applied around every HTTP call.
    pub retry: RetryOptions,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.0-flash".into(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".into(),
            timeout: None,
            retry: RetryOptions::default(),
        }
    }
}
