//! Anthropic adapter configuration.

use std::time::Duration;

use llxprt_core::RetryOptions;

/// Configuration for the Anthropic adapter.
///
/// Credentials are not part of the config — they resolve per call via
/// the core auth precedence (explicit key → `ANTHROPIC_API_KEY` /
/// `LLXPRT_API_KEY` → OAuth). Use struct update syntax with
/// [`Default`]:
///
/// ```rust
/// use llxprt_anthropic::AnthropicConfig;
///
/// let config = AnthropicConfig {
///     model: "claude-opus-4-20250514".into(),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    /// Default model when neither settings nor config name one.
    pub model: String,
    /// Base URL; override for proxies or testing.
    pub base_url: String,
    /// `anthropic-version` header value.
    pub api_version: String,
    /// Request timeout. `None` uses reqwest's default.
    pub timeout: Option<Duration>,
    /// Retry policy applied around every HTTP call.
    pub retry: RetryOptions,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".into(),
            base_url: "https://api.anthropic.com".into(),
            api_version: "2023-06-01".into(),
            timeout: None,
            retry: RetryOptions::default(),
        }
    }
}
