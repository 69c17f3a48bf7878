//! Unified error type for all llxprt operations.
//!
//! Every provider adapter maps its native failures into [`LlxprtError`],
//! giving callers one type to match against regardless of backend.
//! Errors are values: each variant carries enough context for retry
//! classification, user-facing messages, and exit-code mapping.
//!
//! # Recovery locality
//!
//! The retry engine ([`retry`](crate::retry)) recovers transient network
//! failures and 429/5xx responses before the consumer sees them. Auth
//! absence is surfaced immediately and never retried. A mid-stream
//! disconnect is reported as [`LlxprtError::StreamInterrupted`], which
//! classifies transient so the whole call retries.

use std::time::{Duration, SystemTime};

use serde_json::Value;

/// Machine-readable code carried by [`LlxprtError::StreamInterrupted`].
pub const STREAM_INTERRUPTED_CODE: &str = "LLXPRT_STREAM_INTERRUPTED";

/// A parsed `Retry-After` response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAfter {
    /// Delay in whole seconds.
    Seconds(u64),
    /// An absolute HTTP date; the delay is `max(0, at - now)`.
    At(SystemTime),
}

impl RetryAfter {
    /// Parses a `Retry-After` header value: integer seconds, or an
    /// HTTP date (RFC 7231 / RFC 2822 form).
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if let Ok(secs) = value.parse::<u64>() {
            return Some(Self::Seconds(secs));
        }
        chrono::DateTime::parse_from_rfc2822(value)
            .ok()
            .map(|dt| Self::At(SystemTime::from(dt)))
    }

    /// The remaining wait, relative to `now`. Clamped to zero when the
    /// target instant has already passed.
    pub fn remaining(&self, now: SystemTime) -> Duration {
        match self {
            Self::Seconds(s) => Duration::from_secs(*s),
            Self::At(at) => at.duration_since(now).unwrap_or(Duration::ZERO),
        }
    }
}

/// The unified error type returned by all llxprt operations.
///
/// Variants are `#[non_exhaustive]` — always include a wildcard arm when
/// matching.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LlxprtError {
    /// No credential resolved, or the upstream rejected the one we sent.
    /// `hint` tells the user how to re-authenticate.
    #[error("Authentication error for provider '{provider}': {hint}")]
    Auth {
        /// The provider the credential was resolved for.
        provider: String,
        /// Remediation hint shown to the user.
        hint: String,
    },

    /// Bad settings value or unknown configuration key.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An invalid argument surfaced to the caller.
    #[error("Invalid input: {0}")]
    Input(String),

    /// The per-session turn cap was exceeded.
    #[error("Turn limit of {limit} exceeded")]
    TurnLimit {
        /// The configured cap.
        limit: u32,
    },

    /// The named tool is disabled by settings.
    #[error("Tool '{tool}' is disabled by settings")]
    ToolDisabled {
        /// The tool's name.
        tool: String,
    },

    /// A non-retryable or retry-exhausted HTTP failure from the upstream
    /// API. `retry_after` is populated when the response carried a
    /// parseable `Retry-After` header.
    #[error("API error (status={status}): {message}")]
    Api {
        /// The HTTP status code.
        status: http::StatusCode,
        /// Upstream error description.
        message: String,
        /// Parsed `Retry-After` header, when present.
        retry_after: Option<RetryAfter>,
    },

    /// The streaming body was cut off mid-response. Classifies transient;
    /// the retry engine re-invokes the whole call. Blocks already yielded
    /// before the interruption are not rolled back.
    #[error("LLXPRT_STREAM_INTERRUPTED: stream interrupted{}", details_suffix(.details))]
    StreamInterrupted {
        /// What was observed when the stream ended.
        details: Option<String>,
        /// The transport-level cause, when one exists.
        #[source]
        cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A runtime-context snapshot was requested while a required field
    /// was absent. Fatal: the call cannot proceed.
    #[error(
        "Provider runtime for '{provider_key}' is missing {missing_fields:?} at {stage}"
    )]
    MissingProviderRuntime {
        /// Which provider the snapshot was for.
        provider_key: String,
        /// The specific fields that were absent.
        missing_fields: Vec<String>,
        /// The pipeline stage that detected the absence.
        stage: String,
        /// Additional context for diagnostics.
        metadata: Value,
    },

    /// The call was cancelled via its cancellation token.
    #[error("call cancelled")]
    Cancelled,

    /// Catch-all wrapping a lower-level cause. The retry engine walks the
    /// `source()` chain of this variant for transient classification.
    #[error("Unhandled error: {0}")]
    Unhandled(#[source] Box<dyn std::error::Error + Send + Sync>),
}

fn details_suffix(details: &Option<String>) -> String {
    match details {
        Some(d) => format!(": {d}"),
        None => String::new(),
    }
}

impl LlxprtError {
    /// The machine-readable code for this error, when one exists.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::StreamInterrupted { .. } => Some(STREAM_INTERRUPTED_CODE),
            _ => None,
        }
    }

    /// Process exit code for CLI frontends.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Auth { .. } => 41,
            Self::Input(_) => 42,
            Self::Config(_) => 52,
            Self::TurnLimit { .. } => 53,
            _ => 1,
        }
    }

    /// A stream interruption with no underlying transport error
    /// (e.g. EOF before the terminal event).
    pub fn stream_interrupted(details: impl Into<String>) -> Self {
        Self::StreamInterrupted {
            details: Some(details.into()),
            cause: None,
        }
    }

    /// Wraps a transport-level error (connection reset, read failure)
    /// observed while streaming.
    pub fn stream_interrupted_by(
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::StreamInterrupted {
            details: None,
            cause: Some(Box::new(cause)),
        }
    }

    /// Wraps a transport error from the HTTP client. The transient
    /// classifier walks the wrapped chain, so connection resets and
    /// timeouts remain retryable.
    pub fn transport(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Unhandled(Box::new(err))
    }

    /// An API error without a `Retry-After` hint.
    pub fn api(status: http::StatusCode, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
            retry_after: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_parse_seconds() {
        assert_eq!(RetryAfter::parse("2"), Some(RetryAfter::Seconds(2)));
        assert_eq!(RetryAfter::parse(" 30 "), Some(RetryAfter::Seconds(30)));
    }

    #[test]
    fn test_retry_after_parse_http_date() {
        let parsed = RetryAfter::parse("Wed, 21 Oct 2015 07:28:00 GMT").unwrap();
        assert!(matches!(parsed, RetryAfter::At(_)));
    }

    #[test]
    fn test_retry_after_parse_garbage() {
        assert_eq!(RetryAfter::parse("soon"), None);
    }

    #[test]
    fn test_retry_after_remaining_seconds() {
        let ra = RetryAfter::Seconds(2);
        assert_eq!(ra.remaining(SystemTime::now()), Duration::from_secs(2));
    }

    #[test]
    fn test_retry_after_remaining_past_date_clamps_to_zero() {
        let past = SystemTime::now() - Duration::from_secs(60);
        let ra = RetryAfter::At(past);
        assert_eq!(ra.remaining(SystemTime::now()), Duration::ZERO);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            LlxprtError::Auth {
                provider: "openai".into(),
                hint: "set OPENAI_API_KEY".into()
            }
            .exit_code(),
            41
        );
        assert_eq!(LlxprtError::Input("bad".into()).exit_code(), 42);
        assert_eq!(LlxprtError::Config("bad".into()).exit_code(), 52);
        assert_eq!(LlxprtError::TurnLimit { limit: 10 }.exit_code(), 53);
        assert_eq!(LlxprtError::Cancelled.exit_code(), 1);
    }

    #[test]
    fn test_stream_interrupted_code() {
        let err = LlxprtError::stream_interrupted("eof before message_stop");
        assert_eq!(err.code(), Some(STREAM_INTERRUPTED_CODE));
        let display = format!("{err}");
        assert!(display.contains("LLXPRT_STREAM_INTERRUPTED"));
        assert!(display.contains("eof before message_stop"));
    }

    #[test]
    fn test_stream_interrupted_source_chain() {
        use std::error::Error;
        let err =
            LlxprtError::stream_interrupted_by(std::io::Error::other("connection reset by peer"));
        let source = err.source().expect("should have source");
        assert!(format!("{source}").contains("connection reset"));
    }

    #[test]
    fn test_auth_error_display_carries_hint() {
        let err = LlxprtError::Auth {
            provider: "anthropic".into(),
            hint: "run `llxprt auth anthropic` or set ANTHROPIC_API_KEY".into(),
        };
        let display = format!("{err}");
        assert!(display.contains("anthropic"));
        assert!(display.contains("ANTHROPIC_API_KEY"));
    }

    #[test]
    fn test_missing_runtime_lists_fields() {
        let err = LlxprtError::MissingProviderRuntime {
            provider_key: "openai".into(),
            missing_fields: vec!["config".into()],
            stage: "snapshot".into(),
            metadata: serde_json::json!({}),
        };
        let display = format!("{err}");
        assert!(display.contains("config"));
        assert!(display.contains("snapshot"));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LlxprtError>();
    }
}
