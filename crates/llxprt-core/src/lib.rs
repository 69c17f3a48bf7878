//! # llxprt-core
//!
//! Provider-agnostic types, traits, and runtime services for the llxprt
//! multi-provider LLM client. This crate defines the shared vocabulary
//! every adapter speaks — the [`IContent`] conversation model, the
//! [`Provider`] contract, errors, retries, settings capabilities — and
//! intentionally contains **zero** provider-specific wire code.
//! Concrete adapters live in sibling crates and implement [`Provider`]
//! (or its object-safe counterpart [`DynProvider`]).
//!
//! # Provider crates
//!
//! | Crate | Upstream API | Notes |
//! |-------|--------------|-------|
//! | `llxprt-anthropic` | Messages API | strict pairing, OAuth mode |
//! | `llxprt-openai` | Chat Completions | per-index tool accumulation |
//! | `llxprt-responses` | Responses API | server-side threading |
//! | `llxprt-gemini` | Gemini API | server-tools provider |
//!
//! # Architecture
//!
//! ```text
//!  ┌─────────────────┐ ┌───────────────┐ ┌────────────────┐ ┌───────────────┐
//!  │ llxprt-anthropic│ │ llxprt-openai │ │llxprt-responses│ │ llxprt-gemini │
//!  └────────┬────────┘ └───────┬───────┘ └───────┬────────┘ └───────┬───────┘
//!           │                  │                 │                  │
//!           └─────────┬────────┴────────┬────────┴──────────────────┘
//!                     │                 │
//!                     ▼                 ▼
//!            ┌─────────────────────────────────────┐
//!            │            llxprt-core              │  ← you are here
//!            │  (Provider trait, IContent, retry)  │
//!            └─────────────────────────────────────┘
//! ```
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use llxprt_core::{
//!     ConfigAccessor, EphemeralConfig, IContent, InMemorySettingsService,
//!     ProviderManager, SettingsService,
//! };
//!
//! # async fn example() -> Result<(), llxprt_core::LlxprtError> {
//! let settings: Arc<dyn SettingsService> = Arc::new(InMemorySettingsService::new());
//! let config: Arc<dyn ConfigAccessor> = Arc::new(EphemeralConfig::new());
//! let manager = ProviderManager::new(settings, Some(config));
//! // manager.register_provider(Arc::new(AnthropicProvider::new(...)));
//!
//! let mut stream = manager
//!     .generate_chat_completion(
//!         vec![IContent::human("Explain ownership in Rust")],
//!         vec![],
//!         None,
//!         tokio_util::sync::CancellationToken::new(),
//!     )
//!     .await?;
//! while let Some(item) = stream.next().await {
//!     if let Some(text) = item?.text() {
//!         print!("{text}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`content`] | The [`IContent`] conversation model |
//! | [`error`] | Unified [`LlxprtError`] taxonomy and exit codes |
//! | [`retry`] | Retry engine with `Retry-After` honoring and jitter |
//! | [`settings`] | Settings/config capabilities and frozen snapshots |
//! | [`runtime`] | Immutable per-call runtime contexts |
//! | [`auth`] | Precedence-ordered credential resolution |
//! | [`client_cache`] | Keyed HTTP client cache with runtime eviction |
//! | [`history`] | Canonical tool ids and strict-pairing preparation |
//! | [`provider`] | The [`Provider`] trait and per-call options |
//! | [`stream`] | The [`ContentStream`] lazy sequence |
//! | [`prompt`] | Deterministic system-prompt composition |
//! | [`profile`] | Versioned profile persistence |
//! | [`manager`] | Provider registration, routing, session accounting |

#![warn(missing_docs)]

pub mod auth;
pub mod client_cache;
pub mod content;
pub mod error;
pub mod history;
pub mod manager;
pub mod profile;
pub mod prompt;
pub mod provider;
pub mod retry;
pub mod runtime;
pub mod settings;
pub mod stream;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use auth::{AuthMethod, AuthPrecedence, AuthResolver, OAuthTokenSource, ResolvedAuth};
pub use client_cache::{ClientCache, ClientKey};
pub use content::{ContentBlock, ContentMetadata, IContent, Speaker, UsageStats};
pub use error::{LlxprtError, RetryAfter, STREAM_INTERRUPTED_CODE};
pub use history::{
    ToolFormat, detect_tool_format, new_history_id, parse_tool_parameters,
    prepare_strict_history, to_anthropic_id, to_bare_id, to_history_id, to_openai_id,
};
pub use manager::{
    ProviderComparison, ProviderManager, ProviderSwitchEvent, SessionTokenUsage, TokenUsageDelta,
};
pub use profile::{Profile, ProfileStore};
pub use prompt::{PromptComposer, PromptContext, substitute};
pub use provider::{
    DeclaredTool, DynProvider, JsonSchema, ModelInfo, ModelParams,
    NormalizedGenerateChatOptions, Provider, ProviderCapabilities, ResolvedRequest, ToolGroup,
};
pub use retry::{
    RetryOptions, RetryPredicate, RetryState, ThrottleTracker, default_should_retry, is_transient,
    retry,
};
pub use runtime::{RuntimeContext, RuntimeMetadata, RuntimeServices};
pub use settings::{
    ConfigAccessor, EphemeralConfig, InMemorySettingsService, ProviderSettings, SettingsService,
    SettingsSnapshot,
};
pub use stream::{ContentStream, collect_stream, collect_stream_lossy, stream_from_items};

#[cfg(any(test, feature = "test-utils"))]
pub use mock::{MockError, MockProvider, MockTurn};
