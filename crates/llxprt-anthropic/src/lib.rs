//! Anthropic messages-API adapter for llxprt.
//!
//! Implements the [`llxprt_core::Provider`] contract over the
//! Anthropic-style `/v1/messages` wire protocol: strict tool pairing,
//! `tool_use`/`tool_result` content blocks with `toolu_*` ids, SSE
//! streaming, and the OAuth-mode protocol quirk (fixed `system` string
//! plus a `<system>`-wrapped prompt prefix in the first user turn).
//!
//! # Example
//!
//! ```rust,no_run
//! use llxprt_anthropic::{AnthropicConfig, AnthropicProvider};
//! use llxprt_core::RuntimeServices;
//!
//! let provider = AnthropicProvider::new(AnthropicConfig::default(), RuntimeServices::new());
//! ```

mod config;
mod convert;
mod provider;
mod stream;
mod types;

pub use config::AnthropicConfig;
pub use provider::AnthropicProvider;
