//! Gemini-family adapter for llxprt.
//!
//! Implements the [`llxprt_core::Provider`] contract over the Gemini
//! `generateContent` / `streamGenerateContent` wire protocol:
//! `user`/`model` roles, `functionCall`/`functionResponse` parts
//! (correlated by function name on the wire, canonical `hist_tool_*`
//! ids inside the core), `systemInstruction`, and SSE streaming. This
//! adapter is typically pinned as the provider manager's server-tools
//! provider, so its auth state survives provider switches.

mod config;
mod convert;
mod provider;
mod stream;
mod types;

pub use config::GeminiConfig;
pub use provider::GeminiProvider;
