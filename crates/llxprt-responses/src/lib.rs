//! Responses-API-family adapter for llxprt.
//!
//! The Responses API threads conversations server-side via an opaque
//! `previous_response_id`. Per the stateless call contract, the adapter
//! never caches that id on itself: the threading input is read from the
//! ephemeral `previous-response-id` setting on every call, and the id
//! of a completed response is written back through the live config
//! accessor for the next call to pick up.

mod config;
mod convert;
mod provider;
mod stream;
mod types;

pub use config::ResponsesConfig;
pub use provider::ResponsesProvider;
