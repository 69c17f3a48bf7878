//! The provider contract and per-call request types.
//!
//! This module defines two core abstractions:
//!
//! - **[`Provider`]** — the trait every adapter implements. It uses
//!   native async-fn-in-traits, so implementations are plain
//!   `async fn`s with no macro overhead.
//! - **[`DynProvider`]** — an object-safe mirror using boxed futures. A
//!   blanket `impl<T: Provider> DynProvider for T` bridges the two, so
//!   any concrete adapter can live behind `Arc<dyn DynProvider>` in the
//!   provider manager with zero boilerplate.
//!
//! # Statelessness
//!
//! Everything a call needs travels in one immutable value,
//! [`NormalizedGenerateChatOptions`]: the conversation, tool
//! declarations, a frozen settings snapshot, the runtime context, and
//! the resolved model/endpoint/credential. Adapters never mutate their
//! own fields during a call; the only shared mutable state they touch
//! is the keyed HTTP-client cache and the credential cache, both scoped
//! by runtime id.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::content::IContent;
use crate::error::LlxprtError;
use crate::history::ToolFormat;
use crate::retry::ThrottleTracker;
use crate::runtime::RuntimeContext;
use crate::settings::SettingsSnapshot;
use crate::stream::ContentStream;

/// The trait every provider adapter implements.
///
/// Cross-cutting concerns — retry, throttle accounting, usage metrics —
/// are handled by the retry engine inside the adapter pipeline and the
/// manager's logging decorator, keeping individual adapters focused on
/// wire mapping.
pub trait Provider: Send + Sync {
    /// The adapter's registered name (e.g. `"anthropic"`).
    fn name(&self) -> &str;

    /// Runs one chat call and returns a lazy sequence of content items.
    fn generate_chat_completion(
        &self,
        options: NormalizedGenerateChatOptions,
    ) -> impl Future<Output = Result<ContentStream, LlxprtError>> + Send;

    /// Models this adapter can serve.
    fn models(&self) -> Vec<ModelInfo>;

    /// The model used when neither settings nor config name one.
    fn default_model(&self) -> String;

    /// Static capability descriptor.
    fn capabilities(&self) -> ProviderCapabilities;

    /// Whether this adapter becomes active when registered first.
    fn is_default(&self) -> bool {
        false
    }

    /// Drops any provider-side caches (auth state). Called by the
    /// manager when switching away, unless this adapter is the pinned
    /// server-tools provider.
    fn clear_state(&self) {}
}

/// Object-safe counterpart of [`Provider`] for dynamic dispatch.
///
/// You rarely implement this directly — the blanket
/// `impl<T: Provider> DynProvider for T` does it for you.
pub trait DynProvider: Send + Sync {
    /// See [`Provider::name`].
    fn name(&self) -> &str;

    /// Boxed-future version of [`Provider::generate_chat_completion`].
    fn generate_chat_completion_boxed<'a>(
        &'a self,
        options: NormalizedGenerateChatOptions,
    ) -> Pin<Box<dyn Future<Output = Result<ContentStream, LlxprtError>> + Send + 'a>>;

    /// See [`Provider::models`].
    fn models(&self) -> Vec<ModelInfo>;

    /// See [`Provider::default_model`].
    fn default_model(&self) -> String;

    /// See [`Provider::capabilities`].
    fn capabilities(&self) -> ProviderCapabilities;

    /// See [`Provider::is_default`].
    fn is_default(&self) -> bool;

    /// See [`Provider::clear_state`].
    fn clear_state(&self);
}

impl<T: Provider> DynProvider for T {
    fn name(&self) -> &str {
        Provider::name(self)
    }

    fn generate_chat_completion_boxed<'a>(
        &'a self,
        options: NormalizedGenerateChatOptions,
    ) -> Pin<Box<dyn Future<Output = Result<ContentStream, LlxprtError>> + Send + 'a>> {
        Box::pin(self.generate_chat_completion(options))
    }

    fn models(&self) -> Vec<ModelInfo> {
        Provider::models(self)
    }

    fn default_model(&self) -> String {
        Provider::default_model(self)
    }

    fn capabilities(&self) -> ProviderCapabilities {
        Provider::capabilities(self)
    }

    fn is_default(&self) -> bool {
        Provider::is_default(self)
    }

    fn clear_state(&self) {
        Provider::clear_state(self);
    }
}

/// What a provider supports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    /// Server-sent streaming responses.
    pub supports_streaming: bool,
    /// Tool/function calling.
    pub supports_tools: bool,
    /// Image understanding.
    pub supports_vision: bool,
    /// Default max output tokens.
    pub max_tokens: u32,
    /// Tool-format dialects the adapter can encode.
    pub supported_formats: Vec<ToolFormat>,
    /// Whether a model can be selected per call.
    pub has_model_selection: bool,
    /// Whether an API key can be configured.
    pub has_api_key_config: bool,
    /// Whether a base URL can be configured.
    pub has_base_url_config: bool,
    /// Whether a paid tier is available.
    pub supports_paid_mode: bool,
}

impl Default for ProviderCapabilities {
    fn default() -> Self {
        Self {
            supports_streaming: true,
            supports_tools: true,
            supports_vision: false,
            max_tokens: 4096,
            supported_formats: Vec::new(),
            has_model_selection: true,
            has_api_key_config: true,
            has_base_url_config: true,
            supports_paid_mode: true,
        }
    }
}

/// A model an adapter can serve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier sent on the wire.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// The serving provider's name.
    pub provider: String,
    /// Tool-format dialects this model accepts.
    pub supported_tool_formats: Vec<ToolFormat>,
    /// Context window in tokens.
    pub context_window: u64,
    /// Maximum output tokens.
    pub max_output_tokens: u32,
}

/// Sampling and limit parameters merged from settings, profile, and
/// per-call overrides; later writes win.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Nucleus sampling cutoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Top-k sampling cutoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    /// Stop sequences.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    /// Max output tokens override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ModelParams {
    /// True when every field is unset.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Overlays `other` on `self`; set fields in `other` win.
    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        Self {
            temperature: other.temperature.or(self.temperature),
            top_p: other.top_p.or(self.top_p),
            top_k: other.top_k.or(self.top_k),
            stop_sequences: other
                .stop_sequences
                .clone()
                .or_else(|| self.stop_sequences.clone()),
            max_tokens: other.max_tokens.or(self.max_tokens),
        }
    }
}

/// The model, endpoint, and credential a call resolved to.
#[derive(Clone, Default, PartialEq)]
pub struct ResolvedRequest {
    /// The model identifier to send.
    pub model: String,
    /// Base URL override, when configured.
    pub base_url: Option<String>,
    /// Explicit credential (highest precedence); adapters fall back to
    /// env vars and OAuth when absent.
    pub auth_token: Option<String>,
    /// Merged sampling parameters.
    pub model_params: ModelParams,
}

impl std::fmt::Debug for ResolvedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedRequest")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .field("model_params", &self.model_params)
            .finish()
    }
}

/// The immutable per-call options bundle passed through the provider
/// boundary.
#[derive(Clone)]
pub struct NormalizedGenerateChatOptions {
    /// The conversation history.
    pub contents: Vec<IContent>,
    /// Declared tool groups, possibly empty.
    pub tools: Vec<ToolGroup>,
    /// Frozen settings view at call time.
    pub settings: SettingsSnapshot,
    /// The per-call runtime context.
    pub runtime: Arc<RuntimeContext>,
    /// Resolved model/endpoint/credential.
    pub resolved: ResolvedRequest,
    /// User memory appended to the system prompt.
    pub user_memory: Option<String>,
    /// Free-form per-call metadata.
    pub metadata: HashMap<String, Value>,
    /// Receives retry-engine sleep durations for session accumulation.
    pub throttle_tracker: Option<ThrottleTracker>,
    /// Cancels the call: aborts the in-flight request, stops retry
    /// sleeps, and terminates the stream.
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for NormalizedGenerateChatOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NormalizedGenerateChatOptions")
            .field("contents", &self.contents.len())
            .field("tools", &self.tools.len())
            .field("model", &self.resolved.model)
            .field("runtime_id", &self.runtime.runtime_id())
            .finish()
    }
}

impl NormalizedGenerateChatOptions {
    /// Builds a normalized bundle for one call: captures the settings
    /// snapshot and resolves the model, base URL, explicit credential,
    /// and model parameters for `provider_name`.
    ///
    /// `call_params` overlays the settings-derived model parameters for
    /// this call only; set fields in the override win.
    pub fn normalize(
        contents: Vec<IContent>,
        tools: Vec<ToolGroup>,
        runtime: Arc<RuntimeContext>,
        provider_name: &str,
        default_model: &str,
        call_params: Option<&ModelParams>,
    ) -> Self {
        let settings = SettingsSnapshot::capture(
            runtime.settings().as_ref(),
            runtime.config().map(|c| c.as_ref()),
            provider_name,
        );

        let model = settings
            .provider
            .model
            .clone()
            .or_else(|| runtime.config().and_then(|c| c.model()))
            .unwrap_or_else(|| default_model.to_string());

        let base_url = settings
            .provider
            .base_url
            .clone()
            .or_else(|| settings.base_url_override().map(String::from));

        let auth_token = settings
            .auth_key()
            .map(String::from)
            .or_else(|| settings.provider.api_key.clone());

        let model_params = ModelParams {
            temperature: settings.provider.temperature,
            max_tokens: settings.provider.max_tokens,
            top_p: settings.provider.extra.get("top_p").and_then(Value::as_f64),
            top_k: settings
                .provider
                .extra
                .get("top_k")
                .and_then(Value::as_u64)
                .and_then(|v| u32::try_from(v).ok()),
            stop_sequences: settings
                .provider
                .extra
                .get("stop_sequences")
                .and_then(Value::as_array)
                .map(|seq| {
                    seq.iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                }),
        };
        let model_params = match call_params {
            Some(overrides) => model_params.merged(overrides),
            None => model_params,
        };

        let user_memory = runtime.config().and_then(|c| c.user_memory());

        Self {
            contents,
            tools,
            settings,
            runtime,
            resolved: ResolvedRequest {
                model,
                base_url,
                auth_token,
                model_params,
            },
            user_memory,
            metadata: HashMap::new(),
            throttle_tracker: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Attaches a cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Tool declarations flattened across groups.
    pub fn declared_tools(&self) -> Vec<&DeclaredTool> {
        self.tools.iter().flat_map(|g| g.tools.iter()).collect()
    }

    /// Custom request headers merged from the config accessor and the
    /// ephemeral `custom-headers` setting; later writes win.
    pub fn merged_custom_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        if let Some(config) = self.runtime.config() {
            headers.extend(config.custom_headers());
        }
        headers.extend(self.settings.custom_headers());
        headers
    }
}

/// A named group of tool declarations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolGroup {
    /// The tools in this group.
    pub tools: Vec<DeclaredTool>,
}

/// A tool the model may invoke. Adapters translate this into their
/// native encoding; the core never executes tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclaredTool {
    /// The tool's name, matched against emitted tool-call blocks.
    pub name: String,
    /// Description shown to the model.
    pub description: String,
    /// JSON Schema for the tool's input.
    pub parameters: JsonSchema,
}

/// A JSON Schema document for tool parameters.
///
/// Wraps a [`serde_json::Value`]; validation is available via the
/// [`jsonschema`] crate behind the default-on `schema` feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonSchema(Value);

impl JsonSchema {
    /// Creates a schema from a raw JSON value.
    pub fn new(schema: Value) -> Self {
        Self(schema)
    }

    /// The underlying JSON value.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Derives a schema from a Rust type implementing
    /// [`schemars::JsonSchema`].
    #[cfg(feature = "schema")]
    pub fn from_type<T: schemars::JsonSchema>() -> Result<Self, serde_json::Error> {
        let schema = schemars::schema_for!(T);
        Ok(Self(serde_json::to_value(schema)?))
    }

    /// Validates `value` against this schema.
    #[cfg(feature = "schema")]
    pub fn validate(&self, value: &Value) -> Result<(), LlxprtError> {
        let validator = jsonschema::validator_for(&self.0)
            .map_err(|e| LlxprtError::Input(format!("invalid JSON schema: {e}")))?;
        let errors: Vec<String> = validator.iter_errors(value).map(|e| e.to_string()).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(LlxprtError::Input(format!(
                "tool parameters failed schema validation: {}",
                errors.join("; ")
            )))
        }
    }
}
