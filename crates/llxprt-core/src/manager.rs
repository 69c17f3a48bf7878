//! The provider manager.
//!
//! The manager owns the name → provider map, the active-provider
//! selection (persisted through the [`SettingsService`] as the single
//! source of truth), per-call runtime snapshots, and session token
//! accounting. Every registered provider is wrapped in a logging
//! decorator that records token usage and throttle waits — the only
//! mutable state associated with a provider identity.
//!
//! # Active-provider state machine
//!
//! States: `unset` and `active(name)`. Registering a provider with
//! `is_default()` while unset activates it; [`set_active_provider`]
//! moves to `active(name)` (erroring on unknown names);
//! [`clear_active_provider`] returns to `unset`. Reading the active
//! provider while unset walks a fallback ladder — settings →
//! config → `"openai"` → first registered — and writes the resolved
//! name back to settings.
//!
//! [`set_active_provider`]: ProviderManager::set_active_provider
//! [`clear_active_provider`]: ProviderManager::clear_active_provider

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::content::IContent;
use crate::error::LlxprtError;
use crate::profile::Profile;
use crate::provider::{
    DynProvider, ModelInfo, ModelParams, NormalizedGenerateChatOptions, ProviderCapabilities,
    ToolGroup,
};
use crate::runtime::{RuntimeContext, RuntimeMetadata, RuntimeServices};
use crate::settings::{ConfigAccessor, SettingsService};
use crate::stream::ContentStream;

/// Environment variable naming the base runtime identity.
pub const RUNTIME_ID_ENV: &str = "LLXPRT_RUNTIME_ID";

/// Settings key holding the active provider name.
pub const ACTIVE_PROVIDER_KEY: &str = "activeProvider";

/// Session token totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionTokenUsage {
    /// Prompt-side tokens.
    pub input: u64,
    /// Completion-side tokens.
    pub output: u64,
    /// Cache-read tokens.
    pub cache: u64,
    /// Tool-use tokens.
    pub tool: u64,
    /// Reasoning tokens.
    pub thought: u64,
    /// Sum of all components.
    pub total: u64,
}

/// One accumulation step. Negative components are clamped to zero
/// before they are added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenUsageDelta {
    /// Prompt-side tokens.
    pub input: i64,
    /// Completion-side tokens.
    pub output: i64,
    /// Cache-read tokens.
    pub cache: i64,
    /// Tool-use tokens.
    pub tool: i64,
    /// Reasoning tokens.
    pub thought: i64,
}

#[derive(Default)]
struct SessionCounters {
    input: AtomicU64,
    output: AtomicU64,
    cache: AtomicU64,
    tool: AtomicU64,
    thought: AtomicU64,
    total: AtomicU64,
    throttle_wait_ms: AtomicU64,
}

impl SessionCounters {
    fn accumulate(&self, delta: &TokenUsageDelta) {
        let input = delta.input.max(0) as u64;
        let output = delta.output.max(0) as u64;
        let cache = delta.cache.max(0) as u64;
        let tool = delta.tool.max(0) as u64;
        let thought = delta.thought.max(0) as u64;
        self.input.fetch_add(input, Ordering::Relaxed);
        self.output.fetch_add(output, Ordering::Relaxed);
        self.cache.fetch_add(cache, Ordering::Relaxed);
        self.tool.fetch_add(tool, Ordering::Relaxed);
        self.thought.fetch_add(thought, Ordering::Relaxed);
        self.total
            .fetch_add(input + output + cache + tool + thought, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SessionTokenUsage {
        SessionTokenUsage {
            input: self.input.load(Ordering::Relaxed),
            output: self.output.load(Ordering::Relaxed),
            cache: self.cache.load(Ordering::Relaxed),
            tool: self.tool.load(Ordering::Relaxed),
            thought: self.thought.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.input.store(0, Ordering::Relaxed);
        self.output.store(0, Ordering::Relaxed);
        self.cache.store(0, Ordering::Relaxed);
        self.tool.store(0, Ordering::Relaxed);
        self.thought.store(0, Ordering::Relaxed);
        self.total.store(0, Ordering::Relaxed);
        self.throttle_wait_ms.store(0, Ordering::Relaxed);
    }
}

/// Emitted when the active provider changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSwitchEvent {
    /// The provider that was active, if any.
    pub previous: Option<String>,
    /// The provider that is now active.
    pub next: String,
}

type SwitchListener = Box<dyn Fn(&ProviderSwitchEvent) + Send + Sync>;

/// Logging/metrics decorator around a registered provider.
///
/// Records usage metadata flowing through the content stream and wires
/// the retry engine's throttle tracker into the session counters.
struct LoggingProvider {
    inner: Arc<dyn DynProvider>,
    counters: Arc<SessionCounters>,
}

impl DynProvider for LoggingProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn generate_chat_completion_boxed<'a>(
        &'a self,
        mut options: NormalizedGenerateChatOptions,
    ) -> std::pin::Pin<
        Box<dyn Future<Output = Result<ContentStream, LlxprtError>> + Send + 'a>,
    > {
        let counters = Arc::clone(&self.counters);
        if options.throttle_tracker.is_none() {
            let sink = Arc::clone(&counters);
            options.throttle_tracker = Some(Arc::new(move |waited| {
                sink.throttle_wait_ms
                    .fetch_add(waited.as_millis() as u64, Ordering::Relaxed);
            }));
        }
        let provider_name = self.inner.name().to_string();
        Box::pin(async move {
            let stream = self.inner.generate_chat_completion_boxed(options).await?;
            let observed = futures::StreamExt::inspect(stream, move |item| {
                if let Ok(content) = item
                    && let Some(meta) = &content.metadata
                    && let Some(usage) = &meta.usage
                {
                    debug!(
                        provider = %provider_name,
                        prompt = usage.prompt_tokens,
                        completion = usage.completion_tokens,
                        "recording token usage"
                    );
                    counters.accumulate(&TokenUsageDelta {
                        input: usage.prompt_tokens as i64,
                        output: usage.completion_tokens as i64,
                        ..Default::default()
                    });
                }
            });
            Ok(Box::pin(observed) as ContentStream)
        })
    }

    fn models(&self) -> Vec<ModelInfo> {
        self.inner.models()
    }

    fn default_model(&self) -> String {
        self.inner.default_model()
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.inner.capabilities()
    }

    fn is_default(&self) -> bool {
        self.inner.is_default()
    }

    fn clear_state(&self) {
        self.inner.clear_state();
    }
}

/// Capability difference between two providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderComparison {
    /// First provider's name.
    pub a: String,
    /// Second provider's name.
    pub b: String,
    /// Capability flags only `a` has.
    pub only_a: Vec<&'static str>,
    /// Capability flags only `b` has.
    pub only_b: Vec<&'static str>,
}

/// Owns provider registration, active-provider routing, runtime
/// snapshots, and session accounting.
pub struct ProviderManager {
    providers: RwLock<HashMap<String, Arc<LoggingProvider>>>,
    settings: Arc<dyn SettingsService>,
    config: Option<Arc<dyn ConfigAccessor>>,
    services: RuntimeServices,
    server_tools_provider: RwLock<Option<String>>,
    counters: Arc<SessionCounters>,
    capabilities: RwLock<HashMap<String, ProviderCapabilities>>,
    switch_listeners: RwLock<Vec<SwitchListener>>,
    base_runtime_id: String,
}

impl ProviderManager {
    /// Creates a manager over the given capabilities. The base runtime
    /// identity comes from `LLXPRT_RUNTIME_ID`, defaulting to
    /// `"llxprt"`.
    pub fn new(
        settings: Arc<dyn SettingsService>,
        config: Option<Arc<dyn ConfigAccessor>>,
    ) -> Self {
        let base_runtime_id = std::env::var(RUNTIME_ID_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "llxprt".to_string());
        Self {
            providers: RwLock::new(HashMap::new()),
            settings,
            config,
            services: RuntimeServices::new(),
            server_tools_provider: RwLock::new(None),
            counters: Arc::new(SessionCounters::default()),
            capabilities: RwLock::new(HashMap::new()),
            switch_listeners: RwLock::new(Vec::new()),
            base_runtime_id,
        }
    }

    /// Shared runtime services (client cache, auth resolver, prompts).
    pub fn services(&self) -> &RuntimeServices {
        &self.services
    }

    /// Registers a provider, wrapping it in the logging decorator. A
    /// default provider becomes active when nothing is active yet.
    pub fn register_provider(&self, provider: Arc<dyn DynProvider>) {
        let name = provider.name().to_lowercase();
        let captured = capture_capabilities(provider.as_ref());
        self.capabilities
            .write()
            .expect("capabilities lock poisoned")
            .insert(name.clone(), captured);

        let make_default = provider.is_default() && self.active_provider_name().is_none();
        self.providers
            .write()
            .expect("provider lock poisoned")
            .insert(
                name.clone(),
                Arc::new(LoggingProvider {
                    inner: provider,
                    counters: Arc::clone(&self.counters),
                }),
            );
        if make_default {
            self.settings.set(ACTIVE_PROVIDER_KEY, Value::String(name));
        }
    }

    /// Names of all registered providers, sorted.
    pub fn list_providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .providers
            .read()
            .expect("provider lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// The active provider name as stored in settings, if any.
    pub fn active_provider_name(&self) -> Option<String> {
        self.settings
            .get(ACTIVE_PROVIDER_KEY)
            .and_then(|v| v.as_str().map(String::from))
    }

    /// Switches the active provider. Unknown names error. Switching
    /// away from a non-server-tools provider clears its auth state.
    pub fn set_active_provider(&self, name: &str) -> Result<(), LlxprtError> {
        let name = name.to_lowercase();
        let providers = self.providers.read().expect("provider lock poisoned");
        if !providers.contains_key(&name) {
            let mut available: Vec<&String> = providers.keys().collect();
            available.sort();
            return Err(LlxprtError::Config(format!(
                "unknown provider '{name}'. Available: {available:?}"
            )));
        }

        let previous = self.active_provider_name();
        if let Some(prev) = &previous
            && prev != &name
        {
            let pinned = self
                .server_tools_provider
                .read()
                .expect("server tools lock poisoned")
                .clone();
            if pinned.as_deref() != Some(prev.as_str())
                && let Some(prev_provider) = providers.get(prev)
            {
                debug!(provider = %prev, "clearing state of previous provider");
                prev_provider.clear_state();
            }
        }
        drop(providers);

        self.settings
            .set(ACTIVE_PROVIDER_KEY, Value::String(name.clone()));
        let event = ProviderSwitchEvent {
            previous,
            next: name.clone(),
        };
        info!(from = ?event.previous, to = %event.next, "provider switch");
        for listener in self
            .switch_listeners
            .read()
            .expect("listener lock poisoned")
            .iter()
        {
            listener(&event);
        }
        Ok(())
    }

    /// Returns the active-provider state to `unset`.
    pub fn clear_active_provider(&self) {
        self.settings.set(ACTIVE_PROVIDER_KEY, Value::Null);
    }

    /// Registers a callback invoked on every provider switch.
    pub fn on_provider_switch(
        &self,
        listener: impl Fn(&ProviderSwitchEvent) + Send + Sync + 'static,
    ) {
        self.switch_listeners
            .write()
            .expect("listener lock poisoned")
            .push(Box::new(listener));
    }

    /// Resolves the active provider, walking the fallback ladder when
    /// no name is set: settings → config → `"openai"` → first
    /// registered. A name resolved by fallback is written back to
    /// settings before returning.
    pub fn get_active_provider(&self) -> Result<Arc<dyn DynProvider>, LlxprtError> {
        let providers = self.providers.read().expect("provider lock poisoned");
        if providers.is_empty() {
            return Err(LlxprtError::Config("no providers registered".into()));
        }

        if let Some(name) = self.active_provider_name()
            && let Some(provider) = providers.get(&name)
        {
            return Ok(Arc::clone(provider) as Arc<dyn DynProvider>);
        }

        let fallback = self
            .config
            .as_ref()
            .and_then(|c| c.provider())
            .map(|n| n.to_lowercase())
            .filter(|n| providers.contains_key(n))
            .or_else(|| {
                providers
                    .contains_key("openai")
                    .then(|| "openai".to_string())
            })
            .or_else(|| {
                let mut names: Vec<&String> = providers.keys().collect();
                names.sort();
                names.first().map(|n| (*n).to_string())
            })
            .expect("non-empty map has a first provider");

        debug!(provider = %fallback, "active provider resolved by fallback ladder");
        self.settings
            .set(ACTIVE_PROVIDER_KEY, Value::String(fallback.clone()));
        Ok(Arc::clone(&providers[&fallback]) as Arc<dyn DynProvider>)
    }

    /// Pins a provider as the server-tools provider; its auth state is
    /// not cleared on switches.
    pub fn set_server_tools_provider(&self, name: &str) -> Result<(), LlxprtError> {
        let name = name.to_lowercase();
        if !self
            .providers
            .read()
            .expect("provider lock poisoned")
            .contains_key(&name)
        {
            return Err(LlxprtError::Config(format!(
                "unknown provider '{name}' for server tools"
            )));
        }
        *self
            .server_tools_provider
            .write()
            .expect("server tools lock poisoned") = Some(name);
        Ok(())
    }

    /// The pinned server-tools provider, if any.
    pub fn get_server_tools_provider(&self) -> Option<Arc<dyn DynProvider>> {
        let name = self
            .server_tools_provider
            .read()
            .expect("server tools lock poisoned")
            .clone()?;
        self.providers
            .read()
            .expect("provider lock poisoned")
            .get(&name)
            .map(|p| Arc::clone(p) as Arc<dyn DynProvider>)
    }

    /// Models served by `name`, or by the active provider when `None`.
    pub fn get_available_models(&self, name: Option<&str>) -> Result<Vec<ModelInfo>, LlxprtError> {
        match name {
            Some(name) => {
                let name = name.to_lowercase();
                let providers = self.providers.read().expect("provider lock poisoned");
                providers
                    .get(&name)
                    .map(|p| p.models())
                    .ok_or_else(|| LlxprtError::Config(format!("unknown provider '{name}'")))
            }
            None => Ok(self.get_active_provider()?.models()),
        }
    }

    /// Captured capabilities for `name`, or for the active provider.
    pub fn get_provider_capabilities(
        &self,
        name: Option<&str>,
    ) -> Result<ProviderCapabilities, LlxprtError> {
        let name = match name {
            Some(n) => n.to_lowercase(),
            None => self.get_active_provider()?.name().to_lowercase(),
        };
        self.capabilities
            .read()
            .expect("capabilities lock poisoned")
            .get(&name)
            .cloned()
            .ok_or_else(|| LlxprtError::Config(format!("unknown provider '{name}'")))
    }

    /// Capability diff between two registered providers.
    pub fn compare_providers(&self, a: &str, b: &str) -> Result<ProviderComparison, LlxprtError> {
        let caps_a = self.get_provider_capabilities(Some(a))?;
        let caps_b = self.get_provider_capabilities(Some(b))?;
        let flags = |caps: &ProviderCapabilities| -> Vec<&'static str> {
            let mut present = Vec::new();
            if caps.supports_streaming {
                present.push("streaming");
            }
            if caps.supports_tools {
                present.push("tools");
            }
            if caps.supports_vision {
                present.push("vision");
            }
            if caps.supports_paid_mode {
                present.push("paid-mode");
            }
            present
        };
        let set_a = flags(&caps_a);
        let set_b = flags(&caps_b);
        Ok(ProviderComparison {
            a: a.to_lowercase(),
            b: b.to_lowercase(),
            only_a: set_a
                .iter()
                .copied()
                .filter(|f| !set_b.contains(f))
                .collect(),
            only_b: set_b
                .iter()
                .copied()
                .filter(|f| !set_a.contains(f))
                .collect(),
        })
    }

    /// Mints a fresh per-call [`RuntimeContext`]: the base runtime id
    /// plus a short random suffix, stamped with the source tag. Missing
    /// config is fatal.
    pub fn snapshot_runtime_context(
        &self,
        source: &str,
    ) -> Result<RuntimeContext, LlxprtError> {
        let Some(config) = &self.config else {
            return Err(LlxprtError::MissingProviderRuntime {
                provider_key: self.active_provider_name().unwrap_or_default(),
                missing_fields: vec!["config".into()],
                stage: "snapshot".into(),
                metadata: serde_json::json!({ "source": source }),
            });
        };
        let suffix: String = {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            (0..6)
                .map(|_| {
                    let n: u8 = rng.gen_range(0..16);
                    char::from_digit(u32::from(n), 16).expect("hex digit")
                })
                .collect()
        };
        let runtime_id = format!("{}-{suffix}", self.base_runtime_id);
        Ok(RuntimeContext::new(
            Arc::clone(&self.settings),
            Some(Arc::clone(config)),
            runtime_id,
            RuntimeMetadata::for_source(source),
        ))
    }

    /// Runs one chat call against the active provider: snapshots a
    /// runtime context, normalizes options, and delegates.
    ///
    /// `model_params` overrides sampling parameters for this call only,
    /// winning over the settings- and profile-derived values.
    pub async fn generate_chat_completion(
        &self,
        contents: Vec<IContent>,
        tools: Vec<ToolGroup>,
        model_params: Option<&ModelParams>,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<ContentStream, LlxprtError> {
        let provider = self.get_active_provider()?;
        let runtime = Arc::new(self.snapshot_runtime_context("chat")?);
        let options = NormalizedGenerateChatOptions::normalize(
            contents,
            tools,
            runtime,
            provider.name(),
            &provider.default_model(),
            model_params,
        )
        .with_cancel(cancel);
        provider.generate_chat_completion_boxed(options).await
    }

    /// Applies a saved profile: writes its model and sampling
    /// parameters into the provider's settings sub-namespace, imports
    /// its ephemeral settings, and records the profile name. Later
    /// writes win over whatever the settings held before.
    pub fn apply_profile(&self, name: &str, profile: &Profile) {
        self.settings.set_provider_setting(
            &profile.provider,
            "model",
            Value::String(profile.model.clone()),
        );
        let params = &profile.model_params;
        if let Some(temperature) = params.temperature {
            self.settings
                .set_provider_setting(&profile.provider, "temperature", Value::from(temperature));
        }
        if let Some(max_tokens) = params.max_tokens {
            self.settings.set_provider_setting(
                &profile.provider,
                "maxTokens",
                Value::from(max_tokens),
            );
        }
        if let Some(top_p) = params.top_p {
            self.settings
                .set_provider_setting(&profile.provider, "top_p", Value::from(top_p));
        }
        if let Some(top_k) = params.top_k {
            self.settings
                .set_provider_setting(&profile.provider, "top_k", Value::from(top_k));
        }
        if let Some(stop_sequences) = &params.stop_sequences {
            self.settings.set_provider_setting(
                &profile.provider,
                "stop_sequences",
                Value::from(stop_sequences.clone()),
            );
        }
        self.settings.import_from_profile(&profile.ephemeral_settings);
        self.settings.set_current_profile_name(name);
    }

    /// Adds one usage step to the session totals. Negative components
    /// clamp to zero; no update is lost under concurrency.
    pub fn accumulate_session_tokens(&self, provider: &str, delta: &TokenUsageDelta) {
        debug!(provider = %provider, ?delta, "accumulating session tokens");
        self.counters.accumulate(delta);
    }

    /// Current session token totals.
    pub fn get_session_token_usage(&self) -> SessionTokenUsage {
        self.counters.snapshot()
    }

    /// Total time the retry engine spent sleeping this session, in
    /// milliseconds.
    pub fn get_session_throttle_wait_ms(&self) -> u64 {
        self.counters.throttle_wait_ms.load(Ordering::Relaxed)
    }

    /// Zeroes all session counters.
    pub fn reset_session_token_usage(&self) {
        self.counters.reset();
    }

    /// Evicts the auth and HTTP-client caches for one runtime.
    pub fn clear_auth_cache(&self, runtime_key: &str) {
        self.services.clear_runtime(runtime_key);
    }
}

/// Merges hard-coded per-name hints with runtime detection.
fn capture_capabilities(provider: &dyn DynProvider) -> ProviderCapabilities {
    let mut caps = provider.capabilities();
    // Per-name hints for providers whose adapters predate a flag.
    match provider.name().to_lowercase().as_str() {
        "gemini" | "anthropic" => caps.supports_vision = true,
        _ => {}
    }
    // Vision support inferred from model naming.
    let model = provider.default_model().to_lowercase();
    if model.contains("vision") || model.contains("4o") || model.contains("gemini") {
        caps.supports_vision = true;
    }
    caps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::UsageStats;
    use crate::history::ToolFormat;
    use crate::provider::Provider;
    use crate::settings::{EphemeralConfig, InMemorySettingsService};
    use crate::stream::{collect_stream, stream_from_items};
    use std::sync::Mutex;

    struct ScriptedProvider {
        name: String,
        default: bool,
        cleared: Arc<Mutex<u32>>,
        items: Vec<IContent>,
    }

    impl ScriptedProvider {
        fn new(name: &str) -> Self {
            Self {
                name: name.into(),
                default: false,
                cleared: Arc::default(),
                items: vec![IContent::ai_text("ok")],
            }
        }
    }

    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn generate_chat_completion(
            &self,
            _options: NormalizedGenerateChatOptions,
        ) -> Result<ContentStream, LlxprtError> {
            Ok(stream_from_items(self.items.clone()))
        }

        fn models(&self) -> Vec<ModelInfo> {
            vec![ModelInfo {
                id: format!("{}-model", self.name),
                name: format!("{} model", self.name),
                provider: self.name.clone(),
                supported_tool_formats: vec![ToolFormat::OpenAi],
                context_window: 128_000,
                max_output_tokens: 4096,
            }]
        }

        fn default_model(&self) -> String {
            format!("{}-model", self.name)
        }

        fn capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities::default()
        }

        fn is_default(&self) -> bool {
            self.default
        }

        fn clear_state(&self) {
            *self.cleared.lock().unwrap() += 1;
        }
    }

    fn manager_with(names: &[&str]) -> ProviderManager {
        let settings: Arc<dyn SettingsService> = Arc::new(InMemorySettingsService::new());
        let config: Arc<dyn ConfigAccessor> = Arc::new(EphemeralConfig::new());
        let manager = ProviderManager::new(settings, Some(config));
        for name in names {
            manager.register_provider(Arc::new(ScriptedProvider::new(name)));
        }
        manager
    }

    #[test]
    fn test_register_and_list() {
        let manager = manager_with(&["anthropic", "openai"]);
        assert_eq!(manager.list_providers(), vec!["anthropic", "openai"]);
    }

    #[test]
    fn test_set_active_unknown_errors() {
        let manager = manager_with(&["openai"]);
        assert!(manager.set_active_provider("nope").is_err());
    }

    #[test]
    fn test_set_active_writes_settings() {
        let manager = manager_with(&["openai", "anthropic"]);
        manager.set_active_provider("anthropic").unwrap();
        assert_eq!(manager.active_provider_name().as_deref(), Some("anthropic"));
    }

    #[test]
    fn test_fallback_prefers_openai_and_writes_back() {
        let manager = manager_with(&["gemini", "openai"]);
        let provider = manager.get_active_provider().unwrap();
        assert_eq!(provider.name(), "openai");
        assert_eq!(manager.active_provider_name().as_deref(), Some("openai"));
    }

    #[test]
    fn test_fallback_first_registered_when_no_openai() {
        let manager = manager_with(&["gemini", "anthropic"]);
        let provider = manager.get_active_provider().unwrap();
        assert_eq!(provider.name(), "anthropic");
    }

    #[test]
    fn test_fallback_uses_config_provider() {
        let settings: Arc<dyn SettingsService> = Arc::new(InMemorySettingsService::new());
        let config = Arc::new(EphemeralConfig::new());
        config.set_provider("gemini");
        let manager = ProviderManager::new(settings, Some(config as Arc<dyn ConfigAccessor>));
        manager.register_provider(Arc::new(ScriptedProvider::new("gemini")));
        manager.register_provider(Arc::new(ScriptedProvider::new("openai")));
        assert_eq!(manager.get_active_provider().unwrap().name(), "gemini");
    }

    #[test]
    fn test_no_providers_errors() {
        let manager = manager_with(&[]);
        assert!(manager.get_active_provider().is_err());
    }

    #[test]
    fn test_default_provider_activates_on_register() {
        let settings: Arc<dyn SettingsService> = Arc::new(InMemorySettingsService::new());
        let manager = ProviderManager::new(settings, None);
        let mut provider = ScriptedProvider::new("anthropic");
        provider.default = true;
        manager.register_provider(Arc::new(provider));
        assert_eq!(manager.active_provider_name().as_deref(), Some("anthropic"));
    }

    #[test]
    fn test_clear_active_provider() {
        let manager = manager_with(&["openai"]);
        manager.set_active_provider("openai").unwrap();
        manager.clear_active_provider();
        assert_eq!(manager.active_provider_name(), None);
    }

    #[test]
    fn test_switch_clears_previous_state() {
        let settings: Arc<dyn SettingsService> = Arc::new(InMemorySettingsService::new());
        let manager = ProviderManager::new(settings, None);
        let previous = ScriptedProvider::new("openai");
        let cleared = Arc::clone(&previous.cleared);
        manager.register_provider(Arc::new(previous));
        manager.register_provider(Arc::new(ScriptedProvider::new("anthropic")));

        manager.set_active_provider("openai").unwrap();
        manager.set_active_provider("anthropic").unwrap();
        assert_eq!(*cleared.lock().unwrap(), 1);
    }

    #[test]
    fn test_server_tools_provider_exempt_from_clear() {
        let settings: Arc<dyn SettingsService> = Arc::new(InMemorySettingsService::new());
        let manager = ProviderManager::new(settings, None);
        let gemini = ScriptedProvider::new("gemini");
        let cleared = Arc::clone(&gemini.cleared);
        manager.register_provider(Arc::new(gemini));
        manager.register_provider(Arc::new(ScriptedProvider::new("openai")));
        manager.set_server_tools_provider("gemini").unwrap();

        manager.set_active_provider("gemini").unwrap();
        manager.set_active_provider("openai").unwrap();
        assert_eq!(*cleared.lock().unwrap(), 0);
        assert_eq!(
            manager.get_server_tools_provider().unwrap().name(),
            "gemini"
        );
    }

    #[test]
    fn test_switch_event_emitted() {
        let manager = manager_with(&["openai", "anthropic"]);
        let events: Arc<Mutex<Vec<ProviderSwitchEvent>>> = Arc::default();
        let sink = Arc::clone(&events);
        manager.on_provider_switch(move |e| sink.lock().unwrap().push(e.clone()));

        manager.set_active_provider("openai").unwrap();
        manager.set_active_provider("anthropic").unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].previous.as_deref(), Some("openai"));
        assert_eq!(events[1].next, "anthropic");
    }

    #[test]
    fn test_snapshot_runtime_context() {
        let manager = manager_with(&["openai"]);
        let a = manager.snapshot_runtime_context("chat").unwrap();
        let b = manager.snapshot_runtime_context("chat").unwrap();
        assert_ne!(a.runtime_id(), b.runtime_id());
        assert!(a.runtime_id().starts_with("llxprt-"));
        assert_eq!(a.metadata().source.as_deref(), Some("chat"));
    }

    #[test]
    fn test_snapshot_without_config_is_fatal() {
        let settings: Arc<dyn SettingsService> = Arc::new(InMemorySettingsService::new());
        let manager = ProviderManager::new(settings, None);
        let err = manager.snapshot_runtime_context("chat").unwrap_err();
        match err {
            LlxprtError::MissingProviderRuntime { missing_fields, .. } => {
                assert_eq!(missing_fields, vec!["config".to_string()]);
            }
            other => panic!("expected MissingProviderRuntime, got {other:?}"),
        }
    }

    #[test]
    fn test_session_token_accumulation_clamps_negatives() {
        let manager = manager_with(&["openai"]);
        manager.accumulate_session_tokens(
            "openai",
            &TokenUsageDelta {
                input: 100,
                output: -5,
                cache: 3,
                ..Default::default()
            },
        );
        let usage = manager.get_session_token_usage();
        assert_eq!(usage.input, 100);
        assert_eq!(usage.output, 0);
        assert_eq!(usage.cache, 3);
        assert_eq!(usage.total, 103);
    }

    #[test]
    fn test_session_token_accumulation_commutes() {
        let manager = manager_with(&["openai"]);
        manager.accumulate_session_tokens("openai", &TokenUsageDelta { input: 1, ..Default::default() });
        manager.accumulate_session_tokens("openai", &TokenUsageDelta { input: 2, ..Default::default() });

        let other = manager_with(&["openai"]);
        other.accumulate_session_tokens("openai", &TokenUsageDelta { input: 2, ..Default::default() });
        other.accumulate_session_tokens("openai", &TokenUsageDelta { input: 1, ..Default::default() });

        assert_eq!(manager.get_session_token_usage(), other.get_session_token_usage());
    }

    #[test]
    fn test_reset_session_tokens() {
        let manager = manager_with(&["openai"]);
        manager.accumulate_session_tokens("openai", &TokenUsageDelta { input: 9, ..Default::default() });
        manager.reset_session_token_usage();
        assert_eq!(manager.get_session_token_usage(), SessionTokenUsage::default());
    }

    #[tokio::test]
    async fn test_decorator_records_stream_usage() {
        let settings: Arc<dyn SettingsService> = Arc::new(InMemorySettingsService::new());
        let config: Arc<dyn ConfigAccessor> = Arc::new(EphemeralConfig::new());
        let manager = ProviderManager::new(settings, Some(config));
        let mut provider = ScriptedProvider::new("openai");
        provider.items = vec![
            IContent::ai_text("hello"),
            IContent::usage(UsageStats::new(7, 5)),
        ];
        manager.register_provider(Arc::new(provider));

        let stream = manager
            .generate_chat_completion(
                vec![IContent::human("hi")],
                vec![],
                None,
                tokio_util::sync::CancellationToken::new(),
            )
            .await
            .unwrap();
        let items = collect_stream(stream).await.unwrap();
        assert_eq!(items.len(), 2);

        let usage = manager.get_session_token_usage();
        assert_eq!(usage.input, 7);
        assert_eq!(usage.output, 5);
        assert_eq!(usage.total, 12);
    }

    #[test]
    fn test_apply_profile_writes_settings() {
        let settings = Arc::new(InMemorySettingsService::new());
        let config: Arc<dyn ConfigAccessor> = Arc::new(EphemeralConfig::new());
        let manager = ProviderManager::new(
            Arc::clone(&settings) as Arc<dyn SettingsService>,
            Some(config),
        );

        let mut profile = Profile::new("openai", "gpt-4o-mini");
        profile.model_params.temperature = Some(0.5);
        profile
            .ephemeral_settings
            .insert("base-url".into(), serde_json::json!("https://proxy.example"));
        manager.apply_profile("demo", &profile);

        let provider_settings = settings.provider_settings("openai");
        assert_eq!(provider_settings.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(provider_settings.temperature, Some(0.5));
        assert_eq!(
            settings.get("base-url"),
            Some(serde_json::json!("https://proxy.example"))
        );
        assert_eq!(settings.current_profile_name().as_deref(), Some("demo"));
    }

    #[test]
    fn test_model_params_three_way_precedence() {
        let settings = Arc::new(InMemorySettingsService::new());
        let config: Arc<dyn ConfigAccessor> = Arc::new(EphemeralConfig::new());
        let manager = ProviderManager::new(
            Arc::clone(&settings) as Arc<dyn SettingsService>,
            Some(config),
        );
        manager.register_provider(Arc::new(ScriptedProvider::new("openai")));

        // Layer 1: persisted provider settings.
        settings.set_provider_setting("openai", "temperature", serde_json::json!(0.2));
        settings.set_provider_setting("openai", "maxTokens", serde_json::json!(1024));
        settings.set_provider_setting("openai", "top_p", serde_json::json!(0.9));

        // Layer 2: an applied profile overwrites what it names.
        let mut profile = Profile::new("openai", "gpt-4o");
        profile.model_params.temperature = Some(0.5);
        profile.model_params.stop_sequences = Some(vec!["END".into()]);
        manager.apply_profile("demo", &profile);

        // Layer 3: per-call override wins over both.
        let call_params = ModelParams {
            temperature: Some(0.9),
            ..Default::default()
        };
        let runtime = Arc::new(manager.snapshot_runtime_context("chat").unwrap());
        let options = NormalizedGenerateChatOptions::normalize(
            vec![],
            vec![],
            runtime,
            "openai",
            "gpt-4o",
            Some(&call_params),
        );

        let params = &options.resolved.model_params;
        assert_eq!(params.temperature, Some(0.9)); // per-call
        assert_eq!(params.stop_sequences, Some(vec!["END".to_string()])); // profile
        assert_eq!(params.max_tokens, Some(1024)); // settings
        assert_eq!(params.top_p, Some(0.9)); // settings
    }

    #[test]
    fn test_get_available_models() {
        let manager = manager_with(&["openai", "anthropic"]);
        let models = manager.get_available_models(Some("anthropic")).unwrap();
        assert_eq!(models[0].id, "anthropic-model");
        assert!(manager.get_available_models(Some("ghost")).is_err());
    }

    #[test]
    fn test_compare_providers() {
        let manager = manager_with(&["openai"]);
        // Anthropic gets a vision hint at capture time; openai does not.
        manager.register_provider(Arc::new(ScriptedProvider::new("anthropic")));
        let diff = manager.compare_providers("anthropic", "openai").unwrap();
        assert!(diff.only_a.contains(&"vision"));
        assert!(diff.only_b.is_empty());
    }

    #[test]
    fn test_capability_capture_hints() {
        let manager = manager_with(&["gemini"]);
        let caps = manager.get_provider_capabilities(Some("gemini")).unwrap();
        assert!(caps.supports_vision);
    }
}
