//! Settings and config capabilities consumed by the runtime.
//!
//! llxprt does not own a settings file format. It consumes two
//! capabilities supplied by the embedding application:
//!
//! - [`SettingsService`] — scoped key-value storage with per-provider
//!   sub-namespaces and profile export/import hooks. The active-provider
//!   name lives here (single source of truth).
//! - [`ConfigAccessor`] — ephemeral, session-scoped accessors (model
//!   override, user memory, custom headers).
//!
//! [`InMemorySettingsService`] and [`EphemeralConfig`] are reference
//! implementations; embedders with on-disk settings supply their own.
//!
//! Per call, providers read a frozen [`SettingsSnapshot`] so that no
//! mid-call settings mutation can change a request half-way through.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Scoped key-value settings with provider sub-namespaces.
///
/// Implementations guarantee atomic reads and writes for a single key;
/// the provider manager relies on this for the active-provider name.
pub trait SettingsService: Send + Sync {
    /// Reads a top-level setting. `None` when unset or set to null.
    fn get(&self, key: &str) -> Option<Value>;

    /// Writes a top-level setting. Writing `Value::Null` unsets the key.
    fn set(&self, key: &str, value: Value);

    /// Reads the sub-namespace for a provider. Missing providers yield
    /// the default (empty) settings.
    fn provider_settings(&self, name: &str) -> ProviderSettings;

    /// Writes one key in a provider's sub-namespace.
    fn set_provider_setting(&self, name: &str, key: &str, value: Value);

    /// Exports the settings that belong in a saved profile.
    fn export_for_profile(&self) -> HashMap<String, Value>;

    /// Replaces profile-scoped settings from a loaded profile.
    fn import_from_profile(&self, settings: &HashMap<String, Value>);

    /// Records which profile is currently applied.
    fn set_current_profile_name(&self, name: &str);

    /// The currently applied profile, if any.
    fn current_profile_name(&self) -> Option<String>;
}

/// Per-provider settings sub-namespace.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSettings {
    /// Model override for this provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Max output tokens override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Base URL override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Explicit API key (highest credential precedence).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Tool-format dialect override (e.g. `"qwen"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_format: Option<String>,
    /// Provider-specific extras that have no dedicated field.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl std::fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("tool_format", &self.tool_format)
            .field("extra", &self.extra)
            .finish()
    }
}

impl ProviderSettings {
    /// Applies one key by name, routing known keys to their typed field
    /// and everything else to `extra`.
    fn apply(&mut self, key: &str, value: Value) {
        match key {
            "model" => self.model = value.as_str().map(String::from),
            "temperature" => self.temperature = value.as_f64(),
            "maxTokens" | "max_tokens" => {
                self.max_tokens = value.as_u64().and_then(|v| u32::try_from(v).ok());
            }
            "baseUrl" | "base-url" => self.base_url = value.as_str().map(String::from),
            "apiKey" | "api-key" => self.api_key = value.as_str().map(String::from),
            "toolFormat" => self.tool_format = value.as_str().map(String::from),
            _ => {
                if value.is_null() {
                    self.extra.remove(key);
                } else {
                    self.extra.insert(key.to_string(), value);
                }
            }
        }
    }
}

/// Ephemeral, session-scoped configuration accessors.
pub trait ConfigAccessor: Send + Sync {
    /// Session model override.
    fn model(&self) -> Option<String>;

    /// Session provider override.
    fn provider(&self) -> Option<String>;

    /// All ephemeral settings.
    fn ephemeral_settings(&self) -> HashMap<String, Value>;

    /// One ephemeral setting.
    fn ephemeral_setting(&self, key: &str) -> Option<Value> {
        self.ephemeral_settings().get(key).cloned()
    }

    /// Writes one ephemeral setting.
    fn set_ephemeral_setting(&self, key: &str, value: Value);

    /// User memory to append to the system prompt.
    fn user_memory(&self) -> Option<String> {
        None
    }

    /// Custom headers merged into every request.
    fn custom_headers(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Opaque content-generator configuration, when the embedder keeps
    /// one (model routing tables, generation presets).
    fn content_generator_config(&self) -> Option<Value> {
        None
    }

    /// Notifies the embedder that the auth type changed so it can
    /// re-resolve credentials (e.g. after an OAuth login).
    fn refresh_auth(&self, _auth_type: &str) {}
}

/// Reference in-memory [`SettingsService`].
#[derive(Default)]
pub struct InMemorySettingsService {
    values: RwLock<HashMap<String, Value>>,
    providers: RwLock<HashMap<String, ProviderSettings>>,
    profile: RwLock<Option<String>>,
}

impl InMemorySettingsService {
    /// Creates an empty settings store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsService for InMemorySettingsService {
    fn get(&self, key: &str) -> Option<Value> {
        self.values
            .read()
            .expect("settings lock poisoned")
            .get(key)
            .filter(|v| !v.is_null())
            .cloned()
    }

    fn set(&self, key: &str, value: Value) {
        let mut values = self.values.write().expect("settings lock poisoned");
        if value.is_null() {
            values.remove(key);
        } else {
            values.insert(key.to_string(), value);
        }
    }

    fn provider_settings(&self, name: &str) -> ProviderSettings {
        self.providers
            .read()
            .expect("settings lock poisoned")
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    fn set_provider_setting(&self, name: &str, key: &str, value: Value) {
        let mut providers = self.providers.write().expect("settings lock poisoned");
        providers.entry(name.to_string()).or_default().apply(key, value);
    }

    fn export_for_profile(&self) -> HashMap<String, Value> {
        self.values
            .read()
            .expect("settings lock poisoned")
            .clone()
    }

    fn import_from_profile(&self, settings: &HashMap<String, Value>) {
        let mut values = self.values.write().expect("settings lock poisoned");
        for (key, value) in settings {
            if value.is_null() {
                values.remove(key);
            } else {
                values.insert(key.clone(), value.clone());
            }
        }
    }

    fn set_current_profile_name(&self, name: &str) {
        *self.profile.write().expect("settings lock poisoned") = Some(name.to_string());
    }

    fn current_profile_name(&self) -> Option<String> {
        self.profile.read().expect("settings lock poisoned").clone()
    }
}

/// Reference in-memory [`ConfigAccessor`].
#[derive(Default)]
pub struct EphemeralConfig {
    model: RwLock<Option<String>>,
    provider: RwLock<Option<String>>,
    ephemeral: RwLock<HashMap<String, Value>>,
    user_memory: RwLock<Option<String>>,
    headers: RwLock<HashMap<String, String>>,
}

impl EphemeralConfig {
    /// Creates an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the session model override.
    pub fn set_model(&self, model: impl Into<String>) {
        *self.model.write().expect("config lock poisoned") = Some(model.into());
    }

    /// Sets the session provider override.
    pub fn set_provider(&self, provider: impl Into<String>) {
        *self.provider.write().expect("config lock poisoned") = Some(provider.into());
    }

    /// Sets the user memory text.
    pub fn set_user_memory(&self, memory: impl Into<String>) {
        *self.user_memory.write().expect("config lock poisoned") = Some(memory.into());
    }

    /// Adds a custom header applied to every request.
    pub fn set_custom_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.headers
            .write()
            .expect("config lock poisoned")
            .insert(name.into(), value.into());
    }
}

impl ConfigAccessor for EphemeralConfig {
    fn model(&self) -> Option<String> {
        self.model.read().expect("config lock poisoned").clone()
    }

    fn provider(&self) -> Option<String> {
        self.provider.read().expect("config lock poisoned").clone()
    }

    fn ephemeral_settings(&self) -> HashMap<String, Value> {
        self.ephemeral.read().expect("config lock poisoned").clone()
    }

    fn set_ephemeral_setting(&self, key: &str, value: Value) {
        let mut map = self.ephemeral.write().expect("config lock poisoned");
        if value.is_null() {
            map.remove(key);
        } else {
            map.insert(key.to_string(), value);
        }
    }

    fn user_memory(&self) -> Option<String> {
        self.user_memory.read().expect("config lock poisoned").clone()
    }

    fn custom_headers(&self) -> HashMap<String, String> {
        self.headers.read().expect("config lock poisoned").clone()
    }
}

// ── SettingsSnapshot ────────────────────────────────────────────────

/// A frozen, read-only view of settings at call time.
///
/// Captured once when a call's options are normalized; providers read
/// only the snapshot so concurrent settings writes cannot tear a
/// request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsSnapshot {
    /// Active provider name at capture time.
    pub active_provider: Option<String>,
    /// The provider's sub-namespace at capture time.
    pub provider: ProviderSettings,
    /// Ephemeral settings at capture time.
    pub ephemeral: HashMap<String, Value>,
}

impl SettingsSnapshot {
    /// Captures a snapshot for `provider_name` from the given
    /// capabilities.
    pub fn capture(
        settings: &dyn SettingsService,
        config: Option<&dyn ConfigAccessor>,
        provider_name: &str,
    ) -> Self {
        Self {
            active_provider: settings
                .get("activeProvider")
                .and_then(|v| v.as_str().map(String::from)),
            provider: settings.provider_settings(provider_name),
            ephemeral: config.map(ConfigAccessor::ephemeral_settings).unwrap_or_default(),
        }
    }

    /// One ephemeral setting.
    pub fn ephemeral(&self, key: &str) -> Option<&Value> {
        self.ephemeral.get(key)
    }

    /// Streaming is on by default and disabled only when the ephemeral
    /// `streaming` setting equals `"disabled"`.
    pub fn streaming_disabled(&self) -> bool {
        self.ephemeral("streaming")
            .and_then(Value::as_str)
            .is_some_and(|v| v == "disabled")
    }

    /// Per-read socket timeout from the ephemeral `socket-timeout`
    /// setting (milliseconds).
    pub fn socket_timeout(&self) -> Option<Duration> {
        self.ephemeral("socket-timeout")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
    }

    /// The ephemeral `auth-key` setting (explicit credential).
    pub fn auth_key(&self) -> Option<&str> {
        self.ephemeral("auth-key").and_then(Value::as_str)
    }

    /// The ephemeral `base-url` setting.
    pub fn base_url_override(&self) -> Option<&str> {
        self.ephemeral("base-url").and_then(Value::as_str)
    }

    /// The ephemeral `call-id` setting (runtime-key fallback).
    pub fn call_id(&self) -> Option<&str> {
        self.ephemeral("call-id").and_then(Value::as_str)
    }

    /// The ephemeral `custom-headers` map.
    pub fn custom_headers(&self) -> HashMap<String, String> {
        self.ephemeral("custom-headers")
            .and_then(Value::as_object)
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_set_roundtrip() {
        let settings = InMemorySettingsService::new();
        settings.set("activeProvider", json!("openai"));
        assert_eq!(settings.get("activeProvider"), Some(json!("openai")));
    }

    #[test]
    fn test_set_null_unsets() {
        let settings = InMemorySettingsService::new();
        settings.set("k", json!("v"));
        settings.set("k", Value::Null);
        assert_eq!(settings.get("k"), None);
    }

    #[test]
    fn test_provider_settings_default_for_unknown() {
        let settings = InMemorySettingsService::new();
        assert_eq!(settings.provider_settings("nope"), ProviderSettings::default());
    }

    #[test]
    fn test_provider_setting_typed_routing() {
        let settings = InMemorySettingsService::new();
        settings.set_provider_setting("openai", "model", json!("gpt-4o"));
        settings.set_provider_setting("openai", "temperature", json!(0.2));
        settings.set_provider_setting("openai", "maxTokens", json!(2048));
        settings.set_provider_setting("openai", "baseUrl", json!("https://proxy.example"));
        settings.set_provider_setting("openai", "organization", json!("org-1"));

        let ps = settings.provider_settings("openai");
        assert_eq!(ps.model.as_deref(), Some("gpt-4o"));
        assert_eq!(ps.temperature, Some(0.2));
        assert_eq!(ps.max_tokens, Some(2048));
        assert_eq!(ps.base_url.as_deref(), Some("https://proxy.example"));
        assert_eq!(ps.extra.get("organization"), Some(&json!("org-1")));
    }

    #[test]
    fn test_profile_export_import_roundtrip() {
        let settings = InMemorySettingsService::new();
        settings.set("base-url", json!("https://api.example"));
        settings.set("tools.allowed", json!(["read"]));

        let exported = settings.export_for_profile();

        let restored = InMemorySettingsService::new();
        restored.import_from_profile(&exported);
        assert_eq!(restored.get("base-url"), Some(json!("https://api.example")));
        assert_eq!(restored.get("tools.allowed"), Some(json!(["read"])));
    }

    #[test]
    fn test_current_profile_name() {
        let settings = InMemorySettingsService::new();
        assert_eq!(settings.current_profile_name(), None);
        settings.set_current_profile_name("demo");
        assert_eq!(settings.current_profile_name().as_deref(), Some("demo"));
    }

    #[test]
    fn test_snapshot_capture() {
        let settings = InMemorySettingsService::new();
        settings.set("activeProvider", json!("anthropic"));
        settings.set_provider_setting("anthropic", "model", json!("claude-sonnet-4-20250514"));

        let config = EphemeralConfig::new();
        config.set_ephemeral_setting("streaming", json!("disabled"));
        config.set_ephemeral_setting("socket-timeout", json!(5000));

        let snap = SettingsSnapshot::capture(&settings, Some(&config), "anthropic");
        assert_eq!(snap.active_provider.as_deref(), Some("anthropic"));
        assert_eq!(
            snap.provider.model.as_deref(),
            Some("claude-sonnet-4-20250514")
        );
        assert!(snap.streaming_disabled());
        assert_eq!(snap.socket_timeout(), Some(Duration::from_millis(5000)));
    }

    #[test]
    fn test_snapshot_streaming_enabled_by_default() {
        let snap = SettingsSnapshot::default();
        assert!(!snap.streaming_disabled());
    }

    #[test]
    fn test_snapshot_custom_headers() {
        let mut snap = SettingsSnapshot::default();
        snap.ephemeral.insert(
            "custom-headers".into(),
            json!({"x-trace": "abc", "skip": 42}),
        );
        let headers = snap.custom_headers();
        assert_eq!(headers.get("x-trace").map(String::as_str), Some("abc"));
        // Non-string values are ignored.
        assert!(!headers.contains_key("skip"));
    }

    #[test]
    fn test_snapshot_is_frozen_copy() {
        let settings = InMemorySettingsService::new();
        settings.set_provider_setting("openai", "model", json!("gpt-4o"));
        let snap = SettingsSnapshot::capture(&settings, None, "openai");

        // Mutating the live settings does not affect the snapshot.
        settings.set_provider_setting("openai", "model", json!("gpt-5"));
        assert_eq!(snap.provider.model.as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let ps = ProviderSettings {
            api_key: Some("sk-super-secret".into()),
            model: Some("gpt-4o".into()),
            ..Default::default()
        };
        let debug_output = format!("{ps:?}");
        assert!(
            !debug_output.contains("sk-super-secret"),
            "Debug output should not contain the API key"
        );
        assert!(debug_output.contains("[REDACTED]"));
        assert!(debug_output.contains("gpt-4o"));
    }

    #[test]
    fn test_provider_settings_serde() {
        let ps = ProviderSettings {
            model: Some("gpt-4o".into()),
            temperature: Some(0.5),
            ..Default::default()
        };
        let json = serde_json::to_value(&ps).unwrap();
        assert_eq!(json["model"], "gpt-4o");
        let back: ProviderSettings = serde_json::from_value(json).unwrap();
        assert_eq!(back.model.as_deref(), Some("gpt-4o"));
    }
}
