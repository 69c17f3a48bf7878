//! Per-call runtime contexts.
//!
//! A [`RuntimeContext`] is an immutable bundle constructed at call entry
//! and dropped at call end: which settings and config a call sees, under
//! which runtime identity. Two concurrent calls with different runtime
//! ids never share cached HTTP clients or credentials — the caches key
//! on the runtime id (see [`client_cache`](crate::client_cache)).
//!
//! Contexts are never shared between calls except by explicit snapshot
//! copy; the provider manager mints a fresh one per call via
//! [`snapshot_runtime_context`](crate::manager::ProviderManager::snapshot_runtime_context).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::auth::AuthResolver;
use crate::client_cache::ClientCache;
use crate::prompt::PromptComposer;
use crate::settings::{ConfigAccessor, SettingsService};

/// Immutable per-call runtime bundle.
#[derive(Clone)]
pub struct RuntimeContext {
    settings: Arc<dyn SettingsService>,
    config: Option<Arc<dyn ConfigAccessor>>,
    runtime_id: String,
    metadata: RuntimeMetadata,
}

/// Metadata describing where and when a runtime context was created.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeMetadata {
    /// Tag naming the call site (e.g. `"chat"`, `"completion"`).
    pub source: Option<String>,
    /// Runtime id carried in metadata; a fallback for the cache key
    /// ladder when the context id itself is unavailable.
    pub runtime_id: Option<String>,
    /// Creation time, milliseconds since the Unix epoch.
    pub created_at_ms: u64,
    /// Free-form extras.
    pub extra: HashMap<String, Value>,
}

impl RuntimeMetadata {
    /// Metadata stamped with the current time and a source tag.
    pub fn for_source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            created_at_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            ..Default::default()
        }
    }
}

impl RuntimeContext {
    /// Creates a context. The bundle is frozen from this point on.
    pub fn new(
        settings: Arc<dyn SettingsService>,
        config: Option<Arc<dyn ConfigAccessor>>,
        runtime_id: impl Into<String>,
        metadata: RuntimeMetadata,
    ) -> Self {
        Self {
            settings,
            config,
            runtime_id: runtime_id.into(),
            metadata,
        }
    }

    /// The settings service this call reads.
    pub fn settings(&self) -> &Arc<dyn SettingsService> {
        &self.settings
    }

    /// The config accessor, when one was supplied.
    pub fn config(&self) -> Option<&Arc<dyn ConfigAccessor>> {
        self.config.as_ref()
    }

    /// The runtime identity of this call.
    pub fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    /// Creation metadata.
    pub fn metadata(&self) -> &RuntimeMetadata {
        &self.metadata
    }
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("runtime_id", &self.runtime_id)
            .field("metadata", &self.metadata)
            .field("has_config", &self.config.is_some())
            .finish()
    }
}

/// Shared runtime services handed to every provider adapter.
///
/// One instance per manager; adapters hold an [`Arc`] and never any
/// per-conversation state.
#[derive(Clone)]
pub struct RuntimeServices {
    /// The keyed HTTP client cache.
    pub clients: Arc<ClientCache>,
    /// The credential resolver.
    pub auth: Arc<AuthResolver>,
    /// The system-prompt composer.
    pub prompts: Arc<PromptComposer>,
}

impl RuntimeServices {
    /// Builds the default service set (prompt dir from the environment).
    pub fn new() -> Self {
        Self {
            clients: Arc::new(ClientCache::new()),
            auth: Arc::new(AuthResolver::new()),
            prompts: Arc::new(PromptComposer::from_env()),
        }
    }

    /// Evicts the auth and HTTP-client caches for one runtime.
    pub fn clear_runtime(&self, runtime_key: &str) {
        self.auth.clear_runtime(runtime_key);
        self.clients.clear_runtime(runtime_key);
    }
}

impl Default for RuntimeServices {
    fn default() -> Self {
        Self::new()
    }
}
