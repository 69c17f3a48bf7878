//! Keyed HTTP client cache.
//!
//! Clients are cached under `(runtime_key, normalized_base_url,
//! sha256(auth_token))`. Hashing the token keeps plaintext out of the
//! key space while making credential rotations produce cache misses.
//! A per-runtime index of keys enables bulk eviction when a runtime
//! ends, without scanning the whole map.
//!
//! Insertion is an atomic get-or-insert on a concurrent map: readers
//! never block writers. Two runtimes with different ids can never
//! observe each other's clients because the runtime key is part of the
//! cache key.

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::error::LlxprtError;
use crate::provider::NormalizedGenerateChatOptions;

/// Substitute for an unset base URL in cache keys.
pub const DEFAULT_ENDPOINT: &str = "default-endpoint";

/// Sentinel runtime key when no identity can be derived.
pub const FALLBACK_RUNTIME_KEY: &str = "llxprt-shared";

/// Derives the runtime key for a call: the runtime context id, then the
/// metadata runtime id, then the ephemeral `call-id` setting, then the
/// shared sentinel.
pub fn runtime_key(options: &NormalizedGenerateChatOptions) -> String {
    let id = options.runtime.runtime_id();
    if !id.is_empty() {
        return id.to_string();
    }
    if let Some(meta_id) = &options.runtime.metadata().runtime_id
        && !meta_id.is_empty()
    {
        return meta_id.clone();
    }
    if let Some(call_id) = options.settings.call_id() {
        return call_id.to_string();
    }
    FALLBACK_RUNTIME_KEY.to_string()
}

/// Strips trailing slashes; an empty or absent URL becomes
/// [`DEFAULT_ENDPOINT`].
pub fn normalize_base_url(url: Option<&str>) -> String {
    match url {
        Some(u) => {
            let trimmed = u.trim_end_matches('/');
            if trimmed.is_empty() {
                DEFAULT_ENDPOINT.to_string()
            } else {
                trimmed.to_string()
            }
        }
        None => DEFAULT_ENDPOINT.to_string(),
    }
}

fn hash_token(token: Option<&str>) -> String {
    let digest = Sha256::digest(token.unwrap_or("").as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Full cache key for one client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    /// The runtime identity component.
    pub runtime_key: String,
    /// Normalized base URL.
    pub base_url: String,
    /// Hex SHA-256 of the auth token (empty token hashes too).
    pub auth_hash: String,
}

impl ClientKey {
    /// Builds a key, normalizing the URL and hashing the token.
    pub fn new(runtime_key: impl Into<String>, base_url: Option<&str>, token: Option<&str>) -> Self {
        Self {
            runtime_key: runtime_key.into(),
            base_url: normalize_base_url(base_url),
            auth_hash: hash_token(token),
        }
    }
}

/// Concurrent client cache with per-runtime eviction.
#[derive(Default)]
pub struct ClientCache {
    clients: DashMap<ClientKey, reqwest::Client>,
    by_runtime: DashMap<String, Vec<ClientKey>>,
}

impl ClientCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached client for `key`, or builds, stores, and
    /// returns a new one. `reqwest::Client` is cheaply cloneable
    /// (internally reference-counted), so the returned value shares the
    /// cached connection pool.
    pub fn get_or_insert_with<F>(&self, key: &ClientKey, build: F) -> Result<reqwest::Client, LlxprtError>
    where
        F: FnOnce() -> Result<reqwest::Client, LlxprtError>,
    {
        if let Some(existing) = self.clients.get(key) {
            return Ok(existing.clone());
        }
        let built = build()?;
        let client = self
            .clients
            .entry(key.clone())
            .or_insert(built)
            .clone();
        let mut index = self.by_runtime.entry(key.runtime_key.clone()).or_default();
        if !index.contains(key) {
            index.push(key.clone());
        }
        Ok(client)
    }

    /// Evicts every client cached under `runtime_key`. Returns how many
    /// entries were removed.
    pub fn clear_runtime(&self, runtime_key: &str) -> usize {
        let Some((_, keys)) = self.by_runtime.remove(runtime_key) else {
            return 0;
        };
        let mut removed = 0;
        for key in keys {
            if self.clients.remove(&key).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Whether a client is cached under `key`.
    pub fn contains(&self, key: &ClientKey) -> bool {
        self.clients.contains_key(key)
    }

    /// Number of cached clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// True when no clients are cached.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_client() -> Result<reqwest::Client, LlxprtError> {
        Ok(reqwest::Client::new())
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize_base_url(Some("https://api.example.com/")),
            "https://api.example.com"
        );
        assert_eq!(
            normalize_base_url(Some("https://api.example.com///")),
            "https://api.example.com"
        );
        assert_eq!(normalize_base_url(Some("")), DEFAULT_ENDPOINT);
        assert_eq!(normalize_base_url(None), DEFAULT_ENDPOINT);
    }

    #[test]
    fn test_key_hashes_token() {
        let key = ClientKey::new("r1", Some("https://api.example.com"), Some("sk-secret"));
        assert!(!key.auth_hash.contains("sk-secret"));
        assert_eq!(key.auth_hash.len(), 64);
    }

    #[test]
    fn test_token_rotation_changes_key() {
        let a = ClientKey::new("r1", Some("https://x"), Some("token-a"));
        let b = ClientKey::new("r1", Some("https://x"), Some("token-b"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_get_or_insert_reuses() {
        let cache = ClientCache::new();
        let key = ClientKey::new("r1", Some("https://x"), Some("t"));
        cache.get_or_insert_with(&key, build_client).unwrap();
        cache.get_or_insert_with(&key, || panic!("must not rebuild")).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_distinct_runtimes_distinct_clients() {
        let cache = ClientCache::new();
        let key_a = ClientKey::new("A", Some("https://x"), Some("t"));
        let key_b = ClientKey::new("B", Some("https://x"), Some("t"));
        cache.get_or_insert_with(&key_a, build_client).unwrap();
        cache.get_or_insert_with(&key_b, build_client).unwrap();
        assert_eq!(cache.len(), 2);
        assert_ne!(key_a, key_b);
    }

    #[test]
    fn test_clear_runtime_scoped() {
        let cache = ClientCache::new();
        let key_a = ClientKey::new("A", Some("https://x"), Some("t"));
        let key_a2 = ClientKey::new("A", Some("https://y"), Some("t"));
        let key_b = ClientKey::new("B", Some("https://x"), Some("t"));
        cache.get_or_insert_with(&key_a, build_client).unwrap();
        cache.get_or_insert_with(&key_a2, build_client).unwrap();
        cache.get_or_insert_with(&key_b, build_client).unwrap();

        assert_eq!(cache.clear_runtime("A"), 2);
        assert!(!cache.contains(&key_a));
        assert!(!cache.contains(&key_a2));
        assert!(cache.contains(&key_b));
    }

    #[test]
    fn test_clear_unknown_runtime_is_noop() {
        let cache = ClientCache::new();
        assert_eq!(cache.clear_runtime("nope"), 0);
    }

    #[test]
    fn test_build_failure_propagates_and_caches_nothing() {
        let cache = ClientCache::new();
        let key = ClientKey::new("r1", Some("https://x"), Some("t"));
        let result = cache.get_or_insert_with(&key, || {
            Err(LlxprtError::Config("bad tls".into()))
        });
        assert!(result.is_err());
        assert!(cache.is_empty());
    }
}
