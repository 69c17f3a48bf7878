//! Credential resolution.
//!
//! Each provider declares an ordered credential precedence: an explicit
//! key argument beats the provider's environment variables, which beat
//! an OAuth token from a configured token source. The first non-empty
//! credential wins; resolving nothing is an [`LlxprtError::Auth`] with a
//! remediation hint.
//!
//! Results are cached per `(runtime_key, provider)` so a call resolves
//! at most once, but never across runtime contexts with different ids.
//! [`AuthResolver::clear_runtime`] drops a runtime's cached credentials;
//! callers pair it with the HTTP-client cache eviction (see
//! [`RuntimeServices::clear_runtime`](crate::runtime::RuntimeServices::clear_runtime)).

use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::error::LlxprtError;

/// How a credential was obtained. Adapters vary request headers on this
/// (e.g. `x-api-key` vs `authorization: Bearer` plus an OAuth beta
/// header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// A plain API key.
    ApiKey,
    /// An OAuth access token.
    OAuth,
}

/// A resolved credential.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedAuth {
    /// The credential value.
    pub token: String,
    /// How it was obtained.
    pub method: AuthMethod,
}

impl std::fmt::Debug for ResolvedAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedAuth")
            .field("token", &"[REDACTED]")
            .field("method", &self.method)
            .finish()
    }
}

/// Source of OAuth access tokens, supplied by the embedding application.
///
/// `token` may suspend (e.g. to refresh); returning `Ok(None)` means no
/// token is available for the provider.
pub trait OAuthTokenSource: Send + Sync {
    /// Fetches an access token for `provider`, refreshing if needed.
    fn token<'a>(
        &'a self,
        provider: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>, LlxprtError>> + Send + 'a>>;
}

/// A provider's declared credential precedence.
#[derive(Clone)]
pub struct AuthPrecedence {
    /// Provider name used in cache keys and error hints.
    pub provider: String,
    /// Environment variable names checked in order.
    pub env_keys: Vec<String>,
    /// OAuth token source, consulted last.
    pub oauth: Option<Arc<dyn OAuthTokenSource>>,
    /// Hint appended to the [`LlxprtError::Auth`] error when nothing
    /// resolves.
    pub hint: String,
}

impl AuthPrecedence {
    /// A key-only precedence (env vars, no OAuth).
    pub fn env_only(provider: impl Into<String>, env_keys: &[&str]) -> Self {
        let provider = provider.into();
        let hint = format!(
            "provide an API key in settings or set one of: {}",
            env_keys.join(", ")
        );
        Self {
            provider,
            env_keys: env_keys.iter().map(|s| (*s).to_string()).collect(),
            oauth: None,
            hint,
        }
    }

    /// Adds an OAuth token source as the final fallback.
    #[must_use]
    pub fn with_oauth(mut self, oauth: Arc<dyn OAuthTokenSource>) -> Self {
        self.oauth = Some(oauth);
        self
    }
}

impl std::fmt::Debug for AuthPrecedence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthPrecedence")
            .field("provider", &self.provider)
            .field("env_keys", &self.env_keys)
            .field("has_oauth", &self.oauth.is_some())
            .finish()
    }
}

/// Precedence-ordered credential resolver with per-runtime caching.
#[derive(Default)]
pub struct AuthResolver {
    cache: DashMap<(String, String), ResolvedAuth>,
}

impl AuthResolver {
    /// Creates an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves a credential for `precedence.provider` under
    /// `runtime_key`, using: `explicit` argument → environment keys →
    /// OAuth. The result is cached per `(runtime_key, provider)`.
    pub async fn resolve(
        &self,
        runtime_key: &str,
        explicit: Option<&str>,
        precedence: &AuthPrecedence,
    ) -> Result<ResolvedAuth, LlxprtError> {
        // An explicit key always wins and is not worth caching.
        if let Some(key) = explicit
            && !key.is_empty()
        {
            return Ok(ResolvedAuth {
                token: key.to_string(),
                method: AuthMethod::ApiKey,
            });
        }

        let cache_key = (runtime_key.to_string(), precedence.provider.clone());
        if let Some(cached) = self.cache.get(&cache_key) {
            return Ok(cached.clone());
        }

        let resolved = self.resolve_uncached(precedence).await?;
        self.cache.insert(cache_key, resolved.clone());
        Ok(resolved)
    }

    async fn resolve_uncached(
        &self,
        precedence: &AuthPrecedence,
    ) -> Result<ResolvedAuth, LlxprtError> {
        for env_key in &precedence.env_keys {
            if let Ok(value) = std::env::var(env_key)
                && !value.is_empty()
            {
                debug!(provider = %precedence.provider, env = %env_key, "credential from environment");
                return Ok(ResolvedAuth {
                    token: value,
                    method: AuthMethod::ApiKey,
                });
            }
        }

        if let Some(oauth) = &precedence.oauth
            && let Some(token) = oauth.token(&precedence.provider).await?
            && !token.is_empty()
        {
            debug!(provider = %precedence.provider, "credential from OAuth manager");
            return Ok(ResolvedAuth {
                token,
                method: AuthMethod::OAuth,
            });
        }

        Err(LlxprtError::Auth {
            provider: precedence.provider.clone(),
            hint: precedence.hint.clone(),
        })
    }

    /// Drops cached credentials for one runtime.
    pub fn clear_runtime(&self, runtime_key: &str) {
        self.cache.retain(|(rk, _), _| rk != runtime_key);
    }

    /// Drops cached credentials for one provider across all runtimes.
    /// Used when a provider's auth state is torn down on switch-away.
    pub fn clear_provider(&self, provider: &str) {
        self.cache.retain(|(_, p), _| p != provider);
    }

    /// Drops every cached credential.
    pub fn clear(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedToken(Option<String>);

    impl OAuthTokenSource for FixedToken {
        fn token<'a>(
            &'a self,
            _provider: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<Option<String>, LlxprtError>> + Send + 'a>>
        {
            let token = self.0.clone();
            Box::pin(async move { Ok(token) })
        }
    }

    fn unset_env(precedence: &AuthPrecedence) {
        for key in &precedence.env_keys {
            // SAFETY: tests run single-threaded per process start; keys
            // are test-specific names no other test reads concurrently.
            unsafe { std::env::remove_var(key) };
        }
    }

    #[tokio::test]
    async fn test_explicit_key_wins() {
        let resolver = AuthResolver::new();
        let precedence = AuthPrecedence::env_only("test-explicit", &["LLXPRT_TEST_NONE"]);
        let auth = resolver
            .resolve("r1", Some("sk-explicit"), &precedence)
            .await
            .unwrap();
        assert_eq!(auth.token, "sk-explicit");
        assert_eq!(auth.method, AuthMethod::ApiKey);
    }

    #[tokio::test]
    async fn test_env_var_resolution_order() {
        let precedence =
            AuthPrecedence::env_only("test-env", &["LLXPRT_TEST_FIRST", "LLXPRT_TEST_SECOND"]);
        unset_env(&precedence);
        // SAFETY: test-specific variable names.
        unsafe { std::env::set_var("LLXPRT_TEST_SECOND", "from-second") };

        let resolver = AuthResolver::new();
        let auth = resolver.resolve("r1", None, &precedence).await.unwrap();
        assert_eq!(auth.token, "from-second");

        unsafe { std::env::remove_var("LLXPRT_TEST_SECOND") };
    }

    #[tokio::test]
    async fn test_oauth_fallback() {
        let precedence = AuthPrecedence::env_only("test-oauth", &["LLXPRT_TEST_OAUTH_NONE"])
            .with_oauth(Arc::new(FixedToken(Some("oauth-token".into()))));
        unset_env(&precedence);

        let resolver = AuthResolver::new();
        let auth = resolver.resolve("r1", None, &precedence).await.unwrap();
        assert_eq!(auth.token, "oauth-token");
        assert_eq!(auth.method, AuthMethod::OAuth);
    }

    #[tokio::test]
    async fn test_nothing_resolves_is_auth_error_with_hint() {
        let precedence = AuthPrecedence::env_only("test-none", &["LLXPRT_TEST_NONE_AT_ALL"]);
        unset_env(&precedence);

        let resolver = AuthResolver::new();
        let err = resolver.resolve("r1", None, &precedence).await.unwrap_err();
        match err {
            LlxprtError::Auth { provider, hint } => {
                assert_eq!(provider, "test-none");
                assert!(hint.contains("LLXPRT_TEST_NONE_AT_ALL"));
            }
            other => panic!("expected Auth error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cache_scoped_per_runtime() {
        let precedence = AuthPrecedence::env_only("test-cache", &["LLXPRT_TEST_CACHE_NONE"])
            .with_oauth(Arc::new(FixedToken(Some("tok".into()))));
        unset_env(&precedence);

        let resolver = AuthResolver::new();
        resolver.resolve("A", None, &precedence).await.unwrap();
        resolver.resolve("B", None, &precedence).await.unwrap();

        resolver.clear_runtime("A");
        // B's entry survives A's eviction.
        assert!(resolver.cache.contains_key(&("B".into(), "test-cache".into())));
        assert!(!resolver.cache.contains_key(&("A".into(), "test-cache".into())));
    }

    #[test]
    fn test_debug_redacts_token() {
        let auth = ResolvedAuth {
            token: "sk-ant-super-secret".into(),
            method: AuthMethod::ApiKey,
        };
        let debug_output = format!("{auth:?}");
        assert!(
            !debug_output.contains("sk-ant-super-secret"),
            "Debug output should not contain the credential"
        );
        assert!(debug_output.contains("[REDACTED]"));
        assert!(debug_output.contains("ApiKey"));
    }

    #[tokio::test]
    async fn test_empty_explicit_key_falls_through() {
        let precedence = AuthPrecedence::env_only("test-empty", &["LLXPRT_TEST_EMPTY_NONE"])
            .with_oauth(Arc::new(FixedToken(Some("fallback".into()))));
        unset_env(&precedence);

        let resolver = AuthResolver::new();
        let auth = resolver.resolve("r1", Some(""), &precedence).await.unwrap();
        assert_eq!(auth.token, "fallback");
    }
}
