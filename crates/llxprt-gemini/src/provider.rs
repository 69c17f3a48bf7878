//! Gemini `Provider` implementation.
//!
//! Same pipeline as every llxprt adapter. Auth rides in the
//! `x-goog-api-key` header; the streaming endpoint is
//! `:streamGenerateContent?alt=sse`; histories pass through
//! strict-pairing preparation because this wire rejects unpaired
//! `functionResponse` parts.

use std::sync::Arc;

use async_stream::try_stream;
use futures::StreamExt;
use llxprt_core::client_cache::{ClientKey, runtime_key};
use llxprt_core::stream::ContentStream;
use llxprt_core::{
    AuthPrecedence, IContent, LlxprtError, ModelInfo, NormalizedGenerateChatOptions,
    OAuthTokenSource, PromptContext, Provider, ProviderCapabilities, ResolvedAuth, RetryOptions,
    RetryState, RuntimeServices, ToolFormat, prepare_strict_history, stream_from_items,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::config::GeminiConfig;
use crate::convert;
use crate::stream::SseMachine;
use crate::types::Response;

/// Gemini adapter.
pub struct GeminiProvider {
    config: GeminiConfig,
    services: RuntimeServices,
    oauth: Option<Arc<dyn OAuthTokenSource>>,
}

impl GeminiProvider {
    /// Creates an adapter over the shared runtime services.
    pub fn new(config: GeminiConfig, services: RuntimeServices) -> Self {
        Self {
            config,
            services,
            oauth: None,
        }
    }

    /// Attaches an OAuth token source as the final credential fallback.
    #[must_use]
    pub fn with_oauth(mut self, oauth: Arc<dyn OAuthTokenSource>) -> Self {
        self.oauth = Some(oauth);
        self
    }

    fn auth_precedence(&self) -> AuthPrecedence {
        let mut precedence = AuthPrecedence::env_only(
            "gemini",
            &["GEMINI_API_KEY", "GOOGLE_API_KEY", "LLXPRT_API_KEY"],
        );
        if let Some(oauth) = &self.oauth {
            precedence = precedence.with_oauth(Arc::clone(oauth));
        }
        precedence
    }

    fn build_client(
        &self,
        auth: &ResolvedAuth,
        socket_timeout: Option<std::time::Duration>,
    ) -> Result<reqwest::Client, LlxprtError> {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert(
            "x-goog-api-key",
            HeaderValue::from_str(&auth.token).map_err(|_| LlxprtError::Auth {
                provider: "gemini".into(),
                hint: "credential contains invalid header characters".into(),
            })?,
        );

        let mut builder = reqwest::Client::builder().default_headers(headers);
        if let Some(timeout) = self.config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(read_timeout) = socket_timeout {
            builder = builder.read_timeout(read_timeout);
        }
        builder
            .build()
            .map_err(|e| LlxprtError::Config(format!("failed to build HTTP client: {e}")))
    }

    fn generate_url(base_url: &str, model: &str, streaming: bool) -> String {
        let base = base_url.trim_end_matches('/');
        if streaming {
            format!("{base}/models/{model}:streamGenerateContent?alt=sse")
        } else {
            format!("{base}/models/{model}:generateContent")
        }
    }

    /// Converts a non-streaming response into items.
    fn response_items(response: &Response) -> Vec<IContent> {
        SseMachine::new().decode_chunk(response)
    }
}

/// Builds the extra per-request header map from merged custom headers.
fn extra_headers(options: &NormalizedGenerateChatOptions) -> Result<HeaderMap, LlxprtError> {
    let mut headers = HeaderMap::new();
    for (name, value) in options.merged_custom_headers() {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| LlxprtError::Config(format!("invalid custom header name '{name}'")))?;
        let value = HeaderValue::from_str(&value)
            .map_err(|_| LlxprtError::Config(format!("invalid custom header value for '{name}'")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Sends one request and validates the HTTP status, racing the
/// cancellation token.
async fn send_request(
    client: &reqwest::Client,
    url: &str,
    extra: &HeaderMap,
    body: &serde_json::Value,
    cancel: &CancellationToken,
) -> Result<reqwest::Response, LlxprtError> {
    let request = client.post(url).headers(extra.clone()).json(body);
    let response = tokio::select! {
        () = cancel.cancelled() => return Err(LlxprtError::Cancelled),
        result = request.send() => result.map_err(LlxprtError::transport)?,
    };

    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = response.text().await.unwrap_or_default();
        return Err(convert::convert_error(status, retry_after.as_deref(), &body));
    }
    Ok(response)
}

/// Drives the SSE machine with the retry engine around the whole call.
fn stream_with_retry(
    client: reqwest::Client,
    url: String,
    extra: HeaderMap,
    body: serde_json::Value,
    retry_options: RetryOptions,
) -> ContentStream {
    Box::pin(try_stream! {
        let mut state = RetryState::new(&retry_options);
        loop {
            if retry_options.cancel.is_cancelled() {
                Err::<(), LlxprtError>(LlxprtError::Cancelled)?;
            }
            let failure = match send_request(&client, &url, &extra, &body, &retry_options.cancel).await {
                Ok(response) => {
                    let mut machine = SseMachine::new();
                    let mut bytes = Box::pin(response.bytes_stream());
                    let mut failure: Option<LlxprtError> = None;
                    loop {
                        tokio::select! {
                            () = retry_options.cancel.cancelled() => {
                                failure = Some(LlxprtError::Cancelled);
                                break;
                            }
                            chunk = bytes.next() => match chunk {
                                Some(Ok(chunk)) => {
                                    for item in machine.push(&chunk) {
                                        yield item;
                                    }
                                    if machine.overflowed() {
                                        failure = Some(LlxprtError::transport(std::io::Error::other(
                                            "SSE event buffer exceeded 16 MiB",
                                        )));
                                        break;
                                    }
                                }
                                Some(Err(e)) => {
                                    failure = Some(LlxprtError::stream_interrupted_by(e));
                                    break;
                                }
                                None => break,
                            }
                        }
                    }
                    match failure {
                        Some(err) => err,
                        None if machine.finished() => return,
                        None => LlxprtError::stream_interrupted("stream ended before a finish reason"),
                    }
                }
                Err(err) => err,
            };

            if matches!(failure, LlxprtError::Cancelled) {
                Err::<(), LlxprtError>(LlxprtError::Cancelled)?;
            }
            match state.next_delay(&failure) {
                Some(delay) => {
                    debug!(delay_ms = delay.as_millis() as u64, error = %failure, "retrying streaming call");
                    state.sleep(delay).await?;
                }
                None => Err(failure)?,
            }
        }
    })
}

impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    #[instrument(skip_all, fields(model = %options.resolved.model))]
    async fn generate_chat_completion(
        &self,
        options: NormalizedGenerateChatOptions,
    ) -> Result<ContentStream, LlxprtError> {
        let runtime_key = runtime_key(&options);
        let auth = self
            .services
            .auth
            .resolve(
                &runtime_key,
                options.resolved.auth_token.as_deref(),
                &self.auth_precedence(),
            )
            .await?;

        let base_url = options
            .resolved
            .base_url
            .clone()
            .unwrap_or_else(|| self.config.base_url.clone());
        let key = ClientKey::new(&runtime_key, Some(&base_url), Some(&auth.token));
        let client = self.services.clients.get_or_insert_with(&key, || {
            self.build_client(&auth, options.settings.socket_timeout())
        })?;

        let system_prompt = self.services.prompts.compose(&PromptContext {
            user_memory: options.user_memory.as_deref(),
            model: &options.resolved.model,
            provider: "gemini",
            tools: Some(&options.tools),
        })?;

        let streaming = !options.settings.streaming_disabled();
        let prepared = prepare_strict_history(&options.contents);
        let request = convert::build_request(&prepared, &options, &system_prompt);
        let body = serde_json::to_value(&request)
            .map_err(|e| LlxprtError::Input(format!("cannot serialize request: {e}")))?;

        let url = Self::generate_url(&base_url, &options.resolved.model, streaming);
        let extra = extra_headers(&options)?;
        let retry_options = RetryOptions {
            throttle_tracker: options.throttle_tracker.clone(),
            cancel: options.cancel.clone(),
            ..self.config.retry.clone()
        };

        if streaming {
            Ok(stream_with_retry(client, url, extra, body, retry_options))
        } else {
            let items = llxprt_core::retry(&retry_options, || {
                let client = client.clone();
                let url = url.clone();
                let extra = extra.clone();
                let body = body.clone();
                let cancel = retry_options.cancel.clone();
                async move {
                    let response = send_request(&client, &url, &extra, &body, &cancel).await?;
                    let parsed: Response = response
                        .json()
                        .await
                        .map_err(|e| LlxprtError::Input(format!("malformed response: {e}")))?;
                    Ok(GeminiProvider::response_items(&parsed))
                }
            })
            .await?;
            Ok(stream_from_items(items))
        }
    }

    fn models(&self) -> Vec<ModelInfo> {
        let model = |id: &str, context_window: u64| ModelInfo {
            id: id.into(),
            name: id.into(),
            provider: "gemini".into(),
            supported_tool_formats: vec![ToolFormat::Gemini],
            context_window,
            max_output_tokens: 8192,
        };
        vec![
            model("gemini-2.0-flash", 1_000_000),
            model("gemini-1.5-pro", 2_000_000),
            model("gemini-1.5-flash", 1_000_000),
        ]
    }

    fn default_model(&self) -> String {
        self.config.model.clone()
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supports_vision: true,
            max_tokens: 8192,
            supported_formats: vec![ToolFormat::Gemini],
            ..Default::default()
        }
    }

    fn clear_state(&self) {
        self.services.auth.clear_provider("gemini");
    }
}
