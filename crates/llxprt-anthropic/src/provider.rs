//! Anthropic `Provider` implementation.
//!
//! The per-call pipeline: derive the runtime key, resolve auth by
//! precedence, fetch a cached HTTP client, compose the system prompt,
//! convert the prepared history to wire messages, then run the
//! retry-wrapped request. Streaming calls drive the SSE machine from
//! inside the returned stream, retrying the whole call on transient
//! failures; blocks yielded before an interruption are not rolled back.
//!
//! The adapter holds no conversation state. Everything per-call lives
//! in the options value and the stream's own locals.

use std::sync::Arc;

use async_stream::try_stream;
use futures::StreamExt;
use llxprt_core::client_cache::{ClientKey, runtime_key};
use llxprt_core::{
    AuthMethod, AuthPrecedence, ContentBlock, IContent, LlxprtError, ModelInfo,
    NormalizedGenerateChatOptions, OAuthTokenSource, PromptContext, Provider,
    ProviderCapabilities, ResolvedAuth, RetryOptions, RetryState, RuntimeServices, Speaker,
    ToolFormat, UsageStats, prepare_strict_history, stream_from_items, to_history_id,
};
use llxprt_core::stream::ContentStream;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::config::AnthropicConfig;
use crate::convert;
use crate::stream::SseMachine;
use crate::types::Response;

/// Anthropic messages-API adapter.
pub struct AnthropicProvider {
    config: AnthropicConfig,
    services: RuntimeServices,
    oauth: Option<Arc<dyn OAuthTokenSource>>,
}

impl AnthropicProvider {
    /// Creates an adapter over the shared runtime services.
    pub fn new(config: AnthropicConfig, services: RuntimeServices) -> Self {
        Self {
            config,
            services,
            oauth: None,
        }
    }

    /// Attaches an OAuth token source as the final credential fallback.
    /// OAuth-mode calls use bearer auth plus the `anthropic-beta`
    /// header and the fixed system string.
    #[must_use]
    pub fn with_oauth(mut self, oauth: Arc<dyn OAuthTokenSource>) -> Self {
        self.oauth = Some(oauth);
        self
    }

    fn auth_precedence(&self) -> AuthPrecedence {
        let mut precedence =
            AuthPrecedence::env_only("anthropic", &["ANTHROPIC_API_KEY", "LLXPRT_API_KEY"]);
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
            "anthropic-version",
            HeaderValue::from_str(&self.config.api_version).map_err(|_| {
                LlxprtError::Config("API version contains invalid header characters".into())
            })?,
        );
        match auth.method {
            AuthMethod::OAuth => {
                headers.insert(
                    "authorization",
                    HeaderValue::from_str(&format!("Bearer {}", auth.token)).map_err(|_| {
                        auth_header_error()
                    })?,
                );
                headers.insert(
                    "anthropic-beta",
                    HeaderValue::from_static(convert::OAUTH_BETA),
                );
            }
            AuthMethod::ApiKey => {
                headers.insert(
                    "x-api-key",
                    HeaderValue::from_str(&auth.token).map_err(|_| auth_header_error())?,
                );
            }
        }

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

    fn messages_url(base_url: &str) -> String {
        format!("{}/v1/messages", base_url.trim_end_matches('/'))
    }

    /// Converts a non-streaming response body into content items.
    fn response_items(response: Response) -> Vec<IContent> {
        let mut items: Vec<IContent> = Vec::with_capacity(response.content.len() + 1);
        for block in response.content {
            match block.content_type.as_str() {
                "text" => {
                    if let Some(text) = block.text {
                        items.push(IContent::ai_text(text));
                    }
                }
                "tool_use" => {
                    items.push(IContent {
                        speaker: Speaker::Ai,
                        blocks: vec![ContentBlock::ToolCall {
                            id: to_history_id(&block.id.unwrap_or_default()),
                            name: block.name.unwrap_or_default(),
                            parameters: block
                                .input
                                .unwrap_or(serde_json::Value::Object(serde_json::Map::new())),
                        }],
                        metadata: None,
                    });
                }
                _ => {}
            }
        }
        items.push(IContent::usage(UsageStats::new(
            response.usage.input_tokens,
            response.usage.output_tokens,
        )));
        items
    }
}

fn auth_header_error() -> LlxprtError {
    LlxprtError::Auth {
        provider: "anthropic".into(),
        hint: "credential contains invalid header characters".into(),
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
                        None => LlxprtError::stream_interrupted("stream ended before message_stop"),
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

impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
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
            provider: "anthropic",
            tools: Some(&options.tools),
        })?;

        let oauth_mode = auth.method == AuthMethod::OAuth;
        let streaming = !options.settings.streaming_disabled();
        let prepared = prepare_strict_history(&options.contents);
        let request =
            convert::build_request(&prepared, &options, &system_prompt, oauth_mode, streaming);
        let body = serde_json::to_value(&request)
            .map_err(|e| LlxprtError::Input(format!("cannot serialize request: {e}")))?;

        let url = Self::messages_url(&base_url);
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
                    Ok(Self::response_items(parsed))
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
            provider: "anthropic".into(),
            supported_tool_formats: vec![ToolFormat::Anthropic],
            context_window,
            max_output_tokens: convert::max_tokens_for_model(id),
        };
        vec![
            model("claude-opus-4-20250514", 200_000),
            model("claude-sonnet-4-20250514", 200_000),
            model("claude-3-5-haiku-20241022", 200_000),
        ]
    }

    fn default_model(&self) -> String {
        self.config.model.clone()
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supports_vision: true,
            max_tokens: convert::max_tokens_for_model(&self.config.model),
            supported_formats: vec![ToolFormat::Anthropic],
            ..Default::default()
        }
    }

    fn clear_state(&self) {
        self.services.auth.clear_provider("anthropic");
    }
}
