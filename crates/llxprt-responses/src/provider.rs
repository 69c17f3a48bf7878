//! Responses-API `Provider` implementation.
//!
//! Identical pipeline to the other adapters. The one family-specific
//! wrinkle is threading: the request carries `previous_response_id`
//! read from the settings snapshot, and the id of a completed response
//! is written back through the live config accessor — the adapter
//! itself never holds a conversation id across calls.

use std::sync::Arc;

use async_stream::try_stream;
use futures::StreamExt;
use llxprt_core::client_cache::{ClientKey, runtime_key};
use llxprt_core::settings::ConfigAccessor;
use llxprt_core::stream::ContentStream;
use llxprt_core::{
    AuthPrecedence, ContentBlock, IContent, LlxprtError, ModelInfo,
    NormalizedGenerateChatOptions, OAuthTokenSource, PromptContext, Provider,
    ProviderCapabilities, ResolvedAuth, RetryOptions, RetryState, RuntimeServices, Speaker,
    ToolFormat, UsageStats, parse_tool_parameters, stream_from_items, to_history_id,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::config::{PREVIOUS_RESPONSE_ID_KEY, ResponsesConfig};
use crate::convert;
use crate::stream::SseMachine;
use crate::types::Response;

/// Responses-API adapter.
pub struct ResponsesProvider {
    config: ResponsesConfig,
    services: RuntimeServices,
    oauth: Option<Arc<dyn OAuthTokenSource>>,
}

impl ResponsesProvider {
    /// Creates an adapter over the shared runtime services.
    pub fn new(config: ResponsesConfig, services: RuntimeServices) -> Self {
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
        let mut precedence =
            AuthPrecedence::env_only("openai-responses", &["OPENAI_API_KEY", "LLXPRT_API_KEY"]);
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
            "authorization",
            HeaderValue::from_str(&format!("Bearer {}", auth.token)).map_err(|_| {
                LlxprtError::Auth {
                    provider: "openai-responses".into(),
                    hint: "credential contains invalid header characters".into(),
                }
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

    fn responses_url(base_url: &str) -> String {
        format!("{}/responses", base_url.trim_end_matches('/'))
    }

    /// Converts a non-streaming response into items, recording the new
    /// thread id through `config`.
    fn response_items(
        response: Response,
        config: Option<&Arc<dyn ConfigAccessor>>,
    ) -> Vec<IContent> {
        if let (Some(id), Some(config)) = (&response.id, config) {
            config.set_ephemeral_setting(PREVIOUS_RESPONSE_ID_KEY, json!(id));
        }

        let mut items = Vec::new();
        for output in response.output {
            match output.item_type.as_str() {
                "message" => {
                    let text: String = output
                        .content
                        .iter()
                        .filter(|c| c.content_type == "output_text")
                        .filter_map(|c| c.text.clone())
                        .collect();
                    if !text.is_empty() {
                        items.push(IContent::ai_text(text));
                    }
                }
                "function_call" => items.push(IContent {
                    speaker: Speaker::Ai,
                    blocks: vec![ContentBlock::ToolCall {
                        id: to_history_id(&output.call_id.unwrap_or_default()),
                        name: output.name.unwrap_or_default(),
                        parameters: parse_tool_parameters(
                            output.arguments.as_deref().unwrap_or_default(),
                        ),
                    }],
                    metadata: None,
                }),
                _ => {}
            }
        }
        if let Some(usage) = response.usage {
            items.push(IContent::usage(UsageStats::new(
                usage.input_tokens,
                usage.output_tokens,
            )));
        }
        items
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
    config: Option<Arc<dyn ConfigAccessor>>,
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
                        None if machine.finished() => {
                            if let (Some(id), Some(config)) = (machine.response_id(), &config) {
                                config.set_ephemeral_setting(PREVIOUS_RESPONSE_ID_KEY, json!(id));
                            }
                            return;
                        }
                        None => LlxprtError::stream_interrupted("stream ended before response.completed"),
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

impl Provider for ResponsesProvider {
    fn name(&self) -> &str {
        "openai-responses"
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
            provider: "openai-responses",
            tools: Some(&options.tools),
        })?;

        let streaming = !options.settings.streaming_disabled();
        let request = convert::build_request(&options, &system_prompt, streaming);
        let body = serde_json::to_value(&request)
            .map_err(|e| LlxprtError::Input(format!("cannot serialize request: {e}")))?;

        let url = Self::responses_url(&base_url);
        let extra = extra_headers(&options)?;
        let retry_options = RetryOptions {
            throttle_tracker: options.throttle_tracker.clone(),
            cancel: options.cancel.clone(),
            ..self.config.retry.clone()
        };
        let config = options.runtime.config().cloned();

        if streaming {
            Ok(stream_with_retry(
                client,
                url,
                extra,
                body,
                retry_options,
                config,
            ))
        } else {
            let items = llxprt_core::retry(&retry_options, || {
                let client = client.clone();
                let url = url.clone();
                let extra = extra.clone();
                let body = body.clone();
                let cancel = retry_options.cancel.clone();
                let config = config.clone();
                async move {
                    let response = send_request(&client, &url, &extra, &body, &cancel).await?;
                    let parsed: Response = response
                        .json()
                        .await
                        .map_err(|e| LlxprtError::Input(format!("malformed response: {e}")))?;
                    Ok(Self::response_items(parsed, config.as_ref()))
                }
            })
            .await?;
            Ok(stream_from_items(items))
        }
    }

    fn models(&self) -> Vec<ModelInfo> {
        let model = |id: &str, context_window: u64, max_output_tokens: u32| ModelInfo {
            id: id.into(),
            name: id.into(),
            provider: "openai-responses".into(),
            supported_tool_formats: vec![ToolFormat::OpenAi],
            context_window,
            max_output_tokens,
        };
        vec![
            model("gpt-4o", 128_000, 16_384),
            model("o3", 200_000, 32_768),
        ]
    }

    fn default_model(&self) -> String {
        self.config.model.clone()
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supports_vision: true,
            supported_formats: vec![ToolFormat::OpenAi],
            ..Default::default()
        }
    }

    fn clear_state(&self) {
        self.services.auth.clear_provider("openai-responses");
    }
}
