//! Conversion between `IContent` and the Anthropic wire format.
//!
//! The messages API is strict-pairing: every `tool_result` must
//! reference an earlier `tool_use`. Histories are prepared with
//! [`llxprt_core::prepare_strict_history`] before conversion; this
//! module then merges consecutive tool-response items into a single
//! user-role message, rewrites canonical `hist_tool_*` ids to the
//! `toolu_*` wire form, and builds the request body.

use std::sync::OnceLock;

use llxprt_core::{
    ContentBlock as CoreBlock, IContent, LlxprtError, NormalizedGenerateChatOptions, RetryAfter,
    Speaker, to_anthropic_id,
};
use serde_json::Value;

use crate::types::{ContentBlock, ErrorResponse, Message, Request, Tool};

/// Fixed `system` string sent in OAuth mode; provider policy overrides
/// anything else, so the composed prompt travels in the first user turn
/// instead.
pub(crate) const OAUTH_SYSTEM: &str =
    "You are Claude Code, Anthropic's official CLI for Claude.";

/// `anthropic-beta` header value enabling OAuth bearer auth.
pub(crate) const OAUTH_BETA: &str = "oauth-2025-04-20";

/// Model-aware default output-token limits, first match wins.
fn max_tokens_table() -> &'static [(regex::Regex, u32)] {
    static TABLE: OnceLock<Vec<(regex::Regex, u32)>> = OnceLock::new();
    TABLE.get_or_init(|| {
        [
            (r"(?i)(opus|sonnet)-4", 32_000),
            (r"(?i)claude-3-7", 16_384),
            (r"(?i)claude-3-5-sonnet", 8192),
            (r"(?i)haiku", 4096),
        ]
        .iter()
        .map(|(pattern, tokens)| {
            (
                regex::Regex::new(pattern).expect("max-tokens pattern is valid"),
                *tokens,
            )
        })
        .collect()
    })
}

/// Default max output tokens for `model`; 4096 when no pattern matches.
pub(crate) fn max_tokens_for_model(model: &str) -> u32 {
    max_tokens_table()
        .iter()
        .find(|(re, _)| re.is_match(model))
        .map_or(4096, |(_, tokens)| *tokens)
}

/// Builds the request body for one call. `prepared` must already have
/// passed strict-pairing preparation.
pub(crate) fn build_request<'a>(
    prepared: &[IContent],
    options: &'a NormalizedGenerateChatOptions,
    system_prompt: &'a str,
    oauth_mode: bool,
    stream: bool,
) -> Request<'a> {
    let mut messages = build_messages(prepared);
    let system = if oauth_mode {
        inject_prompt_as_user_prefix(&mut messages, system_prompt);
        Some(OAUTH_SYSTEM)
    } else {
        Some(system_prompt)
    };

    let params = &options.resolved.model_params;
    let max_tokens = params
        .max_tokens
        .unwrap_or_else(|| max_tokens_for_model(&options.resolved.model));

    let declared = options.declared_tools();
    let tools = if declared.is_empty() {
        None
    } else {
        Some(
            declared
                .iter()
                .map(|t| Tool {
                    name: &t.name,
                    description: &t.description,
                    input_schema: t.parameters.as_value(),
                })
                .collect(),
        )
    };

    Request {
        model: &options.resolved.model,
        messages,
        max_tokens,
        stream: stream.then_some(true),
        system,
        temperature: params.temperature,
        top_p: params.top_p,
        top_k: params.top_k,
        stop_sequences: params.stop_sequences.as_deref(),
        tools,
    }
}

/// Converts a prepared history to wire messages, merging consecutive
/// tool-response items into one user-role payload.
pub(crate) fn build_messages(prepared: &[IContent]) -> Vec<Message> {
    let mut messages: Vec<Message> = Vec::with_capacity(prepared.len());
    let mut pending_results: Vec<ContentBlock> = Vec::new();

    let flush_results = |pending: &mut Vec<ContentBlock>, messages: &mut Vec<Message>| {
        if !pending.is_empty() {
            messages.push(Message {
                role: "user",
                content: std::mem::take(pending),
            });
        }
    };

    for item in prepared {
        if item.blocks.is_empty() {
            continue;
        }
        match item.speaker {
            Speaker::Tool => {
                pending_results.extend(item.blocks.iter().filter_map(convert_block));
            }
            Speaker::Human => {
                flush_results(&mut pending_results, &mut messages);
                messages.push(Message {
                    role: "user",
                    content: item.blocks.iter().filter_map(convert_block).collect(),
                });
            }
            Speaker::Ai => {
                flush_results(&mut pending_results, &mut messages);
                messages.push(Message {
                    role: "assistant",
                    content: item.blocks.iter().filter_map(convert_block).collect(),
                });
            }
        }
    }
    flush_results(&mut pending_results, &mut messages);
    messages.retain(|m| !m.content.is_empty());
    messages
}

fn convert_block(block: &CoreBlock) -> Option<ContentBlock> {
    match block {
        CoreBlock::Text { text } => Some(ContentBlock::Text { text: text.clone() }),
        CoreBlock::Code { language, code } => Some(ContentBlock::Text {
            text: format!(
                "```{}\n{code}\n```",
                language.as_deref().unwrap_or_default()
            ),
        }),
        CoreBlock::ToolCall {
            id,
            name,
            parameters,
        } => Some(ContentBlock::ToolUse {
            id: to_anthropic_id(id),
            name: name.clone(),
            input: parameters.clone(),
        }),
        CoreBlock::ToolResponse {
            call_id,
            result,
            error,
        } => {
            let (content, is_error) = render_result(result, error.as_deref());
            Some(ContentBlock::ToolResult {
                tool_use_id: to_anthropic_id(call_id),
                content,
                is_error,
            })
        }
    }
}

/// Tool results travel as strings on this wire; non-string values are
/// JSON-encoded. An error description replaces the result and flags
/// `is_error`.
fn render_result(result: &Value, error: Option<&str>) -> (String, bool) {
    if let Some(error) = error {
        return (error.to_string(), true);
    }
    let content = match result {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    (content, false)
}

/// Prepends the composed prompt, wrapped in `<system>` tags, to the
/// first user message. OAuth-mode calls cannot use the `system` field
/// for it.
fn inject_prompt_as_user_prefix(messages: &mut [Message], prompt: &str) {
    if prompt.is_empty() {
        return;
    }
    if let Some(first_user) = messages.iter_mut().find(|m| m.role == "user") {
        first_user.content.insert(
            0,
            ContentBlock::Text {
                text: format!("<system>{prompt}</system>"),
            },
        );
    }
}

/// Maps an error response to a typed error. 401/403 carry a
/// re-authentication hint; 400 surfaces as invalid input; everything
/// else becomes an API error with any `Retry-After` hint attached.
pub(crate) fn convert_error(
    status: http::StatusCode,
    retry_after: Option<&str>,
    body: &str,
) -> LlxprtError {
    let message = serde_json::from_str::<ErrorResponse>(body)
        .map_or_else(|_| body.to_string(), |e| e.error.message);

    match status {
        http::StatusCode::UNAUTHORIZED | http::StatusCode::FORBIDDEN => LlxprtError::Auth {
            provider: "anthropic".into(),
            hint: format!("{message}; set ANTHROPIC_API_KEY or re-run OAuth login"),
        },
        http::StatusCode::BAD_REQUEST => LlxprtError::Input(message),
        _ => LlxprtError::Api {
            status,
            message,
            retry_after: retry_after.and_then(RetryAfter::parse),
        },
    }
}
