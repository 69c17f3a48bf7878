//! Conversion between `IContent` and the chat-completions wire format.
//!
//! This family is not strict-pairing: tool-response items travel as
//! individual `role: "tool"` messages and the upstream tolerates
//! orphans, so histories pass through without pruning. Canonical
//! `hist_tool_*` ids become `call_*` on egress (bare UUIDs in the
//! qwen dialect); tool-call arguments are JSON strings on this wire.

use std::sync::OnceLock;

use llxprt_core::{
    ContentBlock as CoreBlock, IContent, LlxprtError, NormalizedGenerateChatOptions, RetryAfter,
    Speaker, ToolFormat, to_bare_id, to_openai_id,
};
use serde_json::Value;

use crate::types::{
    ErrorResponse, FunctionDef, FunctionOut, Message, Request, StreamOptions, Tool, ToolCallOut,
};

/// Model-aware default output-token limits, first match wins.
fn max_tokens_table() -> &'static [(regex::Regex, u32)] {
    static TABLE: OnceLock<Vec<(regex::Regex, u32)>> = OnceLock::new();
    TABLE.get_or_init(|| {
        [
            (r"(?i)^o[134]", 32_768),
            (r"(?i)gpt-4o", 16_384),
            (r"(?i)gpt-4-turbo", 4096),
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

/// Egress id for the active tool-format dialect.
pub(crate) fn egress_id(history_id: &str, format: ToolFormat) -> String {
    match format {
        ToolFormat::Qwen => to_bare_id(history_id),
        _ => to_openai_id(history_id),
    }
}

/// Builds the request body for one call.
pub(crate) fn build_request<'a>(
    options: &'a NormalizedGenerateChatOptions,
    system_prompt: &str,
    format: ToolFormat,
    stream: bool,
) -> Request<'a> {
    let mut messages = Vec::with_capacity(options.contents.len() + 1);
    if !system_prompt.is_empty() {
        messages.push(Message {
            role: "system",
            content: Some(system_prompt.to_string()),
            tool_calls: None,
            tool_call_id: None,
        });
    }
    messages.extend(build_messages(&options.contents, format));

    let params = &options.resolved.model_params;
    let declared = options.declared_tools();
    let tools = if declared.is_empty() {
        None
    } else {
        Some(
            declared
                .iter()
                .map(|t| Tool {
                    tool_type: "function",
                    function: FunctionDef {
                        name: &t.name,
                        description: &t.description,
                        parameters: t.parameters.as_value(),
                    },
                })
                .collect(),
        )
    };

    Request {
        model: &options.resolved.model,
        messages,
        stream: stream.then_some(true),
        stream_options: stream.then_some(StreamOptions {
            include_usage: true,
        }),
        max_tokens: Some(
            params
                .max_tokens
                .unwrap_or_else(|| max_tokens_for_model(&options.resolved.model)),
        ),
        temperature: params.temperature,
        top_p: params.top_p,
        stop: params.stop_sequences.as_deref(),
        tools,
    }
}

/// Converts a history to wire messages.
pub(crate) fn build_messages(contents: &[IContent], format: ToolFormat) -> Vec<Message> {
    let mut messages = Vec::with_capacity(contents.len());
    for item in contents {
        if item.blocks.is_empty() {
            continue;
        }
        match item.speaker {
            Speaker::Human => messages.push(Message {
                role: "user",
                content: Some(text_of(item)),
                tool_calls: None,
                tool_call_id: None,
            }),
            Speaker::Ai => {
                let tool_calls: Vec<ToolCallOut> = item
                    .blocks
                    .iter()
                    .filter_map(|b| match b {
                        CoreBlock::ToolCall {
                            id,
                            name,
                            parameters,
                        } => Some(ToolCallOut {
                            id: egress_id(id, format),
                            call_type: "function",
                            function: FunctionOut {
                                name: name.clone(),
                                arguments: parameters.to_string(),
                            },
                        }),
                        _ => None,
                    })
                    .collect();
                let text = text_of(item);
                messages.push(Message {
                    role: "assistant",
                    content: (!text.is_empty()).then_some(text),
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                    tool_call_id: None,
                });
            }
            Speaker::Tool => {
                for block in &item.blocks {
                    if let CoreBlock::ToolResponse {
                        call_id,
                        result,
                        error,
                    } = block
                    {
                        messages.push(Message {
                            role: "tool",
                            content: Some(render_result(result, error.as_deref())),
                            tool_calls: None,
                            tool_call_id: Some(egress_id(call_id, format)),
                        });
                    }
                }
            }
        }
    }
    messages.retain(|m| m.content.is_some() || m.tool_calls.is_some());
    messages
}

fn text_of(item: &IContent) -> String {
    let mut out = String::new();
    for block in &item.blocks {
        match block {
            CoreBlock::Text { text } => out.push_str(text),
            CoreBlock::Code { language, code } => {
                out.push_str(&format!(
                    "```{}\n{code}\n```",
                    language.as_deref().unwrap_or_default()
                ));
            }
            _ => {}
        }
    }
    out
}

fn render_result(result: &Value, error: Option<&str>) -> String {
    if let Some(error) = error {
        return format!("Error: {error}");
    }
    match result {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Maps an error response to a typed error.
pub(crate) fn convert_error(
    status: http::StatusCode,
    retry_after: Option<&str>,
    body: &str,
) -> LlxprtError {
    let message = serde_json::from_str::<ErrorResponse>(body)
        .map_or_else(|_| body.to_string(), |e| e.error.message);

    match status {
        http::StatusCode::UNAUTHORIZED | http::StatusCode::FORBIDDEN => LlxprtError::Auth {
            provider: "openai".into(),
            hint: format!("{message}; set OPENAI_API_KEY or provide an auth key"),
        },
        http::StatusCode::BAD_REQUEST => LlxprtError::Input(message),
        _ => LlxprtError::Api {
            status,
            message,
            retry_after: retry_after.and_then(RetryAfter::parse),
        },
    }
}
