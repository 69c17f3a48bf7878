//! Conversion between `IContent` and the Responses-API wire format.

use llxprt_core::{
    ContentBlock as CoreBlock, IContent, LlxprtError, NormalizedGenerateChatOptions, RetryAfter,
    Speaker, to_openai_id,
};
use serde_json::Value;

use crate::config::PREVIOUS_RESPONSE_ID_KEY;
use crate::types::{ErrorResponse, InputContent, InputItem, Request, Tool};

/// Builds the request body. The thread id comes from the frozen
/// settings snapshot — never from adapter state.
pub(crate) fn build_request<'a>(
    options: &'a NormalizedGenerateChatOptions,
    system_prompt: &'a str,
    stream: bool,
) -> Request<'a> {
    let previous_response_id = options
        .settings
        .ephemeral(PREVIOUS_RESPONSE_ID_KEY)
        .and_then(Value::as_str)
        .map(String::from);

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
                    name: &t.name,
                    description: &t.description,
                    parameters: t.parameters.as_value(),
                })
                .collect(),
        )
    };

    Request {
        model: &options.resolved.model,
        input: build_input(&options.contents),
        stream: stream.then_some(true),
        previous_response_id,
        instructions: (!system_prompt.is_empty()).then_some(system_prompt),
        max_output_tokens: params.max_tokens,
        temperature: params.temperature,
        top_p: params.top_p,
        tools,
    }
}

/// Converts a history to input items.
pub(crate) fn build_input(contents: &[IContent]) -> Vec<InputItem> {
    let mut input = Vec::with_capacity(contents.len());
    for item in contents {
        if item.blocks.is_empty() {
            continue;
        }
        match item.speaker {
            Speaker::Human => {
                let text = text_of(item);
                if !text.is_empty() {
                    input.push(InputItem::Message {
                        role: "user",
                        content: vec![InputContent::InputText { text }],
                    });
                }
            }
            Speaker::Ai => {
                let text = text_of(item);
                if !text.is_empty() {
                    input.push(InputItem::Message {
                        role: "assistant",
                        content: vec![InputContent::OutputText { text }],
                    });
                }
                for block in &item.blocks {
                    if let CoreBlock::ToolCall {
                        id,
                        name,
                        parameters,
                    } = block
                    {
                        input.push(InputItem::FunctionCall {
                            call_id: to_openai_id(id),
                            name: name.clone(),
                            arguments: parameters.to_string(),
                        });
                    }
                }
            }
            Speaker::Tool => {
                for block in &item.blocks {
                    if let CoreBlock::ToolResponse {
                        call_id,
                        result,
                        error,
                    } = block
                    {
                        input.push(InputItem::FunctionCallOutput {
                            call_id: to_openai_id(call_id),
                            output: render_result(result, error.as_deref()),
                        });
                    }
                }
            }
        }
    }
    input
}

fn text_of(item: &IContent) -> String {
    let mut out = String::new();
    for block in &item.blocks {
        match block {
            CoreBlock::Text { text } => out.push_str(text),
            CoreBlock::Code { language, code } => out.push_str(&format!(
                "```{}\n{code}\n```",
                language.as_deref().unwrap_or_default()
            )),
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
            provider: "openai-responses".into(),
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
