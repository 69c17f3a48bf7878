//! Conversion between `IContent` and the Gemini wire format.
//!
//! Gemini correlates tool responses by *function name*, not call id,
//! and rejects a `functionResponse` with no preceding `functionCall` —
//! a strict-pairing wire. Histories pass through
//! [`llxprt_core::prepare_strict_history`] first; conversion then
//! resolves each response's function name from the call it answers.

use std::collections::HashMap;

use llxprt_core::{
    ContentBlock as CoreBlock, IContent, LlxprtError, NormalizedGenerateChatOptions, RetryAfter,
    Speaker,
};
use serde_json::{Value, json};

use crate::types::{
    Content, ErrorResponse, FunctionCall, FunctionDeclaration, FunctionResponse,
    GenerationConfig, Part, Request, SystemInstruction, TextPart, ToolDeclarations,
};

/// Builds the request body for one call. `prepared` must already have
/// passed strict-pairing preparation.
pub(crate) fn build_request<'a>(
    prepared: &[IContent],
    options: &'a NormalizedGenerateChatOptions,
    system_prompt: &'a str,
) -> Request<'a> {
    let params = &options.resolved.model_params;
    let has_params = params.temperature.is_some()
        || params.top_p.is_some()
        || params.top_k.is_some()
        || params.max_tokens.is_some()
        || params.stop_sequences.is_some();

    let declared = options.declared_tools();
    let tools = if declared.is_empty() {
        None
    } else {
        Some(vec![ToolDeclarations {
            function_declarations: declared
                .iter()
                .map(|t| FunctionDeclaration {
                    name: &t.name,
                    description: &t.description,
                    parameters: t.parameters.as_value(),
                })
                .collect(),
        }])
    };

    Request {
        contents: build_contents(prepared),
        system_instruction: (!system_prompt.is_empty()).then(|| SystemInstruction {
            parts: vec![TextPart {
                text: system_prompt,
            }],
        }),
        generation_config: has_params.then(|| GenerationConfig {
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            max_output_tokens: params.max_tokens,
            stop_sequences: params.stop_sequences.as_deref(),
        }),
        tools,
    }
}

/// Converts a prepared history to wire contents.
pub(crate) fn build_contents(prepared: &[IContent]) -> Vec<Content> {
    // Map canonical call ids to function names so responses can be
    // correlated the way this wire expects.
    let mut call_names: HashMap<&str, &str> = HashMap::new();
    for item in prepared {
        for block in &item.blocks {
            if let CoreBlock::ToolCall { id, name, .. } = block {
                call_names.insert(id, name);
            }
        }
    }

    let mut contents = Vec::with_capacity(prepared.len());
    for item in prepared {
        if item.blocks.is_empty() {
            continue;
        }
        let (role, parts) = match item.speaker {
            Speaker::Human => ("user", text_parts(item)),
            Speaker::Ai => (
                "model",
                item.blocks
                    .iter()
                    .filter_map(|block| match block {
                        CoreBlock::Text { text } => Some(Part {
                            text: Some(text.clone()),
                            ..Default::default()
                        }),
                        CoreBlock::Code { language, code } => Some(Part {
                            text: Some(format!(
                                "```{}\n{code}\n```",
                                language.as_deref().unwrap_or_default()
                            )),
                            ..Default::default()
                        }),
                        CoreBlock::ToolCall {
                            name, parameters, ..
                        } => Some(Part {
                            function_call: Some(FunctionCall {
                                name: name.clone(),
                                args: parameters.clone(),
                            }),
                            ..Default::default()
                        }),
                        CoreBlock::ToolResponse { .. } => None,
                    })
                    .collect(),
            ),
            Speaker::Tool => (
                "user",
                item.blocks
                    .iter()
                    .filter_map(|block| match block {
                        CoreBlock::ToolResponse {
                            call_id,
                            result,
                            error,
                        } => Some(Part {
                            function_response: Some(FunctionResponse {
                                name: call_names
                                    .get(call_id.as_str())
                                    .map(|n| (*n).to_string())
                                    .unwrap_or_else(|| "unknown".to_string()),
                                response: render_response(result, error.as_deref()),
                            }),
                            ..Default::default()
                        }),
                        _ => None,
                    })
                    .collect(),
            ),
        };
        if !parts.is_empty() {
            contents.push(Content {
                role: role.to_string(),
                parts,
            });
        }
    }
    contents
}

fn text_parts(item: &IContent) -> Vec<Part> {
    item.blocks
        .iter()
        .filter_map(|block| match block {
            CoreBlock::Text { text } => Some(Part {
                text: Some(text.clone()),
                ..Default::default()
            }),
            CoreBlock::Code { language, code } => Some(Part {
                text: Some(format!(
                    "```{}\n{code}\n```",
                    language.as_deref().unwrap_or_default()
                )),
                ..Default::default()
            }),
            _ => None,
        })
        .collect()
}

/// The wire expects an object under `response`; bare values are
/// wrapped.
fn render_response(result: &Value, error: Option<&str>) -> Value {
    if let Some(error) = error {
        return json!({ "error": error });
    }
    match result {
        Value::Object(_) => result.clone(),
        other => json!({ "output": other }),
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
            provider: "gemini".into(),
            hint: format!("{message}; set GEMINI_API_KEY or GOOGLE_API_KEY"),
        },
        http::StatusCode::BAD_REQUEST => LlxprtError::Input(message),
        _ => LlxprtError::Api {
            status,
            message,
            retry_after: retry_after.and_then(RetryAfter::parse),
        },
    }
}
