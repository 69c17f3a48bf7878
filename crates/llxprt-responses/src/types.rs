//! Responses-API wire types. Internal; conversion lives in
//! [`convert`](crate::convert).

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Request types ──────────────────────────────────────────────────

/// Body for `POST /responses`.
#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub model: &'a str,
    pub input: Vec<InputItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool<'a>>>,
}

/// One input item.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub(crate) enum InputItem {
    /// A conversation message.
    #[serde(rename = "message")]
    Message {
        role: &'static str,
        content: Vec<InputContent>,
    },
    /// An assistant-emitted function call echoed back in history.
    #[serde(rename = "function_call")]
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    /// The tool's answer to a prior function call.
    #[serde(rename = "function_call_output")]
    FunctionCallOutput { call_id: String, output: String },
}

/// Message content; user turns use `input_text`, assistant turns
/// `output_text`.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub(crate) enum InputContent {
    #[serde(rename = "input_text")]
    InputText { text: String },
    #[serde(rename = "output_text")]
    OutputText { text: String },
}

/// Tool declaration; the Responses API flattens the function shape.
#[derive(Debug, Serialize)]
pub(crate) struct Tool<'a> {
    #[serde(rename = "type")]
    pub tool_type: &'static str,
    pub name: &'a str,
    pub description: &'a str,
    pub parameters: &'a Value,
}

// ── Response types ─────────────────────────────────────────────────

/// Non-streaming response body.
#[derive(Debug, Deserialize)]
pub(crate) struct Response {
    pub id: Option<String>,
    #[serde(default)]
    pub output: Vec<OutputItem>,
    pub usage: Option<ResponseUsage>,
}

/// One output item.
#[derive(Debug, Deserialize)]
pub(crate) struct OutputItem {
    #[serde(rename = "type")]
    pub item_type: String,
    #[serde(default)]
    pub content: Vec<OutputContent>,
    pub call_id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// Content within an output message item.
#[derive(Debug, Deserialize)]
pub(crate) struct OutputContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: Option<String>,
}

/// Token usage; field names match the API.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ResponseUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Error response body.
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorResponse {
    pub error: ErrorDetail,
}

/// Error detail.
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorDetail {
    pub message: String,
}

// ── Streaming types ────────────────────────────────────────────────

/// One SSE event from the streaming API.
#[derive(Debug, Deserialize)]
pub(crate) struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub delta: Option<String>,
    pub item: Option<OutputItem>,
    pub response: Option<Response>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let req = Request {
            model: "gpt-4o",
            input: vec![InputItem::Message {
                role: "user",
                content: vec![InputContent::InputText {
                    text: "Hello".into(),
                }],
            }],
            stream: Some(true),
            previous_response_id: Some("resp_1".into()),
            instructions: Some("be terse"),
            max_output_tokens: Some(1024),
            temperature: None,
            top_p: None,
            tools: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["previous_response_id"], "resp_1");
        assert_eq!(json["input"][0]["type"], "message");
        assert_eq!(json["input"][0]["content"][0]["type"], "input_text");
    }

    #[test]
    fn test_function_call_output_serialization() {
        let item = InputItem::FunctionCallOutput {
            call_id: "call_1".into(),
            output: "sunny".into(),
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["type"], "function_call_output");
        assert_eq!(json["call_id"], "call_1");
    }

    #[test]
    fn test_stream_event_deserialization() {
        let json = serde_json::json!({
            "type": "response.output_item.done",
            "item": {
                "type": "function_call",
                "call_id": "call_2",
                "name": "search",
                "arguments": "{\"q\":\"rust\"}"
            }
        });
        let event: StreamEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event.event_type, "response.output_item.done");
        assert_eq!(event.item.unwrap().call_id.as_deref(), Some("call_2"));
    }

    #[test]
    fn test_response_deserialization() {
        let json = serde_json::json!({
            "id": "resp_9",
            "output": [
                { "type": "message", "content": [{ "type": "output_text", "text": "Hi" }] }
            ],
            "usage": { "input_tokens": 4, "output_tokens": 2 }
        });
        let resp: Response = serde_json::from_value(json).unwrap();
        assert_eq!(resp.id.as_deref(), Some("resp_9"));
        assert_eq!(resp.output[0].content[0].text.as_deref(), Some("Hi"));
    }
}
