//! SSE decoder for the Responses streaming API.
//!
//! `response.output_text.delta` events yield text immediately;
//! `response.output_item.done` events carrying a `function_call` item
//! yield a complete `ToolCall` block; `response.completed` yields the
//! usage item, records the new thread id, and marks the stream
//! finished.

use llxprt_core::{
    ContentBlock, IContent, Speaker, UsageStats, parse_tool_parameters, to_history_id,
};

use crate::types::StreamEvent;

/// Bound on the decode buffers; a stream exceeding it is malformed.
const MAX_BUF: usize = 16 * 1024 * 1024; // 16 MiB

/// Incremental SSE → `IContent` decoder.
#[derive(Debug, Default)]
pub(crate) struct SseMachine {
    buffer: String,
    utf8_buf: Vec<u8>,
    finished: bool,
    overflowed: bool,
    response_id: Option<String>,
}

impl SseMachine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Whether `response.completed` was seen.
    pub(crate) fn finished(&self) -> bool {
        self.finished
    }

    /// Whether the decode buffer overflowed (malformed stream).
    pub(crate) fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// The completed response's id, for threading the next call.
    pub(crate) fn response_id(&self) -> Option<&str> {
        self.response_id.as_deref()
    }

    /// Feeds raw bytes, returning every item completed by this chunk.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<IContent> {
        self.utf8_buf.extend_from_slice(bytes);
        if self.utf8_buf.len() > MAX_BUF || self.buffer.len() > MAX_BUF {
            self.utf8_buf.clear();
            self.buffer.clear();
            self.overflowed = true;
            return Vec::new();
        }

        match std::str::from_utf8(&self.utf8_buf) {
            Ok(text) => {
                self.buffer.push_str(text);
                self.utf8_buf.clear();
            }
            Err(e) => {
                let valid_up_to = e.valid_up_to();
                if valid_up_to > 0 {
                    // SAFETY: `from_utf8` validated bytes up to this
                    // index as UTF-8.
                    let valid =
                        unsafe { std::str::from_utf8_unchecked(&self.utf8_buf[..valid_up_to]) };
                    self.buffer.push_str(valid);
                }
                match e.error_len() {
                    Some(len) => {
                        self.utf8_buf.drain(..valid_up_to + len);
                    }
                    None => {
                        self.utf8_buf.drain(..valid_up_to);
                    }
                }
            }
        }

        let mut items = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let event_text = self.buffer[..pos + 2].to_string();
            self.buffer.drain(..pos + 2);
            items.extend(self.parse_event(&event_text));
        }
        items
    }

    fn parse_event(&mut self, event_text: &str) -> Vec<IContent> {
        let Some(data) = extract_data_line(event_text) else {
            return Vec::new();
        };
        if data == "[DONE]" {
            return Vec::new();
        }
        let Ok(event) = serde_json::from_str::<StreamEvent>(data) else {
            return Vec::new();
        };

        match event.event_type.as_str() {
            "response.output_text.delta" => event
                .delta
                .filter(|d| !d.is_empty())
                .map(IContent::ai_text)
                .into_iter()
                .collect(),
            "response.output_item.done" => {
                let Some(item) = event.item else {
                    return Vec::new();
                };
                if item.item_type != "function_call" {
                    return Vec::new();
                }
                vec![IContent {
                    speaker: Speaker::Ai,
                    blocks: vec![ContentBlock::ToolCall {
                        id: to_history_id(&item.call_id.unwrap_or_default()),
                        name: item.name.unwrap_or_default(),
                        parameters: parse_tool_parameters(
                            item.arguments.as_deref().unwrap_or_default(),
                        ),
                    }],
                    metadata: None,
                }]
            }
            "response.completed" => {
                self.finished = true;
                let Some(response) = event.response else {
                    return Vec::new();
                };
                self.response_id = response.id;
                response
                    .usage
                    .map(|u| IContent::usage(UsageStats::new(u.input_tokens, u.output_tokens)))
                    .into_iter()
                    .collect()
            }
            _ => Vec::new(),
        }
    }
}

/// Extracts the `data: ` payload from an SSE event block.
fn extract_data_line(event_text: &str) -> Option<&str> {
    for line in event_text.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(data) = line.strip_prefix("data: ") {
            return Some(data);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn push_str(machine: &mut SseMachine, text: &str) -> Vec<IContent> {
        machine.push(text.as_bytes())
    }

    #[test]
    fn test_output_text_delta() {
        let mut machine = SseMachine::new();
        let items = push_str(
            &mut machine,
            "data: {\"type\":\"response.output_text.delta\",\"delta\":\"Hi\"}\n\n",
        );
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].text().as_deref(), Some("Hi"));
    }

    #[test]
    fn test_function_call_done() {
        let mut machine = SseMachine::new();
        let items = push_str(
            &mut machine,
            "data: {\"type\":\"response.output_item.done\",\"item\":{\"type\":\"function_call\",\"call_id\":\"call_5\",\"name\":\"search\",\"arguments\":\"{\\\"q\\\":\\\"rust\\\"}\"}}\n\n",
        );
        assert_eq!(items.len(), 1);
        assert!(matches!(
            &items[0].blocks[0],
            ContentBlock::ToolCall { id, name, parameters }
                if id == "hist_tool_5" && name == "search" && parameters["q"] == "rust"
        ));
    }

    #[test]
    fn test_non_function_item_ignored() {
        let mut machine = SseMachine::new();
        let items = push_str(
            &mut machine,
            "data: {\"type\":\"response.output_item.done\",\"item\":{\"type\":\"message\",\"content\":[]}}\n\n",
        );
        assert!(items.is_empty());
    }

    #[test]
    fn test_completed_yields_usage_and_records_id() {
        let mut machine = SseMachine::new();
        let items = push_str(
            &mut machine,
            "data: {\"type\":\"response.completed\",\"response\":{\"id\":\"resp_7\",\"output\":[],\"usage\":{\"input_tokens\":6,\"output_tokens\":4}}}\n\n",
        );
        assert!(machine.finished());
        assert_eq!(machine.response_id(), Some("resp_7"));
        let usage = items[0].metadata.as_ref().unwrap().usage.unwrap();
        assert_eq!(usage.total_tokens, 10);
    }

    #[test]
    fn test_unparseable_arguments_degrade_to_empty_object() {
        let mut machine = SseMachine::new();
        let items = push_str(
            &mut machine,
            "data: {\"type\":\"response.output_item.done\",\"item\":{\"type\":\"function_call\",\"call_id\":\"call_9\",\"name\":\"x\",\"arguments\":\"{oops\"}}\n\n",
        );
        assert!(matches!(
            &items[0].blocks[0],
            ContentBlock::ToolCall { parameters, .. } if *parameters == json!({})
        ));
    }

    #[test]
    fn test_unknown_events_ignored() {
        let mut machine = SseMachine::new();
        assert!(push_str(
            &mut machine,
            "data: {\"type\":\"response.created\",\"response\":{\"id\":\"resp_1\",\"output\":[]}}\n\n"
        )
        .is_empty());
        assert!(!machine.finished());
    }
}
