//! SSE decoder for the Anthropic messages streaming API.
//!
//! [`SseMachine`] consumes raw response bytes and produces `IContent`
//! items: text deltas are yielded immediately, tool-call arguments
//! accumulate across `input_json_delta` events and surface as one
//! complete `ToolCall` block at `content_block_stop`, and
//! `message_delta` usage becomes a metadata-only item. The machine
//! tracks whether the terminal `message_stop` event arrived so callers
//! can distinguish a clean end from a mid-body interruption.

use std::collections::HashMap;

use llxprt_core::{
    ContentBlock, IContent, Speaker, UsageStats, parse_tool_parameters, to_history_id,
};

use crate::types::StreamEvent;

/// Bound on the decode buffers; a stream exceeding it is malformed.
const MAX_BUF: usize = 16 * 1024 * 1024; // 16 MiB

/// State for one in-flight tool-use block.
#[derive(Debug)]
struct ToolUseState {
    id: String,
    name: String,
    json_buffer: String,
}

/// Incremental SSE → `IContent` decoder.
#[derive(Debug, Default)]
pub(crate) struct SseMachine {
    buffer: String,
    utf8_buf: Vec<u8>,
    tool_states: HashMap<u32, ToolUseState>,
    finished: bool,
    overflowed: bool,
}

impl SseMachine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Whether the terminal `message_stop` event was seen.
    pub(crate) fn finished(&self) -> bool {
        self.finished
    }

    /// Whether the decode buffer overflowed (malformed stream).
    pub(crate) fn overflowed(&self) -> bool {
        self.overflowed
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

        // Decode the valid UTF-8 prefix; hold back a split code point.
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
                    // Permanently invalid bytes are skipped.
                    Some(len) => {
                        self.utf8_buf.drain(..valid_up_to + len);
                    }
                    // Incomplete code point: keep the tail for the next chunk.
                    None => {
                        self.utf8_buf.drain(..valid_up_to);
                    }
                }
            }
        }

        // Extract complete SSE events (delimited by a blank line).
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
            // Unparseable payloads (pings with empty objects) are skipped.
            return Vec::new();
        };

        match event.event_type.as_str() {
            "content_block_start" => {
                if let (Some(index), Some(block)) = (event.index, &event.content_block)
                    && block.block_type == "tool_use"
                {
                    self.tool_states.insert(
                        index,
                        ToolUseState {
                            id: block.id.clone().unwrap_or_default(),
                            name: block.name.clone().unwrap_or_default(),
                            json_buffer: String::new(),
                        },
                    );
                }
                Vec::new()
            }
            "content_block_delta" => {
                let (Some(index), Some(delta)) = (event.index, &event.delta) else {
                    return Vec::new();
                };
                match delta.delta_type.as_deref() {
                    Some("text_delta") => delta
                        .text
                        .as_ref()
                        .map(|t| IContent::ai_text(t.clone()))
                        .into_iter()
                        .collect(),
                    Some("input_json_delta") => {
                        if let (Some(partial), Some(state)) =
                            (&delta.partial_json, self.tool_states.get_mut(&index))
                        {
                            state.json_buffer.push_str(partial);
                        }
                        Vec::new()
                    }
                    _ => Vec::new(),
                }
            }
            "content_block_stop" => {
                let Some(index) = event.index else {
                    return Vec::new();
                };
                let Some(state) = self.tool_states.remove(&index) else {
                    return Vec::new();
                };
                let parameters = parse_tool_parameters(&state.json_buffer);
                vec![IContent {
                    speaker: Speaker::Ai,
                    blocks: vec![ContentBlock::ToolCall {
                        id: to_history_id(&state.id),
                        name: state.name,
                        parameters,
                    }],
                    metadata: None,
                }]
            }
            "message_delta" => event
                .usage
                .as_ref()
                .map(|u| IContent::usage(UsageStats::new(u.input_tokens, u.output_tokens)))
                .into_iter()
                .collect(),
            "message_stop" => {
                self.finished = true;
                Vec::new()
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
