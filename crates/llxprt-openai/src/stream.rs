//! SSE decoder for the chat-completions streaming API.
//!
//! Text deltas yield immediately. Tool-call pieces accumulate per
//! choice index — the first piece carries the id and name, later
//! pieces append argument fragments — and flush as complete `ToolCall`
//! blocks when the upstream reports `finish_reason == "tool_calls"` or
//! the `[DONE]` sentinel arrives. A usage chunk (requested via
//! `stream_options.include_usage`) becomes a metadata-only item.

use std::collections::HashMap;

use llxprt_core::{
    ContentBlock, IContent, Speaker, UsageStats, parse_tool_parameters, to_history_id,
};

use crate::types::StreamChunk;

/// Bound on the decode buffers; a stream exceeding it is malformed.
const MAX_BUF: usize = 16 * 1024 * 1024; // 16 MiB

/// State for one in-flight tool call, keyed by choice index.
#[derive(Debug)]
struct ToolCallState {
    id: String,
    name: String,
    arguments_buffer: String,
}

/// Incremental SSE → `IContent` decoder.
#[derive(Debug, Default)]
pub(crate) struct SseMachine {
    buffer: String,
    utf8_buf: Vec<u8>,
    tool_states: HashMap<u32, ToolCallState>,
    finished: bool,
    overflowed: bool,
}

impl SseMachine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Whether a terminal event (`finish_reason` or `[DONE]`) was seen.
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
            self.finished = true;
            return self.flush_pending();
        }
        let Ok(chunk) = serde_json::from_str::<StreamChunk>(data) else {
            return Vec::new();
        };

        let mut items = Vec::new();
        if let Some(choice) = chunk.choices.first() {
            if let Some(text) = &choice.delta.content
                && !text.is_empty()
            {
                items.push(IContent::ai_text(text.clone()));
            }

            if let Some(tool_calls) = &choice.delta.tool_calls {
                for piece in tool_calls {
                    if let Some(id) = &piece.id {
                        let name = piece
                            .function
                            .as_ref()
                            .and_then(|f| f.name.clone())
                            .unwrap_or_default();
                        self.tool_states.insert(
                            piece.index,
                            ToolCallState {
                                id: id.clone(),
                                name,
                                arguments_buffer: String::new(),
                            },
                        );
                    }
                    if let Some(arguments) = piece.function.as_ref().and_then(|f| f.arguments.as_ref())
                        && !arguments.is_empty()
                        && let Some(state) = self.tool_states.get_mut(&piece.index)
                    {
                        state.arguments_buffer.push_str(arguments);
                    }
                }
            }

            if let Some(reason) = &choice.finish_reason {
                if reason == "tool_calls" {
                    items.extend(self.flush_pending());
                }
                self.finished = true;
            }
        }

        if let Some(usage) = &chunk.usage {
            items.push(IContent::usage(UsageStats::new(
                usage.prompt_tokens,
                usage.completion_tokens,
            )));
        }
        items
    }

    /// Flushes accumulated tool calls in index order.
    fn flush_pending(&mut self) -> Vec<IContent> {
        let mut indices: Vec<u32> = self.tool_states.keys().copied().collect();
        indices.sort_unstable();
        indices
            .into_iter()
            .filter_map(|index| self.tool_states.remove(&index))
            .map(|state| IContent {
                speaker: Speaker::Ai,
                blocks: vec![ContentBlock::ToolCall {
                    id: to_history_id(&state.id),
                    name: state.name,
                    parameters: parse_tool_parameters(&state.arguments_buffer),
                }],
                metadata: None,
            })
            .collect()
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
