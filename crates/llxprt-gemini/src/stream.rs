//! SSE decoder for `streamGenerateContent`.
//!
//! Each SSE `data:` line carries a complete chunked response: text
//! parts yield immediately, `functionCall` parts yield complete
//! `ToolCall` blocks (arguments arrive structured on this wire, and
//! the call gets a freshly minted canonical id because Gemini assigns
//! none), and the chunk carrying a `finishReason` contributes the
//! usage item and marks the stream finished.

use llxprt_core::{ContentBlock, IContent, Speaker, new_history_id};

use crate::types::Response;

/// Bound on the decode buffers; a stream exceeding it is malformed.
const MAX_BUF: usize = 16 * 1024 * 1024; // 16 MiB

/// Incremental SSE → `IContent` decoder.
#[derive(Debug, Default)]
pub(crate) struct SseMachine {
    buffer: String,
    utf8_buf: Vec<u8>,
    finished: bool,
    overflowed: bool,
}

impl SseMachine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Whether a chunk with a `finishReason` was seen.
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
        let Ok(chunk) = serde_json::from_str::<Response>(data) else {
            return Vec::new();
        };
        self.decode_chunk(&chunk)
    }

    /// Decodes one chunked response into items; shared with the
    /// non-streaming path (a full response is one big chunk).
    pub(crate) fn decode_chunk(&mut self, chunk: &Response) -> Vec<IContent> {
        let mut items = Vec::new();
        let mut saw_finish = false;

        if let Some(candidate) = chunk.candidates.first() {
            if let Some(content) = &candidate.content {
                for part in &content.parts {
                    if let Some(text) = &part.text
                        && !text.is_empty()
                    {
                        items.push(IContent::ai_text(text.clone()));
                    }
                    if let Some(call) = &part.function_call {
                        items.push(IContent {
                            speaker: Speaker::Ai,
                            blocks: vec![ContentBlock::ToolCall {
                                id: new_history_id(),
                                name: call.name.clone(),
                                parameters: call.args.clone(),
                            }],
                            metadata: None,
                        });
                    }
                }
            }
            if candidate.finish_reason.is_some() {
                saw_finish = true;
            }
        }

        if saw_finish {
            self.finished = true;
            if let Some(usage) = &chunk.usage_metadata {
                items.push(IContent::usage(llxprt_core::UsageStats::new(
                    usage.prompt_token_count,
                    usage.candidates_token_count,
                )));
            }
        }
        items
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

    fn push_str(machine: &mut SseMachine, text: &str) -> Vec<IContent> {
        machine.push(text.as_bytes())
    }

    #[test]
    fn test_text_chunk() {
        let mut machine = SseMachine::new();
        let items = push_str(
            &mut machine,
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Hel\"}]}}]}\n\n",
        );
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].text().as_deref(), Some("Hel"));
        assert!(!machine.finished());
    }

    #[test]
    fn test_finish_chunk_carries_usage() {
        let mut machine = SseMachine::new();
        let items = push_str(
            &mut machine,
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"lo\"}]},\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":8,\"candidatesTokenCount\":3}}\n\n",
        );
        assert!(machine.finished());
        assert_eq!(items.len(), 2);
        let usage = items[1].metadata.as_ref().unwrap().usage.unwrap();
        assert_eq!(usage.prompt_tokens, 8);
        assert_eq!(usage.completion_tokens, 3);
    }

    #[test]
    fn test_function_call_gets_minted_canonical_id() {
        let mut machine = SseMachine::new();
        let items = push_str(
            &mut machine,
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"functionCall\":{\"name\":\"search\",\"args\":{\"q\":\"rust\"}}}]},\"finishReason\":\"STOP\"}]}\n\n",
        );
        assert!(matches!(
            &items[0].blocks[0],
            ContentBlock::ToolCall { id, name, parameters }
                if id.starts_with("hist_tool_") && name == "search" && parameters["q"] == "rust"
        ));
    }

    #[test]
    fn test_unparseable_chunk_ignored() {
        let mut machine = SseMachine::new();
        assert!(push_str(&mut machine, "data: not-json\n\n").is_empty());
    }

    #[test]
    fn test_chunk_split_across_pushes() {
        let mut machine = SseMachine::new();
        assert!(push_str(
            &mut machine,
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Hi"
        )
        .is_empty());
        let items = push_str(&mut machine, "\"}]}}]}\n\n");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].text().as_deref(), Some("Hi"));
    }
}
