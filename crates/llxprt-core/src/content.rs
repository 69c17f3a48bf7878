//! The provider-neutral conversation model.
//!
//! Every provider adapter speaks [`IContent`] at its boundary: a speaker,
//! an ordered list of typed [`ContentBlock`]s, and optional metadata
//! (token usage, runtime and provider identity). Wire formats differ
//! wildly between upstream APIs; adapters translate to and from this
//! model so consumers never see a provider-specific shape.
//!
//! # Invariants
//!
//! - A `speaker == Tool` item carries at least one
//!   [`ContentBlock::ToolResponse`], and its `call_id` refers to a
//!   previously emitted [`ContentBlock::ToolCall`] id. Strict-pairing
//!   providers enforce this by pruning orphans before send (see
//!   [`history`](crate::history)).
//! - Tool-call `parameters` are structured JSON values at this boundary,
//!   never strings. Wire-level string forms are parsed during decoding.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who produced a conversation item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    /// The end user.
    Human,
    /// The model.
    Ai,
    /// A tool responding to a prior tool call.
    Tool,
}

/// A single item in a conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IContent {
    /// Who produced this item.
    pub speaker: Speaker,
    /// Ordered content blocks. May be empty for metadata-only items
    /// (e.g. a usage update at the end of a stream).
    pub blocks: Vec<ContentBlock>,
    /// Optional per-item metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ContentMetadata>,
}

/// A typed payload within an [`IContent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },
    /// A fenced code block.
    Code {
        /// Language tag, when known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
        /// The code content.
        code: String,
    },
    /// A tool invocation requested by the model (`speaker == Ai` only).
    ToolCall {
        /// Canonical history id (`hist_tool_<uuid>`).
        id: String,
        /// The tool's name.
        name: String,
        /// Structured arguments. Always a JSON value, never a string.
        parameters: Value,
    },
    /// A tool's answer to a prior call (`speaker == Tool` only).
    ToolResponse {
        /// The [`ContentBlock::ToolCall`] id this responds to.
        call_id: String,
        /// The tool's result.
        result: Value,
        /// Error description when the tool failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Per-item metadata attached to an [`IContent`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContentMetadata {
    /// Token usage reported by the provider, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageStats>,
    /// The runtime context this item was produced under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_id: Option<String>,
    /// The provider that produced this item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_name: Option<String>,
}

/// Token counts for a single request/response pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsageStats {
    /// Tokens consumed by the prompt.
    pub prompt_tokens: u64,
    /// Tokens produced by the model.
    pub completion_tokens: u64,
    /// Sum of prompt and completion tokens.
    pub total_tokens: u64,
}

impl UsageStats {
    /// Creates a usage record, computing the total.
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

impl IContent {
    /// A `human` item with a single text block.
    pub fn human(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Human,
            blocks: vec![ContentBlock::Text { text: text.into() }],
            metadata: None,
        }
    }

    /// An `ai` item with a single text block.
    pub fn ai_text(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Ai,
            blocks: vec![ContentBlock::Text { text: text.into() }],
            metadata: None,
        }
    }

    /// An `ai` item carrying a single tool call.
    pub fn ai_tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            speaker: Speaker::Ai,
            blocks: vec![ContentBlock::ToolCall {
                id: id.into(),
                name: name.into(),
                parameters,
            }],
            metadata: None,
        }
    }

    /// A `tool` item answering a prior tool call.
    pub fn tool_response(call_id: impl Into<String>, result: Value) -> Self {
        Self {
            speaker: Speaker::Tool,
            blocks: vec![ContentBlock::ToolResponse {
                call_id: call_id.into(),
                result,
                error: None,
            }],
            metadata: None,
        }
    }

    /// A metadata-only `ai` item carrying a usage update.
    pub fn usage(usage: UsageStats) -> Self {
        Self {
            speaker: Speaker::Ai,
            blocks: Vec::new(),
            metadata: Some(ContentMetadata {
                usage: Some(usage),
                ..Default::default()
            }),
        }
    }

    /// Concatenated text of all [`ContentBlock::Text`] blocks, or `None`
    /// if the item has no text.
    pub fn text(&self) -> Option<String> {
        let mut out = String::new();
        for block in &self.blocks {
            if let ContentBlock::Text { text } = block {
                out.push_str(text);
            }
        }
        if out.is_empty() { None } else { Some(out) }
    }

    /// Ids of all tool calls in this item.
    pub fn tool_call_ids(&self) -> Vec<&str> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolCall { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Returns `true` if the item contains at least one tool-response block.
    pub fn has_tool_response(&self) -> bool {
        self.blocks
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolResponse { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_constructor() {
        let item = IContent::human("Hello");
        assert_eq!(item.speaker, Speaker::Human);
        assert_eq!(item.text().as_deref(), Some("Hello"));
        assert!(item.metadata.is_none());
    }

    #[test]
    fn test_usage_stats_totals() {
        let u = UsageStats::new(3, 2);
        assert_eq!(u.total_tokens, 5);
    }

    #[test]
    fn test_usage_stats_saturating() {
        let u = UsageStats::new(u64::MAX, 1);
        assert_eq!(u.total_tokens, u64::MAX);
    }

    #[test]
    fn test_usage_item_is_metadata_only() {
        let item = IContent::usage(UsageStats::new(10, 5));
        assert!(item.blocks.is_empty());
        assert_eq!(
            item.metadata.unwrap().usage.unwrap().total_tokens,
            15
        );
    }

    #[test]
    fn test_text_concatenates_blocks() {
        let item = IContent {
            speaker: Speaker::Ai,
            blocks: vec![
                ContentBlock::Text {
                    text: "Hello, ".into(),
                },
                ContentBlock::ToolCall {
                    id: "hist_tool_1".into(),
                    name: "x".into(),
                    parameters: serde_json::json!({}),
                },
                ContentBlock::Text {
                    text: "world".into(),
                },
            ],
            metadata: None,
        };
        assert_eq!(item.text().as_deref(), Some("Hello, world"));
    }

    #[test]
    fn test_text_none_when_no_text_blocks() {
        let item = IContent::tool_response("hist_tool_1", serde_json::json!("ok"));
        assert!(item.text().is_none());
    }

    #[test]
    fn test_tool_call_ids() {
        let item = IContent::ai_tool_call("hist_tool_a", "search", serde_json::json!({"q": 1}));
        assert_eq!(item.tool_call_ids(), vec!["hist_tool_a"]);
    }

    #[test]
    fn test_has_tool_response() {
        assert!(IContent::tool_response("hist_tool_a", serde_json::json!(null)).has_tool_response());
        assert!(!IContent::human("hi").has_tool_response());
    }

    #[test]
    fn test_speaker_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Speaker::Ai).unwrap(), "\"ai\"");
        assert_eq!(serde_json::to_string(&Speaker::Human).unwrap(), "\"human\"");
        assert_eq!(serde_json::to_string(&Speaker::Tool).unwrap(), "\"tool\"");
    }

    #[test]
    fn test_block_serde_tagged() {
        let block = ContentBlock::ToolCall {
            id: "hist_tool_1".into(),
            name: "search".into(),
            parameters: serde_json::json!({"q": "rust"}),
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "tool_call");
        assert_eq!(json["name"], "search");
    }

    #[test]
    fn test_content_serde_roundtrip() {
        let item = IContent {
            speaker: Speaker::Ai,
            blocks: vec![
                ContentBlock::Text { text: "hi".into() },
                ContentBlock::Code {
                    language: Some("rust".into()),
                    code: "fn main() {}".into(),
                },
            ],
            metadata: Some(ContentMetadata {
                usage: Some(UsageStats::new(1, 2)),
                runtime_id: Some("r1".into()),
                provider_name: Some("anthropic".into()),
            }),
        };
        let json = serde_json::to_string(&item).unwrap();
        let back: IContent = serde_json::from_str(&json).unwrap();
        assert_eq!(item, back);
    }

    #[test]
    fn test_metadata_skipped_when_absent() {
        let json = serde_json::to_value(IContent::human("x")).unwrap();
        assert!(json.get("metadata").is_none());
    }
}
