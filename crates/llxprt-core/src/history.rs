//! Tool-id canonicalization and strict-pairing history preparation.
//!
//! Inside the core every tool call is identified by the canonical form
//! `hist_tool_<uuid>`. Provider wire forms (`toolu_<uuid>` for
//! Anthropic-style APIs, `call_<uuid>` for OpenAI-style APIs, bare
//! UUIDs elsewhere) are rewritten on ingress and egress so the rest of
//! the system never branches on provider id shapes.
//!
//! Strict-pairing providers reject payloads whose tool results do not
//! correspond 1-for-1 to earlier tool uses. [`prepare_strict_history`]
//! enforces the invariant before send: orphaned tool results are pruned
//! (with a debug log), leading tool items are dropped, and a placeholder
//! `human` item is prepended when the first item would otherwise not be
//! `human`.

use serde_json::Value;
use tracing::{debug, warn};

use crate::content::{ContentBlock, IContent, Speaker};

/// Canonical history-id prefix.
pub const HISTORY_TOOL_PREFIX: &str = "hist_tool_";
/// Anthropic-style wire prefix.
pub const ANTHROPIC_TOOL_PREFIX: &str = "toolu_";
/// OpenAI-style wire prefix.
pub const OPENAI_TOOL_PREFIX: &str = "call_";

/// Placeholder sent when a strict-pairing conversation would otherwise
/// be empty.
pub const EMPTY_CONVERSATION_PLACEHOLDER: &str = "Hello";
/// Placeholder prepended when the first item is not `human`.
pub const CONTINUE_PLACEHOLDER: &str = "Continue the conversation";

/// Mints a fresh canonical id.
pub fn new_history_id() -> String {
    format!("{HISTORY_TOOL_PREFIX}{}", uuid::Uuid::new_v4())
}

/// Ingress: rewrites any provider id form to the canonical
/// `hist_tool_<uuid>`. Already-canonical ids pass through unchanged;
/// unknown prefixes are treated as a bare UUID.
pub fn to_history_id(provider_id: &str) -> String {
    if let Some(rest) = provider_id.strip_prefix(HISTORY_TOOL_PREFIX) {
        return format!("{HISTORY_TOOL_PREFIX}{rest}");
    }
    let bare = provider_id
        .strip_prefix(ANTHROPIC_TOOL_PREFIX)
        .or_else(|| provider_id.strip_prefix(OPENAI_TOOL_PREFIX))
        .unwrap_or(provider_id);
    format!("{HISTORY_TOOL_PREFIX}{bare}")
}

/// Egress for Anthropic-style APIs: `hist_tool_<u>` → `toolu_<u>`.
pub fn to_anthropic_id(history_id: &str) -> String {
    format!("{ANTHROPIC_TOOL_PREFIX}{}", bare_id(history_id))
}

/// Egress for OpenAI-style APIs: `hist_tool_<u>` → `call_<u>`.
pub fn to_openai_id(history_id: &str) -> String {
    format!("{OPENAI_TOOL_PREFIX}{}", bare_id(history_id))
}

/// Egress for dialects using raw UUIDs (qwen/glm): strips the
/// canonical prefix.
pub fn to_bare_id(history_id: &str) -> String {
    bare_id(history_id).to_string()
}

/// Strips any known prefix; unknown-prefix ids are treated as bare.
fn bare_id(id: &str) -> &str {
    id.strip_prefix(HISTORY_TOOL_PREFIX)
        .or_else(|| id.strip_prefix(ANTHROPIC_TOOL_PREFIX))
        .or_else(|| id.strip_prefix(OPENAI_TOOL_PREFIX))
        .unwrap_or(id)
}

/// Parses streamed tool parameters. Providers deliver arguments as an
/// accumulated JSON string; a parse failure degrades to `{}` with a log
/// entry and the call proceeds.
pub fn parse_tool_parameters(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    match serde_json::from_str(raw) {
        Ok(value @ Value::Object(_)) => value,
        Ok(other) => {
            warn!(raw = %raw, "tool parameters parsed to a non-object; substituting {{}}");
            let _ = other;
            Value::Object(serde_json::Map::new())
        }
        Err(err) => {
            warn!(error = %err, raw = %raw, "tool parameters failed to parse; substituting {{}}");
            Value::Object(serde_json::Map::new())
        }
    }
}

/// Prepares a history for a strict-pairing provider:
///
/// 1. Tool-response blocks whose `call_id` was never emitted as a
///    tool-call id are pruned; items left with no blocks are dropped.
/// 2. Any remaining leading `tool` items are dropped.
/// 3. An empty result becomes a single `{human, "Hello"}` placeholder.
/// 4. A result whose first item is not `human` gets a
///    `{human, "Continue the conversation"}` placeholder prepended.
pub fn prepare_strict_history(contents: &[IContent]) -> Vec<IContent> {
    let emitted: std::collections::HashSet<&str> = contents
        .iter()
        .filter(|item| item.speaker == Speaker::Ai)
        .flat_map(|item| item.tool_call_ids())
        .collect();

    let mut prepared: Vec<IContent> = Vec::with_capacity(contents.len());
    for item in contents {
        if item.speaker != Speaker::Tool {
            prepared.push(item.clone());
            continue;
        }
        let kept: Vec<ContentBlock> = item
            .blocks
            .iter()
            .filter(|block| match block {
                ContentBlock::ToolResponse { call_id, .. } => {
                    let known = emitted.contains(call_id.as_str());
                    if !known {
                        debug!(call_id = %call_id, "pruning orphaned tool response");
                    }
                    known
                }
                _ => true,
            })
            .cloned()
            .collect();
        if !kept.is_empty() {
            prepared.push(IContent {
                speaker: item.speaker,
                blocks: kept,
                metadata: item.metadata.clone(),
            });
        }
    }

    while prepared
        .first()
        .is_some_and(|item| item.speaker == Speaker::Tool)
    {
        debug!("dropping leading tool item from conversation head");
        prepared.remove(0);
    }

    if prepared.is_empty() {
        return vec![IContent::human(EMPTY_CONVERSATION_PLACEHOLDER)];
    }
    if prepared[0].speaker != Speaker::Human {
        prepared.insert(0, IContent::human(CONTINUE_PLACEHOLDER));
    }
    prepared
}

// ── Tool-format detection ───────────────────────────────────────────

/// Wire dialect used to encode tool declarations and calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolFormat {
    /// Anthropic `tool_use` / `tool_result` blocks.
    Anthropic,
    /// OpenAI function-call encoding.
    OpenAi,
    /// Gemini `functionCall` / `functionResponse` parts.
    Gemini,
    /// Qwen/GLM dialect of the OpenAI encoding (bare-uuid call ids).
    Qwen,
}

impl ToolFormat {
    /// Parses a settings value (`"qwen"`, `"openai"`, …).
    pub fn from_setting(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "anthropic" => Some(Self::Anthropic),
            "openai" => Some(Self::OpenAi),
            "gemini" => Some(Self::Gemini),
            "qwen" => Some(Self::Qwen),
            _ => None,
        }
    }
}

/// Picks the tool format for a call: an explicit `toolFormat` setting
/// overrides; otherwise qwen/glm model names select the qwen dialect;
/// otherwise the provider's native format applies.
pub fn detect_tool_format(explicit: Option<&str>, model: &str, native: ToolFormat) -> ToolFormat {
    if let Some(setting) = explicit
        && let Some(format) = ToolFormat::from_setting(setting)
    {
        return format;
    }
    let lowered = model.to_lowercase();
    if lowered.contains("qwen") || lowered.contains("glm") {
        return ToolFormat::Qwen;
    }
    native
}
