//! System-prompt composition.
//!
//! The composer loads a template from the prompt directory
//! (`LLXPRT_PROMPTS_DIR` overrides the default `~/.llxprt/prompts`),
//! substitutes `{{VARIABLE}}` tokens, and appends user memory after a
//! `---` separator when present. When no template file exists, a
//! built-in default is used so composition never fails on a fresh
//! install.
//!
//! Substitution is deterministic on `(template bytes, variable map)`:
//! there are no implicit variables. The brace rules:
//!
//! - `{{NAME}}` with `NAME` in the map → the mapped value.
//! - `{{NAME}}` absent from the map → the empty string.
//! - An opener whose body contains another `{{` is emitted literally
//!   and scanning resumes after that opener.
//! - An opener with no closing `}}` is emitted as-is and scanning
//!   resumes after it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::LlxprtError;
use crate::provider::ToolGroup;

/// Environment variable overriding the prompt directory.
pub const PROMPTS_DIR_ENV: &str = "LLXPRT_PROMPTS_DIR";

/// File name of the core prompt template inside the prompt directory.
const CORE_TEMPLATE_FILE: &str = "core.md";

/// Built-in template used when the prompt directory has no `core.md`.
const DEFAULT_TEMPLATE: &str = "\
You are an AI assistant served by {{PROVIDER}} running model {{MODEL}}.
Answer precisely and cite tool results when you use them.
{{TOOL_GUIDANCE}}";

/// Inputs to one composition.
#[derive(Debug, Clone, Default)]
pub struct PromptContext<'a> {
    /// User memory appended after a `---` separator.
    pub user_memory: Option<&'a str>,
    /// The resolved model id.
    pub model: &'a str,
    /// The provider name.
    pub provider: &'a str,
    /// Declared tools, used to render tool guidance.
    pub tools: Option<&'a [ToolGroup]>,
}

/// Composes system prompts from templates on disk.
#[derive(Debug, Clone)]
pub struct PromptComposer {
    dir: PathBuf,
}

impl PromptComposer {
    /// A composer rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Resolves the prompt directory from `LLXPRT_PROMPTS_DIR`, falling
    /// back to `~/.llxprt/prompts`.
    pub fn from_env() -> Self {
        if let Ok(dir) = std::env::var(PROMPTS_DIR_ENV)
            && !dir.is_empty()
        {
            return Self::new(dir);
        }
        let base = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(base.join(".llxprt").join("prompts"))
    }

    /// The directory templates are loaded from.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Composes the system prompt for one call.
    pub fn compose(&self, ctx: &PromptContext<'_>) -> Result<String, LlxprtError> {
        let template_path = self.dir.join(CORE_TEMPLATE_FILE);
        let template = match std::fs::read_to_string(&template_path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %template_path.display(), "no core template; using built-in default");
                DEFAULT_TEMPLATE.to_string()
            }
            Err(err) => {
                return Err(LlxprtError::Config(format!(
                    "failed to read prompt template {}: {err}",
                    template_path.display()
                )));
            }
        };

        let mut vars = HashMap::new();
        vars.insert("MODEL".to_string(), ctx.model.to_string());
        vars.insert("PROVIDER".to_string(), ctx.provider.to_string());
        vars.insert("TOOL_GUIDANCE".to_string(), tool_guidance(ctx.tools));

        let mut prompt = substitute(&template, &vars);
        if let Some(memory) = ctx.user_memory
            && !memory.is_empty()
        {
            prompt.push_str("\n\n---\n\n");
            prompt.push_str(memory);
        }
        Ok(prompt)
    }
}

fn tool_guidance(tools: Option<&[ToolGroup]>) -> String {
    let names: Vec<&str> = tools
        .unwrap_or_default()
        .iter()
        .flat_map(|g| g.tools.iter())
        .map(|t| t.name.as_str())
        .collect();
    if names.is_empty() {
        String::new()
    } else {
        format!("Available tools: {}.", names.join(", "))
    }
}

/// Substitutes `{{VARIABLE}}` tokens in `template` against `vars`.
///
/// See the module docs for the exact brace rules. Deterministic on its
/// inputs.
pub fn substitute(template: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            None => {
                // Unbalanced opener: emit as-is, resume after it.
                out.push_str("{{");
                rest = after;
            }
            Some(end) => {
                let body = &after[..end];
                if body.contains("{{") {
                    // Nested opener: keep this opener literal and let the
                    // inner token be handled on the next pass.
                    out.push_str("{{");
                    rest = after;
                } else {
                    if let Some(value) = vars.get(body.trim()) {
                        out.push_str(value);
                    }
                    // Unmatched names substitute to the empty string.
                    rest = &after[end + 2..];
                }
            }
        }
    }
    out.push_str(rest);
    out
}
