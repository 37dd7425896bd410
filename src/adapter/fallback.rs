//! Prompt-grammar fallback for backends without native tool calling.
//!
//! The tool schemas are injected into a system prologue that pins a strict
//! reply grammar: a single line `TOOL_CALL: {json}`. Assistant text matching
//! the grammar is re-synthesized into structured tool calls; everything else
//! passes through as ordinary content.

use crate::protocol::{ToolCall, ToolSpec};
use serde_json::Value;

const MARKER: &str = "TOOL_CALL:";

/// System prologue describing the available tools and the reply grammar.
pub fn build_prologue(tools: &[ToolSpec]) -> String {
    let mut out = String::from(
        "You can call tools. To call a tool, reply with EXACTLY one line of the form\n\
         TOOL_CALL: {\"name\": \"<tool_name>\", \"arguments\": { ... }}\n\
         and nothing else. Otherwise answer the user normally in plain text.\n\
         Available tools:\n",
    );
    for tool in tools {
        out.push_str(&format!(
            "- {}: {}\n  arguments schema: {}\n",
            tool.name, tool.description, tool.input_schema
        ));
    }
    out
}

/// Parse assistant text for the grammar. Returns the synthesized call when
/// some line matches; ids are assigned by the caller.
pub fn parse_tool_call(text: &str) -> Option<ToolCall> {
    for line in text.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix(MARKER) else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(rest.trim()) else {
            continue;
        };
        let name = value.get("name")?.as_str()?.to_string();
        let arguments = value
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        return Some(ToolCall {
            id: String::new(),
            name,
            arguments,
        });
    }
    None
}
