//! Normalises agent output lines into categorised log entries.
//!
//! Two input shapes are understood:
//! - Claude CLI `stream-json` events (`assistant`, `user`, `result`, `system`)
//! - hook events carrying `hook_event_name` (`PreToolUse`, `PostToolUse`, ...)
//!
//! The parser is stateful per stage file: it remembers which tool each
//! `tool_use` id belongs to so that the matching tool result can be tagged
//! as a file change.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

use super::super::models::LogCategory;

/// Tools whose successful completion modifies a file in the working copy.
const FILE_EDITING_TOOLS: [&str; 4] = ["Write", "Edit", "MultiEdit", "NotebookEdit"];

/// Tool result bodies larger than this are clipped in the payload.
const MAX_RESULT_CHARS: usize = 4000;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("line is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unrecognised line shape: {0}")]
    Shape(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEntry {
    pub category: LogCategory,
    pub payload: Value,
}

impl ParsedEntry {
    fn new(category: LogCategory, payload: Value) -> Self {
        Self { category, payload }
    }
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        id: String,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct UserMessage {
    #[serde(default)]
    content: Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    Assistant {
        message: AssistantMessage,
    },
    User {
        message: Option<UserMessage>,
    },
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default)]
        num_turns: Option<u64>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
    },
    System {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct HookEvent {
    hook_event_name: String,
    #[serde(default)]
    tool_name: Option<String>,
    #[serde(default)]
    tool_input: Value,
    #[serde(default)]
    tool_response: Value,
    #[serde(default)]
    session_id: Option<String>,
}

struct PendingTool {
    name: String,
    input: Value,
}

/// Stateful line parser; one per stage log file.
#[derive(Default)]
pub struct LineParser {
    pending: HashMap<String, PendingTool>,
}

impl LineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one line. Blank lines yield no entries; lines that are not JSON
    /// objects of a known shape are errors for the caller to skip.
    pub fn parse_line(&mut self, line: &str) -> Result<Vec<ParsedEntry>, ParseError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        let value: Value = serde_json::from_str(trimmed)?;
        if !value.is_object() {
            return Err(ParseError::Shape("expected a JSON object".into()));
        }
        if value.get("hook_event_name").is_some() {
            let hook: HookEvent = serde_json::from_value(value)?;
            return Ok(self.hook_entries(hook));
        }
        match value.get("type").and_then(Value::as_str) {
            Some("assistant" | "user" | "result" | "system") => {
                let event: StreamEvent = serde_json::from_value(value)?;
                Ok(self.stream_entries(event))
            }
            Some(other) => Err(ParseError::Shape(format!("unknown event type '{}'", other))),
            None => Err(ParseError::Shape("missing 'type' field".into())),
        }
    }

    fn stream_entries(&mut self, event: StreamEvent) -> Vec<ParsedEntry> {
        match event {
            StreamEvent::Assistant { message } => message
                .content
                .into_iter()
                .filter_map(|block| self.block_entries(block))
                .flatten()
                .collect(),
            StreamEvent::User { message } => {
                let blocks: Vec<ContentBlock> = message
                    .and_then(|m| serde_json::from_value(m.content).ok())
                    .unwrap_or_default();
                blocks
                    .into_iter()
                    .filter_map(|block| self.block_entries(block))
                    .flatten()
                    .collect()
            }
            StreamEvent::Result {
                subtype,
                result,
                is_error,
                duration_ms,
                num_turns,
                total_cost_usd,
            } => vec![ParsedEntry::new(
                LogCategory::Status,
                json!({
                    "event": "result",
                    "subtype": subtype,
                    "is_error": is_error,
                    "result": result,
                    "duration_ms": duration_ms,
                    "num_turns": num_turns,
                    "total_cost_usd": total_cost_usd,
                }),
            )],
            StreamEvent::System {
                subtype,
                model,
                session_id,
            } => vec![ParsedEntry::new(
                LogCategory::Status,
                json!({
                    "event": "system",
                    "subtype": subtype,
                    "model": model,
                    "session_id": session_id,
                }),
            )],
        }
    }

    fn block_entries(&mut self, block: ContentBlock) -> Option<Vec<ParsedEntry>> {
        match block {
            ContentBlock::Thinking { thinking } => Some(vec![ParsedEntry::new(
                LogCategory::Thinking,
                json!({ "text": thinking }),
            )]),
            ContentBlock::Text { text } => Some(vec![ParsedEntry::new(
                LogCategory::Text,
                json!({ "text": text }),
            )]),
            ContentBlock::ToolUse { name, input, id } => {
                let entry = tool_pre(&name, &input, Some(&id));
                if !id.is_empty() {
                    self.pending.insert(id, PendingTool { name, input });
                }
                Some(vec![entry])
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let pending = self.pending.remove(&tool_use_id);
                let tool = pending.as_ref().map(|p| p.name.as_str());
                let mut entries = vec![ParsedEntry::new(
                    LogCategory::ToolUsePost,
                    json!({
                        "tool": tool,
                        "id": tool_use_id,
                        "is_error": is_error,
                        "content": clip(&result_text(&content)),
                    }),
                )];
                if let Some(p) = pending
                    && !is_error
                    && let Some(change) = file_change(&p.name, &p.input)
                {
                    entries.push(change);
                }
                Some(entries)
            }
            ContentBlock::Other => None,
        }
    }

    fn hook_entries(&mut self, hook: HookEvent) -> Vec<ParsedEntry> {
        let tool = hook.tool_name.unwrap_or_default();
        match hook.hook_event_name.as_str() {
            "PreToolUse" => vec![tool_pre(&tool, &hook.tool_input, None)],
            "PostToolUse" => {
                let failed = hook
                    .tool_response
                    .get("success")
                    .and_then(Value::as_bool)
                    .is_some_and(|ok| !ok);
                let mut entries = vec![ParsedEntry::new(
                    LogCategory::ToolUsePost,
                    json!({
                        "tool": tool,
                        "is_error": failed,
                        "content": clip(&result_text(&hook.tool_response)),
                    }),
                )];
                if !failed && let Some(change) = file_change(&tool, &hook.tool_input) {
                    entries.push(change);
                }
                entries
            }
            other => vec![ParsedEntry::new(
                LogCategory::Status,
                json!({ "event": "hook", "hook": other, "session_id": hook.session_id }),
            )],
        }
    }
}

fn tool_pre(name: &str, input: &Value, id: Option<&str>) -> ParsedEntry {
    ParsedEntry::new(
        LogCategory::ToolUsePre,
        json!({
            "tool": name,
            "id": id,
            "summary": describe_tool_use(name, input),
            "input": input,
        }),
    )
}

fn file_change(tool: &str, input: &Value) -> Option<ParsedEntry> {
    if !FILE_EDITING_TOOLS.contains(&tool) {
        return None;
    }
    let path = input
        .get("file_path")
        .or_else(|| input.get("notebook_path"))
        .and_then(Value::as_str)?;
    Some(ParsedEntry::new(
        LogCategory::FileChanged,
        json!({ "tool": tool, "path": path }),
    ))
}

fn result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn clip(s: &str) -> String {
    if s.len() <= MAX_RESULT_CHARS {
        s.to_string()
    } else {
        format!("{}...", &s[..s.floor_char_boundary(MAX_RESULT_CHARS)])
    }
}

/// Human-readable one-liner for a tool invocation.
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let path = || {
        input
            .get("file_path")
            .or_else(|| input.get("notebook_path"))
            .and_then(Value::as_str)
            .map(shorten_path)
            .unwrap_or_else(|| "file".to_string())
    };
    match name {
        "Read" => format!("Reading: {}", path()),
        "Write" => format!("Creating: {}", path()),
        "Edit" | "MultiEdit" | "NotebookEdit" => format!("Editing: {}", path()),
        "Bash" => {
            let cmd = input
                .get("command")
                .and_then(Value::as_str)
                .map(|s| truncate_str(s, 40))
                .unwrap_or_else(|| "command".to_string());
            format!("Running: {}", cmd)
        }
        "Glob" => {
            let pattern = input.get("pattern").and_then(Value::as_str).unwrap_or("*");
            format!("Searching: {}", pattern)
        }
        "Grep" => {
            let pattern = input
                .get("pattern")
                .and_then(Value::as_str)
                .map(|s| truncate_str(s, 30))
                .unwrap_or_else(|| "pattern".to_string());
            format!("Grep: {}", pattern)
        }
        "Task" => {
            let desc = input
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("subagent");
            format!("Agent: {}", desc)
        }
        _ => name.to_string(),
    }
}

/// Last two path components.
fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() <= 2 {
        path.to_string()
    } else {
        parts[parts.len() - 2..].join("/")
    }
}

fn truncate_str(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..s.floor_char_boundary(max_len - 3)])
    }
}
