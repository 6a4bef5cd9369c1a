use std::path::Path;

use serde_json::{Map, Value};
use unicode_width::UnicodeWidthChar;

/// Key fragments whose values are never shown in tool previews.
const REDACT_KEYS: [&str; 6] = ["key", "token", "secret", "password", "auth", "cookie"];

/// Default display width for a tool preview.
pub const DEFAULT_PREVIEW_WIDTH: usize = 80;

/// How tool invocations are described in [`Event::Tool`](crate::event::Event::Tool).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolFormat {
    /// Include a preview of the tool input when the engine gives no title.
    pub include_input: bool,
    /// Maximum display width of the preview.
    pub max_width: usize,
}

impl Default for ToolFormat {
    fn default() -> Self {
        Self {
            include_input: false,
            max_width: DEFAULT_PREVIEW_WIDTH,
        }
    }
}

/// Describe a claude tool call, e.g. `[Bash: cargo test]` or `[Read: main.rs]`.
pub fn claude_tool_description(name: &str, input: &Value, format: ToolFormat) -> String {
    let detail = match name {
        "Read" | "Write" | "Edit" | "NotebookEdit" => get_str(input, "file_path")
            .or_else(|| get_str(input, "notebook_path"))
            .map(file_name)
            .unwrap_or_default()
            .to_string(),
        "Bash" => first_line(get_str(input, "command").unwrap_or_default()).to_string(),
        "Glob" => get_str(input, "pattern").unwrap_or_default().to_string(),
        "Grep" => {
            let pattern = get_str(input, "pattern").unwrap_or_default();
            match get_str(input, "path") {
                Some(path) if !path.is_empty() => format!("{pattern}  {path}"),
                _ => pattern.to_string(),
            }
        }
        "Task" => get_str(input, "description").unwrap_or_default().to_string(),
        "WebFetch" => get_str(input, "url").unwrap_or_default().to_string(),
        "WebSearch" => get_str(input, "query").unwrap_or_default().to_string(),
        _ if format.include_input => redacted_json(input),
        _ => String::new(),
    };
    let detail = truncate_width(first_line(&detail), format.max_width);
    if detail.is_empty() {
        format!("[{name}]")
    } else {
        format!("[{name}: {detail}]")
    }
}

/// Describe an OpenCode tool part, e.g. `[tool:bash Run tests]`.
///
/// The engine-supplied `state.title` wins; otherwise an input preview is used
/// when enabled.
pub fn opencode_tool_description(tool: &str, part: &Value, format: ToolFormat) -> String {
    let state = part.get("state");
    let title = state
        .and_then(|s| get_str(s, "title"))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    let preview = match title {
        Some(title) => Some(title.to_string()),
        None if format.include_input => state
            .and_then(|s| s.get("input"))
            .and_then(|input| input_preview(tool, input)),
        None => None,
    };
    match preview {
        Some(p) => format!(
            "[tool:{tool} {}]",
            truncate_width(first_line(&p), format.max_width)
        ),
        None => format!("[tool:{tool}]"),
    }
}

/// Short preview of an OpenCode tool input (lowercase tool names).
pub fn input_preview(tool: &str, input: &Value) -> Option<String> {
    if input.is_null() {
        return None;
    }
    match tool {
        "bash" => {
            if let Some(cmd) = get_str(input, "command").map(str::trim)
                && !cmd.is_empty()
            {
                return Some(cmd.to_string());
            }
        }
        "read" | "write" | "edit" => {
            if let Some(path) = get_str(input, "filePath").or_else(|| get_str(input, "file_path"))
                && !path.is_empty()
            {
                return Some(path.to_string());
            }
        }
        "grep" => {
            if let Some(pattern) = get_str(input, "pattern").filter(|p| !p.is_empty()) {
                let include = get_str(input, "include")
                    .filter(|i| !i.is_empty())
                    .map(|i| format!(" include='{i}'"))
                    .unwrap_or_default();
                return Some(format!("pattern='{pattern}'{include}"));
            }
        }
        _ => {}
    }
    Some(redacted_json(input))
}

/// Replace values under sensitive-looking keys with `[REDACTED]`, recursively.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let redacted: Map<String, Value> = map
                .iter()
                .map(|(k, v)| {
                    let lower = k.to_lowercase();
                    if REDACT_KEYS.iter().any(|rk| lower.contains(rk)) {
                        (k.clone(), Value::String("[REDACTED]".to_string()))
                    } else {
                        (k.clone(), redact(v))
                    }
                })
                .collect();
            Value::Object(redacted)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

fn redacted_json(input: &Value) -> String {
    // serde_json's default map is ordered, so keys come out sorted.
    redact(input).to_string()
}

/// Truncate to at most `max` display columns, marking the cut with `…`.
pub fn truncate_width(s: &str, max: usize) -> String {
    let total: usize = s.chars().map(|c| c.width().unwrap_or(0)).sum();
    if total <= max {
        return s.to_string();
    }
    let budget = max.saturating_sub(1);
    let mut width = 0;
    let mut out = String::new();
    for c in s.chars() {
        let w = c.width().unwrap_or(0);
        if width + w > budget {
            break;
        }
        width += w;
        out.push(c);
    }
    out.push('…');
    out
}

fn get_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn file_name(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}

/// Extract the first line of a string (no truncation).
pub(crate) fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn claude_bash_shows_first_line_of_command() {
        let input = json!({"command": "cargo test\necho done"});
        assert_eq!(
            claude_tool_description("Bash", &input, ToolFormat::default()),
            "[Bash: cargo test]"
        );
    }

    #[test]
    fn claude_file_tools_show_file_name() {
        let input = json!({"file_path": "/repo/src/main.rs"});
        assert_eq!(
            claude_tool_description("Edit", &input, ToolFormat::default()),
            "[Edit: main.rs]"
        );
    }

    #[test]
    fn claude_unknown_tool_hides_input_by_default() {
        let input = json!({"api_key": "sk-123"});
        assert_eq!(
            claude_tool_description("mcp__x__call", &input, ToolFormat::default()),
            "[mcp__x__call]"
        );
        let verbose = ToolFormat {
            include_input: true,
            ..Default::default()
        };
        assert_eq!(
            claude_tool_description("mcp__x__call", &input, verbose),
            r#"[mcp__x__call: {"api_key":"[REDACTED]"}]"#
        );
    }

    #[test]
    fn claude_long_command_is_truncated() {
        let input = json!({"command": "x".repeat(100)});
        let format = ToolFormat {
            max_width: 10,
            ..Default::default()
        };
        assert_eq!(
            claude_tool_description("Bash", &input, format),
            format!("[Bash: {}…]", "x".repeat(9))
        );
    }

    #[test]
    fn opencode_title_wins() {
        let part = json!({"tool": "bash", "state": {"title": "Run tests", "input": {"command": "make"}}});
        assert_eq!(
            opencode_tool_description("bash", &part, ToolFormat::default()),
            "[tool:bash Run tests]"
        );
    }

    #[test]
    fn opencode_without_title() {
        let part = json!({"tool": "read", "state": {"input": {"filePath": "/a/b.rs"}}});
        assert_eq!(
            opencode_tool_description("read", &part, ToolFormat::default()),
            "[tool:read]"
        );
        let verbose = ToolFormat {
            include_input: true,
            ..Default::default()
        };
        assert_eq!(
            opencode_tool_description("read", &part, verbose),
            "[tool:read /a/b.rs]"
        );
    }

    #[test]
    fn grep_preview_with_include() {
        let input = json!({"pattern": "fn main", "include": "*.rs"});
        assert_eq!(
            input_preview("grep", &input).unwrap(),
            "pattern='fn main' include='*.rs'"
        );
    }

    #[test]
    fn unknown_tool_preview_is_redacted_json() {
        let input = json!({"url": "https://x", "headers": {"Authorization": "Bearer t"}});
        insta::assert_snapshot!(
            input_preview("webfetch", &input).unwrap(),
            @r#"{"headers":{"Authorization":"[REDACTED]"},"url":"https://x"}"#
        );
    }

    #[test]
    fn redact_nested_arrays() {
        let value = json!([{"password": "p"}, {"name": "n"}]);
        assert_eq!(
            redact(&value),
            json!([{"password": "[REDACTED]"}, {"name": "n"}])
        );
    }

    #[test]
    fn truncate_respects_wide_chars() {
        assert_eq!(truncate_width("日本語テキスト", 5), "日本…");
        assert_eq!(truncate_width("short", 10), "short");
    }
}
