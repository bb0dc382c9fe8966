//! Structured-output extraction from free-form model text (C1).
//!
//! Two pure functions, no exceptions escape: [`extract_json`] recovers a
//! JSON value from noisy text via a fallback chain; [`parse_tool_call`]
//! recovers a tool-call directive from the `<tool_code>` XML wire format
//! using outermost-delimiter slicing rather than regex, so that content
//! embedding tag-shaped substrings survives verbatim (§9's pinned fix for
//! the greedy/non-greedy mis-slicing bug).

use serde_json::Value;

/// Try, in order: a ```json fenced block, any fenced block, the outermost
/// `{...}` span, the outermost `[...]` span. Returns `None` if nothing
/// parses — never panics, never propagates a parse error.
pub fn extract_json(text: &str) -> Option<Value> {
    let text = text.trim();

    if let Some(v) = try_fenced(text, Some("json")) {
        return Some(v);
    }
    if let Some(v) = try_fenced(text, None) {
        return Some(v);
    }
    if let Some(v) = try_span(text, '{', '}') {
        return Some(v);
    }
    try_span(text, '[', ']')
}

fn try_fenced(text: &str, lang: Option<&str>) -> Option<Value> {
    let fence = "```";
    let mut search_from = 0;
    while let Some(rel_start) = text[search_from..].find(fence) {
        let start = search_from + rel_start + fence.len();
        let after_fence = &text[start..];

        let body_start = if let Some(lang) = lang {
            let trimmed = after_fence.trim_start();
            if !trimmed.to_ascii_lowercase().starts_with(lang) {
                search_from = start;
                continue;
            }
            let consumed = after_fence.len() - trimmed.len() + lang.len();
            start + consumed
        } else {
            start
        };

        let Some(rel_end) = text[body_start..].find(fence) else {
            return None;
        };
        let body = text[body_start..body_start + rel_end].trim();
        if let Ok(v) = serde_json::from_str(body) {
            return Some(v);
        }
        search_from = body_start + rel_end + fence.len();
    }
    None
}

fn try_span(text: &str, open: char, close: char) -> Option<Value> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

/// A parsed `<tool_code>` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub tool: String,
    pub params: ToolParams,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolParams {
    WriteToFile { path: String, content: String },
    ApplyDiff { path: String, search_block: String, replace_block: String },
    ExecuteCommand { command: String },
}

/// Find the first `<tool_code>` element, locate `tool_name` and
/// `parameters` within it, and extract the shape for the recognised tool.
/// Returns `None` on malformed structure or missing required parameters.
pub fn parse_tool_call(text: &str) -> Option<ToolCall> {
    let inner = extract_tag_content(text, "tool_code")?;
    let tool_name = extract_tag_content(&inner, "tool_name")?.trim().to_string();
    let params_xml = extract_tag_content(&inner, "parameters")?;

    let params = match tool_name.as_str() {
        "write_to_file" => {
            let path = extract_tag_content(&params_xml, "path")?.trim().to_string();
            let content = extract_tag_content(&params_xml, "content")?;
            ToolParams::WriteToFile { path, content }
        }
        "apply_diff" => {
            let path = extract_tag_content(&params_xml, "path")?.trim().to_string();
            let search_block = extract_tag_content(&params_xml, "search_block")?;
            let replace_block = extract_tag_content(&params_xml, "replace_block")?;
            ToolParams::ApplyDiff { path, search_block, replace_block }
        }
        "execute_command" => {
            let command = extract_tag_content(&params_xml, "command")?.trim().to_string();
            ToolParams::ExecuteCommand { command }
        }
        _ => return None,
    };

    Some(ToolCall { tool: tool_name, params })
}

/// Slice the content between the *first* opening and *last* closing
/// occurrence of `<tag>...</tag>` — never a greedy/non-greedy regex — so
/// that tag-shaped text nested inside the content (e.g. a `</content>`
/// lookalike inside generated source) is preserved verbatim. Strips
/// surrounding whitespace and an optional CDATA wrapper.
fn extract_tag_content(xml: &str, tag: &str) -> Option<String> {
    let open_tag = format!("<{tag}>");
    let close_tag = format!("</{tag}>");

    let start = find_ci(xml, &open_tag)?;
    let content_start = start + open_tag.len();
    let end = rfind_ci(xml, &close_tag)?;
    if end <= content_start {
        return None;
    }

    let mut content = xml[content_start..end].trim();
    if let Some(stripped) = content
        .strip_prefix("<![CDATA[")
        .and_then(|s| s.strip_suffix("]]>"))
    {
        content = stripped.trim();
    }
    Some(content.to_string())
}

fn find_ci(haystack: &str, needle: &str) -> Option<usize> {
    let haystack_lower = haystack.to_ascii_lowercase();
    let needle_lower = needle.to_ascii_lowercase();
    haystack_lower.find(&needle_lower)
}

fn rfind_ci(haystack: &str, needle: &str) -> Option<usize> {
    let haystack_lower = haystack.to_ascii_lowercase();
    let needle_lower = needle.to_ascii_lowercase();
    haystack_lower.rfind(&needle_lower)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_from_json_fence() {
        let text = "here you go:\n```json\n{\"a\": 1}\n```\nthanks";
        assert_eq!(extract_json(text).unwrap(), serde_json::json!({"a": 1}));
    }

    #[test]
    fn extract_json_from_generic_fence() {
        let text = "```\n[1, 2, 3]\n```";
        assert_eq!(extract_json(text).unwrap(), serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn extract_json_from_bare_braces() {
        let text = "sure, the result is {\"status\": \"approve\"} — done.";
        assert_eq!(extract_json(text).unwrap(), serde_json::json!({"status": "approve"}));
    }

    #[test]
    fn extract_json_from_bare_brackets() {
        let text = "plan: [\"step one\", \"step two\"]";
        assert_eq!(
            extract_json(text).unwrap(),
            serde_json::json!(["step one", "step two"])
        );
    }

    #[test]
    fn extract_json_prefers_object_over_array_fallback() {
        let text = "{\"a\": [1, 2]}";
        assert_eq!(extract_json(text).unwrap(), serde_json::json!({"a": [1, 2]}));
    }

    #[test]
    fn extract_json_returns_none_for_garbage() {
        assert!(extract_json("no json here at all").is_none());
    }

    #[test]
    fn extract_json_returns_none_without_panicking_on_malformed_fence() {
        assert!(extract_json("```json\n{not valid\n```").is_none());
    }

    #[test]
    fn parse_write_to_file_basic() {
        let text = r#"
<tool_code>
  <tool_name>write_to_file</tool_name>
  <parameters>
    <path>src/utils.py</path>
    <content>
      import os
      print("hi")
    </content>
  </parameters>
</tool_code>
"#;
        let call = parse_tool_call(text).unwrap();
        assert_eq!(call.tool, "write_to_file");
        match call.params {
            ToolParams::WriteToFile { path, content } => {
                assert_eq!(path, "src/utils.py");
                assert!(content.contains("import os"));
                assert!(content.contains("print(\"hi\")"));
            }
            _ => panic!("expected WriteToFile"),
        }
    }

    /// *Tool-call fidelity* (§8): content containing a substring that looks
    /// like a closing `</content>` tag must survive verbatim — proves the
    /// outermost-delimiter slicing, not a greedy/non-greedy regex.
    #[test]
    fn parse_write_to_file_preserves_embedded_closing_tag_lookalike() {
        let text = r#"<tool_code>
  <tool_name>write_to_file</tool_name>
  <parameters>
    <path>templates/page.html</path>
    <content>
<div>some text claiming to end with </content> right here</div>
    </content>
  </parameters>
</tool_code>"#;
        let call = parse_tool_call(text).unwrap();
        match call.params {
            ToolParams::WriteToFile { content, .. } => {
                assert!(content.contains("</content> right here"));
            }
            _ => panic!("expected WriteToFile"),
        }
    }

    #[test]
    fn parse_apply_diff() {
        let text = r#"<tool_code>
  <tool_name>apply_diff</tool_name>
  <parameters>
    <path>src/lib.rs</path>
    <search_block>fn old() -> i32 { 1 }</search_block>
    <replace_block>fn old() -> i32 { 2 }</replace_block>
  </parameters>
</tool_code>"#;
        let call = parse_tool_call(text).unwrap();
        match call.params {
            ToolParams::ApplyDiff { path, search_block, replace_block } => {
                assert_eq!(path, "src/lib.rs");
                assert!(search_block.contains("{ 1 }"));
                assert!(replace_block.contains("{ 2 }"));
            }
            _ => panic!("expected ApplyDiff"),
        }
    }

    #[test]
    fn parse_execute_command() {
        let text = "<tool_code><tool_name>execute_command</tool_name><parameters><command>npm install lodash</command></parameters></tool_code>";
        let call = parse_tool_call(text).unwrap();
        match call.params {
            ToolParams::ExecuteCommand { command } => assert_eq!(command, "npm install lodash"),
            _ => panic!("expected ExecuteCommand"),
        }
    }

    #[test]
    fn parse_tool_call_strips_cdata_wrapper() {
        let text = r#"<tool_code><tool_name>write_to_file</tool_name><parameters>
<path>x.py</path>
<content><![CDATA[print(1 < 2)]]></content>
</parameters></tool_code>"#;
        let call = parse_tool_call(text).unwrap();
        match call.params {
            ToolParams::WriteToFile { content, .. } => assert_eq!(content, "print(1 < 2)"),
            _ => panic!("expected WriteToFile"),
        }
    }

    #[test]
    fn parse_tool_call_finds_first_tool_code_in_surrounding_prose() {
        let text = "Sure, here's the plan.\n<tool_code>\n<tool_name>execute_command</tool_name>\n<parameters><command>ls</command></parameters>\n</tool_code>\nLet me know if that works.";
        let call = parse_tool_call(text).unwrap();
        assert_eq!(call.tool, "execute_command");
    }

    #[test]
    fn parse_tool_call_returns_none_without_tool_code_wrapper() {
        assert!(parse_tool_call("just some ```python\nprint(1)\n``` code").is_none());
    }

    #[test]
    fn parse_tool_call_returns_none_for_unrecognised_tool() {
        let text = "<tool_code><tool_name>delete_everything</tool_name><parameters><path>x</path></parameters></tool_code>";
        assert!(parse_tool_call(text).is_none());
    }

    #[test]
    fn parse_tool_call_returns_none_missing_required_param() {
        let text = "<tool_code><tool_name>write_to_file</tool_name><parameters><path>x.py</path></parameters></tool_code>";
        assert!(parse_tool_call(text).is_none());
    }
}
