// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Text-fallback tool-call parsing.
//!
//! Most providers emit tool calls as structured events (see
//! `agentrt_model::ResponseEvent::ToolCall`), but some open-weight models
//! served through a bare-bones completions endpoint write them inline as
//! text instead. This module recognizes the two conventions a model is
//! likely to use and turns them back into the same [`crate::ToolCall`] shape
//! the structured path produces, so the rest of the loop never needs to
//! know which path a given call came from.

use serde_json::Value;

use crate::tool::ToolCall;

/// One tool call recovered from free-form assistant text, plus the byte
/// range in the original string it was extracted from (so callers can
/// splice the residual text back together without re-scanning).
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    /// Synthesized by append order (`tc_0`, `tc_1`, ...) since the inline
    /// text conventions this module recognizes carry no id of their own.
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// Recognizes two inline conventions:
///
/// ```text
/// [TOOL_CALL] read_file({"path": "src/main.rs"}) [/TOOL_CALL]
/// ```
///
/// and a fenced code block:
///
/// ````text
/// ```tool_call
/// {"name": "read_file", "arguments": {"path": "src/main.rs"}}
/// ```
/// ````
///
/// Returns the residual text (with every recognized call stripped out) and
/// the list of calls found, in order of appearance. Text that merely looks
/// similar but fails to parse as valid JSON is left untouched in the
/// residual text rather than silently dropped.
pub fn parse_tool_calls_from_text(text: &str) -> (String, Vec<ParsedToolCall>) {
    let mut calls = Vec::new();
    let mut residual = String::with_capacity(text.len());
    let mut rest = text;

    loop {
        let bracket = rest.find("[TOOL_CALL]");
        let fence = rest.find("```tool_call");
        let next = match (bracket, fence) {
            (Some(b), Some(f)) => Some(b.min(f)),
            (Some(b), None) => Some(b),
            (None, Some(f)) => Some(f),
            (None, None) => None,
        };
        let Some(start) = next else {
            residual.push_str(rest);
            break;
        };

        if Some(start) == bracket {
            match parse_bracket_call(&rest[start..]) {
                Some((call, consumed)) => {
                    residual.push_str(&rest[..start]);
                    calls.push(call);
                    rest = &rest[start + consumed..];
                    continue;
                }
                None => {
                    // Not well-formed; keep the literal tag and move past it
                    // so we don't loop forever re-matching the same prefix.
                    residual.push_str(&rest[..start + "[TOOL_CALL]".len()]);
                    rest = &rest[start + "[TOOL_CALL]".len()..];
                    continue;
                }
            }
        } else {
            match parse_fenced_call(&rest[start..]) {
                Some((call, consumed)) => {
                    residual.push_str(&rest[..start]);
                    calls.push(call);
                    rest = &rest[start + consumed..];
                    continue;
                }
                None => {
                    residual.push_str(&rest[..start + "```tool_call".len()]);
                    rest = &rest[start + "```tool_call".len()..];
                    continue;
                }
            }
        }
    }

    for (i, call) in calls.iter_mut().enumerate() {
        call.id = format!("tc_{i}");
    }

    (residual.trim().to_string(), calls)
}

fn parse_bracket_call(s: &str) -> Option<(ParsedToolCall, usize)> {
    let end_tag = "[/TOOL_CALL]";
    let prefix = "[TOOL_CALL]";
    debug_assert!(s.starts_with(prefix));
    let end = s.find(end_tag)?;
    let inner = s[prefix.len()..end].trim();

    let paren_open = inner.find('(')?;
    let name = inner[..paren_open].trim().to_string();
    if name.is_empty() {
        return None;
    }
    let args_str = inner[paren_open + 1..].trim_end();
    let args_str = args_str.strip_suffix(')')?.trim();
    let args: Value = if args_str.is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_str(args_str).ok()?
    };

    Some((ParsedToolCall { id: String::new(), name, args }, end + end_tag.len()))
}

fn parse_fenced_call(s: &str) -> Option<(ParsedToolCall, usize)> {
    let prefix = "```tool_call";
    debug_assert!(s.starts_with(prefix));
    let body_start = s[prefix.len()..].find('\n')? + prefix.len() + 1;
    let close = s[body_start..].find("```")?;
    let body = s[body_start..body_start + close].trim();

    let value: Value = serde_json::from_str(body).ok()?;
    let name = value.get("name")?.as_str()?.to_string();
    let args = value.get("arguments").cloned().unwrap_or(Value::Object(Default::default()));

    Some((ParsedToolCall { id: String::new(), name, args }, body_start + close + 3))
}

/// Render a tool call back into the fenced-block text form, the inverse of
/// [`parse_tool_calls_from_text`]'s fenced-block recognition. Used by
/// providers that need to replay a structured call as inline text (e.g. when
/// constructing a synthetic assistant turn for a transcript export).
pub fn render_tool_call(call: &ToolCall) -> String {
    let payload = serde_json::json!({ "name": call.name, "arguments": call.args });
    format!("```tool_call\n{}\n```", payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_bracket_style_call() {
        let text = r#"Let me check that file. [TOOL_CALL] read_file({"path": "src/main.rs"}) [/TOOL_CALL]"#;
        let (residual, calls) = parse_tool_calls_from_text(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].args, json!({"path": "src/main.rs"}));
        assert_eq!(residual, "Let me check that file.");
    }

    #[test]
    fn parses_fenced_style_call() {
        let text = "Checking.\n```tool_call\n{\"name\": \"grep\", \"arguments\": {\"pattern\": \"foo\"}}\n```\nDone.";
        let (residual, calls) = parse_tool_calls_from_text(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "grep");
        assert_eq!(calls[0].args, json!({"pattern": "foo"}));
        assert!(residual.contains("Checking."));
        assert!(residual.contains("Done."));
    }

    #[test]
    fn parses_multiple_calls_in_order() {
        let text = "[TOOL_CALL] a({}) [/TOOL_CALL] middle [TOOL_CALL] b({}) [/TOOL_CALL]";
        let (residual, calls) = parse_tool_calls_from_text(text);
        assert_eq!(calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(residual, "middle");
    }

    #[test]
    fn no_calls_returns_text_unchanged() {
        let text = "just a normal response, no tools here";
        let (residual, calls) = parse_tool_calls_from_text(text);
        assert!(calls.is_empty());
        assert_eq!(residual, text);
    }

    #[test]
    fn call_with_no_arguments() {
        let text = "[TOOL_CALL] list_dir() [/TOOL_CALL]";
        let (_, calls) = parse_tool_calls_from_text(text);
        assert_eq!(calls[0].args, json!({}));
    }

    #[test]
    fn malformed_json_args_is_left_in_residual() {
        let text = "[TOOL_CALL] read_file({not valid json}) [/TOOL_CALL]";
        let (residual, calls) = parse_tool_calls_from_text(text);
        assert!(calls.is_empty());
        assert!(residual.contains("[TOOL_CALL]"));
    }

    #[test]
    fn render_then_parse_round_trips() {
        let call = ToolCall { id: "tc_0".into(), name: "read_file".into(), args: json!({"path": "a.rs"}) };
        let rendered = render_tool_call(&call);
        let (_, parsed) = parse_tool_calls_from_text(&rendered);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].name, call.name);
        assert_eq!(parsed[0].args, call.args);
        assert_eq!(parsed[0].id, call.id);
    }

    #[test]
    fn ids_are_synthesized_by_append_order() {
        let text = "[TOOL_CALL] a({}) [/TOOL_CALL] middle [TOOL_CALL] b({}) [/TOOL_CALL]";
        let (_, calls) = parse_tool_calls_from_text(text);
        assert_eq!(calls[0].id, "tc_0");
        assert_eq!(calls[1].id, "tc_1");
    }
}
