// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::Value;

use crate::events::{EventKind, ResultSubtype, SessionEvent};

/// Parse one stream-JSON line into typed events.
///
/// The parser is total: an unparseable or unrecognized line yields an empty
/// vec, never an error.  One assistant line may fan out into several events
/// (text + thinking + tool_use blocks in the same message).
pub fn parse_stream_events(line: &str, job_id: Option<&str>) -> Vec<SessionEvent> {
    let Ok(data) = serde_json::from_str::<Value>(line) else {
        return Vec::new();
    };

    let session_id = data
        .get("session_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    let job_id = job_id.map(str::to_string);
    let event = |kind| SessionEvent::new(kind, session_id.clone(), job_id.clone());

    let mut events = Vec::new();

    match data.get("type").and_then(Value::as_str) {
        Some("system") => {
            if data.get("subtype").and_then(Value::as_str) == Some("init") {
                events.push(event(EventKind::SystemInit {
                    tools: data
                        .get("tools")
                        .and_then(Value::as_array)
                        .map(|tools| {
                            tools
                                .iter()
                                .filter_map(Value::as_str)
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default(),
                    cwd: data.get("cwd").and_then(Value::as_str).map(str::to_string),
                }));
            }
        }

        Some("result") => {
            let subtype = match data.get("subtype").and_then(Value::as_str) {
                Some("error") => ResultSubtype::Error,
                _ => ResultSubtype::Success,
            };
            let usage = data.get("usage");
            let usage_u64 = |key: &str| {
                usage
                    .and_then(|u| u.get(key))
                    .and_then(Value::as_u64)
                    .unwrap_or(0)
            };
            events.push(event(EventKind::SystemResult {
                subtype,
                is_error: data.get("is_error").and_then(Value::as_bool).unwrap_or(false),
                error_message: data
                    .get("error_message")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                cost_usd: data.get("cost_usd").and_then(Value::as_f64),
                num_turns: data.get("num_turns").and_then(Value::as_u64).unwrap_or(0) as u32,
                duration_ms: data.get("duration_ms").and_then(Value::as_u64).unwrap_or(0),
                input_tokens: usage_u64("input_tokens"),
                output_tokens: usage_u64("output_tokens"),
            }));
        }

        Some("assistant") => {
            for content in message_content(&data) {
                match content.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        events.push(event(EventKind::Speech {
                            text: content
                                .get("text")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                        }));
                    }
                    Some("thinking") => {
                        events.push(event(EventKind::Thinking {
                            thinking: content
                                .get("thinking")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                        }));
                    }
                    Some("tool_use") => {
                        events.push(event(EventKind::ToolStart {
                            tool_name: content
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            tool_use_id: content
                                .get("id")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            tool_input: content.get("input").cloned().unwrap_or(Value::Null),
                        }));
                    }
                    _ => {}
                }
            }
        }

        Some("user") => {
            for content in message_content(&data) {
                if content.get("type").and_then(Value::as_str) == Some("tool_result") {
                    events.push(event(EventKind::ToolResult {
                        tool_use_id: content
                            .get("tool_use_id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        // Name is attached later by matching against the
                        // earlier tool_use id.
                        tool_name: String::new(),
                        result: result_text(content.get("content")),
                        is_error: content
                            .get("is_error")
                            .and_then(Value::as_bool)
                            .unwrap_or(false),
                    }));
                }
            }
        }

        _ => {}
    }

    events
}

fn message_content(data: &Value) -> impl Iterator<Item = &Value> {
    data.get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .map(|c| c.iter())
        .into_iter()
        .flatten()
}

/// Tool-result content may be a plain string or a list of content blocks;
/// both flatten to the concatenated text.
fn result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

// ── Control side channel ──────────────────────────────────────────────────────

/// A privileged-action request emitted by the assistant as a control line.
/// Control traffic is not part of the six event families; the event parser
/// ignores it and the runner handles it on a side channel.
#[derive(Debug, Clone)]
pub struct ControlRequest {
    pub subtype: String,
    pub tool_name: String,
    pub input: Value,
    pub description: Option<String>,
}

/// Recognise a `control_request` line.  Returns `None` for anything else,
/// including malformed control lines (the runner then treats the line as
/// ordinary stream output).
pub fn parse_control_request(line: &str) -> Option<ControlRequest> {
    let data: Value = serde_json::from_str(line).ok()?;
    if data.get("type")?.as_str()? != "control_request" {
        return None;
    }
    let request = data.get("request")?;
    Some(ControlRequest {
        subtype: request.get("subtype")?.as_str()?.to_string(),
        tool_name: request
            .get("tool_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        input: request.get("input").cloned().unwrap_or(Value::Null),
        description: request
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// The reply line written to the child's stdin for a control request.
pub fn control_response(allow: bool) -> String {
    let behavior = if allow { "allow" } else { "deny" };
    serde_json::json!({
        "type": "control_response",
        "response": { "behavior": behavior },
    })
    .to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
