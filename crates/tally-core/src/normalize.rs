use std::collections::HashSet;

use serde_json::{Map, Value};

use tally_providers::{ChatMessage, ChatToolCall};
use tally_types::{Part, Role, Turn};

const CALL_ID_KEYS: [&str; 3] = ["toolCallId", "callId", "id"];
const TOOL_NAME_KEYS: [&str; 2] = ["toolName", "name"];
const ARGS_KEYS: [&str; 3] = ["args", "arguments", "input"];
const OUTPUT_KEYS: [&str; 2] = ["output", "result"];

#[derive(Debug, Default)]
struct Discards {
    turns: usize,
    parts: usize,
}

/// Reduces loosely shaped client turns to the typed history. Malformed turns
/// and parts are dropped, never reported as errors.
pub fn normalize_turns(raw: &[Value]) -> Vec<Turn> {
    let mut issued: HashSet<String> = HashSet::new();
    let mut discards = Discards::default();
    let mut turns = Vec::with_capacity(raw.len());

    for message in raw {
        let Some(role) = message
            .get("role")
            .and_then(Value::as_str)
            .and_then(Role::parse)
        else {
            discards.turns += 1;
            continue;
        };
        let mut parts = Vec::new();
        for part in raw_parts(message) {
            let before = parts.len();
            normalize_part(&part, &mut issued, &mut parts);
            if parts.len() == before {
                discards.parts += 1;
            }
        }
        if parts.is_empty() {
            discards.turns += 1;
            continue;
        }
        turns.push(Turn::new(role, parts));
    }

    if discards.turns > 0 || discards.parts > 0 {
        tracing::debug!(
            dropped_turns = discards.turns,
            dropped_parts = discards.parts,
            kept_turns = turns.len(),
            "normalized conversation history"
        );
    }
    turns
}

fn raw_parts(message: &Value) -> Vec<Value> {
    if let Some(parts) = message.get("parts").and_then(Value::as_array) {
        return parts.clone();
    }
    match message.get("content") {
        Some(Value::Array(parts)) => parts.clone(),
        Some(Value::String(text)) => vec![serde_json::json!({"type": "text", "text": text})],
        _ => Vec::new(),
    }
}

fn normalize_part(part: &Value, issued: &mut HashSet<String>, out: &mut Vec<Part>) {
    let Some(kind) = part.get("type").and_then(Value::as_str) else {
        return;
    };
    match kind {
        "text" => {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                if !text.is_empty() {
                    out.push(Part::Text {
                        text: text.to_string(),
                    });
                }
            }
        }
        "tool-call" | "tool_call" => {
            if let Some(call) = tool_call(part) {
                issued.insert(call_id_of(&call));
                out.push(call);
            }
        }
        "tool-invocation" => {
            // Older clients nest the call, and possibly its result, under `toolInvocation`.
            let body = part
                .get("toolInvocation")
                .filter(|v| v.is_object())
                .unwrap_or(part);
            let Some(call) = tool_call(body) else {
                return;
            };
            let call_id = call_id_of(&call);
            let tool_name = match &call {
                Part::ToolCall { tool_name, .. } => Some(tool_name.clone()),
                _ => None,
            };
            issued.insert(call_id.clone());
            out.push(call);
            if let Some(output) = first_key(body, &OUTPUT_KEYS) {
                out.push(Part::ToolResult {
                    call_id,
                    tool_name,
                    output: output.clone(),
                });
            }
        }
        "tool-result" | "tool_result" => {
            let Some(call_id) = first_str(part, &CALL_ID_KEYS) else {
                return;
            };
            if !issued.contains(call_id) {
                return;
            }
            let Some(output) = first_key(part, &OUTPUT_KEYS) else {
                return;
            };
            out.push(Part::ToolResult {
                call_id: call_id.to_string(),
                tool_name: first_str(part, &TOOL_NAME_KEYS).map(str::to_string),
                output: output.clone(),
            });
        }
        _ => {}
    }
}

fn tool_call(body: &Value) -> Option<Part> {
    let call_id = first_str(body, &CALL_ID_KEYS)?;
    let tool_name = first_str(body, &TOOL_NAME_KEYS)?;
    let arguments = first_key(body, &ARGS_KEYS)?;
    Some(Part::ToolCall {
        call_id: call_id.to_string(),
        tool_name: tool_name.to_string(),
        arguments: parse_arguments(arguments),
    })
}

fn call_id_of(part: &Part) -> String {
    match part {
        Part::ToolCall { call_id, .. } | Part::ToolResult { call_id, .. } => call_id.clone(),
        Part::Text { .. } => String::new(),
    }
}

fn parse_arguments(raw: &Value) -> Value {
    match raw {
        Value::String(text) => {
            serde_json::from_str::<Value>(text).unwrap_or_else(|_| Value::String(text.clone()))
        }
        other => other.clone(),
    }
}

fn first_str<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| value.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
}

/// First key that is present, even when its value is `null`.
fn first_key<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    let obj: &Map<String, Value> = value.as_object()?;
    keys.iter().find_map(|k| obj.get(*k))
}

/// Converts typed turns into backend messages. Assistant tool calls ride on
/// the assistant message; their results follow as `tool` messages. Calls that
/// never got a result are left out, since backends reject an unpaired call.
pub fn to_chat_messages(system: Option<&str>, turns: &[Turn]) -> Vec<ChatMessage> {
    let answered = turns
        .iter()
        .flat_map(|turn| turn.parts.iter())
        .filter_map(|part| match part {
            Part::ToolResult { call_id, .. } => Some(call_id.as_str()),
            _ => None,
        })
        .collect::<HashSet<_>>();
    let mut messages = Vec::with_capacity(turns.len() + 1);
    if let Some(system) = system.map(str::trim).filter(|s| !s.is_empty()) {
        messages.push(ChatMessage::system(system));
    }
    for turn in turns {
        let text = turn.text();
        let mut calls = Vec::new();
        let mut results = Vec::new();
        for part in &turn.parts {
            match part {
                Part::ToolCall { call_id, .. } if !answered.contains(call_id.as_str()) => {}
                Part::ToolCall {
                    call_id,
                    tool_name,
                    arguments,
                } => calls.push(ChatToolCall {
                    id: call_id.clone(),
                    name: tool_name.clone(),
                    arguments: value_text(arguments),
                }),
                Part::ToolResult {
                    call_id, output, ..
                } => results.push(ChatMessage::tool_result(call_id.clone(), value_text(output))),
                Part::Text { .. } => {}
            }
        }
        match turn.role {
            Role::System if !text.is_empty() => messages.push(ChatMessage::system(text)),
            Role::User if !text.is_empty() => messages.push(ChatMessage::user(text)),
            Role::Assistant if !text.is_empty() || !calls.is_empty() => {
                messages.push(ChatMessage::assistant(text, calls))
            }
            _ => {}
        }
        messages.extend(results);
    }
    messages
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Joined text of the last user turn that carries any.
pub fn last_user_utterance(turns: &[Turn]) -> Option<String> {
    turns
        .iter()
        .rev()
        .filter(|turn| turn.role == Role::User)
        .map(Turn::text)
        .find(|text| !text.trim().is_empty())
}
