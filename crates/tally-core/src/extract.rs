use serde::Serialize;
use serde_json::{Map, Value};

use tally_wire::TOOL_OUTPUT_MARKER;

use crate::primary::ToolStep;

/// A tool result recovered for the follow-up. Only guaranteed to be a
/// complete JSON object; its fields are whatever the tool returned.
pub type ExtractedToolResult = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionSource {
    StepTrace,
    Buffer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub result: ExtractedToolResult,
    pub source: ExtractionSource,
}

/// The most recent tool output that is a non-empty object.
pub fn from_step_trace(steps: &[ToolStep]) -> Option<ExtractedToolResult> {
    steps
        .iter()
        .rev()
        .find_map(|step| step.output.as_object().filter(|obj| !obj.is_empty()).cloned())
}

/// Recovers the first tool output object from the relayed text. The object
/// must close before the text ends; a partial object yields `None`.
pub fn from_buffer(text: &str) -> Option<ExtractedToolResult> {
    let start = text.find(TOOL_OUTPUT_MARKER)? + TOOL_OUTPUT_MARKER.len();
    let body = text[start..].trim_start();
    if !body.starts_with('{') {
        return None;
    }
    let end = matching_brace(body)?;
    match serde_json::from_str::<Value>(&body[..=end]).ok()? {
        Value::Object(obj) => Some(obj),
        _ => None,
    }
}

/// Byte index of the `}` closing the object that opens at index 0. Braces
/// inside string literals do not count.
fn matching_brace(body: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, byte) in body.bytes().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// Step trace first; the buffer is only consulted when the trace has nothing.
pub fn extract(steps: &[ToolStep], buffer: &str) -> Option<Extraction> {
    if let Some(result) = from_step_trace(steps) {
        return Some(Extraction {
            result,
            source: ExtractionSource::StepTrace,
        });
    }
    from_buffer(buffer).map(|result| Extraction {
        result,
        source: ExtractionSource::Buffer,
    })
}
