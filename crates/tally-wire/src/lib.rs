use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use tally_types::StreamFrame;

/// Field that precedes a tool's output payload in an encoded `tool_result` frame.
pub const TOOL_OUTPUT_MARKER: &str = "\"output\":";

/// One outward stream event: a frame tagged with the assistant message it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireFrame {
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(flatten)]
    pub frame: StreamFrame,
}

#[derive(Serialize)]
struct WireFrameRef<'a> {
    #[serde(rename = "messageId")]
    message_id: &'a str,
    #[serde(flatten)]
    frame: &'a StreamFrame,
}

/// Encodes a frame exactly as it is sent to the client.
pub fn encode_frame(message_id: &str, frame: &StreamFrame) -> serde_json::Result<String> {
    serde_json::to_string(&WireFrameRef { message_id, frame })
}

/// Decodes one event payload. Unrecognized frame types are rejected.
pub fn decode_frame(payload: &str) -> Option<WireFrame> {
    serde_json::from_str::<WireFrame>(payload.trim()).ok()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireErrorBody {
    pub error: WireError,
}

impl WireErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: WireError {
                code: code.into(),
                message: message.into(),
            },
        }
    }

    pub fn to_value(&self) -> Value {
        json!({ "error": { "code": self.error.code, "message": self.error.message } })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_frames_carry_message_id_and_type() {
        let payload = encode_frame(
            "msg_1",
            &StreamFrame::TextDelta {
                delta: "Hello".to_string(),
            },
        )
        .expect("encode");
        assert_eq!(
            payload,
            r#"{"messageId":"msg_1","type":"text_delta","delta":"Hello"}"#
        );
        let decoded = decode_frame(&payload).expect("decode");
        assert_eq!(decoded.message_id, "msg_1");
        assert_eq!(decoded.frame.text_payload(), Some("Hello"));
    }

    #[test]
    fn tool_result_payload_contains_output_marker() {
        let payload = encode_frame(
            "msg_1",
            &StreamFrame::ToolResult {
                call_id: "c1".to_string(),
                tool_name: "get_invoice".to_string(),
                output: json!({"a": 1}),
                is_error: false,
            },
        )
        .expect("encode");
        let idx = payload.find(TOOL_OUTPUT_MARKER).expect("marker");
        assert!(payload[idx + TOOL_OUTPUT_MARKER.len()..].starts_with("{\"a\":1}"));
    }

    #[test]
    fn decode_rejects_unknown_frame_types() {
        assert!(decode_frame(r#"{"messageId":"m","type":"reasoning_delta","delta":"x"}"#).is_none());
        assert!(decode_frame("not json").is_none());
    }

    #[test]
    fn error_body_shape() {
        let body = WireErrorBody::new("PROVIDER_REQUEST_FAILED", "boom").to_value();
        assert_eq!(body["error"]["code"], "PROVIDER_REQUEST_FAILED");
        assert_eq!(body["error"]["message"], "boom");
    }
}
