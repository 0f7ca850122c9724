use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::TokenUsage;

/// Discrete event of a generation session, in the order it was produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum StreamFrame {
    TextDelta {
        delta: String,
    },
    ToolCallStart {
        call_id: String,
        tool_name: String,
    },
    ToolCallArgs {
        call_id: String,
        args_delta: String,
    },
    ToolResult {
        call_id: String,
        tool_name: String,
        output: Value,
        #[serde(default)]
        is_error: bool,
    },
    StepFinish {
        finish_reason: String,
        is_continued: bool,
    },
    MessageFinish {
        finish_reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },
    /// Terminates a stream that already reached the client.
    Error {
        code: String,
        message: String,
    },
}

impl StreamFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamFrame::TextDelta { .. } => "text_delta",
            StreamFrame::ToolCallStart { .. } => "tool_call_start",
            StreamFrame::ToolCallArgs { .. } => "tool_call_args",
            StreamFrame::ToolResult { .. } => "tool_result",
            StreamFrame::StepFinish { .. } => "step_finish",
            StreamFrame::MessageFinish { .. } => "message_finish",
            StreamFrame::Error { .. } => "error",
        }
    }

    /// Non-empty assistant text carried by this frame, if any.
    pub fn text_payload(&self) -> Option<&str> {
        match self {
            StreamFrame::TextDelta { delta } if !delta.is_empty() => Some(delta.as_str()),
            _ => None,
        }
    }
}
