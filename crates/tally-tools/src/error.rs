use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("record API rejected the credential (status {status})")]
    Unauthorized { status: u16 },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("record API rejected the request (status {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("record API failed (status {status}): {message}")]
    Upstream { status: u16, message: String },
    #[error("record API unavailable: {0}")]
    Unavailable(String),
    #[error("invalid response from record API: {0}")]
    InvalidResponse(String),
    #[error("tool call cancelled")]
    Cancelled,
}

impl ToolError {
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::InvalidArguments(_) => "invalid_arguments",
            ToolError::UnknownTool(_) => "unknown_tool",
            ToolError::Unauthorized { .. } => "unauthorized",
            ToolError::NotFound(_) => "not_found",
            ToolError::Rejected { .. } => "rejected",
            ToolError::Upstream { .. } => "upstream_error",
            ToolError::Unavailable(_) => "unavailable",
            ToolError::InvalidResponse(_) => "invalid_response",
            ToolError::Cancelled => "cancelled",
        }
    }

    /// Maps a non-success record API status onto the catalog's error kinds.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => ToolError::Unauthorized { status },
            404 => ToolError::NotFound(message),
            400..=499 => ToolError::Rejected { status, message },
            _ => ToolError::Upstream { status, message },
        }
    }

    pub fn to_output(&self) -> Value {
        json!({
            "error": self.kind(),
            "message": self.to_string(),
        })
    }
}
