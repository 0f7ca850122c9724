use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use tally_observability::ObservabilityEvent;
use tally_providers::{ChatMessage, Provider, StreamChunk};
use tally_types::{StreamFrame, TokenUsage};

use crate::backend::{next_chunk, open_stream, ObsScope, StreamInterrupt};
use crate::extract::ExtractedToolResult;
use crate::relay::{FrameRelay, RelayClosed};

const FOLLOW_UP_SYSTEM: &str = "You explain the result of an invoicing action to the user. \
Use only the values in the supplied result. Do not invent amounts, dates, numbers or statuses, \
and do not claim that something happened unless the result shows it.";

const FOLLOW_UP_INSTRUCTION: &str = "Answer the question using only these values.";

#[derive(Debug, Error)]
pub enum FollowUpFault {
    #[error("follow-up request failed: {0}")]
    Backend(anyhow::Error),
    #[error("follow-up produced no text")]
    Empty,
    #[error("follow-up cancelled")]
    Cancelled,
    #[error("client disconnected")]
    Disconnected,
}

impl FollowUpFault {
    pub fn kind(&self) -> &'static str {
        match self {
            FollowUpFault::Backend(_) => "backend",
            FollowUpFault::Empty => "empty",
            FollowUpFault::Cancelled => "cancelled",
            FollowUpFault::Disconnected => "disconnected",
        }
    }
}

impl From<RelayClosed> for FollowUpFault {
    fn from(_: RelayClosed) -> Self {
        FollowUpFault::Disconnected
    }
}

impl From<StreamInterrupt> for FollowUpFault {
    fn from(value: StreamInterrupt) -> Self {
        match value {
            StreamInterrupt::Backend(err) => FollowUpFault::Backend(err),
            StreamInterrupt::Cancelled => FollowUpFault::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FollowUpSummary {
    pub text: String,
    pub frames: usize,
    pub finish_reason: String,
    pub usage: Option<TokenUsage>,
}

/// The tool-less request: the user's question, the result verbatim, and an
/// instruction to stay within its values.
pub fn follow_up_messages(
    utterance: Option<&str>,
    result: &ExtractedToolResult,
) -> Vec<ChatMessage> {
    let result_json = serde_json::to_string(result).unwrap_or_else(|_| "{}".to_string());
    let question = utterance
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("Summarize this result for me.");
    vec![
        ChatMessage::system(FOLLOW_UP_SYSTEM),
        ChatMessage::user(format!(
            "Question: {question}\n\nResult:\n{result_json}\n\n{FOLLOW_UP_INSTRUCTION}"
        )),
    ]
}

/// Second, text-only generation that continues the primary message.
pub struct FollowUpSession {
    provider: Arc<dyn Provider>,
    model: Option<String>,
    obs: ObsScope,
}

impl FollowUpSession {
    pub(crate) fn new(provider: Arc<dyn Provider>, model: Option<String>, obs: ObsScope) -> Self {
        Self {
            provider,
            model,
            obs: obs.with_component("chat.followup"),
        }
    }

    /// Relays only text deltas, under the relay's message id.
    pub async fn run(
        &self,
        messages: Vec<ChatMessage>,
        relay: &mut FrameRelay,
        cancel: &CancellationToken,
    ) -> Result<FollowUpSummary, FollowUpFault> {
        self.obs.emit(
            Level::INFO,
            ObservabilityEvent {
                status: Some("start"),
                ..self.obs.event("chat.followup.start")
            },
        );
        let result = self.stream_text(messages, relay, cancel).await;
        match &result {
            Ok(summary) => {
                let chars = summary.text.chars().count().to_string();
                self.obs.emit(
                    Level::INFO,
                    ObservabilityEvent {
                        status: Some("delivered"),
                        detail: Some(&chars),
                        ..self.obs.event("chat.followup.finish")
                    },
                );
            }
            Err(fault) => {
                let detail = fault.to_string();
                self.obs.emit(
                    Level::WARN,
                    ObservabilityEvent {
                        status: Some("failed"),
                        error_code: Some(fault.kind()),
                        detail: Some(&detail),
                        ..self.obs.event("chat.followup.error")
                    },
                );
            }
        }
        result
    }

    async fn stream_text(
        &self,
        messages: Vec<ChatMessage>,
        relay: &mut FrameRelay,
        cancel: &CancellationToken,
    ) -> Result<FollowUpSummary, FollowUpFault> {
        let frames_before = relay.frames_sent();
        let mut stream = open_stream(
            self.provider.as_ref(),
            self.model.as_deref(),
            &messages,
            None,
            cancel,
        )
        .await?;
        let mut summary = FollowUpSummary::default();
        while let Some(chunk) = next_chunk(&mut stream, cancel).await? {
            match chunk {
                StreamChunk::TextDelta(delta) => {
                    if delta.is_empty() {
                        continue;
                    }
                    summary.text.push_str(&delta);
                    relay.forward(&StreamFrame::TextDelta { delta }).await?;
                }
                StreamChunk::Done {
                    finish_reason,
                    usage,
                } => {
                    summary.finish_reason = finish_reason;
                    summary.usage = usage;
                    break;
                }
                // Tools are disabled for this request; stray call chunks are not relayed.
                StreamChunk::ToolCallStart { .. }
                | StreamChunk::ToolCallDelta { .. }
                | StreamChunk::ToolCallEnd { .. } => {}
            }
        }
        if summary.text.trim().is_empty() {
            return Err(FollowUpFault::Empty);
        }
        if summary.finish_reason.is_empty() {
            summary.finish_reason = "stop".to_string();
        }
        summary.frames = relay.frames_sent() - frames_before;
        Ok(summary)
    }
}
