use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use tally_observability::{ObservabilityEvent, ProcessKind};
use tally_providers::{
    provider_error_code, ChatMessage, ChatToolCall, ChunkStream, Provider, StreamChunk,
};
use tally_tools::{validate_tool_schemas, ToolContext, ToolExecutor, ToolSchemaValidationError};
use tally_types::{StreamFrame, TokenUsage, ToolSchema};

use crate::backend::{next_chunk, open_stream, ObsScope, StreamInterrupt};
use crate::relay::{FrameRelay, RelayClosed};

#[derive(Debug, Error)]
pub enum PrimaryFault {
    #[error(transparent)]
    ToolSchema(#[from] ToolSchemaValidationError),
    #[error("backend request failed: {0}")]
    Backend(anyhow::Error),
    #[error("backend stream ended before producing any output")]
    EmptyStream,
    #[error("generation deadline exceeded")]
    DeadlineExceeded,
    #[error("generation cancelled")]
    Cancelled,
    #[error("client disconnected")]
    Disconnected,
}

impl PrimaryFault {
    pub fn code(&self) -> &'static str {
        match self {
            PrimaryFault::ToolSchema(_) => "TOOL_SCHEMA_INVALID",
            PrimaryFault::Backend(err) => provider_error_code(&err.to_string()),
            PrimaryFault::EmptyStream => "PROVIDER_EMPTY_STREAM",
            PrimaryFault::DeadlineExceeded => "DEADLINE_EXCEEDED",
            PrimaryFault::Cancelled => "CANCELLED",
            PrimaryFault::Disconnected => "CLIENT_DISCONNECTED",
        }
    }
}

impl From<RelayClosed> for PrimaryFault {
    fn from(_: RelayClosed) -> Self {
        PrimaryFault::Disconnected
    }
}

impl From<StreamInterrupt> for PrimaryFault {
    fn from(value: StreamInterrupt) -> Self {
        match value {
            StreamInterrupt::Backend(err) => PrimaryFault::Backend(err),
            StreamInterrupt::Cancelled => PrimaryFault::Cancelled,
        }
    }
}

/// One executed tool call and the output the model saw for it.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolStep {
    pub round: usize,
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub output: Value,
    pub is_error: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PrimaryOutcome {
    /// Step trace in execution order.
    pub steps: Vec<ToolStep>,
    pub text: String,
    pub finish_reason: String,
    pub usage: Option<TokenUsage>,
    /// Frames relayed by this session, in delivery order.
    pub frames: Vec<StreamFrame>,
    pub rounds: usize,
}

pub struct PrimaryRequest {
    pub provider: Arc<dyn Provider>,
    pub model: Option<String>,
    pub tools: Arc<dyn ToolExecutor>,
    pub tool_ctx: ToolContext,
    pub history: Vec<ChatMessage>,
    pub max_steps: usize,
    pub message_id: String,
    pub process: ProcessKind,
}

#[derive(Debug, Default)]
struct PendingCall {
    id: String,
    name: String,
    args: String,
}

impl PendingCall {
    fn arguments_text(&self) -> String {
        if self.args.trim().is_empty() {
            "{}".to_string()
        } else {
            self.args.clone()
        }
    }
}

#[derive(Debug, Default)]
struct StepAccumulator {
    text: String,
    calls: Vec<PendingCall>,
    finish_reason: Option<String>,
}

impl StepAccumulator {
    fn call_mut(&mut self, id: &str) -> &mut PendingCall {
        if let Some(pos) = self.calls.iter().position(|c| c.id == id) {
            return &mut self.calls[pos];
        }
        self.calls.push(PendingCall {
            id: id.to_string(),
            ..PendingCall::default()
        });
        let last = self.calls.len() - 1;
        &mut self.calls[last]
    }
}

/// The tool-enabled generation: one backend stream per round, tool calls
/// executed between rounds, every frame relayed as it arrives.
pub struct PrimarySession {
    provider: Arc<dyn Provider>,
    model: Option<String>,
    tools: Arc<dyn ToolExecutor>,
    tool_ctx: ToolContext,
    schemas: Vec<ToolSchema>,
    history: Vec<ChatMessage>,
    max_steps: usize,
    stream: ChunkStream,
    first: StreamChunk,
    obs: ObsScope,
    started_at: Instant,
}

impl PrimarySession {
    /// Opens the first backend stream and waits for its first chunk, so a
    /// backend that fails before producing output is reported here rather
    /// than after the response has started.
    pub async fn open(request: PrimaryRequest) -> Result<Self, PrimaryFault> {
        let PrimaryRequest {
            provider,
            model,
            tools,
            tool_ctx,
            history,
            max_steps,
            message_id,
            process,
        } = request;
        let obs = ObsScope {
            process,
            component: "chat.primary",
            message_id,
            provider_id: provider.info().id,
            model_id: model.clone(),
        };
        let started_at = Instant::now();
        let schemas = tools.schemas();
        if let Err(err) = validate_tool_schemas(&schemas) {
            let detail = err.to_string();
            obs.emit(
                Level::ERROR,
                ObservabilityEvent {
                    status: Some("failed"),
                    error_code: Some("TOOL_SCHEMA_INVALID"),
                    detail: Some(&detail),
                    ..obs.event("provider.call.error")
                },
            );
            return Err(err.into());
        }
        obs.emit(
            Level::INFO,
            ObservabilityEvent {
                status: Some("start"),
                ..obs.event("provider.call.start")
            },
        );

        let cancel = tool_ctx.cancel.clone();
        let opened = async {
            let mut stream = open_stream(
                provider.as_ref(),
                model.as_deref(),
                &history,
                Some(schemas.clone()),
                &cancel,
            )
            .await?;
            let first = next_chunk(&mut stream, &cancel).await?;
            Ok::<_, StreamInterrupt>((stream, first))
        }
        .await;
        let (stream, first) = match opened {
            Ok((stream, Some(first))) => (stream, first),
            Ok((_, None)) => {
                let fault = PrimaryFault::EmptyStream;
                report_fault(&obs, &fault);
                return Err(fault);
            }
            Err(interrupt) => {
                let fault = PrimaryFault::from(interrupt);
                report_fault(&obs, &fault);
                return Err(fault);
            }
        };
        obs.emit(
            Level::INFO,
            ObservabilityEvent {
                status: Some("streaming"),
                elapsed_ms: Some(started_at.elapsed().as_millis() as u64),
                ..obs.event("provider.call.first_byte")
            },
        );

        Ok(Self {
            provider,
            model,
            tools,
            tool_ctx,
            schemas,
            history,
            max_steps: max_steps.max(1),
            stream,
            first,
            obs,
            started_at,
        })
    }

    pub fn provider_id(&self) -> &str {
        &self.obs.provider_id
    }

    /// Drives the agent loop to completion. Frames reach the relay in the
    /// order the backend produced them; a round's tool results follow its
    /// last backend frame in call order.
    pub async fn run(
        self,
        relay: &mut FrameRelay,
        cancel: &CancellationToken,
    ) -> Result<PrimaryOutcome, PrimaryFault> {
        let obs = self.obs.clone();
        let started_at = self.started_at;
        let result = self.run_rounds(relay, cancel).await;
        match &result {
            Ok(outcome) => obs.emit(
                Level::INFO,
                ObservabilityEvent {
                    status: Some("completed"),
                    detail: Some(&outcome.finish_reason),
                    elapsed_ms: Some(started_at.elapsed().as_millis() as u64),
                    ..obs.event("provider.call.finish")
                },
            ),
            Err(fault) => report_fault(&obs, fault),
        }
        result
    }

    async fn run_rounds(
        self,
        relay: &mut FrameRelay,
        cancel: &CancellationToken,
    ) -> Result<PrimaryOutcome, PrimaryFault> {
        let PrimarySession {
            provider,
            model,
            tools,
            tool_ctx,
            schemas,
            mut history,
            max_steps,
            mut stream,
            first,
            obs,
            ..
        } = self;
        let frames_before = relay.frames_sent();
        let mut outcome = PrimaryOutcome::default();
        let mut pending = Some(first);

        loop {
            outcome.rounds += 1;
            let mut step = StepAccumulator::default();
            loop {
                let chunk = match pending.take() {
                    Some(chunk) => Some(chunk),
                    None => next_chunk(&mut stream, cancel).await?,
                };
                let Some(chunk) = chunk else {
                    break;
                };
                match chunk {
                    StreamChunk::TextDelta(delta) => {
                        if delta.is_empty() {
                            continue;
                        }
                        step.text.push_str(&delta);
                        relay.forward(&StreamFrame::TextDelta { delta }).await?;
                    }
                    StreamChunk::ToolCallStart { id, name } => {
                        let call = step.call_mut(&id);
                        if call.name.is_empty() {
                            call.name = name.clone();
                        }
                        relay
                            .forward(&StreamFrame::ToolCallStart {
                                call_id: id,
                                tool_name: name,
                            })
                            .await?;
                    }
                    StreamChunk::ToolCallDelta { id, args_delta } => {
                        step.call_mut(&id).args.push_str(&args_delta);
                        relay
                            .forward(&StreamFrame::ToolCallArgs {
                                call_id: id,
                                args_delta,
                            })
                            .await?;
                    }
                    StreamChunk::ToolCallEnd { .. } => {}
                    StreamChunk::Done {
                        finish_reason,
                        usage,
                    } => {
                        step.finish_reason = Some(finish_reason);
                        if let Some(usage) = usage {
                            outcome
                                .usage
                                .get_or_insert_with(TokenUsage::default)
                                .accumulate(&usage);
                        }
                        break;
                    }
                }
            }

            let finish_reason = step
                .finish_reason
                .take()
                .unwrap_or_else(|| "stop".to_string());
            outcome.text.push_str(&step.text);

            if step.calls.is_empty() {
                relay
                    .forward(&StreamFrame::StepFinish {
                        finish_reason: finish_reason.clone(),
                        is_continued: false,
                    })
                    .await?;
                outcome.finish_reason = finish_reason;
                break;
            }

            let calls = std::mem::take(&mut step.calls);
            let arguments = calls
                .iter()
                .map(|call| parse_tool_args(&call.args))
                .collect::<Vec<_>>();
            let executions = calls
                .iter()
                .zip(arguments.iter())
                .map(|(call, args)| tools.execute(&call.name, args.clone(), &tool_ctx));
            let outputs = tokio::select! {
                _ = cancel.cancelled() => return Err(PrimaryFault::Cancelled),
                outputs = join_all(executions) => outputs,
            };

            let mut chat_calls = Vec::with_capacity(calls.len());
            let mut tool_messages = Vec::with_capacity(calls.len());
            for ((call, args), output) in calls.into_iter().zip(arguments).zip(outputs) {
                let error_kind = output.value.get("error").and_then(Value::as_str);
                obs.emit(
                    if output.is_error {
                        Level::WARN
                    } else {
                        Level::INFO
                    },
                    ObservabilityEvent {
                        tool: Some(&call.name),
                        status: Some(if output.is_error { "failed" } else { "ok" }),
                        error_code: if output.is_error { error_kind } else { None },
                        ..obs.event("tool.call.finish")
                    },
                );
                relay
                    .forward(&StreamFrame::ToolResult {
                        call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        output: output.value.clone(),
                        is_error: output.is_error,
                    })
                    .await?;
                chat_calls.push(ChatToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments_text(),
                });
                tool_messages.push(ChatMessage::tool_result(
                    call.id.clone(),
                    output.value.to_string(),
                ));
                outcome.steps.push(ToolStep {
                    round: outcome.rounds,
                    call_id: call.id,
                    tool_name: call.name,
                    arguments: args,
                    output: output.value,
                    is_error: output.is_error,
                });
            }
            history.push(ChatMessage::assistant(step.text, chat_calls));
            history.extend(tool_messages);

            let continued = outcome.rounds < max_steps;
            relay
                .forward(&StreamFrame::StepFinish {
                    finish_reason: finish_reason.clone(),
                    is_continued: continued,
                })
                .await?;
            if !continued {
                tracing::warn!(
                    message_id = %relay.message_id(),
                    rounds = outcome.rounds,
                    "agent loop stopped at step limit"
                );
                outcome.finish_reason = "max_steps".to_string();
                break;
            }
            stream = open_stream(
                provider.as_ref(),
                model.as_deref(),
                &history,
                Some(schemas.clone()),
                cancel,
            )
            .await?;
        }

        outcome.frames = relay.delivered()[frames_before..].to_vec();
        Ok(outcome)
    }
}

fn report_fault(obs: &ObsScope, fault: &PrimaryFault) {
    let level = match fault {
        PrimaryFault::Cancelled | PrimaryFault::Disconnected => Level::INFO,
        _ => Level::ERROR,
    };
    let detail = fault.to_string();
    obs.emit(
        level,
        ObservabilityEvent {
            status: Some("failed"),
            error_code: Some(fault.code()),
            detail: Some(&detail),
            ..obs.event("provider.call.error")
        },
    );
}

/// Streamed argument text as JSON. Text that is not JSON is passed through
/// as a string so argument validation can reject it with a readable error.
fn parse_tool_args(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return json!({});
    }
    serde_json::from_str::<Value>(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_args_parse_or_pass_through() {
        assert_eq!(parse_tool_args("  "), json!({}));
        assert_eq!(
            parse_tool_args(r#"{"invoiceId":"inv_1"}"#),
            json!({"invoiceId": "inv_1"})
        );
        assert_eq!(parse_tool_args("inv_1"), json!("inv_1"));
    }

    #[test]
    fn step_accumulator_keeps_first_seen_order() {
        let mut step = StepAccumulator::default();
        step.call_mut("b").name = "get_invoice".to_string();
        step.call_mut("a").args.push_str("{\"x\":");
        step.call_mut("b").args.push_str("{}");
        step.call_mut("a").args.push_str("1}");
        let ids = step.calls.iter().map(|c| c.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(step.calls[1].args, "{\"x\":1}");
        assert_eq!(PendingCall::default().arguments_text(), "{}");
    }

    #[test]
    fn fault_codes_are_stable() {
        assert_eq!(PrimaryFault::EmptyStream.code(), "PROVIDER_EMPTY_STREAM");
        assert_eq!(
            PrimaryFault::Backend(anyhow::anyhow!("429 too many requests")).code(),
            "RATE_LIMIT_EXCEEDED"
        );
        assert_eq!(PrimaryFault::from(RelayClosed).code(), "CLIENT_DISCONNECTED");
    }
}
