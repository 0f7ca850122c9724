#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use tally_core::{ChatOrchestrator, OrchestratorConfig};
use tally_observability::ProcessKind;
use tally_providers::{ChatMessage, ChunkStream, Provider, ProviderRegistry, StreamChunk};
use tally_tools::{ToolContext, ToolError, ToolExecutor, ToolOutput};
use tally_types::{ChatRequest, ModelInfo, ProviderInfo, StreamFrame, ToolSchema};
use tally_wire::decode_frame;

/// One backend request's worth of behaviour.
pub enum Round {
    Chunks(Vec<StreamChunk>),
    /// `stream()` itself fails.
    FailOpen(String),
    /// The chunks arrive, then the stream yields an error.
    FailAfter(Vec<StreamChunk>, String),
    /// The chunks arrive, then the stream never produces anything again.
    Stall(Vec<StreamChunk>),
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Option<Vec<ToolSchema>>,
}

pub struct ScriptedProvider {
    rounds: Mutex<VecDeque<Round>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedProvider {
    pub fn new(rounds: Vec<Round>) -> Arc<Self> {
        Arc::new(Self {
            rounds: Mutex::new(rounds.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "scripted".to_string(),
            name: "Scripted".to_string(),
            models: vec![ModelInfo {
                id: "scripted-1".to_string(),
                provider_id: "scripted".to_string(),
                display_name: "Scripted".to_string(),
                context_window: 8192,
            }],
        }
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        _model_override: Option<&str>,
        tools: Option<Vec<ToolSchema>>,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        self.requests
            .lock()
            .unwrap()
            .push(RecordedRequest { messages, tools });
        let round = self.rounds.lock().unwrap().pop_front();
        let Some(round) = round else {
            anyhow::bail!("script exhausted");
        };
        let stream: ChunkStream = match round {
            Round::Chunks(chunks) => Box::pin(futures::stream::iter(chunks.into_iter().map(Ok))),
            Round::FailOpen(message) => anyhow::bail!(message),
            Round::FailAfter(chunks, message) => Box::pin(
                futures::stream::iter(chunks.into_iter().map(Ok))
                    .chain(futures::stream::once(async move { Err(anyhow::anyhow!(message)) })),
            ),
            Round::Stall(chunks) => Box::pin(
                futures::stream::iter(chunks.into_iter().map(Ok))
                    .chain(futures::stream::pending()),
            ),
        };
        Ok(stream)
    }
}

pub fn text(delta: &str) -> StreamChunk {
    StreamChunk::TextDelta(delta.to_string())
}

pub fn done(reason: &str) -> StreamChunk {
    StreamChunk::Done {
        finish_reason: reason.to_string(),
        usage: None,
    }
}

pub fn call(id: &str, name: &str, args: Value) -> Vec<StreamChunk> {
    vec![
        StreamChunk::ToolCallStart {
            id: id.to_string(),
            name: name.to_string(),
        },
        StreamChunk::ToolCallDelta {
            id: id.to_string(),
            args_delta: args.to_string(),
        },
        StreamChunk::ToolCallEnd { id: id.to_string() },
    ]
}

/// Tool catalog with canned outputs and a call log.
#[derive(Default)]
pub struct FakeTools {
    outputs: HashMap<String, ToolOutput>,
    delay: Option<Duration>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl FakeTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, name: &str, value: Value) -> Self {
        self.outputs.insert(name.to_string(), ToolOutput::ok(value));
        self
    }

    pub fn with_error(mut self, name: &str, err: ToolError) -> Self {
        self.outputs.insert(name.to_string(), ToolOutput::failed(&err));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolExecutor for FakeTools {
    fn schemas(&self) -> Vec<ToolSchema> {
        vec![
            ToolSchema {
                name: "get_invoice".to_string(),
                description: "Fetch one invoice".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": { "invoiceId": { "type": "string" } }
                }),
            },
            ToolSchema {
                name: "update_invoice_status".to_string(),
                description: "Change an invoice status".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "invoiceId": { "type": "string" },
                        "status": { "type": "string" }
                    },
                    "required": ["invoiceId", "status"]
                }),
            },
        ]
    }

    async fn execute(&self, name: &str, args: Value, _ctx: &ToolContext) -> ToolOutput {
        self.calls.lock().unwrap().push((name.to_string(), args));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.outputs
            .get(name)
            .cloned()
            .unwrap_or_else(|| ToolOutput::failed(&ToolError::UnknownTool(name.to_string())))
    }
}

pub fn orchestrator(
    provider: Arc<ScriptedProvider>,
    tools: Arc<FakeTools>,
    config: OrchestratorConfig,
) -> ChatOrchestrator {
    ChatOrchestrator::new(
        ProviderRegistry::from_providers(vec![provider], None),
        tools,
        config,
    )
}

pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        drain_delay: Duration::from_millis(5),
        process: ProcessKind::Cli,
        ..OrchestratorConfig::default()
    }
}

pub fn user_request(text: &str) -> ChatRequest {
    ChatRequest {
        messages: vec![json!({ "role": "user", "content": text })],
        model: None,
    }
}

/// Decodes every payload, asserting each one is a well-formed frame.
pub fn decode_all(payloads: &[String]) -> Vec<(String, StreamFrame)> {
    payloads
        .iter()
        .map(|payload| {
            let wire = decode_frame(payload).unwrap_or_else(|| panic!("bad frame: {payload}"));
            (wire.message_id, wire.frame)
        })
        .collect()
}

pub fn kinds(frames: &[(String, StreamFrame)]) -> Vec<&'static str> {
    frames.iter().map(|(_, frame)| frame.kind()).collect()
}

pub fn joined_text(frames: &[(String, StreamFrame)]) -> String {
    frames
        .iter()
        .filter_map(|(_, frame)| frame.text_payload())
        .collect()
}
