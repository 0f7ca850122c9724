use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use tally_observability::{emit_event, ObservabilityEvent, ProcessKind};
use tally_providers::{ChatMessage, ChunkStream, Provider, StreamChunk};
use tally_types::ToolSchema;

/// Why reading from the completion backend stopped early.
#[derive(Debug)]
pub(crate) enum StreamInterrupt {
    Backend(anyhow::Error),
    Cancelled,
}

pub(crate) async fn open_stream(
    provider: &dyn Provider,
    model: Option<&str>,
    history: &[ChatMessage],
    tools: Option<Vec<ToolSchema>>,
    cancel: &CancellationToken,
) -> Result<ChunkStream, StreamInterrupt> {
    tokio::select! {
        _ = cancel.cancelled() => Err(StreamInterrupt::Cancelled),
        stream = provider.stream(history.to_vec(), model, tools, cancel.clone()) => {
            stream.map_err(StreamInterrupt::Backend)
        }
    }
}

pub(crate) async fn next_chunk(
    stream: &mut ChunkStream,
    cancel: &CancellationToken,
) -> Result<Option<StreamChunk>, StreamInterrupt> {
    tokio::select! {
        _ = cancel.cancelled() => Err(StreamInterrupt::Cancelled),
        chunk = stream.next() => chunk.transpose().map_err(StreamInterrupt::Backend),
    }
}

/// Fixed identity fields for the events one session emits.
#[derive(Debug, Clone)]
pub(crate) struct ObsScope {
    pub process: ProcessKind,
    pub component: &'static str,
    pub message_id: String,
    pub provider_id: String,
    pub model_id: Option<String>,
}

impl ObsScope {
    pub fn event<'a>(&'a self, event: &'a str) -> ObservabilityEvent<'a> {
        ObservabilityEvent {
            message_id: Some(&self.message_id),
            provider_id: Some(&self.provider_id),
            model_id: self.model_id.as_deref(),
            ..ObservabilityEvent::new(event, self.component)
        }
    }

    pub fn emit(&self, level: Level, event: ObservabilityEvent<'_>) {
        emit_event(level, self.process, event);
    }

    pub fn with_component(&self, component: &'static str) -> Self {
        Self {
            component,
            ..self.clone()
        }
    }
}
