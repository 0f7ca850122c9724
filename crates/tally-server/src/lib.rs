use std::sync::Arc;
use std::time::Instant;

use tally_core::{AppConfig, ChatOrchestrator};
use tally_observability::ProcessKind;
use tally_providers::ProviderRegistry;
use tally_tools::{RecordApiClient, ToolRegistry};

mod http;

pub use http::{app_router, serve};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: ChatOrchestrator,
    started_at: Instant,
}

impl AppState {
    pub fn new(orchestrator: ChatOrchestrator) -> Self {
        Self {
            orchestrator,
            started_at: Instant::now(),
        }
    }

    /// Wires providers, the invoicing tool catalog and the orchestrator from
    /// resolved configuration.
    pub fn from_config(config: &AppConfig, process: ProcessKind) -> Self {
        let providers = ProviderRegistry::new(config.provider_settings());
        let tools = ToolRegistry::invoicing(RecordApiClient::new(&config.records));
        Self::new(ChatOrchestrator::new(
            providers,
            Arc::new(tools),
            config.orchestrator_config(process),
        ))
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}
