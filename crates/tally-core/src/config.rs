use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;

use tally_observability::ProcessKind;
use tally_providers::{ProviderConfig, ProviderSettings};
use tally_tools::RecordApiConfig;

use crate::relay::DEFAULT_BUFFER_CAPACITY;
use crate::session::{OrchestratorConfig, DEFAULT_SYSTEM_PROMPT};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChatConfig {
    pub generation_deadline_secs: u64,
    pub drain_delay_ms: u64,
    pub buffer_capacity: usize,
    pub relay_capacity: usize,
    pub max_steps: usize,
    pub system_prompt: Option<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            generation_deadline_secs: 120,
            drain_delay_ms: 250,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            relay_capacity: 32,
            max_steps: 8,
            system_prompt: Some(DEFAULT_SYSTEM_PROMPT.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
    #[serde(default)]
    pub records: RecordApiConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

impl AppConfig {
    pub fn provider_settings(&self) -> ProviderSettings {
        ProviderSettings {
            providers: self.providers.clone(),
            default_provider: self.default_provider.clone(),
        }
    }

    pub fn orchestrator_config(&self, process: ProcessKind) -> OrchestratorConfig {
        let chat = &self.chat;
        OrchestratorConfig {
            generation_deadline: Duration::from_secs(chat.generation_deadline_secs.max(1)),
            drain_delay: Duration::from_millis(chat.drain_delay_ms),
            buffer_capacity: chat.buffer_capacity.max(1),
            relay_capacity: chat.relay_capacity.max(1),
            max_steps: chat.max_steps.max(1),
            system_prompt: chat
                .system_prompt
                .clone()
                .filter(|prompt| !prompt.trim().is_empty()),
            process,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    file: Value,
    env: Value,
    cli: Value,
}

/// Read-only layered configuration: config file, then environment, then
/// command-line overrides. Later layers win key by key.
#[derive(Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    layers: Arc<ConfigLayers>,
}

impl ConfigStore {
    pub async fn load(path: Option<&Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let file = match path {
            Some(path) => read_json_file(path).await?,
            None => empty_object(),
        };
        Ok(Self {
            path: path.map(Path::to_path_buf),
            layers: Arc::new(ConfigLayers {
                file,
                env: env_layer(),
                cli: cli_overrides.unwrap_or_else(empty_object),
            }),
        })
    }

    pub fn from_layers(file: Value, env: Value, cli: Value) -> Self {
        Self {
            path: None,
            layers: Arc::new(ConfigLayers { file, env, cli }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self) -> anyhow::Result<AppConfig> {
        serde_json::from_value(self.get_effective_value()).context("invalid configuration")
    }

    pub fn get_effective_value(&self) -> Value {
        let mut merged = empty_object();
        deep_merge(&mut merged, &self.layers.file);
        deep_merge(&mut merged, &self.layers.env);
        deep_merge(&mut merged, &self.layers.cli);
        merged
    }

    /// Every layer with provider keys blanked, for diagnostics.
    pub fn get_layers_value(&self) -> Value {
        let mut value = json!({
            "file": self.layers.file,
            "env": self.layers.env,
            "cli": self.layers.cli,
        });
        if let Some(layers) = value.as_object_mut() {
            for layer in layers.values_mut() {
                redact_provider_keys(layer);
            }
        }
        value
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(empty_object());
    }
    serde_json::from_str::<Value>(&raw).with_context(|| format!("parsing config {}", path.display()))
}

fn redact_provider_keys(layer: &mut Value) {
    let Some(providers) = layer.get_mut("providers").and_then(Value::as_object_mut) else {
        return;
    };
    for cfg in providers.values_mut() {
        let Some(cfg) = cfg.as_object_mut() else {
            continue;
        };
        for key in ["api_key", "apiKey"] {
            if cfg.contains_key(key) {
                cfg.insert(key.to_string(), Value::String("<redacted>".to_string()));
            }
        }
    }
}

fn env_layer() -> Value {
    env_layer_from(|key| std::env::var(key).ok())
}

/// Builds the environment layer from `lookup`. Blank values count as unset.
pub fn env_layer_from(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    let mut root = empty_object();

    if let Some(provider) = get("TALLY_DEFAULT_PROVIDER") {
        deep_merge(&mut root, &json!({ "default_provider": provider.trim() }));
    }
    if let Some(url) = get("TALLY_RECORDS_URL") {
        deep_merge(&mut root, &json!({ "records": { "base_url": url.trim() } }));
    }
    for (env, key) in [
        ("TALLY_GENERATION_DEADLINE_SECS", "generation_deadline_secs"),
        ("TALLY_DRAIN_DELAY_MS", "drain_delay_ms"),
        ("TALLY_BUFFER_CAPACITY", "buffer_capacity"),
    ] {
        let Some(raw) = get(env) else {
            continue;
        };
        match raw.trim().parse::<u64>() {
            Ok(value) => deep_merge(&mut root, &json!({ "chat": { key: value } })),
            Err(_) => tracing::warn!(env, value = %raw, "ignoring non-numeric setting"),
        }
    }

    for (provider, key_env, url, model) in [
        ("openai", "OPENAI_API_KEY", "https://api.openai.com/v1", "gpt-4o-mini"),
        (
            "openrouter",
            "OPENROUTER_API_KEY",
            "https://openrouter.ai/api/v1",
            "openai/gpt-4o-mini",
        ),
        (
            "groq",
            "GROQ_API_KEY",
            "https://api.groq.com/openai/v1",
            "llama-3.1-8b-instant",
        ),
        (
            "mistral",
            "MISTRAL_API_KEY",
            "https://api.mistral.ai/v1",
            "mistral-small-latest",
        ),
        (
            "together",
            "TOGETHER_API_KEY",
            "https://api.together.xyz/v1",
            "meta-llama/Llama-3.1-8B-Instruct-Turbo",
        ),
        (
            "azure",
            "AZURE_OPENAI_API_KEY",
            "https://example.openai.azure.com/openai/deployments/default",
            "gpt-4o-mini",
        ),
    ] {
        if let Some(api_key) = get(key_env) {
            add_openai_env(&mut root, provider, &api_key, url, model);
        }
    }
    if let Some(ollama_url) = get("OLLAMA_URL") {
        deep_merge(
            &mut root,
            &json!({
                "providers": {
                    "ollama": {
                        "url": ollama_url,
                        "default_model": "llama3.1:8b"
                    }
                }
            }),
        );
    }

    root
}

fn add_openai_env(root: &mut Value, provider: &str, api_key: &str, default_url: &str, model: &str) {
    deep_merge(
        root,
        &json!({
            "providers": {
                provider: {
                    "api_key": api_key,
                    "url": default_url,
                    "default_model": model
                }
            }
        }),
    );
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
