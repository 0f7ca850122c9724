use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tracing::info;

use tally_core::{ConfigStore, DEFAULT_ENGINE_HOST, DEFAULT_ENGINE_PORT};
use tally_observability::{
    emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use tally_server::{serve, AppState};
use tally_tools::{Credential, RecordApiClient, ToolContext, ToolExecutor, ToolRegistry};
use tally_types::{ChatRequest, StreamFrame};
use tally_wire::decode_frame;

const SUPPORTED_PROVIDER_IDS: [&str; 7] = [
    "openai",
    "openrouter",
    "ollama",
    "groq",
    "mistral",
    "together",
    "azure",
];

#[derive(Parser, Debug)]
#[command(name = "tally-engine")]
#[command(about = "Invoicing chat assistant backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug, Clone, Default)]
struct ConfigArgs {
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    records_url: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the chat API over HTTP.
    Serve {
        #[arg(long, alias = "host", default_value = DEFAULT_ENGINE_HOST)]
        hostname: String,
        #[arg(long, default_value_t = DEFAULT_ENGINE_PORT)]
        port: u16,
        #[arg(long)]
        logs_dir: Option<String>,
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Answer one prompt and print the streamed reply.
    Run {
        prompt: String,
        #[arg(long, env = "TALLY_AUTHORIZATION")]
        authorization: Option<String>,
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Execute one catalog tool directly.
    Tool {
        #[arg(long)]
        json: String,
        #[arg(long, env = "TALLY_AUTHORIZATION")]
        authorization: Option<String>,
        #[command(flatten)]
        config: ConfigArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            logs_dir,
            config,
        } => {
            let logs_dir = logs_dir.map(PathBuf::from);
            let (_log_guard, log_info) =
                init_process_logging(ProcessKind::Server, logs_dir.as_deref(), 14)?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Server,
                ObservabilityEvent {
                    status: Some("ok"),
                    detail: Some("server logging initialized"),
                    ..ObservabilityEvent::new("logging.initialized", "engine.main")
                },
            );
            info!("engine logging initialized: {:?}", log_info);
            let store = load_config(&config).await?;
            let app_config = store.get()?;
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            info!(
                "starting tally-engine on http://{addr} records={} config={}",
                app_config.records.base_url,
                store
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "<none>".to_string())
            );
            let state = AppState::from_config(&app_config, ProcessKind::Server);
            serve(addr, state).await?;
        }
        Command::Run {
            prompt,
            authorization,
            config,
        } => {
            let (_log_guard, _) = init_process_logging(ProcessKind::Cli, None, 14)?;
            let app_config = load_config(&config).await?.get()?;
            let state = AppState::from_config(&app_config, ProcessKind::Cli);
            let request = ChatRequest {
                messages: vec![json!({ "role": "user", "content": prompt })],
                model: None,
            };
            let credential = Credential {
                authorization,
                cookie: None,
            };
            let session = state
                .orchestrator
                .open(request, credential)
                .await
                .map_err(|err| anyhow::anyhow!("{}: {}", err.code(), err))?;
            let (mut frames, report) = session.split();
            let mut stdout = std::io::stdout();
            while let Some(payload) = frames.next().await {
                let Some(wire) = decode_frame(&payload) else {
                    continue;
                };
                match wire.frame {
                    StreamFrame::TextDelta { delta } => {
                        write!(stdout, "{delta}")?;
                        stdout.flush()?;
                    }
                    StreamFrame::ToolCallStart { tool_name, .. } => {
                        eprintln!("[tool] {tool_name}");
                    }
                    StreamFrame::Error { code, message } => {
                        eprintln!("\n[error] {code}: {message}");
                    }
                    _ => {}
                }
            }
            println!();
            if let Some(report) = report.wait().await {
                info!(
                    "session {} finished: {:?}",
                    report.message_id, report.termination
                );
            }
        }
        Command::Tool {
            json,
            authorization,
            config,
        } => {
            let app_config = load_config(&config).await?.get()?;
            let payload = read_tool_json(&json)?;
            let tool = payload
                .get("tool")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            if tool.is_empty() {
                anyhow::bail!("tool is required in input json");
            }
            let args = payload.get("args").cloned().unwrap_or_else(|| json!({}));
            let registry = ToolRegistry::invoicing(RecordApiClient::new(&app_config.records));
            let ctx = ToolContext {
                credential: Credential {
                    authorization,
                    cookie: None,
                },
                ..ToolContext::default()
            };
            let output = registry.execute(&tool, args, &ctx).await;
            println!("{}", serde_json::to_string_pretty(&output.value)?);
            if output.is_error {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

async fn load_config(args: &ConfigArgs) -> anyhow::Result<ConfigStore> {
    let overrides = build_cli_overrides(args)?;
    let path = args.config.as_deref().map(PathBuf::from);
    ConfigStore::load(path.as_deref(), overrides).await
}

fn build_cli_overrides(args: &ConfigArgs) -> anyhow::Result<Option<Value>> {
    let provider = normalize_and_validate_provider(args.provider.clone())?;
    if args.api_key.is_none()
        && provider.is_none()
        && args.model.is_none()
        && args.records_url.is_none()
    {
        return Ok(None);
    }
    let mut root = Map::new();

    if let Some(p) = &provider {
        root.insert("default_provider".to_string(), Value::String(p.clone()));
    }
    if let Some(url) = &args.records_url {
        root.insert("records".to_string(), json!({ "base_url": url }));
    }

    // Key and model overrides land on the selected provider, openai otherwise.
    let target_provider = provider.as_deref().unwrap_or("openai");
    if args.api_key.is_some() || args.model.is_some() {
        let mut provider_config = Map::new();
        if let Some(k) = &args.api_key {
            provider_config.insert("api_key".to_string(), Value::String(k.clone()));
        }
        if let Some(m) = &args.model {
            provider_config.insert("default_model".to_string(), Value::String(m.clone()));
        }
        root.insert(
            "providers".to_string(),
            json!({ target_provider: Value::Object(provider_config) }),
        );
    }

    Ok(Some(Value::Object(root)))
}

fn normalize_and_validate_provider(provider: Option<String>) -> anyhow::Result<Option<String>> {
    let Some(provider) = provider else {
        return Ok(None);
    };
    let normalized = provider.trim().to_lowercase();
    if normalized.is_empty() {
        anyhow::bail!(
            "provider cannot be empty. supported providers: {}",
            SUPPORTED_PROVIDER_IDS.join(", ")
        );
    }
    if SUPPORTED_PROVIDER_IDS.contains(&normalized.as_str()) {
        return Ok(Some(normalized));
    }
    anyhow::bail!(
        "unsupported provider `{}`. supported providers: {}",
        provider,
        SUPPORTED_PROVIDER_IDS.join(", ")
    );
}

fn read_tool_json(input: &str) -> anyhow::Result<Value> {
    if input.trim() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(serde_json::from_str(&buf)?);
    }
    if let Some(path) = input.strip_prefix('@') {
        let raw = std::fs::read_to_string(path)?;
        return Ok(serde_json::from_str(&raw)?);
    }
    Ok(serde_json::from_str(input)?)
}
