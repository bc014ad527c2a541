use anyhow::{Context, Result, anyhow};
use console::style;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::{CONFIG_ENV, RelayConfig, StoreBackend};
use crate::core::agent::ScriptedAgent;
use crate::core::lifecycle::LifecycleManager;
use crate::core::store::{MemoryRunStore, RunStore, RunSweeper, SqliteRunStore, StoreOptions};
use crate::core::terminal::{self, GuideSection};
use crate::interfaces::web::{ApiServer, AppState};
use crate::logging;

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Server")
        .command("serve", "Run the chat relay HTTP server")
        .command("help", "Show this help")
        .print();

    GuideSection::new("Serve flags")
        .command("--config <PATH>", "Read settings from a TOML file")
        .command("--host <HOST>", "Bind address (default 127.0.0.1)")
        .command("--port <PORT>", "Listen port (default 8000)")
        .print();

    println!(
        "\n {} {} <command> [flags]\n",
        style("Usage:").bold(),
        style("hitl-relay").green()
    );
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ServeArgs {
    pub config: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

pub(crate) fn parse_serve_flags(args: &[String], start: usize) -> Result<ServeArgs> {
    let mut parsed = ServeArgs::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    parsed.config = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                } else {
                    return Err(anyhow!("--config needs a path"));
                }
            }
            "--host" => {
                if i + 1 < args.len() {
                    parsed.host = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    return Err(anyhow!("--host needs a value"));
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    let port = args[i + 1]
                        .parse()
                        .with_context(|| format!("invalid port '{}'", args[i + 1]))?;
                    parsed.port = Some(port);
                    i += 2;
                } else {
                    return Err(anyhow!("--port needs a value"));
                }
            }
            other => return Err(anyhow!("unknown flag '{}'", other)),
        }
    }
    Ok(parsed)
}

/// File, then environment, then flags.
pub(crate) async fn resolve_config(args: &ServeArgs) -> Result<RelayConfig> {
    let path = args
        .config
        .clone()
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
    let mut config = RelayConfig::load(path.as_deref()).await?;
    config.apply_env()?;
    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    Ok(config)
}

pub(crate) async fn build_store(config: &RelayConfig) -> Result<Arc<dyn RunStore>> {
    let options = StoreOptions {
        ttl: config.store.run_ttl(),
        max_messages: config.store.max_messages,
    };
    let store: Arc<dyn RunStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(MemoryRunStore::new(options)),
        StoreBackend::Sqlite => {
            let path = config.store.sqlite_path();
            info!(path = %path.display(), "Opening SQLite run store");
            Arc::new(SqliteRunStore::open(&path, options).await?)
        }
    };
    Ok(store)
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = resolve_config(&args).await?;
    logging::init_logging(&config.logging)?;

    let store = build_store(&config).await?;
    let agent = Arc::new(ScriptedAgent::demo());
    let state = AppState::new(
        store.clone(),
        agent,
        config.agent.model.clone(),
        config.server.cors_origins.clone(),
    );

    let mut lifecycle = LifecycleManager::new();
    if let Some(ttl) = config.store.run_ttl() {
        lifecycle.attach(Arc::new(Mutex::new(RunSweeper::new(
            store.clone(),
            ttl,
            config.store.sweep_interval(),
        ))));
    }
    lifecycle.attach(Arc::new(Mutex::new(ApiServer::new(state, &config.server))));
    lifecycle.start().await?;

    terminal::print_banner();
    terminal::print_link(
        "Chat endpoint:",
        &format!("http://{}:{}/api/chat", config.server.host, config.server.port),
    );
    terminal::print_info("Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    lifecycle.shutdown().await?;
    terminal::print_success("Relay stopped.");
    Ok(())
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("serve") => serve(parse_serve_flags(&args, 2)?).await,
        None | Some("help") | Some("--help") | Some("-h") => {
            print_help();
            Ok(())
        }
        Some(other) => {
            print_help();
            Err(anyhow!("unknown command '{}'", other))
        }
    }
}
