use anyhow::Context;
use clap::{Parser, ValueEnum};
use relay_cache::CapabilityCache;
use relay_core::{resolve_env_in_value, Preset, ProxyConfig};
use relay_proxy::{ConnectionSettings, InboundTransport, ProxyController};
use relay_server::create_server;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relay", about = "mcp-relay — aggregate MCP backends behind one endpoint")]
struct Cli {
    /// Path to the backend servers config (JSON)
    #[arg(long)]
    servers: PathBuf,

    /// Path to the preset file (JSON); omit to expose nothing
    #[arg(long)]
    preset: Option<PathBuf>,

    /// Inbound transport to serve
    #[arg(long, value_enum, default_value_t = Transport::Stdio)]
    transport: Transport,

    /// Listen address for the http/ws transports
    #[arg(long, default_value = "127.0.0.1:8090")]
    listen: String,

    /// Directory for the persistent capability cache; omit to disable
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Log level filter (e.g. info, debug, relay_proxy=trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum Transport {
    Stdio,
    Http,
    Ws,
}

/// Read a JSON config file and substitute `${NAME}` references against the
/// process environment before typed decoding.
async fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read '{}'", path.display()))?;
    let mut value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("'{}' is not valid JSON", path.display()))?;
    resolve_env_in_value(&mut value)
        .with_context(|| format!("env substitution failed in '{}'", path.display()))?;
    serde_json::from_value(value)
        .with_context(|| format!("'{}' does not match the expected schema", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Stdout belongs to the protocol when serving stdio, so diagnostics
    // always go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .with_writer(std::io::stderr)
        .init();

    let config: ProxyConfig = load_json(&cli.servers).await?;
    let preset = match &cli.preset {
        Some(path) => load_json::<Preset>(path).await?,
        None => Preset::empty(),
    };
    info!(
        backends = config.servers.len(),
        preset = %preset.id,
        "configuration loaded"
    );

    let cache = match &cli.cache_dir {
        Some(dir) => Some(Arc::new(CapabilityCache::open(dir.clone()).await?)),
        None => None,
    };

    let controller = Arc::new(ProxyController::new(ConnectionSettings::default(), cache));
    controller.start(&config, preset).await?;

    let transport = match cli.transport {
        Transport::Stdio => InboundTransport::Stdio,
        Transport::Http => InboundTransport::Http {
            listen: cli.listen.clone(),
        },
        Transport::Ws => InboundTransport::Websocket {
            listen: cli.listen.clone(),
        },
    };
    let server = create_server(&transport, controller.aggregator());
    controller.attach_server(server.clone()).await;
    server.start().await?;
    info!(transport = %transport, "relay serving");

    tokio::select! {
        _ = server.wait() => {
            info!("session ended");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }

    controller.shutdown().await;
    Ok(())
}
