use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use parley_gateway::HttpGateway;
use parley_server::shutdown::wait_for_signal;
use parley_server::ParleyServer;

#[derive(Debug, Parser)]
#[command(name = "parley", about = "WebSocket chat hub in front of an inference backend")]
struct Args {
    /// Settings file (defaults to ~/.parley/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Base URL of the inference backend, e.g. http://localhost:8000.
    #[arg(long)]
    inference_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => parley_settings::load_settings_from_path(path),
        None => parley_settings::load_settings(),
    }
    .context("failed to load settings")?;

    if let Some(host) = args.host {
        settings.server.host = host;
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if let Some(url) = args.inference_url {
        settings.inference.base_url = url;
    }

    parley_telemetry::init_telemetry(&settings.logging).context("failed to initialize logging")?;

    let gateway = HttpGateway::new(&settings.inference.base_url, settings.inference.timeout())
        .context("failed to build inference client")?;
    tracing::info!(endpoint = gateway.endpoint(), "inference backend configured");

    let server = ParleyServer::new(settings, Arc::new(gateway));
    let handle = server.listen().await.context("failed to bind listener")?;
    tracing::info!(addr = %handle.addr, "parley ready");

    wait_for_signal().await;

    tracing::info!("shutting down");
    server.shutdown().graceful_shutdown(handle.into_tasks(), None).await;
    Ok(())
}
