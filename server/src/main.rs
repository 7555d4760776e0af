use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use archipelago_server::{RendezvousServer, Topology, TopologyFile};

#[derive(Parser)]
#[command(name = "archipelago-server", about = "Archipelago rendezvous server")]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value = "7451", env = "ARCHIPELAGO_PORT")]
    port: u16,

    /// Path to the topology JSON file
    #[arg(long, env = "ARCHIPELAGO_TOPOLOGY")]
    topology: std::path::PathBuf,

    /// Force synchronous (barrier-locked) exchange, overriding the file
    #[arg(long)]
    sync: bool,

    /// Global exchange modulo used with --sync
    #[arg(long)]
    sync_modulo: Option<u32>,

    /// Global exchange offset used with --sync
    #[arg(long)]
    sync_offset: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let raw = std::fs::read_to_string(&cli.topology)
        .with_context(|| format!("reading topology file {}", cli.topology.display()))?;
    let mut file: TopologyFile = serde_json::from_str(&raw).context("parsing topology JSON")?;
    if cli.sync {
        file.synchronous = true;
        file.sync_modulo = cli.sync_modulo.or(file.sync_modulo);
        file.sync_offset = cli.sync_offset.or(file.sync_offset);
    }
    let topology = Topology::build(file)?;
    tracing::info!(
        islands = topology.len(),
        synchronous = topology.synchronous,
        "Starting archipelago rendezvous server"
    );

    let addr = format!("0.0.0.0:{}", cli.port);
    let server = RendezvousServer::bind(topology, &addr).await?;
    tracing::info!("Listening on {addr}");

    tokio::select! {
        result = server.run() => result?,
        _ = shutdown_signal() => {}
    }

    tracing::info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async { tokio::signal::ctrl_c().await.ok(); };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
