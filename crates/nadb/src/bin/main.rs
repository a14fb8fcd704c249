use clap::Parser;
use nadb::config::{BackendKind, Mode};
use nadb::{FileSystemStorage, NetworkSyncStorage, NodeConfig, SqliteStorage, StorageBackend};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const STATS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a NADB replication node", long_about = None)]
struct Args {
    /// Path to the node configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = NodeConfig::from_file(&args.config)?;
    config.replication.validate()?;

    info!("Starting NADB node in {} mode", config.replication.mode);
    info!("Opening {:?} storage at {:?}", config.storage.backend, config.storage.path);

    match config.storage.backend {
        BackendKind::Fs => {
            let base = FileSystemStorage::open(&config.storage.path)?;
            run_node(base, config).await
        }
        BackendKind::Sqlite => {
            if let Some(parent) = config.storage.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let base = SqliteStorage::open(&config.storage.path, &config.storage)?;
            run_node(base, config).await
        }
    }
}

async fn run_node<B: StorageBackend + 'static>(
    base: B,
    config: NodeConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut storage = match config.replication.mode {
        Mode::Primary => {
            let storage = NetworkSyncStorage::start_primary(base, config.replication.clone()).await?;
            if let Some(addr) = storage.listen_addr() {
                info!("Accepting secondaries on {}", addr);
            }
            storage
        }
        Mode::Secondary => NetworkSyncStorage::start_secondary(base, config.replication.clone())?,
    };
    storage.set_context(config.context.db.clone(), config.context.namespace.clone());

    info!("Node running. Press Ctrl+C to stop.");

    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            _ = ticker.tick() => {
                match serde_json::to_string(&storage.stats().await) {
                    Ok(stats) => info!("Replication stats: {}", stats),
                    Err(e) => error!("Failed to serialize stats: {}", e),
                }
            }
        }
    }

    storage.close().await;
    info!("Shutdown complete");
    Ok(())
}
