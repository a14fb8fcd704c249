use clap::Parser;
use nadb::{FileSystemStorage, NetworkSyncStorage, ReplicationConfig, key_path};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DB: &str = "dev";
const NAMESPACE: &str = "default";

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a local primary with secondaries for development", long_about = None)]
struct Args {
    /// Number of secondaries to start
    #[arg(short, long, default_value = "2")]
    secondaries: u16,

    /// Replication port of the primary
    #[arg(short, long, default_value = "9000")]
    port: u16,

    /// Number of sample keys written on the primary
    #[arg(short, long, default_value = "10")]
    keys: usize,

    /// Data directory root (each node gets a subdirectory)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,
}

struct NodeDir {
    path: PathBuf,
    _temp_dir: Option<TempDir>, // Keep alive to prevent cleanup
}

fn node_dir(data_dir: &Option<PathBuf>, name: &str) -> std::io::Result<NodeDir> {
    match data_dir {
        Some(base) => {
            let path = base.join(name);
            std::fs::create_dir_all(&path)?;
            Ok(NodeDir {
                path,
                _temp_dir: None,
            })
        }
        None => {
            let temp_dir = TempDir::new()?;
            Ok(NodeDir {
                path: temp_dir.path().to_path_buf(),
                _temp_dir: Some(temp_dir),
            })
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    info!("Starting primary with {} secondaries...", args.secondaries);

    let primary_dir = node_dir(&args.data_dir, "primary")?;
    let primary_config = ReplicationConfig {
        heartbeat_interval_secs: 2.0,
        ..ReplicationConfig::primary("127.0.0.1", args.port)
    };
    let mut primary = NetworkSyncStorage::start_primary(
        FileSystemStorage::open(&primary_dir.path)?,
        primary_config,
    )
    .await?;
    primary.set_context(DB, NAMESPACE);
    let port = primary.listen_addr().map(|a| a.port()).unwrap_or(args.port);
    info!("Primary: replication=127.0.0.1:{}, data={:?}", port, primary_dir.path);

    let mut dirs = vec![primary_dir];
    let mut secondaries = Vec::new();
    for i in 1..=args.secondaries {
        let dir = node_dir(&args.data_dir, &format!("secondary-{}", i))?;
        let config = ReplicationConfig {
            reconnect_interval_secs: 0.5,
            ..ReplicationConfig::secondary("127.0.0.1", port)
        };
        let secondary =
            NetworkSyncStorage::start_secondary(FileSystemStorage::open(&dir.path)?, config)?;
        info!("Secondary {}: data={:?}", i, dir.path);
        dirs.push(dir);
        secondaries.push(secondary);
    }

    // Let the secondaries connect so they see the writes live
    let (primary_ref, secondaries_ref) = (&primary, &secondaries);
    wait_for(Duration::from_secs(10), move || async move {
        primary_ref.manager().replica_count().await >= secondaries_ref.len()
    })
    .await;

    for i in 0..args.keys {
        let key = format!("user:{}", i);
        let value = format!("{{\"id\":{},\"name\":\"user-{}\"}}", i, i);
        let path = key_path(DB, NAMESPACE, &key);
        primary
            .write_replicated(&path, value.into_bytes(), &key, &["sample".to_string()], None)
            .await?;
    }
    let target = primary.manager().current_sequence();
    info!("Wrote {} keys on the primary (sequence {})", args.keys, target);

    let secondaries_ref = &secondaries;
    let caught_up = wait_for(Duration::from_secs(10), move || async move {
        secondaries_ref
            .iter()
            .all(|s| s.manager().last_applied_sequence() >= target)
    })
    .await;
    if caught_up {
        info!("All secondaries applied sequence {}", target);
    } else {
        warn!("Secondaries did not catch up to sequence {} in time", target);
    }

    let probe = key_path(DB, NAMESPACE, "user:0");
    for (i, secondary) in secondaries.iter().enumerate() {
        match secondary.read(&probe) {
            Ok(Some(value)) => info!(
                "Secondary {} has user:0 = {}",
                i + 1,
                String::from_utf8_lossy(&value)
            ),
            Ok(None) => warn!("Secondary {} is missing user:0", i + 1),
            Err(e) => error!("Secondary {} read failed: {}", i + 1, e),
        }
    }
    info!("Primary stats: {}", serde_json::to_string_pretty(&primary.stats().await)?);

    info!("All nodes started. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");

    for secondary in &mut secondaries {
        secondary.close().await;
    }
    primary.close().await;

    // Keep data directories alive until every node has shut down
    drop(dirs);
    info!("Shutdown complete");
    Ok(())
}

async fn wait_for<F, Fut>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}
