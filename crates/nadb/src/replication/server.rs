use crate::error::{ReplicationError, Result};
use crate::replication::connection::OutboundReplicaLink;
use crate::replication::manager::ReplicationManager;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// How long the accept loop waits before rechecking the running flag
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);
/// Heartbeat lag after which a secondary is evicted
pub const MAX_REPLICA_LAG: Duration = Duration::from_secs(60);
/// Bounded wait for a loop task to finish on stop
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    pub listen_addr: String,
    pub running: bool,
    pub active_connections: usize,
}

/// TCP endpoint on the primary that secondaries connect to
///
/// Accepted sockets become [`OutboundReplicaLink`]s registered with the
/// manager. A maintenance task sends heartbeats, drains link queues and
/// evicts dead or lagging links.
pub struct ReplicationServer {
    manager: Arc<ReplicationManager>,
    listen_addr: String,
    local_addr: Option<SocketAddr>,
    running: Arc<AtomicBool>,
    accept_task: Option<JoinHandle<()>>,
    maintenance_task: Option<JoinHandle<()>>,
}

impl ReplicationServer {
    pub fn new(manager: Arc<ReplicationManager>, listen_addr: impl Into<String>) -> Self {
        Self {
            manager,
            listen_addr: listen_addr.into(),
            local_addr: None,
            running: Arc::new(AtomicBool::new(false)),
            accept_task: None,
            maintenance_task: None,
        }
    }

    /// Address actually bound; differs from the configured one for port 0
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Bind the listening socket and spawn the accept and maintenance tasks
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.is_running() {
            warn!("Replication server already running");
            return self
                .local_addr
                .ok_or_else(|| ReplicationError::connection("server has no local address", None));
        }

        let listener = TcpListener::bind(&self.listen_addr).await.map_err(|e| {
            ReplicationError::connection(
                format!("failed to bind: {}", e),
                Some(self.listen_addr.clone()),
            )
        })?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);
        self.running.store(true, Ordering::Release);

        self.accept_task = Some(tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.manager),
            Arc::clone(&self.running),
        )));
        self.maintenance_task = Some(tokio::spawn(maintenance_loop(
            Arc::clone(&self.manager),
            Arc::clone(&self.running),
        )));

        info!("Replication server listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Stop both loops, disconnect every secondary and close the listener
    pub async fn stop(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Stopping replication server");

        // The listener is owned by the accept task and closes when it exits
        for (name, task) in [
            ("accept", self.accept_task.take()),
            ("maintenance", self.maintenance_task.take()),
        ] {
            if let Some(task) = task {
                join_bounded(name, task).await;
            }
        }

        self.manager.shutdown().await;
        info!("Replication server stopped");
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            listen_addr: self
                .local_addr
                .map(|addr| addr.to_string())
                .unwrap_or_else(|| self.listen_addr.clone()),
            running: self.is_running(),
            active_connections: self.manager.replica_count().await,
        }
    }
}

pub(crate) async fn join_bounded(name: &str, mut task: JoinHandle<()>) {
    match timeout(JOIN_TIMEOUT, &mut task).await {
        Ok(Ok(())) => debug!("{} task finished", name),
        Ok(Err(e)) => error!("{} task failed: {}", name, e),
        Err(_) => {
            warn!(
                "{} task did not finish within {:?}, aborting it",
                name, JOIN_TIMEOUT
            );
            task.abort();
        }
    }
}

fn replica_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("replica-{}", &id[..8])
}

async fn accept_loop(
    listener: TcpListener,
    manager: Arc<ReplicationManager>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Acquire) {
        let (socket, peer_addr) = match timeout(ACCEPT_TIMEOUT, listener.accept()).await {
            Err(_) => continue,
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => {
                if running.load(Ordering::Acquire) {
                    error!("Error accepting connection: {}", e);
                }
                continue;
            }
        };

        let replica_id = replica_id();
        info!("Accepted secondary {} from {}", replica_id, peer_addr);
        let link = Arc::new(OutboundReplicaLink::new(
            replica_id.clone(),
            socket,
            peer_addr,
        ));
        if let Err(e) = manager.register(&replica_id, link).await {
            error!("Failed to register replica {}: {}", replica_id, e);
        }
    }
    debug!("Accept loop exited");
}

async fn maintenance_loop(manager: Arc<ReplicationManager>, running: Arc<AtomicBool>) {
    while running.load(Ordering::Acquire) {
        if let Err(e) = run_maintenance(&manager).await {
            error!("Error in maintenance loop: {}", e);
        }
        tokio::time::sleep(MAINTENANCE_INTERVAL).await;
    }
    debug!("Maintenance loop exited");
}

async fn run_maintenance(manager: &ReplicationManager) -> Result<()> {
    manager.send_heartbeat().await?;
    manager.process_replica_queues().await?;
    manager.evict_stale(MAX_REPLICA_LAG).await?;
    Ok(())
}
