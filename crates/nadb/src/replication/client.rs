use crate::replication::manager::ReplicationManager;
use crate::replication::server::join_bounded;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub running: bool,
    pub primary: String,
    pub connected: bool,
}

/// Secondary-side loop that keeps a connection to the primary and feeds
/// received operations into the manager's apply path
pub struct ReplicationClient {
    manager: Arc<ReplicationManager>,
    primary_host: String,
    primary_port: u16,
    reconnect_interval: Duration,
    running: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl ReplicationClient {
    pub fn new(
        manager: Arc<ReplicationManager>,
        primary_host: impl Into<String>,
        primary_port: u16,
    ) -> Self {
        let reconnect_interval = manager.config().reconnect_interval();
        Self {
            manager,
            primary_host: primary_host.into(),
            primary_port,
            reconnect_interval,
            running: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!("Replication client already running");
            return;
        }

        self.task = Some(tokio::spawn(receive_loop(
            Arc::clone(&self.manager),
            self.primary_host.clone(),
            self.primary_port,
            self.reconnect_interval,
            Arc::clone(&self.running),
        )));
        info!(
            "Replication client started for primary {}:{}",
            self.primary_host, self.primary_port
        );
    }

    pub async fn stop(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Stopping replication client");

        // The loop can still reconnect until it has observed the flag
        if let Some(task) = self.task.take() {
            join_bounded("receive", task).await;
        }
        if let Some(link) = self.manager.primary_link().await {
            link.disconnect().await;
        }
        info!("Replication client stopped");
    }

    pub async fn stats(&self) -> ClientStats {
        ClientStats {
            running: self.is_running(),
            primary: format!("{}:{}", self.primary_host, self.primary_port),
            connected: self.manager.is_connected_to_primary().await,
        }
    }
}

async fn receive_loop(
    manager: Arc<ReplicationManager>,
    host: String,
    port: u16,
    reconnect_interval: Duration,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Acquire) {
        if !manager.is_connected_to_primary().await {
            if let Err(e) = manager.connect(&host, port).await {
                debug!("Primary {}:{} unavailable: {}", host, port, e);
                sleep_while_running(reconnect_interval, &running).await;
                continue;
            }
        }

        if let Err(e) = manager.receive().await {
            warn!("Error receiving from primary: {}", e);
            if let Some(link) = manager.primary_link().await {
                link.disconnect().await;
            }
        }
    }
    debug!("Receive loop exited");
}

/// Sleep for `duration`, waking early once `running` is cleared
async fn sleep_while_running(duration: Duration, running: &AtomicBool) {
    const STEP: Duration = Duration::from_millis(100);
    let deadline = tokio::time::Instant::now() + duration.min(Duration::from_secs(86_400));
    while running.load(Ordering::Acquire) {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        tokio::time::sleep(STEP.min(deadline - now)).await;
    }
}
