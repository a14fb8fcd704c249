use crate::config::{Mode, ReplicationConfig};
use crate::error::{ReplicationError, Result};
use crate::replication::{
    ApplyFn, ClientStats, ReplicationClient, ReplicationManager, ReplicationServer,
    ReplicationStats, ServerStats,
};
use crate::storage::{StorageBackend, key_path};
use crate::types::{DeletePayload, OpKind, Operation, SetPayload};
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

/// Database and namespace stamped on replicated operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteContext {
    pub db: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkSyncStats {
    #[serde(flatten)]
    pub replication: ReplicationStats,
    pub server: Option<ServerStats>,
    pub client: Option<ClientStats>,
}

/// Storage decorator that replicates writes from a primary to secondaries
///
/// On a primary, plain `write`/`delete` only touch the local backend;
/// `write_replicated`/`delete_replicated` also broadcast the logical
/// operation. On a secondary every mutating call fails with a read-only
/// error and the local backend is only changed by operations arriving from
/// the primary. Reads always go to the local backend.
pub struct NetworkSyncStorage<B: StorageBackend> {
    base: Arc<B>,
    manager: Arc<ReplicationManager>,
    server: Option<ReplicationServer>,
    client: Option<ReplicationClient>,
    context: RwLock<Option<WriteContext>>,
}

impl<B: StorageBackend + 'static> NetworkSyncStorage<B> {
    /// Wrap `base` as a primary and start accepting secondaries
    pub async fn start_primary(base: B, config: ReplicationConfig) -> Result<Self> {
        config.validate()?;
        let manager = Arc::new(ReplicationManager::primary(config));
        let mut server = ReplicationServer::new(Arc::clone(&manager), manager.config().listen_addr());
        server.start().await?;

        let mut storage = Self::with_manager(Arc::new(base), manager);
        storage.server = Some(server);
        Ok(storage)
    }

    /// Wrap `base` as a secondary and start following the primary
    pub fn start_secondary(base: B, config: ReplicationConfig) -> Result<Self> {
        config.validate()?;
        let primary_host = config
            .primary_host
            .clone()
            .ok_or_else(|| ReplicationError::Config("primary_host is required".to_string()))?;
        let primary_port = config.primary_port;

        let base = Arc::new(base);
        let manager = Arc::new(ReplicationManager::secondary(
            config,
            Self::apply_callback(Arc::clone(&base)),
        ));
        let mut client = ReplicationClient::new(Arc::clone(&manager), primary_host, primary_port);
        client.start();

        let mut storage = Self::with_manager(base, manager);
        storage.client = Some(client);
        Ok(storage)
    }

    /// Wrap `base` around an existing manager without starting any network
    /// tasks. A secondary-mode manager should have been built with
    /// [`apply_callback`](Self::apply_callback) over the same backend.
    pub fn with_manager(base: Arc<B>, manager: Arc<ReplicationManager>) -> Self {
        Self {
            base,
            manager,
            server: None,
            client: None,
            context: RwLock::new(None),
        }
    }

    /// Callback that applies received operations to `base`
    pub fn apply_callback(base: Arc<B>) -> ApplyFn {
        Arc::new(move |operation: &Operation| apply_operation(base.as_ref(), operation))
    }
}

impl<B: StorageBackend> NetworkSyncStorage<B> {
    pub fn mode(&self) -> Mode {
        self.manager.mode()
    }

    pub fn manager(&self) -> &Arc<ReplicationManager> {
        &self.manager
    }

    pub fn base(&self) -> &Arc<B> {
        &self.base
    }

    /// Address the replication server bound to (primary only)
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().and_then(ReplicationServer::local_addr)
    }

    pub fn set_context(&self, db: impl Into<String>, namespace: impl Into<String>) {
        *self.context.write() = Some(WriteContext {
            db: db.into(),
            namespace: namespace.into(),
        });
    }

    pub fn context(&self) -> Option<WriteContext> {
        self.context.read().clone()
    }

    fn ensure_writable(&self, action: &str) -> Result<()> {
        match self.mode() {
            Mode::Primary => Ok(()),
            Mode::Secondary => Err(ReplicationError::read_only(format!(
                "Cannot {} secondary replica",
                action
            ))),
        }
    }

    /// Local write without replication
    pub fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.ensure_writable("write to")?;
        self.base.write(path, data)?;
        Ok(())
    }

    /// Local write followed by a broadcast SET
    ///
    /// The broadcast only happens when a context is set; the returned
    /// operation is `None` otherwise.
    pub async fn write_replicated(
        &self,
        path: &str,
        data: impl Into<Bytes>,
        key: &str,
        tags: &[String],
        ttl_seconds: Option<u64>,
    ) -> Result<Option<Operation>> {
        self.ensure_writable("write to")?;
        let data = data.into();
        self.base.write(path, &data)?;

        let Some(context) = self.context() else {
            debug!("No context set, not replicating write of {}", key);
            return Ok(None);
        };
        let payload = SetPayload::new(key, data, context.db, context.namespace)
            .with_tags(tags.iter().cloned())
            .with_ttl(ttl_seconds);
        Ok(Some(self.manager.broadcast_set(payload).await?))
    }

    /// Local delete without replication
    pub fn delete(&self, path: &str) -> Result<bool> {
        self.ensure_writable("delete from")?;
        Ok(self.base.delete(path)?)
    }

    /// Local delete followed by a broadcast DELETE
    pub async fn delete_replicated(&self, path: &str, key: &str) -> Result<bool> {
        self.ensure_writable("delete from")?;
        let removed = self.base.delete(path)?;

        if let Some(context) = self.context() {
            self.manager
                .broadcast_delete(DeletePayload::new(key, context.db, context.namespace))
                .await?;
        }
        Ok(removed)
    }

    pub fn read(&self, path: &str) -> Result<Option<Bytes>> {
        Ok(self.base.read(path)?)
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.base.exists(path)?)
    }

    pub fn size(&self, path: &str) -> Result<u64> {
        Ok(self.base.size(path)?)
    }

    pub fn ensure_directory(&self, path: &str) -> Result<()> {
        Ok(self.base.ensure_directory(path)?)
    }

    pub async fn stats(&self) -> NetworkSyncStats {
        let server = match &self.server {
            Some(server) => Some(server.stats().await),
            None => None,
        };
        let client = match &self.client {
            Some(client) => Some(client.stats().await),
            None => None,
        };
        NetworkSyncStats {
            replication: self.manager.stats().await,
            server,
            client,
        }
    }

    /// Stop the server or client and shut the manager down
    pub async fn close(&mut self) {
        if let Some(server) = self.server.as_mut() {
            server.stop().await;
        }
        if let Some(client) = self.client.as_mut() {
            client.stop().await;
        }
        self.manager.shutdown().await;
        info!("Network sync storage closed");
    }
}

/// Apply one operation from the primary to a local backend
pub fn apply_operation<B: StorageBackend + ?Sized>(base: &B, operation: &Operation) -> Result<()> {
    match operation.kind() {
        OpKind::Set(payload) => {
            let path = key_path(&payload.db, &payload.namespace, &payload.key);
            base.write(&path, &payload.value)?;
            debug!("Applied SET {} at {}", payload.key, path);
            Ok(())
        }
        OpKind::Delete(payload) => {
            let path = key_path(&payload.db, &payload.namespace, &payload.key);
            base.delete(&path)?;
            debug!("Applied DELETE {} at {}", payload.key, path);
            Ok(())
        }
        OpKind::Heartbeat => Ok(()),
        OpKind::SyncRequest { .. }
        | OpKind::SetTtl(_)
        | OpKind::Flush(_)
        | OpKind::Metadata(_)
        | OpKind::SyncResponse(_) => Err(ReplicationError::UnsupportedOperation(operation.op_type())),
    }
}
