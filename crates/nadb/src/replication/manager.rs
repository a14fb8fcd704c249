use crate::buffers::OperationLog;
use crate::config::{Mode, ReplicationConfig};
use crate::error::{ReplicationError, Result};
use crate::replication::connection::{
    InboundPrimaryLink, OutboundReplicaLink, PrimaryLinkStats, ReplicaStats, SendOutcome,
};
use crate::types::{DeletePayload, Operation, SetPayload};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{MutexGuard, RwLock};
use tracing::{debug, error, info, warn};

/// Log entries replayed to a newly registered secondary
pub const CATCH_UP_LIMIT: usize = 1000;

/// Callback that applies a received operation to local storage
pub type ApplyFn = Arc<dyn Fn(&Operation) -> Result<()> + Send + Sync>;

/// Result of handing one received operation to the apply path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Heartbeat,
    /// Sequence already applied; nothing was done
    Duplicate,
    Applied,
    /// Applied although `missing` earlier sequences never arrived
    AppliedAfterGap { missing: u64 },
    /// The callback failed; the sequence still counts as consumed
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicationStats {
    pub mode: Mode,
    pub sequence_number: u64,
    pub operation_log_size: usize,
    pub role: RoleStats,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleStats {
    Primary {
        replica_count: usize,
        replicas: Vec<ReplicaStats>,
    },
    Secondary {
        primary: Option<PrimaryLinkStats>,
        last_applied_sequence: u64,
        operations_applied: u64,
        sequence_gaps: u64,
    },
}

struct PrimaryState {
    replicas: RwLock<HashMap<String, Arc<OutboundReplicaLink>>>,
    last_heartbeat: Mutex<Instant>,
    /// Held from sequence assignment until the operation is on every queue
    ordering: tokio::sync::Mutex<()>,
}

#[derive(Default)]
struct ApplyProgress {
    last_applied_sequence: u64,
    operations_applied: u64,
    sequence_gaps: u64,
}

struct SecondaryState {
    primary: RwLock<Option<Arc<InboundPrimaryLink>>>,
    apply: Option<ApplyFn>,
    progress: Mutex<ApplyProgress>,
}

enum Role {
    Primary(PrimaryState),
    Secondary(SecondaryState),
}

/// Sequencing, logging and fan-out of replicated operations
///
/// A primary-mode manager numbers operations, keeps the recent ones for
/// catch-up and sends them to every registered secondary. A secondary-mode
/// manager owns the link to the primary and runs the apply path. Calling a
/// method that belongs to the other mode returns
/// [`ReplicationError::WrongMode`].
pub struct ReplicationManager {
    config: ReplicationConfig,
    sequence_number: Mutex<u64>,
    log: Mutex<OperationLog>,
    role: Role,
}

impl ReplicationManager {
    pub fn new(config: ReplicationConfig, apply: Option<ApplyFn>) -> Self {
        let role = match config.mode {
            Mode::Primary => Role::Primary(PrimaryState {
                replicas: RwLock::new(HashMap::new()),
                last_heartbeat: Mutex::new(Instant::now()),
                ordering: tokio::sync::Mutex::new(()),
            }),
            Mode::Secondary => Role::Secondary(SecondaryState {
                primary: RwLock::new(None),
                apply,
                progress: Mutex::new(ApplyProgress::default()),
            }),
        };
        info!("Replication manager initialized in {} mode", config.mode);
        Self {
            log: Mutex::new(OperationLog::new(config.max_operation_log)),
            sequence_number: Mutex::new(0),
            config,
            role,
        }
    }

    pub fn primary(config: ReplicationConfig) -> Self {
        Self::new(ReplicationConfig { mode: Mode::Primary, ..config }, None)
    }

    pub fn secondary(config: ReplicationConfig, apply: ApplyFn) -> Self {
        Self::new(
            ReplicationConfig {
                mode: Mode::Secondary,
                ..config
            },
            Some(apply),
        )
    }

    pub fn mode(&self) -> Mode {
        self.config.mode
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    fn primary_state(&self, operation: &'static str) -> Result<&PrimaryState> {
        match &self.role {
            Role::Primary(state) => Ok(state),
            Role::Secondary(_) => Err(ReplicationError::WrongMode {
                operation,
                mode: self.mode(),
            }),
        }
    }

    fn secondary_state(&self, operation: &'static str) -> Result<&SecondaryState> {
        match &self.role {
            Role::Secondary(state) => Ok(state),
            Role::Primary(_) => Err(ReplicationError::WrongMode {
                operation,
                mode: self.mode(),
            }),
        }
    }

    /// Next sequence number (1, 2, ...)
    ///
    /// Only the increment is locked; `broadcast_set` and `broadcast_delete`
    /// call this under the broadcast ordering lock.
    pub fn next_sequence(&self) -> u64 {
        let mut sequence = self.sequence_number.lock();
        *sequence += 1;
        *sequence
    }

    pub fn current_sequence(&self) -> u64 {
        *self.sequence_number.lock()
    }

    pub fn log_len(&self) -> usize {
        self.log.lock().len()
    }

    /// Copy of every logged operation with `sequence >= from_sequence`
    pub fn operations_from(&self, from_sequence: u64) -> Vec<Operation> {
        self.log.lock().since(from_sequence)
    }

    // Primary

    /// Log an operation and send it to every registered secondary
    ///
    /// Returns the number of links that accepted it. Links whose send fails
    /// are unregistered once the fan-out is done; a link whose queue is full
    /// stays registered and counts the drop in its statistics.
    pub async fn broadcast(&self, operation: Operation) -> Result<usize> {
        let state = self.primary_state("broadcast")?;
        let ordering = state.ordering.lock().await;
        self.fan_out(state, ordering, &operation).await
    }

    /// Build, number and broadcast a SET
    pub async fn broadcast_set(&self, payload: SetPayload) -> Result<Operation> {
        let (state, ordering) = self.begin_write().await?;
        let operation = Operation::set(self.next_sequence(), payload);
        self.fan_out(state, ordering, &operation).await?;
        Ok(operation)
    }

    /// Build, number and broadcast a DELETE
    pub async fn broadcast_delete(&self, payload: DeletePayload) -> Result<Operation> {
        let (state, ordering) = self.begin_write().await?;
        let operation = Operation::delete(self.next_sequence(), payload);
        self.fan_out(state, ordering, &operation).await?;
        Ok(operation)
    }

    async fn begin_write(&self) -> Result<(&PrimaryState, MutexGuard<'_, ()>)> {
        let Role::Primary(state) = &self.role else {
            return Err(ReplicationError::read_only(
                "cannot create operations on a secondary",
            ));
        };
        let ordering = state.ordering.lock().await;
        Ok((state, ordering))
    }

    // Logging and enqueueing happen under `ordering`, so every link's queue
    // and the log see operations in sequence order. Socket writes for
    // blocking mode happen after it is released.
    async fn fan_out(
        &self,
        state: &PrimaryState,
        ordering: MutexGuard<'_, ()>,
        operation: &Operation,
    ) -> Result<usize> {
        self.log.lock().push(operation.clone());
        let targets: Vec<Arc<OutboundReplicaLink>> =
            state.replicas.read().await.values().cloned().collect();
        let mut outcomes: Vec<SendOutcome> =
            targets.iter().map(|link| link.enqueue(operation)).collect();
        drop(ordering);

        if !self.config.broadcast_async {
            for (link, outcome) in targets.iter().zip(outcomes.iter_mut()) {
                if outcome.accepted() {
                    *outcome = if link.flush().await {
                        SendOutcome::Sent
                    } else {
                        SendOutcome::Failed
                    };
                }
            }
        }

        let mut accepted = 0;
        let mut failed = Vec::new();
        for (link, outcome) in targets.iter().zip(&outcomes) {
            if outcome.accepted() {
                accepted += 1;
            } else if !link.is_connected() {
                failed.push(link.replica_id().to_string());
            }
        }

        for replica_id in failed {
            warn!(
                "Replica {} failed during broadcast of {}, unregistering",
                replica_id,
                operation.sequence()
            );
            self.unregister(&replica_id).await?;
        }

        debug!(
            "Broadcast {} {} to {}/{} replicas",
            operation.op_type(),
            operation.sequence(),
            accepted,
            targets.len()
        );
        Ok(accepted)
    }

    /// Add a secondary link and queue the recent log to it for catch-up
    ///
    /// An existing link with the same id is disconnected and replaced. The
    /// catch-up frames are queued under the broadcast ordering lock so no
    /// broadcast can overtake them or be queued twice.
    pub async fn register(&self, replica_id: &str, link: Arc<OutboundReplicaLink>) -> Result<()> {
        let state = self.primary_state("register")?;

        let (previous, catch_up, queued) = {
            let _ordering = state.ordering.lock().await;
            let mut replicas = state.replicas.write().await;
            let previous = replicas.insert(replica_id.to_string(), Arc::clone(&link));
            let catch_up = self.log.lock().tail(CATCH_UP_LIMIT);
            let queued = catch_up
                .iter()
                .filter(|operation| link.enqueue(operation).accepted())
                .count();
            (previous, catch_up.len(), queued)
        };

        if let Some(previous) = previous {
            warn!("Replacing existing link for replica {}", replica_id);
            previous.disconnect().await;
        }

        info!(
            "Registered replica {} from {} ({}/{} catch-up operations queued)",
            replica_id,
            link.address(),
            queued,
            catch_up
        );
        Ok(())
    }

    /// Remove a secondary link and close its socket
    pub async fn unregister(&self, replica_id: &str) -> Result<bool> {
        let state = self.primary_state("unregister")?;
        let removed = state.replicas.write().await.remove(replica_id);
        match removed {
            Some(link) => {
                link.disconnect().await;
                info!("Unregistered replica {}", replica_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Snapshot of the registered links
    pub async fn replicas(&self) -> Result<Vec<Arc<OutboundReplicaLink>>> {
        let state = self.primary_state("replicas")?;
        Ok(state.replicas.read().await.values().cloned().collect())
    }

    pub async fn replica_count(&self) -> usize {
        match &self.role {
            Role::Primary(state) => state.replicas.read().await.len(),
            Role::Secondary(_) => 0,
        }
    }

    /// Send a heartbeat to every link if the interval has elapsed
    ///
    /// Returns whether a heartbeat went out. The heartbeat carries the
    /// current sequence number without consuming a new one.
    pub async fn send_heartbeat(&self) -> Result<bool> {
        let state = self.primary_state("send_heartbeat")?;
        {
            let mut last = state.last_heartbeat.lock();
            if last.elapsed() < self.config.heartbeat_interval() {
                return Ok(false);
            }
            *last = Instant::now();
        }

        let _ordering = state.ordering.lock().await;
        let heartbeat = Operation::heartbeat(self.current_sequence());
        let targets: Vec<Arc<OutboundReplicaLink>> =
            state.replicas.read().await.values().cloned().collect();
        for link in &targets {
            link.enqueue(&heartbeat);
            link.update_heartbeat();
        }
        debug!("Sent heartbeat to {} replicas", targets.len());
        Ok(true)
    }

    /// Drain every link's outbound queue once. Returns frames sent.
    pub async fn process_replica_queues(&self) -> Result<usize> {
        let mut sent = 0;
        for link in self.replicas().await? {
            sent += link.drain_queue().await;
        }
        Ok(sent)
    }

    /// Unregister links that are disconnected or whose lag exceeds `max_lag`
    pub async fn evict_stale(&self, max_lag: Duration) -> Result<Vec<String>> {
        let mut evicted = Vec::new();
        for link in self.replicas().await? {
            let lag = link.lag();
            if !link.is_connected() {
                warn!("Replica {} disconnected, evicting", link.replica_id());
            } else if lag > max_lag {
                let timeout = ReplicationError::ReplicaTimeout {
                    replica_id: link.replica_id().to_string(),
                    lag,
                };
                warn!("{}, evicting", timeout);
            } else {
                continue;
            }
            if self.unregister(link.replica_id()).await? {
                evicted.push(link.replica_id().to_string());
            }
        }
        Ok(evicted)
    }

    // Secondary

    /// Connect (or reconnect) to the primary
    pub async fn connect(&self, host: &str, port: u16) -> Result<()> {
        let state = self.secondary_state("connect")?;
        let link = {
            let mut primary = state.primary.write().await;
            let existing = primary
                .as_ref()
                .filter(|link| link.host() == host && link.port() == port)
                .cloned();
            match existing {
                Some(link) => link,
                None => {
                    if let Some(old) = primary.take() {
                        old.disconnect().await;
                    }
                    let link = Arc::new(InboundPrimaryLink::new(host, port));
                    *primary = Some(Arc::clone(&link));
                    link
                }
            }
        };
        link.connect().await
    }

    pub async fn primary_link(&self) -> Option<Arc<InboundPrimaryLink>> {
        match &self.role {
            Role::Secondary(state) => state.primary.read().await.clone(),
            Role::Primary(_) => None,
        }
    }

    pub async fn is_connected_to_primary(&self) -> bool {
        match self.primary_link().await {
            Some(link) => link.is_connected(),
            None => false,
        }
    }

    /// One bounded read from the primary, applying whatever arrived
    ///
    /// Returns the number of operations dispatched to the apply path.
    pub async fn receive(&self) -> Result<usize> {
        let state = self.secondary_state("receive")?;
        let Some(link) = state.primary.read().await.clone() else {
            return Err(ReplicationError::connection(
                "no primary configured",
                None,
            ));
        };
        if !link.is_connected() {
            link.connect().await?;
        }
        link.receive_once(|operation| {
            self.apply_received(state, &operation);
        })
        .await
    }

    /// Apply one operation received from the primary
    pub fn handle_received(&self, operation: &Operation) -> Result<ApplyOutcome> {
        let state = self.secondary_state("handle_received")?;
        Ok(self.apply_received(state, operation))
    }

    fn apply_received(&self, state: &SecondaryState, operation: &Operation) -> ApplyOutcome {
        if operation.is_heartbeat() {
            return ApplyOutcome::Heartbeat;
        }

        let mut progress = state.progress.lock();
        let sequence = operation.sequence();
        if sequence <= progress.last_applied_sequence {
            debug!(
                "Skipping already applied operation {} (last applied {})",
                sequence, progress.last_applied_sequence
            );
            return ApplyOutcome::Duplicate;
        }

        let expected = progress.last_applied_sequence + 1;
        let missing = sequence - expected;
        if missing > 0 {
            warn!(
                "Sequence gap: expected {}, got {} ({} operations missing)",
                expected, sequence, missing
            );
            progress.sequence_gaps += 1;
        }

        let applied = match &state.apply {
            Some(apply) => apply(operation),
            None => Ok(()),
        };
        progress.last_applied_sequence = sequence;
        self.log.lock().push(operation.clone());

        match applied {
            Ok(()) => {
                progress.operations_applied += 1;
                debug!("Applied {} {}", operation.op_type(), sequence);
                if missing > 0 {
                    ApplyOutcome::AppliedAfterGap { missing }
                } else {
                    ApplyOutcome::Applied
                }
            }
            Err(e) => {
                error!(
                    "Error applying {} {}: {}",
                    operation.op_type(),
                    sequence,
                    e
                );
                ApplyOutcome::Failed
            }
        }
    }

    pub fn last_applied_sequence(&self) -> u64 {
        match &self.role {
            Role::Secondary(state) => state.progress.lock().last_applied_sequence,
            Role::Primary(_) => 0,
        }
    }

    pub async fn stats(&self) -> ReplicationStats {
        let role = match &self.role {
            Role::Primary(state) => {
                let replicas: Vec<ReplicaStats> = state
                    .replicas
                    .read()
                    .await
                    .values()
                    .map(|link| link.stats())
                    .collect();
                RoleStats::Primary {
                    replica_count: replicas.len(),
                    replicas,
                }
            }
            Role::Secondary(state) => {
                let primary = state.primary.read().await.as_ref().map(|link| link.stats());
                let progress = state.progress.lock();
                RoleStats::Secondary {
                    primary,
                    last_applied_sequence: progress.last_applied_sequence,
                    operations_applied: progress.operations_applied,
                    sequence_gaps: progress.sequence_gaps,
                }
            }
        };

        ReplicationStats {
            mode: self.mode(),
            sequence_number: self.current_sequence(),
            operation_log_size: self.log_len(),
            role,
        }
    }

    /// Disconnect every link (primary) or the primary link (secondary)
    pub async fn shutdown(&self) {
        match &self.role {
            Role::Primary(state) => {
                let links: Vec<Arc<OutboundReplicaLink>> =
                    state.replicas.write().await.drain().map(|(_, link)| link).collect();
                for link in links {
                    link.disconnect().await;
                }
            }
            Role::Secondary(state) => {
                if let Some(link) = state.primary.read().await.as_ref() {
                    link.disconnect().await;
                }
            }
        }
        info!("Replication manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode;
    use crate::protocol::FrameDecode;
    use bytes::{Buf, BytesMut};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    fn primary_manager() -> ReplicationManager {
        ReplicationManager::primary(ReplicationConfig::primary("127.0.0.1", 0))
    }

    fn counting_secondary() -> (ReplicationManager, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let apply: ApplyFn = Arc::new(move |_op: &Operation| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let manager =
            ReplicationManager::secondary(ReplicationConfig::secondary("127.0.0.1", 9000), apply);
        (manager, calls)
    }

    fn set_op(sequence: u64) -> Operation {
        Operation::set(sequence, SetPayload::new("k", &b"v"[..], "db", "ns"))
    }

    async fn link_pair(id: &str) -> (Arc<OutboundReplicaLink>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (Arc::new(OutboundReplicaLink::new(id, server, peer)), client)
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let manager = primary_manager();
        let seqs: Vec<u64> = (0..100).map(|_| manager.next_sequence()).collect();
        assert_eq!(seqs, (1..=100).collect::<Vec<u64>>());
        assert_eq!(manager.current_sequence(), 100);
    }

    #[test]
    fn test_sequence_unique_across_threads() {
        let manager = Arc::new(primary_manager());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    (0..250).map(|_| manager.next_sequence()).collect::<Vec<u64>>()
                })
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (1..=1000).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_broadcast_without_replicas_is_zero() {
        let manager = primary_manager();
        let op = manager
            .broadcast_set(SetPayload::new("k", &b"v"[..], "db", "ns"))
            .await
            .unwrap();

        assert_eq!(op.sequence(), 1);
        assert_eq!(manager.log_len(), 1);
        assert_eq!(manager.broadcast(set_op(2)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_log_is_bounded() {
        let mut config = ReplicationConfig::primary("127.0.0.1", 0);
        config.max_operation_log = 5;
        let manager = ReplicationManager::primary(config);

        for _ in 0..12 {
            let seq = manager.next_sequence();
            manager.broadcast(set_op(seq)).await.unwrap();
        }

        let seqs: Vec<u64> = manager
            .operations_from(0)
            .iter()
            .map(Operation::sequence)
            .collect();
        assert_eq!(seqs, vec![8, 9, 10, 11, 12]);
        assert_eq!(manager.operations_from(11).len(), 2);
    }

    #[tokio::test]
    async fn test_wrong_mode_fails_fast() {
        let (secondary, _) = counting_secondary();
        let err = secondary.broadcast(set_op(1)).await.unwrap_err();
        assert!(matches!(
            err,
            ReplicationError::WrongMode {
                operation: "broadcast",
                mode: Mode::Secondary
            }
        ));
        assert_eq!(secondary.log_len(), 0);

        let err = secondary
            .broadcast_set(SetPayload::new("k", &b"v"[..], "db", "ns"))
            .await
            .unwrap_err();
        assert!(err.is_read_only());
        assert_eq!(secondary.current_sequence(), 0);

        let primary = primary_manager();
        assert!(matches!(
            primary.connect("127.0.0.1", 1).await,
            Err(ReplicationError::WrongMode { .. })
        ));
        assert!(matches!(
            primary.handle_received(&set_op(1)),
            Err(ReplicationError::WrongMode { .. })
        ));
    }

    #[test]
    fn test_apply_path_skips_heartbeats_and_replays() {
        let (manager, calls) = counting_secondary();

        assert_eq!(
            manager.handle_received(&Operation::heartbeat(0)).unwrap(),
            ApplyOutcome::Heartbeat
        );
        assert_eq!(manager.handle_received(&set_op(1)).unwrap(), ApplyOutcome::Applied);
        assert_eq!(manager.handle_received(&set_op(2)).unwrap(), ApplyOutcome::Applied);
        assert_eq!(
            manager.handle_received(&set_op(2)).unwrap(),
            ApplyOutcome::Duplicate
        );
        assert_eq!(
            manager.handle_received(&set_op(1)).unwrap(),
            ApplyOutcome::Duplicate
        );

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(manager.last_applied_sequence(), 2);
        assert_eq!(manager.log_len(), 2);
    }

    #[tokio::test]
    async fn test_apply_path_tolerates_gap() {
        let (manager, calls) = counting_secondary();

        manager.handle_received(&set_op(1)).unwrap();
        assert_eq!(
            manager.handle_received(&set_op(5)).unwrap(),
            ApplyOutcome::AppliedAfterGap { missing: 3 }
        );
        assert_eq!(manager.last_applied_sequence(), 5);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        match manager.stats().await.role {
            RoleStats::Secondary {
                sequence_gaps,
                operations_applied,
                ..
            } => {
                assert_eq!(sequence_gaps, 1);
                assert_eq!(operations_applied, 2);
            }
            other => panic!("unexpected role stats: {:?}", other),
        }
    }

    #[test]
    fn test_failed_apply_still_consumes_sequence() {
        let apply: ApplyFn = Arc::new(|op: &Operation| {
            Err(ReplicationError::UnsupportedOperation(op.op_type()))
        });
        let manager =
            ReplicationManager::secondary(ReplicationConfig::secondary("127.0.0.1", 9000), apply);

        assert_eq!(manager.handle_received(&set_op(1)).unwrap(), ApplyOutcome::Failed);
        assert_eq!(manager.last_applied_sequence(), 1);
        assert_eq!(
            manager.handle_received(&set_op(1)).unwrap(),
            ApplyOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn test_register_queues_catch_up() {
        let manager = primary_manager();
        for _ in 0..5 {
            let seq = manager.next_sequence();
            manager.broadcast(set_op(seq)).await.unwrap();
        }

        let (link, mut client) = link_pair("replica-a").await;
        manager.register("replica-a", Arc::clone(&link)).await.unwrap();
        assert_eq!(link.queue_len(), 5);
        assert_eq!(manager.replica_count().await, 1);

        assert_eq!(manager.process_replica_queues().await.unwrap(), 5);

        let mut buf = BytesMut::new();
        let mut seqs = Vec::new();
        while seqs.len() < 5 {
            client.read_buf(&mut buf).await.unwrap();
            while let FrameDecode::Complete {
                operation,
                consumed,
            } = decode(&buf)
            {
                buf.advance(consumed);
                seqs.push(operation.sequence());
            }
        }
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_register_replaces_existing_link() {
        let manager = primary_manager();
        let (first, _c1) = link_pair("replica-a").await;
        let (second, _c2) = link_pair("replica-a").await;

        manager.register("replica-a", Arc::clone(&first)).await.unwrap();
        manager.register("replica-a", Arc::clone(&second)).await.unwrap();

        assert_eq!(manager.replica_count().await, 1);
        assert!(!first.is_connected());
        assert!(second.is_connected());
    }

    #[tokio::test]
    async fn test_broadcast_unregisters_dead_links() {
        let manager = primary_manager();
        let (live, _c1) = link_pair("live").await;
        let (dead, _c2) = link_pair("dead").await;
        manager.register("live", live).await.unwrap();
        manager.register("dead", Arc::clone(&dead)).await.unwrap();

        dead.disconnect().await;

        let seq = manager.next_sequence();
        assert_eq!(manager.broadcast(set_op(seq)).await.unwrap(), 1);
        assert_eq!(manager.replica_count().await, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_is_rate_limited() {
        let mut config = ReplicationConfig::primary("127.0.0.1", 0);
        config.heartbeat_interval_secs = 0.0;
        let manager = ReplicationManager::primary(config);
        assert!(manager.send_heartbeat().await.unwrap());

        let slow = ReplicationManager::primary(ReplicationConfig::primary("127.0.0.1", 0));
        assert!(!slow.send_heartbeat().await.unwrap());
        // Heartbeats never consume a sequence number
        assert_eq!(manager.current_sequence(), 0);
    }

    #[tokio::test]
    async fn test_evict_stale_removes_disconnected() {
        let manager = primary_manager();
        let (link, _client) = link_pair("replica-a").await;
        manager.register("replica-a", Arc::clone(&link)).await.unwrap();

        assert!(manager
            .evict_stale(Duration::from_secs(60))
            .await
            .unwrap()
            .is_empty());

        link.disconnect().await;
        let evicted = manager.evict_stale(Duration::from_secs(60)).await.unwrap();
        assert_eq!(evicted, vec!["replica-a".to_string()]);
        assert_eq!(manager.replica_count().await, 0);
    }

    #[tokio::test]
    async fn test_evict_stale_removes_lagging_link() {
        let manager = primary_manager();
        let (link, _client) = link_pair("replica-a").await;
        manager.register("replica-a", Arc::clone(&link)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let evicted = manager.evict_stale(Duration::ZERO).await.unwrap();
        assert_eq!(evicted, vec!["replica-a".to_string()]);
        assert_eq!(manager.replica_count().await, 0);
        assert!(!link.is_connected());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_broadcasts_log_in_order() {
        let manager = Arc::new(primary_manager());
        let writers: Vec<_> = (0..8)
            .map(|w| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    for i in 0..500 {
                        let key = format!("w{}-{}", w, i);
                        manager
                            .broadcast_set(SetPayload::new(key, &b"v"[..], "db", "ns"))
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let seqs: Vec<u64> = manager
            .operations_from(0)
            .iter()
            .map(Operation::sequence)
            .collect();
        assert_eq!(seqs, (1..=4000).collect::<Vec<u64>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_all_applied_on_secondary() {
        let mut config = ReplicationConfig::primary("127.0.0.1", 0);
        config.broadcast_async = false;
        let primary = Arc::new(ReplicationManager::primary(config));
        let (link, mut client) = link_pair("replica-a").await;
        primary.register("replica-a", link).await.unwrap();

        let total = 8 * 250;
        let reader = tokio::spawn(async move {
            let (secondary, calls) = counting_secondary();
            let mut buf = BytesMut::new();
            let mut outcomes = Vec::new();
            while outcomes.len() < total {
                client.read_buf(&mut buf).await.unwrap();
                while let FrameDecode::Complete {
                    operation,
                    consumed,
                } = decode(&buf)
                {
                    buf.advance(consumed);
                    outcomes.push(secondary.handle_received(&operation).unwrap());
                }
            }
            (outcomes, calls.load(Ordering::SeqCst), secondary.last_applied_sequence())
        });

        let writers: Vec<_> = (0..8)
            .map(|w| {
                let primary = Arc::clone(&primary);
                tokio::spawn(async move {
                    for i in 0..250 {
                        let key = format!("w{}-{}", w, i);
                        primary
                            .broadcast_set(SetPayload::new(key, &b"v"[..], "db", "ns"))
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let (outcomes, applied, last) = reader.await.unwrap();
        assert!(outcomes.iter().all(|o| *o == ApplyOutcome::Applied));
        assert_eq!(applied, total);
        assert_eq!(last, total as u64);
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_links() {
        let manager = primary_manager();
        let (link, _client) = link_pair("replica-a").await;
        manager.register("replica-a", Arc::clone(&link)).await.unwrap();

        manager.shutdown().await;
        assert!(!link.is_connected());
        assert_eq!(manager.replica_count().await, 0);
    }
}
