use crate::buffers::{QueuedFrame, SendQueue};
use crate::error::{ReplicationError, Result};
use crate::protocol::{FrameCodec, FrameDecode};
use crate::types::Operation;
use bytes::{Buf, BytesMut};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Outbound queue capacity per secondary
pub const SEND_QUEUE_CAPACITY: usize = 1000;
/// Frames sent per `drain_queue` call
pub const DRAIN_BATCH: usize = 100;
/// Write timeout for a frame to a secondary
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(30);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on a single read from the primary
pub const READ_TIMEOUT: Duration = Duration::from_millis(500);
pub const BACKOFF_FLOOR: Duration = Duration::from_secs(1);
pub const BACKOFF_CEILING: Duration = Duration::from_secs(60);

const READ_CHUNK: usize = 64 * 1024;

/// What happened to an operation handed to [`OutboundReplicaLink::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the socket
    Sent,
    /// Accepted onto the outbound queue
    Queued,
    /// Queue full; the operation was discarded for this link
    Dropped,
    /// The link is down or the write failed
    Failed,
}

impl SendOutcome {
    pub fn accepted(&self) -> bool {
        matches!(self, SendOutcome::Sent | SendOutcome::Queued)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicaStats {
    pub replica_id: String,
    pub address: String,
    pub connected: bool,
    pub lag_seconds: f64,
    pub last_sequence: u64,
    pub operations_sent: u64,
    pub bytes_sent: u64,
    pub errors: u64,
    pub dropped_operations: u64,
    pub queue_size: usize,
}

/// Primary-side link to one secondary
///
/// Owns the socket and a bounded outbound queue. Counters are atomics so
/// statistics can be read while a send is in flight.
pub struct OutboundReplicaLink {
    replica_id: String,
    address: SocketAddr,
    stream: Mutex<Option<TcpStream>>,
    connected: AtomicBool,
    queue: SendQueue,
    codec: FrameCodec,
    last_heartbeat: parking_lot::Mutex<Instant>,
    last_sequence: AtomicU64,
    operations_sent: AtomicU64,
    bytes_sent: AtomicU64,
    errors: AtomicU64,
    dropped: AtomicU64,
}

impl OutboundReplicaLink {
    pub fn new(replica_id: impl Into<String>, stream: TcpStream, address: SocketAddr) -> Self {
        Self::with_queue_capacity(replica_id, stream, address, SEND_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(
        replica_id: impl Into<String>,
        stream: TcpStream,
        address: SocketAddr,
        queue_capacity: usize,
    ) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", address, e);
        }
        Self {
            replica_id: replica_id.into(),
            address,
            stream: Mutex::new(Some(stream)),
            connected: AtomicBool::new(true),
            queue: SendQueue::new(queue_capacity),
            codec: FrameCodec::default(),
            last_heartbeat: parking_lot::Mutex::new(Instant::now()),
            last_sequence: AtomicU64::new(0),
            operations_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Send an operation to the secondary
    ///
    /// With `blocking` the frame is written before returning (any frames
    /// still queued go first, so order is kept). Otherwise it is queued for
    /// the maintenance loop; a full queue drops it.
    pub async fn send(&self, operation: &Operation, blocking: bool) -> SendOutcome {
        if !blocking {
            return self.enqueue(operation);
        }
        let Some(item) = self.encode_frame(operation) else {
            return SendOutcome::Failed;
        };

        let mut stream = self.stream.lock().await;
        self.drain_locked(&mut stream, usize::MAX).await;
        if self.write_frame(&mut stream, &item).await {
            SendOutcome::Sent
        } else {
            SendOutcome::Failed
        }
    }

    /// Queue an operation without touching the socket
    pub fn enqueue(&self, operation: &Operation) -> SendOutcome {
        let Some(item) = self.encode_frame(operation) else {
            return SendOutcome::Failed;
        };
        if self.queue.try_push(item) {
            SendOutcome::Queued
        } else {
            warn!(
                "Send queue full for replica {}, dropping operation {}",
                self.replica_id,
                operation.sequence()
            );
            self.dropped.fetch_add(1, Ordering::Relaxed);
            SendOutcome::Dropped
        }
    }

    fn encode_frame(&self, operation: &Operation) -> Option<QueuedFrame> {
        if !self.is_connected() {
            return None;
        }
        match self.codec.encode(operation) {
            Ok(frame) => Some(QueuedFrame {
                sequence: operation.sequence(),
                frame,
            }),
            Err(e) => {
                error!(
                    "Error encoding operation {} for {}: {}",
                    operation.sequence(),
                    self.replica_id,
                    e
                );
                self.errors.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Send up to [`DRAIN_BATCH`] queued frames
    ///
    /// Stops at the first failure, putting that frame back at the head of the
    /// queue. Returns the number of frames sent.
    pub async fn drain_queue(&self) -> usize {
        let mut stream = self.stream.lock().await;
        self.drain_locked(&mut stream, DRAIN_BATCH).await
    }

    /// Write every queued frame. Returns whether the link is still up.
    pub async fn flush(&self) -> bool {
        let mut stream = self.stream.lock().await;
        self.drain_locked(&mut stream, usize::MAX).await;
        self.is_connected()
    }

    // Frames are popped only while the stream is held, so concurrent
    // drainers cannot reorder them on the wire.
    async fn drain_locked(&self, stream: &mut Option<TcpStream>, limit: usize) -> usize {
        let mut sent = 0;
        while sent < limit {
            let Some(item) = self.queue.pop() else {
                break;
            };
            if self.write_frame(stream, &item).await {
                sent += 1;
            } else {
                self.queue.requeue(item);
                break;
            }
        }
        sent
    }

    async fn write_frame(&self, guard: &mut Option<TcpStream>, item: &QueuedFrame) -> bool {
        let Some(stream) = guard.as_mut() else {
            return false;
        };

        let result = timeout(SOCKET_TIMEOUT, stream.write_all(&item.frame)).await;
        match result {
            Ok(Ok(())) => {
                self.operations_sent.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent
                    .fetch_add(item.frame.len() as u64, Ordering::Relaxed);
                self.last_sequence.store(item.sequence, Ordering::Relaxed);
                true
            }
            Ok(Err(e)) => {
                error!("Error sending to replica {}: {}", self.replica_id, e);
                self.errors.fetch_add(1, Ordering::Relaxed);
                self.close(guard);
                false
            }
            Err(_) => {
                error!(
                    "Timeout sending to replica {} after {:?}",
                    self.replica_id, SOCKET_TIMEOUT
                );
                self.errors.fetch_add(1, Ordering::Relaxed);
                self.close(guard);
                false
            }
        }
    }

    /// Refresh the liveness timestamp
    pub fn update_heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    /// Time since the last heartbeat refresh
    pub fn lag(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn dropped_operations(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close the socket. Calling this more than once is a no-op.
    pub async fn disconnect(&self) {
        let mut guard = self.stream.lock().await;
        self.close(&mut guard);
    }

    fn close(&self, stream: &mut Option<TcpStream>) {
        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        if stream.take().is_some() || was_connected {
            info!("Disconnected from replica {}", self.replica_id);
        }
    }

    pub fn stats(&self) -> ReplicaStats {
        ReplicaStats {
            replica_id: self.replica_id.clone(),
            address: self.address.to_string(),
            connected: self.is_connected(),
            lag_seconds: self.lag().as_secs_f64(),
            last_sequence: self.last_sequence.load(Ordering::Relaxed),
            operations_sent: self.operations_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            dropped_operations: self.dropped.load(Ordering::Relaxed),
            queue_size: self.queue.len(),
        }
    }
}

/// Reconnect throttle: doubling delay between attempts, reset on success
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    floor: Duration,
    ceiling: Duration,
    last_attempt: Option<Instant>,
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            current: floor,
            floor,
            ceiling,
            last_attempt: None,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Whether enough time has passed since the last attempt
    pub fn ready(&self, now: Instant) -> bool {
        match self.last_attempt {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.current,
        }
    }

    pub fn record_attempt(&mut self, now: Instant) {
        self.last_attempt = Some(now);
    }

    pub fn increase(&mut self) {
        self.current = (self.current * 2).min(self.ceiling);
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BACKOFF_FLOOR, BACKOFF_CEILING)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PrimaryLinkStats {
    pub host: String,
    pub port: u16,
    pub connected: bool,
    pub operations_received: u64,
    pub bytes_received: u64,
    pub reconnections: u64,
    pub seconds_since_last_operation: f64,
    pub reconnect_backoff_seconds: f64,
}

struct LinkIo {
    stream: Option<TcpStream>,
    buffer: BytesMut,
}

/// Secondary-side link to the primary
///
/// Owns the socket and the receive buffer where partial frames wait for the
/// rest of their bytes.
pub struct InboundPrimaryLink {
    host: String,
    port: u16,
    io: Mutex<LinkIo>,
    connected: AtomicBool,
    backoff: parking_lot::Mutex<Backoff>,
    codec: FrameCodec,
    operations_received: AtomicU64,
    bytes_received: AtomicU64,
    reconnections: AtomicU64,
    last_operation: parking_lot::Mutex<Instant>,
}

impl InboundPrimaryLink {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::with_backoff(host, port, Backoff::default())
    }

    pub fn with_backoff(host: impl Into<String>, port: u16, backoff: Backoff) -> Self {
        Self {
            host: host.into(),
            port,
            io: Mutex::new(LinkIo {
                stream: None,
                buffer: BytesMut::with_capacity(READ_CHUNK),
            }),
            connected: AtomicBool::new(false),
            backoff: parking_lot::Mutex::new(backoff),
            codec: FrameCodec::default(),
            operations_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            reconnections: AtomicU64::new(0),
            last_operation: parking_lot::Mutex::new(Instant::now()),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        self.backoff.lock().current()
    }

    /// Connect to the primary, subject to the reconnect backoff
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        {
            let mut backoff = self.backoff.lock();
            let now = Instant::now();
            if !backoff.ready(now) {
                return Err(ReplicationError::connection(
                    format!("reconnect backoff of {:?} not elapsed", backoff.current()),
                    Some(self.addr()),
                ));
            }
            backoff.record_attempt(now);
        }

        let addr = self.addr();
        let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!("Failed to connect to primary {}: {}", addr, e);
                self.backoff.lock().increase();
                return Err(ReplicationError::connection(e.to_string(), Some(addr)));
            }
            Err(_) => {
                error!("Timeout connecting to primary {}", addr);
                self.backoff.lock().increase();
                return Err(ReplicationError::connection(
                    format!("connect timed out after {:?}", CONNECT_TIMEOUT),
                    Some(addr),
                ));
            }
        };

        let mut io = self.io.lock().await;
        io.stream = Some(stream);
        // Bytes from a previous connection can never complete a frame
        io.buffer.clear();
        self.connected.store(true, Ordering::Release);
        self.backoff.lock().reset();
        self.reconnections.fetch_add(1, Ordering::Relaxed);
        info!("Connected to primary at {}", addr);
        Ok(())
    }

    /// One bounded read from the primary, dispatching every complete frame
    ///
    /// Returns the number of operations handed to `on_operation`. A read that
    /// times out without data is `Ok(0)`. A closed or failed socket
    /// disconnects the link and returns a connection error.
    pub async fn receive_once<F>(&self, mut on_operation: F) -> Result<usize>
    where
        F: FnMut(Operation),
    {
        let mut io = self.io.lock().await;
        let io = &mut *io;
        let Some(stream) = io.stream.as_mut() else {
            return Err(ReplicationError::connection(
                "not connected to primary",
                Some(self.addr()),
            ));
        };

        io.buffer.reserve(READ_CHUNK);
        let read = match timeout(READ_TIMEOUT, stream.read_buf(&mut io.buffer)).await {
            Err(_) => return Ok(0),
            Ok(result) => result,
        };

        match read {
            Ok(0) => {
                warn!("Primary {} closed connection", self.addr());
                self.close(io);
                Err(ReplicationError::connection(
                    "primary closed connection",
                    Some(self.addr()),
                ))
            }
            Ok(n) => {
                self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                Ok(self.process_buffer(&mut io.buffer, &mut on_operation))
            }
            Err(e) => {
                error!("Error receiving from primary {}: {}", self.addr(), e);
                self.close(io);
                Err(ReplicationError::connection(e.to_string(), Some(self.addr())))
            }
        }
    }

    fn process_buffer<F>(&self, buffer: &mut BytesMut, on_operation: &mut F) -> usize
    where
        F: FnMut(Operation),
    {
        let mut dispatched = 0;
        loop {
            match self.codec.decode(buffer) {
                FrameDecode::Incomplete { .. } => break,
                FrameDecode::Complete {
                    operation,
                    consumed,
                } => {
                    buffer.advance(consumed);
                    on_operation(operation);
                    self.operations_received.fetch_add(1, Ordering::Relaxed);
                    *self.last_operation.lock() = Instant::now();
                    dispatched += 1;
                }
                FrameDecode::Invalid {
                    error,
                    consumed: Some(consumed),
                } => {
                    error!("Protocol error, skipping {} byte frame: {}", consumed, error);
                    buffer.advance(consumed);
                }
                FrameDecode::Invalid {
                    error,
                    consumed: None,
                } => {
                    error!(
                        "Unrecoverable protocol error, discarding {} buffered bytes: {}",
                        buffer.len(),
                        error
                    );
                    buffer.clear();
                    break;
                }
            }
        }
        dispatched
    }

    /// Close the socket. Calling this more than once is a no-op.
    pub async fn disconnect(&self) {
        let mut io = self.io.lock().await;
        self.close(&mut io);
    }

    fn close(&self, io: &mut LinkIo) {
        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        io.buffer.clear();
        if io.stream.take().is_some() || was_connected {
            info!("Disconnected from primary {}", self.addr());
        }
    }

    pub fn stats(&self) -> PrimaryLinkStats {
        PrimaryLinkStats {
            host: self.host.clone(),
            port: self.port,
            connected: self.is_connected(),
            operations_received: self.operations_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            reconnections: self.reconnections.load(Ordering::Relaxed),
            seconds_since_last_operation: self.last_operation.lock().elapsed().as_secs_f64(),
            reconnect_backoff_seconds: self.reconnect_backoff().as_secs_f64(),
        }
    }
}
