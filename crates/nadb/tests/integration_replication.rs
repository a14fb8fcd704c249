use nadb::replication::{OutboundReplicaLink, RoleStats};
use nadb::{
    FileSystemStorage, NetworkSyncStorage, ReplicationConfig, ReplicationManager, SetPayload,
    key_path,
};
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

const DB: &str = "app";
const NAMESPACE: &str = "default";

async fn wait_until<F, Fut>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition().await {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

async fn start_primary(temp: &TempDir) -> NetworkSyncStorage<FileSystemStorage> {
    let config = ReplicationConfig {
        heartbeat_interval_secs: 0.5,
        ..ReplicationConfig::primary("127.0.0.1", 0)
    };
    let primary =
        NetworkSyncStorage::start_primary(FileSystemStorage::open(temp.path()).unwrap(), config)
            .await
            .unwrap();
    primary.set_context(DB, NAMESPACE);
    primary
}

fn start_secondary(temp: &TempDir, port: u16) -> NetworkSyncStorage<FileSystemStorage> {
    let config = ReplicationConfig {
        reconnect_interval_secs: 0.1,
        ..ReplicationConfig::secondary("127.0.0.1", port)
    };
    NetworkSyncStorage::start_secondary(FileSystemStorage::open(temp.path()).unwrap(), config)
        .unwrap()
}

async fn wait_for_replicas(primary: &NetworkSyncStorage<FileSystemStorage>, count: usize) {
    let connected = wait_until(Duration::from_secs(10), || async {
        primary.manager().replica_count().await >= count
    })
    .await;
    assert!(connected, "secondaries did not connect");
}

/// Start a primary and one secondary, replicate a SET then a DELETE
#[tokio::test]
async fn test_set_and_delete_replicate() {
    // Initialize logging for test output
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let primary_dir = TempDir::new().unwrap();
    let secondary_dir = TempDir::new().unwrap();

    let mut primary = start_primary(&primary_dir).await;
    let port = primary.listen_addr().unwrap().port();
    let mut secondary = start_secondary(&secondary_dir, port);
    wait_for_replicas(&primary, 1).await;

    let path = key_path(DB, NAMESPACE, "k1");
    let op = primary
        .write_replicated(&path, &b"v1"[..], "k1", &["t".to_string()], None)
        .await
        .unwrap()
        .expect("context is set, operation should be broadcast");

    let applied = wait_until(Duration::from_secs(10), || async {
        secondary.read(&path).unwrap() == Some(Bytes::from_static(b"v1"))
    })
    .await;
    assert!(applied, "secondary never stored k1");
    assert_eq!(secondary.manager().last_applied_sequence(), op.sequence());

    assert!(primary.delete_replicated(&path, "k1").await.unwrap());
    let deleted = wait_until(Duration::from_secs(10), || async {
        !secondary.exists(&path).unwrap()
    })
    .await;
    assert!(deleted, "secondary still has k1 after delete");
    assert_eq!(secondary.manager().last_applied_sequence(), op.sequence() + 1);

    secondary.close().await;
    primary.close().await;
}

/// Operations written before a secondary connects reach it through catch-up
#[tokio::test]
async fn test_catch_up_on_connect() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let primary_dir = TempDir::new().unwrap();
    let secondary_dir = TempDir::new().unwrap();
    let mut primary = start_primary(&primary_dir).await;

    for i in 0..50 {
        let key = format!("key-{}", i);
        let value = format!("value-{}", i);
        primary
            .write_replicated(&key_path(DB, NAMESPACE, &key), value.into_bytes(), &key, &[], None)
            .await
            .unwrap();
    }
    assert_eq!(primary.manager().current_sequence(), 50);

    let port = primary.listen_addr().unwrap().port();
    let mut secondary = start_secondary(&secondary_dir, port);

    let caught_up = wait_until(Duration::from_secs(10), || async {
        secondary.manager().last_applied_sequence() == 50
    })
    .await;
    assert!(caught_up, "secondary did not catch up");

    for i in [0, 25, 49] {
        let key = format!("key-{}", i);
        assert_eq!(
            secondary.read(&key_path(DB, NAMESPACE, &key)).unwrap(),
            Some(Bytes::from(format!("value-{}", i)))
        );
    }

    match secondary.stats().await.replication.role {
        RoleStats::Secondary {
            operations_applied,
            sequence_gaps,
            ..
        } => {
            assert_eq!(operations_applied, 50);
            assert_eq!(sequence_gaps, 0);
        }
        other => panic!("unexpected role stats: {:?}", other),
    }

    secondary.close().await;
    primary.close().await;
}

/// A secondary started before its primary keeps retrying until it connects
#[tokio::test]
async fn test_secondary_connects_after_primary_starts() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    // Reserve a port, then free it for the primary
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let secondary_dir = TempDir::new().unwrap();
    let mut secondary = start_secondary(&secondary_dir, port);
    sleep(Duration::from_millis(300)).await;
    assert!(!secondary.manager().is_connected_to_primary().await);

    let primary_dir = TempDir::new().unwrap();
    let config = ReplicationConfig {
        heartbeat_interval_secs: 0.5,
        ..ReplicationConfig::primary("127.0.0.1", port)
    };
    let mut primary = NetworkSyncStorage::start_primary(
        FileSystemStorage::open(primary_dir.path()).unwrap(),
        config,
    )
    .await
    .unwrap();

    let connected = wait_until(Duration::from_secs(15), || async {
        secondary.manager().is_connected_to_primary().await
    })
    .await;
    assert!(connected, "secondary never reached the primary");

    secondary.close().await;
    primary.close().await;
}

/// A full send queue drops operations without blocking the broadcaster
#[tokio::test]
async fn test_backpressure_drops_without_blocking() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _secondary = TcpStream::connect(addr).await.unwrap();
    let (socket, peer) = listener.accept().await.unwrap();

    let manager = ReplicationManager::primary(ReplicationConfig::primary("127.0.0.1", 0));
    let link = Arc::new(OutboundReplicaLink::with_queue_capacity(
        "slow-replica",
        socket,
        peer,
        1,
    ));
    manager
        .register("slow-replica", Arc::clone(&link))
        .await
        .unwrap();

    // Nothing drains the queue, so the first broadcast fills it
    let first = manager
        .broadcast_set(SetPayload::new("k1", &b"v1"[..], DB, NAMESPACE))
        .await
        .unwrap();
    assert_eq!(first.sequence(), 1);

    let dropped = tokio::time::timeout(
        Duration::from_secs(1),
        manager.broadcast_set(SetPayload::new("k2", &b"v2"[..], DB, NAMESPACE)),
    )
    .await
    .expect("broadcast blocked on a full queue")
    .unwrap();
    assert_eq!(dropped.sequence(), 2);

    let stats = link.stats();
    assert_eq!(stats.dropped_operations, 1);
    assert_eq!(stats.queue_size, 1);
    assert!(stats.connected);

    // A full queue is not a link failure
    assert_eq!(manager.replica_count().await, 1);
    match manager.stats().await.role {
        RoleStats::Primary { replicas, .. } => {
            assert_eq!(replicas[0].dropped_operations, 1);
        }
        other => panic!("unexpected role stats: {:?}", other),
    }
}
