
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use cron_lite::config::RegisterConfig;
use cron_lite::coord::MemoryCluster;
use cron_lite::worker::Register;
use test_harness::assert_eventually;

fn register_config(addr: &str) -> RegisterConfig {
    RegisterConfig {
        lease_ttl: Duration::from_millis(300),
        retry_backoff: Duration::from_millis(100),
        advertise_addr: Some(addr.to_string()),
    }
}

#[tokio::test]
async fn test_register_writes_worker_key() {
    let cluster = MemoryCluster::new();
    let register = Register::new(Arc::new(cluster.client()), &register_config("10.0.0.5")).unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(register.run(shutdown.clone()));

    let key = "/cron/workers/10.0.0.5";
    assert_eventually(
        || async { cluster.get(key).await.is_some() },
        Duration::from_secs(2),
        "worker key should appear",
    )
    .await;

    let kv = cluster.get(key).await.unwrap();
    assert!(kv.lease.is_some());
    // %Y/%m/%d %H:%M:%S
    let value = String::from_utf8(kv.value).unwrap();
    assert_eq!(value.len(), 19);
    assert_eq!(&value[4..5], "/");
    assert_eq!(&value[10..11], " ");

    // Renewal keeps the key alive past its TTL
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(cluster.get(key).await.is_some());

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_register_recovers_after_partition() {
    let cluster = MemoryCluster::new();
    let client = cluster.client();
    let register = Register::new(Arc::new(client.clone()), &register_config("10.0.0.6")).unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(register.run(shutdown.clone()));

    let key = "/cron/workers/10.0.0.6";
    assert_eventually(
        || async { cluster.get(key).await.is_some() },
        Duration::from_secs(2),
        "worker key should appear",
    )
    .await;
    let first_lease = cluster.get(key).await.unwrap().lease;

    client.set_partitioned(true);
    assert_eventually(
        || async { cluster.get(key).await.is_none() },
        Duration::from_secs(3),
        "registration should lapse with its lease",
    )
    .await;

    client.set_partitioned(false);
    assert_eventually(
        || async { cluster.get(key).await.is_some() },
        Duration::from_secs(3),
        "worker should re-register under a fresh lease",
    )
    .await;
    assert_ne!(cluster.get(key).await.unwrap().lease, first_lease);

    shutdown.cancel();
}

#[tokio::test]
async fn test_register_stops_on_shutdown() {
    let cluster = MemoryCluster::new();
    let register = Register::new(Arc::new(cluster.client()), &register_config("10.0.0.7")).unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(register.run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("register loop did not stop")
        .unwrap();
}
