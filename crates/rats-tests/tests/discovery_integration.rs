//! Auto-discovery integration: two nodes find each other through the
//! rendezvous hash with no explicit connect.

use std::sync::Arc;
use std::time::Duration;

use rats_dht::{DhtConfig, DhtNode};
use rats_net::engine::{MeshConfig, MeshEngine, MeshHandler};
use rats_net::{noise, Discovery, DiscoveryConfig};
use rats_tests::init_tracing;

struct Quiet;
impl MeshHandler for Quiet {}

fn fast_discovery() -> DiscoveryConfig {
    DiscoveryConfig {
        announce_interval: Duration::from_millis(300),
        search_interval: Duration::from_millis(400),
        blacklist_for: Duration::from_secs(10),
        max_concurrent_dials: 8,
    }
}

async fn node() -> (rats_dht::DhtHandle, Arc<MeshEngine>) {
    let dht = DhtNode::spawn(DhtConfig {
        local_id: rats_core::NodeId::random(),
        bind_addr: "127.0.0.1:0".parse().unwrap(),
    })
    .await
    .unwrap();

    let (secret, _) = noise::generate_keypair().unwrap();
    let engine = MeshEngine::start(
        MeshConfig::new("127.0.0.1:0".parse().unwrap()),
        secret,
        Arc::new(Quiet),
        None,
    )
    .await
    .unwrap();

    (dht, engine)
}

#[tokio::test]
async fn test_nodes_discover_each_other() {
    init_tracing();

    let (dht_a, engine_a) = node().await;
    let (dht_b, engine_b) = node().await;

    // Link the DHTs so lookups can travel.
    dht_b.bootstrap(vec![dht_a.local_addr()]).await.unwrap();

    let discovery_a = Discovery::new(fast_discovery(), dht_a.clone(), engine_a.clone());
    let discovery_b = Discovery::new(fast_discovery(), dht_b.clone(), engine_b.clone());
    tokio::spawn(discovery_a.clone().run());
    tokio::spawn(discovery_b.clone().run());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if engine_a.peer_count() >= 1 && engine_b.peer_count() >= 1 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "nodes never discovered each other"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Collision resolution leaves exactly one session even though both
    // sides may have dialed.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(engine_a.peer_count(), 1);
    assert_eq!(engine_b.peer_count(), 1);

    discovery_a.stop();
    discovery_b.stop();
    engine_a.stop().await;
    engine_b.stop().await;
    dht_a.shutdown().await;
    dht_b.shutdown().await;
}
