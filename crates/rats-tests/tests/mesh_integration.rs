//! Mesh integration tests: connect, messaging, disconnects.

use std::time::Duration;

use rats_tests::{init_tracing, TestNetwork, TestNode};

#[tokio::test]
async fn test_two_node_connect_fires_both_callbacks() {
    init_tracing();

    let a = TestNode::start().await;
    let b = TestNode::start().await;

    let b_hash = a.connect_to(&b).await;
    assert_eq!(b_hash, b.client.local_hash().await.unwrap());

    TestNode::wait_until(Duration::from_secs(2), || {
        a.mesh.connect_count() == 1 && b.mesh.connect_count() == 1
    })
    .await
    .unwrap();

    let a_hash = a.client.local_hash().await.unwrap();
    assert_eq!(a.mesh.connects.lock()[0], b_hash);
    assert_eq!(b.mesh.connects.lock()[0], a_hash);
    assert_eq!(a.client.peer_count().await, 1);
    assert_eq!(b.client.peer_count().await, 1);

    a.client.stop().await;
    b.client.stop().await;
}

#[tokio::test]
async fn test_broadcast_reaches_each_peer_exactly_once() {
    init_tracing();

    let network = TestNetwork::with_nodes(3).await;
    network.connect_mesh().await;
    network
        .wait_for_peer_count(2, Duration::from_secs(3))
        .await
        .unwrap();

    let a = network.node(0);
    let delivered = a.client.broadcast_string("hi").await.unwrap();
    assert_eq!(delivered, 2);

    for i in [1, 2] {
        let node = network.node(i);
        TestNode::wait_until(Duration::from_secs(2), || {
            node.mesh.string_payloads() == vec!["hi".to_string()]
        })
        .await
        .unwrap();
    }
    // Extra wait to catch any duplicate delivery.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(network.node(1).mesh.string_payloads(), vec!["hi"]);
    assert_eq!(network.node(2).mesh.string_payloads(), vec!["hi"]);
    assert!(a.mesh.string_payloads().is_empty());

    network.stop_all().await;
}

#[tokio::test]
async fn test_large_binary_message_reassembled() {
    init_tracing();

    let a = TestNode::start().await;
    let b = TestNode::start().await;
    let b_hash = a.connect_to(&b).await;

    // Several multi-part frames worth of payload.
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    a.client.send(b_hash, &payload).await.unwrap();

    TestNode::wait_until(Duration::from_secs(3), || {
        !b.mesh.messages.lock().is_empty()
    })
    .await
    .unwrap();

    let messages = b.mesh.messages.lock();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].1, payload);
    drop(messages);

    a.client.stop().await;
    b.client.stop().await;
}

#[tokio::test]
async fn test_repeat_connect_reuses_session() {
    init_tracing();

    let a = TestNode::start().await;
    let b = TestNode::start().await;

    let first = a.connect_to(&b).await;
    let second = a.connect_to(&b).await;
    assert_eq!(first, second);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(a.client.peer_count().await, 1);
    assert_eq!(b.client.peer_count().await, 1);
    assert_eq!(a.mesh.connect_count(), 1);

    a.client.stop().await;
    b.client.stop().await;
}

#[tokio::test]
async fn test_disconnect_notifies_both_sides() {
    init_tracing();

    let a = TestNode::start().await;
    let b = TestNode::start().await;
    let b_hash = a.connect_to(&b).await;

    TestNode::wait_until(Duration::from_secs(2), || {
        a.mesh.connect_count() == 1 && b.mesh.connect_count() == 1
    })
    .await
    .unwrap();

    a.client.disconnect(b_hash).await.unwrap();

    TestNode::wait_until(Duration::from_secs(2), || {
        a.mesh.disconnect_count() == 1 && b.mesh.disconnect_count() == 1
    })
    .await
    .unwrap();
    assert_eq!(a.client.peer_count().await, 0);
    assert_eq!(b.client.peer_count().await, 0);

    a.client.stop().await;
    b.client.stop().await;
}

#[tokio::test]
async fn test_stop_closes_remote_sessions() {
    init_tracing();

    let a = TestNode::start().await;
    let b = TestNode::start().await;
    a.connect_to(&b).await;

    TestNode::wait_until(Duration::from_secs(2), || b.mesh.connect_count() == 1)
        .await
        .unwrap();

    a.client.stop().await;

    TestNode::wait_until(Duration::from_secs(3), || b.mesh.disconnect_count() == 1)
        .await
        .unwrap();
    assert_eq!(b.client.peer_count().await, 0);

    b.client.stop().await;
}
