//! File transfer integration tests.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rats::{Config, RatsClient, TransferStatus};
use rats_tests::{init_tracing, MeshRecorder, TestNode};
use sha1::{Digest, Sha1};

fn patterned_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 247) as u8).collect()
}

fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

async fn write_source(node: &TestNode, name: &str, data: &[u8]) -> PathBuf {
    let path = node.scratch_dir().join(name);
    tokio::fs::write(&path, data).await.unwrap();
    path
}

fn chunk_len() -> usize {
    rats_transfer::effective_chunk_size(rats_transfer::DEFAULT_CHUNK_SIZE) as usize
}

#[tokio::test]
async fn test_file_roundtrip_with_matching_hash() {
    init_tracing();

    let a = TestNode::start().await;
    let b = TestNode::start().await;
    let b_hash = a.connect_to(&b).await;

    let data = patterned_bytes(2 * 1024 * 1024);
    let source = write_source(&a, "data.bin", &data).await;

    let id = a.client.send_file(b_hash, source).await.unwrap();

    TestNode::wait_until_async(Duration::from_secs(20), || async {
        matches!(
            a.client.transfer(id).await,
            Some(t) if t.status == TransferStatus::Completed
        )
    })
    .await
    .unwrap();

    TestNode::wait_until(Duration::from_secs(5), || {
        b.transfers
            .completion_for(id)
            .is_some_and(|t| t.status == TransferStatus::Completed)
    })
    .await
    .unwrap();

    let received = tokio::fs::read(b.download_dir().join("data.bin"))
        .await
        .unwrap();
    assert_eq!(sha1_hex(&received), sha1_hex(&data));

    // Progress is monotonic non-decreasing on both sides.
    for node in [&a, &b] {
        let progress = node.transfers.progress_for(id);
        assert!(!progress.is_empty());
        assert!(
            progress.windows(2).all(|w| w[0] <= w[1]),
            "progress went backwards: {progress:?}"
        );
    }
    assert_eq!(b.transfers.offers.lock().len(), 1);

    a.client.stop().await;
    b.client.stop().await;
}

#[tokio::test]
async fn test_default_policy_rejects_offers() {
    init_tracing();

    let a = TestNode::start().await;

    // A bare client keeps the default transfer policy: reject.
    let mut config = Config::generate(0);
    config.bootstrap_nodes = Vec::new();
    let dir = tempfile::tempdir().unwrap();
    config.file_dir = dir.path().to_path_buf();
    let b = RatsClient::with_config(config);
    b.set_mesh_handler(Arc::new(MeshRecorder::default()));
    b.start().await.unwrap();

    let b_addr = b.listen_addr().await.unwrap();
    let b_hash = a
        .client
        .connect("127.0.0.1", b_addr.port())
        .await
        .unwrap();

    let source = write_source(&a, "unwanted.bin", &patterned_bytes(10_000)).await;
    let id = a.client.send_file(b_hash, source).await.unwrap();

    TestNode::wait_until_async(Duration::from_secs(5), || async {
        matches!(
            a.client.transfer(id).await,
            Some(t) if t.status == TransferStatus::Failed
        )
    })
    .await
    .unwrap();

    let failed = a.client.transfer(id).await.unwrap();
    assert!(failed.error.unwrap_or_default().contains("rejected"));

    a.client.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_pause_then_resume_completes() {
    init_tracing();

    let a = TestNode::start().await;
    let b = TestNode::start().await;
    let b_hash = a.connect_to(&b).await;

    let data = patterned_bytes(4 * 1024 * 1024);
    let source = write_source(&a, "paused.bin", &data).await;

    let id = a.client.send_file(b_hash, source).await.unwrap();
    // Freeze right away; the stream either never starts or stops at
    // whatever was in flight.
    a.client.pause_transfer(id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    let first = a.client.transfer(id).await.unwrap();
    assert_eq!(first.status, TransferStatus::Paused);
    assert!(first.chunks_done < first.chunks_total, "paused too late");

    // Progress must hold still while paused.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let second = a.client.transfer(id).await.unwrap();
    assert_eq!(second.chunks_done, first.chunks_done);

    a.client.resume_transfer(id).await.unwrap();

    TestNode::wait_until_async(Duration::from_secs(30), || async {
        matches!(
            a.client.transfer(id).await,
            Some(t) if t.status == TransferStatus::Completed
        )
    })
    .await
    .unwrap();

    let received = tokio::fs::read(b.download_dir().join("paused.bin"))
        .await
        .unwrap();
    assert_eq!(sha1_hex(&received), sha1_hex(&data));

    a.client.stop().await;
    b.client.stop().await;
}

#[tokio::test]
async fn test_resume_from_existing_partial_file() {
    init_tracing();

    let a = TestNode::start().await;
    let b = TestNode::start().await;
    let b_hash = a.connect_to(&b).await;

    let chunk = chunk_len();
    let data = patterned_bytes(chunk * 10 + 1234);
    let source = write_source(&a, "partial.bin", &data).await;

    // Three whole chunks already sit in the receiver's part file, as if
    // an earlier attempt died mid-way.
    tokio::fs::create_dir_all(b.download_dir()).await.unwrap();
    tokio::fs::write(
        b.download_dir().join("partial.bin.part"),
        &data[..chunk * 3],
    )
    .await
    .unwrap();

    let id = a.client.send_file(b_hash, source).await.unwrap();

    TestNode::wait_until_async(Duration::from_secs(20), || async {
        matches!(
            a.client.transfer(id).await,
            Some(t) if t.status == TransferStatus::Completed
        )
    })
    .await
    .unwrap();

    let received = tokio::fs::read(b.download_dir().join("partial.bin"))
        .await
        .unwrap();
    assert_eq!(sha1_hex(&received), sha1_hex(&data));

    // The receiver picked up past the pre-existing chunks.
    let first_progress = b
        .transfers
        .progress_for(id)
        .first()
        .copied()
        .expect("receiver progress");
    assert!(
        first_progress > 3,
        "expected resume past chunk 3, first progress was {first_progress}"
    );

    a.client.stop().await;
    b.client.stop().await;
}

#[tokio::test]
async fn test_cancel_discards_partial() {
    init_tracing();

    let a = TestNode::start().await;
    let b = TestNode::start().await;
    let b_hash = a.connect_to(&b).await;

    let data = patterned_bytes(4 * 1024 * 1024);
    let source = write_source(&a, "doomed.bin", &data).await;

    let id = a.client.send_file(b_hash, source).await.unwrap();
    // Freeze immediately, then cancel: deterministic partial state.
    a.client.pause_transfer(id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    a.client.cancel_transfer(id).await.unwrap();

    TestNode::wait_until_async(Duration::from_secs(5), || async {
        matches!(
            a.client.transfer(id).await,
            Some(t) if t.status == TransferStatus::Cancelled
        )
    })
    .await
    .unwrap();

    // Cancel twice is fine.
    a.client.cancel_transfer(id).await.unwrap();

    TestNode::wait_until(Duration::from_secs(5), || {
        b.transfers
            .completion_for(id)
            .is_some_and(|t| t.status == TransferStatus::Cancelled)
    })
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!b.download_dir().join("doomed.bin").exists());
    assert!(!b.download_dir().join("doomed.bin.part").exists());

    a.client.stop().await;
    b.client.stop().await;
}

#[tokio::test]
async fn test_directory_transfer() {
    init_tracing();

    let a = TestNode::start().await;
    let b = TestNode::start().await;
    let b_hash = a.connect_to(&b).await;

    let root = a.scratch_dir().join("album");
    tokio::fs::create_dir_all(root.join("inner")).await.unwrap();
    let files = [
        ("one.bin", patterned_bytes(10_000)),
        ("two.bin", patterned_bytes(123)),
        ("inner/three.bin", patterned_bytes(300_000)),
    ];
    for (name, data) in &files {
        tokio::fs::write(root.join(name), data).await.unwrap();
    }

    let parent = a.client.send_directory(b_hash, root).await.unwrap();

    TestNode::wait_until(Duration::from_secs(20), || {
        b.transfers
            .completions
            .lock()
            .iter()
            .filter(|t| t.status == TransferStatus::Completed)
            .count()
            == files.len()
    })
    .await
    .unwrap();

    for (name, data) in &files {
        let received = tokio::fs::read(b.download_dir().join("album").join(name))
            .await
            .unwrap();
        assert_eq!(&received, data, "mismatch for {name}");
    }

    // Every member shares the parent id.
    for completion in b.transfers.completions.lock().iter() {
        assert_eq!(completion.parent_id, Some(parent));
    }

    a.client.stop().await;
    b.client.stop().await;
}
