//! Keepalive and timeout behavior, driven at the engine level with a
//! hand-rolled peer that goes silent after the handshake.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;

use rats_core::{PeerHash, PROTOCOL_VERSION};
use rats_net::engine::{MeshConfig, MeshEngine, MeshHandler};
use rats_net::frame::{read_frame, write_frame};
use rats_net::noise::{self, Handshake};
use rats_net::session::DisconnectReason;
use rats_net::wire::{Body, Frame};
use rats_tests::init_tracing;

#[derive(Default)]
struct Recorder {
    connects: Mutex<Vec<PeerHash>>,
    disconnects: Mutex<Vec<(PeerHash, DisconnectReason)>>,
}

impl MeshHandler for Recorder {
    fn on_connect(&self, peer: PeerHash) {
        self.connects.lock().push(peer);
    }
    fn on_disconnect(&self, peer: PeerHash, reason: DisconnectReason) {
        self.disconnects.lock().push((peer, reason));
    }
}

fn fast_config() -> MeshConfig {
    let mut config = MeshConfig::new("127.0.0.1:0".parse().unwrap());
    config.idle_ping_after = Duration::from_millis(200);
    config.session_dead_after = Duration::from_millis(700);
    config.keepalive_tick = Duration::from_millis(50);
    config
}

/// Dials `engine`, completes the Noise handshake and hello exchange by
/// hand, then returns the raw stream without ever writing again.
async fn silent_peer(engine: &MeshEngine) -> TcpStream {
    let (secret, public) = noise::generate_keypair().unwrap();
    let local_hash = PeerHash::from_static_key(&public);

    let mut stream = TcpStream::connect(engine.listen_addr()).await.unwrap();
    let (mut read_half, mut write_half) = stream.split();

    let mut handshake = Handshake::initiator(&secret).unwrap();
    let msg = handshake.write_message().unwrap();
    write_frame(&mut write_half, &msg).await.unwrap();
    let msg = read_frame(&mut read_half).await.unwrap();
    handshake.read_message(&msg).unwrap();
    let msg = handshake.write_message().unwrap();
    write_frame(&mut write_half, &msg).await.unwrap();

    let established = handshake.into_transport().unwrap();
    let binding = PeerHash::session_binding(&public, &established.handshake_hash);
    let mut send = established.send;
    let mut recv = established.recv;

    let hello = Frame {
        id: 0,
        body: Body::Hello {
            peer_hash: local_hash.to_hex(),
            binding: binding.to_hex(),
            version: PROTOCOL_VERSION.to_string(),
            listen_port: 1,
        },
    };
    let ciphertext = send.encrypt(&hello.to_bytes().unwrap()).unwrap();
    write_frame(&mut write_half, &ciphertext).await.unwrap();

    // Consume the engine's hello so the session is fully up.
    let ciphertext = read_frame(&mut read_half).await.unwrap();
    let frame = Frame::from_bytes(&recv.decrypt(&ciphertext).unwrap()).unwrap();
    assert!(matches!(frame.body, Body::Hello { .. }));

    stream
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    init_tracing();

    let recorder = Arc::new(Recorder::default());
    let (engine_secret, _) = noise::generate_keypair().unwrap();
    let engine = MeshEngine::start(fast_config(), engine_secret, recorder.clone(), None)
        .await
        .unwrap();

    // Keep the stream alive but never answer anything.
    let stream = silent_peer(&engine).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if recorder
            .disconnects
            .lock()
            .iter()
            .any(|(_, reason)| *reason == DisconnectReason::Timeout)
        {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "engine never timed the silent peer out"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(engine.peer_count(), 0);

    drop(stream);
    engine.stop().await;
}

#[tokio::test]
async fn test_engines_answer_keepalive_pings() {
    init_tracing();

    // Two engines with aggressive keepalive stay connected because they
    // answer each other's pings.
    let rec_a = Arc::new(Recorder::default());
    let rec_b = Arc::new(Recorder::default());
    let (sk_a, _) = noise::generate_keypair().unwrap();
    let (sk_b, _) = noise::generate_keypair().unwrap();

    let a = MeshEngine::start(fast_config(), sk_a, rec_a.clone(), None)
        .await
        .unwrap();
    let b = MeshEngine::start(fast_config(), sk_b, rec_b.clone(), None)
        .await
        .unwrap();

    let b_addr = b.listen_addr();
    a.connect("127.0.0.1", b_addr.port()).await.unwrap();

    // Several dead-session windows pass without traffic from the app.
    tokio::time::sleep(Duration::from_millis(2500)).await;

    assert_eq!(a.peer_count(), 1, "session should stay alive");
    assert_eq!(b.peer_count(), 1, "session should stay alive");
    assert!(rec_a.disconnects.lock().is_empty());
    assert!(rec_b.disconnects.lock().is_empty());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_wrong_identity_in_hello_rejected() {
    init_tracing();

    let recorder = Arc::new(Recorder::default());
    let (engine_secret, _) = noise::generate_keypair().unwrap();
    let engine = MeshEngine::start(fast_config(), engine_secret, recorder.clone(), None)
        .await
        .unwrap();

    let (secret, public) = noise::generate_keypair().unwrap();
    let mut stream = TcpStream::connect(engine.listen_addr()).await.unwrap();
    let (mut read_half, mut write_half) = stream.split();

    let mut handshake = Handshake::initiator(&secret).unwrap();
    let msg = handshake.write_message().unwrap();
    write_frame(&mut write_half, &msg).await.unwrap();
    let msg = read_frame(&mut read_half).await.unwrap();
    handshake.read_message(&msg).unwrap();
    let msg = handshake.write_message().unwrap();
    write_frame(&mut write_half, &msg).await.unwrap();

    let established = handshake.into_transport().unwrap();
    let binding = PeerHash::session_binding(&public, &established.handshake_hash);
    let mut send = established.send;

    // Declare an identity that does not match our static key.
    let hello = Frame {
        id: 0,
        body: Body::Hello {
            peer_hash: PeerHash::random().to_hex(),
            binding: binding.to_hex(),
            version: PROTOCOL_VERSION.to_string(),
            listen_port: 1,
        },
    };
    let ciphertext = send.encrypt(&hello.to_bytes().unwrap()).unwrap();
    write_frame(&mut write_half, &ciphertext).await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(engine.peer_count(), 0);
    assert!(recorder.connects.lock().is_empty());

    engine.stop().await;
}

#[tokio::test]
async fn test_listen_port_conflict_is_fatal() {
    init_tracing();

    let (sk_a, _) = noise::generate_keypair().unwrap();
    let (sk_b, _) = noise::generate_keypair().unwrap();

    let a = MeshEngine::start(fast_config(), sk_a, Arc::new(Recorder::default()), None)
        .await
        .unwrap();

    let mut conflicting = fast_config();
    conflicting.listen_addr = a.listen_addr();
    let result = MeshEngine::start(conflicting, sk_b, Arc::new(Recorder::default()), None).await;
    assert!(result.is_err(), "second bind on the same port must fail");

    a.stop().await;
}
