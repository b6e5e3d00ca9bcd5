//! Test harness for multi-node rats integration testing.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod harness;
pub mod node;

pub use harness::TestNetwork;
pub use node::{MeshRecorder, TestNode, TransferRecorder};

/// Initializes tracing for tests; safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("rats=debug,rats_net=debug,rats_dht=debug,rats_transfer=debug")
        .with_test_writer()
        .try_init();
}
