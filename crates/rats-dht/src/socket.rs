//! UDP socket actor.
//!
//! Owns the DHT's UDP socket and separates datagram I/O from protocol
//! logic: the node actor sends [`SocketCommand`]s and consumes
//! [`SocketEvent`]s.

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tracing::{debug, warn};

use crate::krpc::KrpcMessage;

const CHANNEL_CAPACITY: usize = 128;
const RECV_BUFFER_LEN: usize = 4096;

/// Commands accepted by the socket actor.
pub enum SocketCommand {
    /// Encode and send a message to `to`
    Send {
        /// Message to send
        message: KrpcMessage,
        /// Destination endpoint
        to: SocketAddr,
    },
    /// Stop the actor
    Shutdown,
}

/// Events emitted by the socket actor.
#[derive(Debug)]
pub enum SocketEvent {
    /// A well-formed KRPC message arrived
    Message {
        /// Decoded message
        message: KrpcMessage,
        /// Sender endpoint
        from: SocketAddr,
    },
}

/// Handle used by the node actor to drive the socket.
#[derive(Clone)]
pub struct SocketHandle {
    command_tx: Sender<SocketCommand>,
    local_addr: SocketAddr,
}

impl SocketHandle {
    /// Sends a KRPC message to `to`.
    pub async fn send(&self, message: KrpcMessage, to: SocketAddr) {
        if self
            .command_tx
            .send(SocketCommand::Send { message, to })
            .await
            .is_err()
        {
            debug!("socket actor gone, dropping outbound datagram");
        }
    }

    /// Asks the actor to stop.
    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(SocketCommand::Shutdown).await;
    }

    /// The bound local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// The socket actor.
pub struct DhtSocket {
    socket: UdpSocket,
    command_rx: Receiver<SocketCommand>,
    event_tx: Sender<SocketEvent>,
}

impl DhtSocket {
    /// Binds the UDP socket and builds the actor plus its endpoints.
    pub async fn bind(
        bind_addr: SocketAddr,
    ) -> Result<(Self, SocketHandle, Receiver<SocketEvent>), std::io::Error> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let local_addr = socket.local_addr()?;
        let (command_tx, command_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let actor = Self {
            socket,
            command_rx,
            event_tx,
        };
        let handle = SocketHandle {
            command_tx,
            local_addr,
        };
        Ok((actor, handle, event_rx))
    }

    /// Runs the actor until shutdown or until the node actor goes away.
    pub async fn run(mut self) {
        let mut buf = vec![0u8; RECV_BUFFER_LEN];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => match KrpcMessage::from_bytes(&buf[..len]) {
                            Ok(message) => {
                                if self
                                    .event_tx
                                    .send(SocketEvent::Message { message, from })
                                    .await
                                    .is_err()
                                {
                                    debug!("node actor gone, socket actor stopping");
                                    return;
                                }
                            }
                            Err(err) => {
                                // Garbage on a public UDP port is routine.
                                debug!(%from, %err, "dropping undecodable datagram");
                            }
                        },
                        Err(err) => {
                            warn!(%err, "UDP receive error");
                        }
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(SocketCommand::Send { message, to }) => {
                            let bytes = message.to_bytes();
                            if let Err(err) = self.socket.send_to(&bytes, to).await {
                                debug!(%to, %err, "UDP send failed");
                            }
                        }
                        Some(SocketCommand::Shutdown) | None => {
                            debug!("socket actor shutting down");
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::krpc::{MessageBody, Query, TransactionId};
    use rats_core::NodeId;

    #[tokio::test]
    async fn test_datagram_roundtrip() {
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (actor_a, handle_a, _events_a) = DhtSocket::bind(bind).await.unwrap();
        let (actor_b, handle_b, mut events_b) = DhtSocket::bind(bind).await.unwrap();

        let addr_a = handle_a.local_addr();
        let addr_b = handle_b.local_addr();

        tokio::spawn(actor_a.run());
        tokio::spawn(actor_b.run());

        let msg = KrpcMessage::query(TransactionId::random(), NodeId::random(), Query::Ping);
        handle_a.send(msg.clone(), addr_b).await;

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), events_b.recv())
            .await
            .unwrap()
            .unwrap();

        let SocketEvent::Message { message, from } = event;
        assert_eq!(from, addr_a);
        assert!(matches!(
            message.body,
            MessageBody::Query {
                query: Query::Ping,
                ..
            }
        ));
    }
}
