//! Outbound delivery to client connections.
//!
//! The socket layer is pluggable; the session manager only needs to push a
//! [`ServerMessage`] to a connection id held by this instance.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::game::state::ConnectionId;
use crate::network::protocol::ServerMessage;

/// Per-connection outbound queue depth.
pub const OUTBOUND_QUEUE: usize = 64;

/// Delivery errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The connection is not held by this instance.
    #[error("connection {0} is not open here")]
    UnknownConnection(ConnectionId),
    /// The client stopped reading.
    #[error("connection {0} closed")]
    Closed(ConnectionId),
}

/// Outbound message sink.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue a message for a connection.
    async fn send(&self, connection: ConnectionId, message: ServerMessage) -> Result<(), TransportError>;

    /// Whether this instance holds the connection.
    async fn is_open(&self, connection: ConnectionId) -> bool;
}

/// Channel-backed transport. The socket task owns the receiving end.
#[derive(Default)]
pub struct LocalTransport {
    senders: RwLock<HashMap<ConnectionId, mpsc::Sender<ServerMessage>>>,
}

impl LocalTransport {
    /// Empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection and return its outbound queue.
    pub async fn register(&self, connection: ConnectionId) -> mpsc::Receiver<ServerMessage> {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        self.senders.write().await.insert(connection, tx);
        rx
    }

    /// Forget a closed connection.
    pub async fn unregister(&self, connection: ConnectionId) {
        self.senders.write().await.remove(&connection);
    }

    /// Open connections.
    pub async fn connection_count(&self) -> usize {
        self.senders.read().await.len()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, connection: ConnectionId, message: ServerMessage) -> Result<(), TransportError> {
        let tx = self.senders.read().await
            .get(&connection)
            .cloned()
            .ok_or(TransportError::UnknownConnection(connection))?;
        // Full queue: the client is not reading, drop
        tx.try_send(message).map_err(|e| {
            debug!("Dropping message for {}: {}", connection, e);
            TransportError::Closed(connection)
        })
    }

    async fn is_open(&self, connection: ConnectionId) -> bool {
        self.senders.read().await
            .get(&connection)
            .is_some_and(|tx| !tx.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::ErrorCode;

    #[tokio::test]
    async fn test_send_reaches_registered_connection() {
        let transport = LocalTransport::new();
        let connection = ConnectionId::random();
        let mut rx = transport.register(connection).await;

        transport.send(connection, ServerMessage::error(ErrorCode::NotFound, "x")).await.unwrap();
        assert!(matches!(rx.recv().await, Some(ServerMessage::Error(_))));
        assert!(transport.is_open(connection).await);
    }

    #[tokio::test]
    async fn test_unknown_and_closed_connections() {
        let transport = LocalTransport::new();
        let connection = ConnectionId::random();
        let msg = ServerMessage::Pong { timestamp: 1, server_time: 2 };

        assert_eq!(
            transport.send(connection, msg.clone()).await,
            Err(TransportError::UnknownConnection(connection))
        );

        let rx = transport.register(connection).await;
        drop(rx);
        assert!(!transport.is_open(connection).await);
        assert_eq!(transport.send(connection, msg).await, Err(TransportError::Closed(connection)));

        transport.unregister(connection).await;
        assert_eq!(transport.connection_count().await, 0);
    }
}
