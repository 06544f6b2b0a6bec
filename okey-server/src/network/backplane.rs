//! Cross-instance backplane.
//!
//! After an operation is persisted, the instance that ran it publishes a
//! [`RoomUpdate`]. Every instance (including the publisher) receives it and
//! pushes per-player views to the connections it holds for that room.
//! Delivery is fire-and-forget: a lost update is repaired by the next one or
//! by a reconnect resync, since the store is the source of truth.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use redis::AsyncCommands;
use serde::{Serialize, Deserialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::game::events::GameEvent;
use crate::game::state::RoomState;

/// Pub/sub channel shared by all instances.
pub const ROOM_UPDATES_CHANNEL: &str = "okey:room-updates";

/// A persisted room change.
///
/// Build with [`RoomUpdate::new`]; the carried state never includes the
/// server seed of an unrevealed round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomUpdate {
    /// Room as written, fairness secrets stripped
    pub state: RoomState,
    /// Events of the operation
    pub events: Vec<GameEvent>,
}

impl RoomUpdate {
    /// Wrap a persisted state for publishing.
    pub fn new(mut state: RoomState, events: Vec<GameEvent>) -> Self {
        state.fairness.redact_secrets();
        Self { state, events }
    }
}

/// Backplane errors.
#[derive(Debug, thiserror::Error)]
pub enum BackplaneError {
    /// Transport failure.
    #[error("backplane unavailable: {0}")]
    Unavailable(String),

    /// Payload could not be encoded.
    #[error("backplane codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Publish/subscribe for room updates.
#[async_trait]
pub trait Backplane: Send + Sync {
    /// Send an update to every subscribed instance.
    async fn publish(&self, update: &RoomUpdate) -> Result<(), BackplaneError>;

    /// Stream of updates published from now on.
    async fn subscribe(&self) -> Result<BoxStream<'static, RoomUpdate>, BackplaneError>;
}

// =============================================================================
// IN-PROCESS
// =============================================================================

/// Single-instance backplane on a tokio broadcast channel.
#[derive(Clone)]
pub struct LocalBackplane {
    tx: broadcast::Sender<Arc<RoomUpdate>>,
}

impl LocalBackplane {
    /// Create with room for `capacity` undelivered updates per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for LocalBackplane {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Backplane for LocalBackplane {
    async fn publish(&self, update: &RoomUpdate) -> Result<(), BackplaneError> {
        // No subscribers is not an error
        let _ = self.tx.send(Arc::new(update.clone()));
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, RoomUpdate>, BackplaneError> {
        let rx = self.tx.subscribe();
        let updates = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(update) => return Some(((*update).clone(), rx)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Backplane subscriber lagged, {} updates dropped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(updates.boxed())
    }
}

// =============================================================================
// REDIS
// =============================================================================

/// Backplane over Redis pub/sub.
#[derive(Clone)]
pub struct RedisBackplane {
    client: redis::Client,
    publisher: redis::aio::MultiplexedConnection,
}

impl RedisBackplane {
    /// Connect to `url`.
    pub async fn connect(url: &str) -> Result<Self, BackplaneError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let publisher = client.get_multiplexed_async_connection().await.map_err(unavailable)?;
        info!("Connected to Redis backplane on {}", ROOM_UPDATES_CHANNEL);
        Ok(Self { client, publisher })
    }
}

fn unavailable(e: redis::RedisError) -> BackplaneError {
    BackplaneError::Unavailable(e.to_string())
}

#[async_trait]
impl Backplane for RedisBackplane {
    async fn publish(&self, update: &RoomUpdate) -> Result<(), BackplaneError> {
        let payload = serde_json::to_string(update)?;
        let mut conn = self.publisher.clone();
        conn.publish::<_, _, ()>(ROOM_UPDATES_CHANNEL, payload)
            .await
            .map_err(unavailable)
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, RoomUpdate>, BackplaneError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(unavailable)?;
        pubsub.subscribe(ROOM_UPDATES_CHANNEL).await.map_err(unavailable)?;
        let updates = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    debug!("Unreadable backplane payload: {}", e);
                    return None;
                }
            };
            match serde_json::from_str::<RoomUpdate>(&payload) {
                Ok(update) => Some(update),
                Err(e) => {
                    warn!("Dropping malformed room update: {}", e);
                    None
                }
            }
        });
        Ok(updates.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{full_room, test_engine};
    use crate::game::state::{NoWinnerReason, RoomId};
    use chrono::Utc;

    fn update(name: &str) -> RoomUpdate {
        RoomUpdate::new(RoomState::new(RoomId::random(), name, 0, Utc::now()), Vec::new())
    }

    #[tokio::test]
    async fn test_local_fan_out() {
        let backplane = LocalBackplane::default();
        let mut a = backplane.subscribe().await.unwrap();
        let mut b = backplane.subscribe().await.unwrap();

        let sent = update("one");
        backplane.publish(&sent).await.unwrap();

        assert_eq!(a.next().await.unwrap(), sent);
        assert_eq!(b.next().await.unwrap(), sent);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let backplane = LocalBackplane::new(4);
        assert!(backplane.publish(&update("nobody")).await.is_ok());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_keeps_receiving() {
        let backplane = LocalBackplane::new(2);
        let mut rx = backplane.subscribe().await.unwrap();
        for i in 0..5 {
            backplane.publish(&update(&format!("room-{}", i))).await.unwrap();
        }
        // The oldest updates were overwritten; the newest are still delivered
        let first = rx.next().await.unwrap();
        assert_eq!(first.state.name, "room-3");
    }

    #[tokio::test]
    async fn test_update_hides_seed_until_reveal() {
        let (engine, _) = test_engine();
        let (room, _) = full_room(&engine).await;
        let started = engine.start_game(room).await.unwrap();
        let stored = engine.store().get(room).await.unwrap().unwrap();
        assert!(serde_json::to_string(&stored).unwrap().contains("server_seed\":\""));

        let update = RoomUpdate::new(started.state, started.events);
        assert_eq!(update.state.fairness.commitment, stored.fairness.commitment);
        let payload = serde_json::to_string(&update).unwrap();
        assert!(!payload.contains("server_seed\":\""));
        assert_eq!(update.state.compute_hash(), stored.compute_hash());

        let ended = engine
            .cancel(room, NoWinnerReason::Cancelled)
            .await
            .unwrap();
        let update = RoomUpdate::new(ended.state, ended.events);
        assert!(update.state.fairness.is_revealed());
        assert!(serde_json::to_string(&update).unwrap().contains("server_seed\":\""));
    }
}
