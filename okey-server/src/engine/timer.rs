//! Turn timer.
//!
//! Every instance runs one. Each tick walks the active-room index and
//! auto-plays turns whose deadline has passed. Instances racing on the same
//! turn are harmless: the update is atomic and keyed on the observed turn
//! number, so all but one come back `Stale`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::engine::TurnEngine;
use crate::error::GameError;
use crate::game::state::GamePhase;
use crate::game::turn::TimeoutOutcome;
use crate::network::backplane::{Backplane, RoomUpdate};

/// Periodic sweep for overdue turns.
pub struct TurnTimer {
    engine: TurnEngine,
    backplane: Arc<dyn Backplane>,
    poll_interval: Duration,
}

impl TurnTimer {
    /// Create a timer.
    pub fn new(engine: TurnEngine, backplane: Arc<dyn Backplane>, poll_interval: Duration) -> Self {
        Self { engine, backplane, poll_interval }
    }

    /// Sweep until a shutdown signal arrives.
    #[instrument(skip(self, shutdown))]
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Turn timer polling every {:?}", self.poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(0) => {}
                        Ok(n) => debug!("Auto-played {} overdue turns", n),
                        Err(e) => warn!("Turn sweep failed: {}", e),
                    }
                }
                _ = shutdown.recv() => {
                    info!("Turn timer stopped");
                    break;
                }
            }
        }
    }

    /// One pass over the active rooms. Returns the number of turns auto-played.
    ///
    /// A failure on one room is logged and the sweep moves on. Finished rooms
    /// still listed in the index are retired again.
    pub async fn sweep(&self) -> Result<usize, GameError> {
        let now = self.engine.now();
        let mut auto_played = 0;

        for id in self.engine.active_room_ids().await? {
            let room = match self.engine.store().get(id).await {
                Ok(Some(room)) => room,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Room {} unreadable, skipped: {}", id, e);
                    continue;
                }
            };

            if room.phase.is_terminal() {
                let ttl = self.engine.store().config().finished_room_ttl;
                if let Err(e) = self.engine.store().expire(id, ttl).await {
                    warn!("Room {} still not retired: {}", id, e);
                }
                continue;
            }

            let Some(turn) = room.turn.as_ref() else { continue };
            if room.phase != GamePhase::Playing || !turn.is_expired(now) {
                continue;
            }

            match self.engine.on_turn_timeout(id, turn.number).await {
                Ok((TimeoutOutcome::AutoPlayed { .. }, Some(outcome))) => {
                    auto_played += 1;
                    let update = RoomUpdate::new(outcome.state, outcome.events);
                    if let Err(e) = self.backplane.publish(&update).await {
                        warn!("Room {} update not published: {}", id, e);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Room {} timeout check failed: {}", id, e),
            }
        }
        Ok(auto_played)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{engine_on, full_room, test_engine};
    use crate::game::events::GameEvent;
    use crate::game::state::{RoomId, RoomState};
    use crate::network::backplane::LocalBackplane;
    use crate::store::{MemoryBackend, RoomBackend};
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_sweep_auto_plays_and_publishes() {
        let (engine, clock) = test_engine();
        let (room, players) = full_room(&engine).await;
        engine.start_game(room).await.unwrap();

        let backplane = Arc::new(LocalBackplane::default());
        let mut updates = backplane.subscribe().await.unwrap();
        let timer = TurnTimer::new(engine.clone(), backplane.clone(), Duration::from_millis(10));

        assert_eq!(timer.sweep().await.unwrap(), 0);

        clock.advance(engine.rules().turn_duration());
        assert_eq!(timer.sweep().await.unwrap(), 1);

        let update = updates.next().await.unwrap();
        assert_eq!(update.state.id, room);
        assert_eq!(update.state.turn.as_ref().unwrap().player, players[1]);
        assert!(update.events.iter().any(|e| matches!(e, GameEvent::AutoPlayed { turn_number: 1, .. })));

        // The new turn started at the advanced time and is not yet due
        assert_eq!(timer.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_ignores_rooms_not_playing() {
        let (engine, clock) = test_engine();
        full_room(&engine).await;
        let timer = TurnTimer::new(engine.clone(), Arc::new(LocalBackplane::default()), Duration::from_secs(1));

        clock.advance(chrono::Duration::hours(1));
        assert_eq!(timer.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_skips_unreadable_room() {
        let backend = Arc::new(MemoryBackend::new());
        let (engine, clock) = engine_on(backend.clone());
        backend
            .insert(RoomId::random(), 1, "not json".into(), Duration::from_secs(60))
            .await
            .unwrap();
        let (room, _) = full_room(&engine).await;
        engine.start_game(room).await.unwrap();
        let timer = TurnTimer::new(engine.clone(), Arc::new(LocalBackplane::default()), Duration::from_secs(1));

        clock.advance(engine.rules().turn_duration());
        assert_eq!(timer.sweep().await.unwrap(), 1);
        let state = engine.get_room(room).await.unwrap();
        assert_eq!(state.turn.as_ref().unwrap().number, 2);
        assert_eq!(engine.list_rooms().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_retires_finished_room_left_in_index() {
        let backend = Arc::new(MemoryBackend::new());
        let (engine, _) = engine_on(backend.clone());

        // A cancelled room whose retirement was lost
        let mut finished = RoomState::new(RoomId::random(), "gone", 0, engine.now());
        finished.transition_to(GamePhase::Cancelled).unwrap();
        let record = serde_json::to_string(&finished).unwrap();
        backend.insert(finished.id, 3, record, Duration::from_secs(60)).await.unwrap();
        assert_eq!(engine.active_room_ids().await.unwrap(), vec![finished.id]);

        let timer = TurnTimer::new(engine.clone(), Arc::new(LocalBackplane::default()), Duration::from_secs(1));
        assert_eq!(timer.sweep().await.unwrap(), 0);
        assert!(engine.active_room_ids().await.unwrap().is_empty());
        assert!(engine.get_room(finished.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (engine, _) = test_engine();
        let timer = TurnTimer::new(engine, Arc::new(LocalBackplane::default()), Duration::from_millis(5));
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(timer.run(rx));

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
