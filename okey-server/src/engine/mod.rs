//! Turn Engine
//!
//! Async front of the turn state machine. Every operation is one atomic
//! [`StateStore::update`]: load the room, run the pure transition from
//! [`crate::game::turn`], write back under compare-and-swap.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       TURN ENGINE                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  TurnEngine      - room operations, clock + rules injected  │
//! │  timer.rs        - per-instance sweep for overdue turns     │
//! │                                                             │
//! │  request ──► StateStore::update ──► game::turn::* ──► CAS   │
//! │                                        │                    │
//! │                                        └──► Vec<GameEvent>  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Transitions that produce no events (a repeated join, a timeout that is
//! stale or not yet due) do not write.

pub mod timer;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tracing::{debug, info, instrument, warn};

use crate::core::clock::Clock;
use crate::error::GameError;
use crate::game::events::GameEvent;
use crate::game::rules::RuleSet;
use crate::game::state::{NoWinnerReason, PlayerId, RoomId, RoomState, RoundOutcome};
use crate::game::tile::TileId;
use crate::game::turn::{self, TimeoutOutcome};
use crate::proof::commitment::ServerSeed;
use crate::store::StateStore;

pub use self::timer::TurnTimer;

/// Persisted state after an operation plus the events it produced.
#[derive(Debug, Clone)]
pub struct EngineOutcome {
    /// Room as written (or as loaded, when nothing changed)
    pub state: RoomState,
    /// What happened, in order
    pub events: Vec<GameEvent>,
}

impl EngineOutcome {
    /// Whether the operation changed anything.
    pub fn is_noop(&self) -> bool {
        self.events.is_empty()
    }
}

/// Room operations over the shared state store.
#[derive(Clone)]
pub struct TurnEngine {
    store: Arc<StateStore>,
    rules: RuleSet,
    clock: Arc<dyn Clock>,
}

impl TurnEngine {
    /// Create an engine.
    pub fn new(store: Arc<StateStore>, rules: RuleSet, clock: Arc<dyn Clock>) -> Self {
        Self { store, rules, clock }
    }

    /// Rules applied to every room.
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Current time as seen by the engine.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn apply<F>(&self, room: RoomId, mut transition: F) -> Result<EngineOutcome, GameError>
    where
        F: FnMut(&mut RoomState, DateTime<Utc>) -> Result<Vec<GameEvent>, GameError> + Send,
    {
        let now = self.clock.now();
        let (state, events) = self.store.update_with(room, |state| {
            let events = transition(state, now)?;
            if events.is_empty() {
                return Ok(None);
            }
            state.updated_at = now;
            Ok(Some(events))
        }).await?;
        Ok(EngineOutcome { state, events: events.unwrap_or_default() })
    }

    // =========================================================================
    // ROOMS
    // =========================================================================

    /// Open a new room.
    #[instrument(skip(self))]
    pub async fn create_room(&self, name: &str, stake: u64) -> Result<RoomState, GameError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(GameError::Validation("room name must not be empty".into()));
        }
        let state = RoomState::new(RoomId::random(), name, stake, self.clock.now());
        let state = self.store.create(state).await?;
        info!("Room {} created ({}, stake {})", state.id, state.name, state.stake);
        Ok(state)
    }

    /// Load a room.
    pub async fn get_room(&self, room: RoomId) -> Result<RoomState, GameError> {
        self.store.get(room).await?.ok_or_else(|| GameError::room_not_found(room))
    }

    /// Ids in the active-room index. Fails only if the index itself cannot
    /// be read.
    pub async fn active_room_ids(&self) -> Result<Vec<RoomId>, GameError> {
        let mut ids = self.store.list_active_room_ids();
        let mut out = Vec::new();
        while let Some(id) = ids.next().await {
            out.push(id?);
        }
        Ok(out)
    }

    /// Every room still in the active index.
    ///
    /// Rooms that vanish between the index scan and the load are skipped, as
    /// are rooms that fail to load.
    pub async fn list_rooms(&self) -> Result<Vec<RoomState>, GameError> {
        let mut rooms = Vec::new();
        for id in self.active_room_ids().await? {
            match self.store.get(id).await {
                Ok(Some(state)) => rooms.push(state),
                Ok(None) => {}
                Err(e) => warn!("Skipping room {}: {}", id, e),
            }
        }
        Ok(rooms)
    }

    /// Take the first free seat.
    #[instrument(skip(self, name))]
    pub async fn join(&self, room: RoomId, player: PlayerId, name: &str) -> Result<EngineOutcome, GameError> {
        let outcome = self.apply(room, |state, now| turn::seat_player(state, player, name, now)).await?;
        if let Some(p) = outcome.state.player(&player) {
            debug!("Player {} seated {} in room {}", player, p.seat, room);
        }
        Ok(outcome)
    }

    /// Leave a room that has not started.
    #[instrument(skip(self))]
    pub async fn leave(&self, room: RoomId, player: PlayerId) -> Result<EngineOutcome, GameError> {
        self.apply(room, |state, _| turn::remove_player(state, player)).await
    }

    /// Contribute a client seed to the upcoming shuffle.
    #[instrument(skip(self, seed))]
    pub async fn submit_client_seed(
        &self,
        room: RoomId,
        player: PlayerId,
        seed: &str,
    ) -> Result<EngineOutcome, GameError> {
        self.apply(room, |state, now| turn::submit_client_seed(state, player, seed, now)).await
    }

    /// Shuffle, commit, deal and start turn 1.
    ///
    /// One seed is drawn per call; a retried update reuses it.
    #[instrument(skip(self))]
    pub async fn start_game(&self, room: RoomId) -> Result<EngineOutcome, GameError> {
        let seed = ServerSeed::generate();
        let rules = &self.rules;
        let outcome = self.apply(room, |state, now| turn::start_game(state, rules, &seed, now)).await?;
        if let Some(commitment) = outcome.state.fairness.commitment {
            info!(
                "Room {} started, commitment {} (nonce {})",
                room,
                commitment.to_hex(),
                outcome.state.fairness.nonce
            );
        }
        Ok(outcome)
    }

    // =========================================================================
    // TURNS
    // =========================================================================

    /// Draw from the draw pile.
    #[instrument(skip(self))]
    pub async fn draw(&self, room: RoomId, player: PlayerId) -> Result<EngineOutcome, GameError> {
        self.apply(room, |state, now| turn::draw(state, player, now)).await
    }

    /// Take the top discard instead of drawing.
    #[instrument(skip(self))]
    pub async fn pickup_discard(&self, room: RoomId, player: PlayerId) -> Result<EngineOutcome, GameError> {
        let rules = &self.rules;
        self.apply(room, |state, now| turn::pickup_discard(state, rules, player, now)).await
    }

    /// Discard a tile and pass the turn.
    #[instrument(skip(self))]
    pub async fn discard(&self, room: RoomId, player: PlayerId, tile: TileId) -> Result<EngineOutcome, GameError> {
        let rules = &self.rules;
        self.apply(room, |state, now| turn::discard(state, rules, player, tile, now)).await
    }

    /// Auto-play turn `expected_turn` if it is still running and overdue.
    ///
    /// Only an [`TimeoutOutcome::AutoPlayed`] result writes and carries an
    /// outcome.
    #[instrument(skip(self))]
    pub async fn on_turn_timeout(
        &self,
        room: RoomId,
        expected_turn: u32,
    ) -> Result<(TimeoutOutcome, Option<EngineOutcome>), GameError> {
        let now = self.clock.now();
        let rules = &self.rules;
        let mut observed = TimeoutOutcome::Stale;
        let (state, events) = self.store.update_with(room, |state| {
            let (result, events) = turn::on_turn_timeout(state, rules, expected_turn, now)?;
            observed = result;
            if events.is_empty() {
                return Ok(None);
            }
            state.updated_at = now;
            Ok(Some(events))
        }).await?;

        match events {
            Some(events) => {
                info!("Room {} turn {} auto-played", room, expected_turn);
                Ok((observed, Some(EngineOutcome { state, events })))
            }
            None => {
                debug!("Room {} timeout for turn {}: {:?}", room, expected_turn, observed);
                Ok((observed, None))
            }
        }
    }

    // =========================================================================
    // END OF ROUND
    // =========================================================================

    /// Finish the round and reveal the shuffle.
    #[instrument(skip(self))]
    pub async fn end_game(&self, room: RoomId, outcome: RoundOutcome) -> Result<EngineOutcome, GameError> {
        let result = self.apply(room, |state, _| turn::end_game(state, outcome)).await?;
        info!("Room {} finished: {:?}", room, outcome);
        Ok(result)
    }

    /// Cancel the room.
    #[instrument(skip(self))]
    pub async fn cancel(&self, room: RoomId, reason: NoWinnerReason) -> Result<EngineOutcome, GameError> {
        let result = self.apply(room, |state, _| turn::cancel(state, reason)).await?;
        warn!("Room {} cancelled: {:?}", room, reason);
        Ok(result)
    }

    // =========================================================================
    // CONNECTION STATUS
    // =========================================================================

    /// Flag a player as connected.
    pub async fn mark_connected(&self, room: RoomId, player: PlayerId) -> Result<EngineOutcome, GameError> {
        self.apply(room, |state, now| turn::mark_connected(state, player, now)).await
    }

    /// Flag a player as disconnected. The turn clock keeps running.
    pub async fn mark_disconnected(&self, room: RoomId, player: PlayerId) -> Result<EngineOutcome, GameError> {
        self.apply(room, |state, now| turn::mark_disconnected(state, player, now)).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::core::clock::ManualClock;
    use crate::game::state::{GamePhase, Seat, TurnPhase};
    use crate::proof::verify::{verify_room, Verdict};
    use crate::store::{MemoryBackend, RoomBackend};

    pub(crate) fn test_engine() -> (TurnEngine, Arc<ManualClock>) {
        engine_on(Arc::new(MemoryBackend::new()))
    }

    pub(crate) fn engine_on(backend: Arc<dyn RoomBackend>) -> (TurnEngine, Arc<ManualClock>) {
        let store = Arc::new(StateStore::new(backend, StoreConfig::default()));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (TurnEngine::new(store, RuleSet::default(), clock.clone()), clock)
    }

    /// A room with four seated players, in seat order.
    pub(crate) async fn full_room(engine: &TurnEngine) -> (RoomId, Vec<PlayerId>) {
        let room = engine.create_room("table", 100).await.unwrap();
        let mut players = Vec::new();
        for name in ["ayse", "burak", "cem", "deniz"] {
            let player = PlayerId::random();
            engine.join(room.id, player, name).await.unwrap();
            players.push(player);
        }
        (room.id, players)
    }

    #[tokio::test]
    async fn test_join_fills_seats_in_order() {
        let (engine, _) = test_engine();
        let (room, players) = full_room(&engine).await;
        let state = engine.get_room(room).await.unwrap();

        assert_eq!(state.phase, GamePhase::ReadyToStart);
        for (player, seat) in players.iter().zip(Seat::ALL) {
            assert_eq!(state.player(player).unwrap().seat, seat);
        }

        let err = engine.join(room, PlayerId::random(), "late").await.unwrap_err();
        assert!(matches!(err, GameError::IllegalAction(_)));
    }

    #[tokio::test]
    async fn test_rejoin_does_not_write() {
        let (engine, _) = test_engine();
        let room = engine.create_room("table", 0).await.unwrap();
        let player = PlayerId::random();
        let first = engine.join(room.id, player, "ayse").await.unwrap();
        let again = engine.join(room.id, player, "ayse").await.unwrap();

        assert!(again.is_noop());
        assert_eq!(again.state.version, first.state.version);
    }

    #[tokio::test]
    async fn test_start_and_play_a_turn() {
        let (engine, _) = test_engine();
        let (room, players) = full_room(&engine).await;
        let started = engine.start_game(room).await.unwrap();

        assert_eq!(started.state.phase, GamePhase::Playing);
        assert!(started.state.fairness.is_sealed());
        assert!(started.events.iter().any(|e| matches!(e, GameEvent::CommitmentPublished { .. })));
        assert_eq!(started.state.current_player().unwrap().id, players[0]);

        engine.draw(room, players[0]).await.unwrap();
        let hand = engine.get_room(room).await.unwrap().player(&players[0]).unwrap().hand.clone();
        let after = engine.discard(room, players[0], hand[0]).await.unwrap();

        let turn = after.state.turn.as_ref().unwrap();
        assert_eq!(turn.number, 2);
        assert_eq!(turn.player, players[1]);
        assert_eq!(turn.phase, TurnPhase::WaitingForDraw);
        assert!(after.state.tiles_conserved());
    }

    #[tokio::test]
    async fn test_wrong_player_rejected() {
        let (engine, _) = test_engine();
        let (room, players) = full_room(&engine).await;
        engine.start_game(room).await.unwrap();

        let err = engine.draw(room, players[2]).await.unwrap_err();
        assert!(matches!(err, GameError::IllegalAction(_)));
        assert_eq!(engine.get_room(room).await.unwrap().version, 6);
    }

    #[tokio::test]
    async fn test_timeout_not_due_then_auto_played() {
        let (engine, clock) = test_engine();
        let (room, players) = full_room(&engine).await;
        engine.start_game(room).await.unwrap();

        let (outcome, result) = engine.on_turn_timeout(room, 1).await.unwrap();
        assert_eq!(outcome, TimeoutOutcome::NotDue);
        assert!(result.is_none());

        clock.advance(engine.rules().turn_duration());
        let (outcome, result) = engine.on_turn_timeout(room, 1).await.unwrap();
        assert_eq!(outcome, TimeoutOutcome::AutoPlayed { turn_number: 1 });
        let state = result.unwrap().state;
        assert_eq!(state.turn.as_ref().unwrap().player, players[1]);
        assert_eq!(state.player(&players[0]).unwrap().hand.len(), engine.rules().hand_size);

        // A second instance observing the same turn finds it already handled
        let (outcome, result) = engine.on_turn_timeout(room, 1).await.unwrap();
        assert_eq!(outcome, TimeoutOutcome::Stale);
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_racing_discards_only_one_wins() {
        let (engine, _) = test_engine();
        let (room, players) = full_room(&engine).await;
        engine.start_game(room).await.unwrap();
        engine.draw(room, players[0]).await.unwrap();
        let hand = engine.get_room(room).await.unwrap().player(&players[0]).unwrap().hand.clone();

        let a = tokio::spawn({
            let engine = engine.clone();
            let tile = hand[0];
            let player = players[0].clone();
            async move { engine.discard(room, player, tile).await }
        });
        let b = tokio::spawn({
            let engine = engine.clone();
            let tile = hand[1];
            let player = players[0].clone();
            async move { engine.discard(room, player, tile).await }
        });
        let results = [a.await.unwrap(), b.await.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let state = engine.get_room(room).await.unwrap();
        assert_eq!(state.tiles.discard_pile.len(), 1);
        assert_eq!(state.turn.as_ref().unwrap().number, 2);
        assert!(state.tiles_conserved());
    }

    #[tokio::test]
    async fn test_end_game_reveals_verifiable_shuffle() {
        let (engine, _) = test_engine();
        let (room, players) = full_room(&engine).await;
        engine.submit_client_seed(room, players[1], "table-salt").await.unwrap();
        engine.start_game(room).await.unwrap();

        let ended = engine.end_game(room, RoundOutcome::Won { winner: players[3] }).await.unwrap();
        assert_eq!(ended.state.phase, GamePhase::Finished);
        assert!(ended.state.turn.is_none());
        assert!(ended.events.iter().any(|e| matches!(e, GameEvent::SeedRevealed { .. })));

        let report = verify_room(&ended.state).unwrap();
        assert_eq!(report.verdict, Verdict::Valid);

        // Finished rooms leave the active index
        assert!(engine.list_rooms().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_after_last_player_leaves() {
        let (engine, _) = test_engine();
        let room = engine.create_room("table", 0).await.unwrap();
        let player = PlayerId::random();
        engine.join(room.id, player, "ayse").await.unwrap();
        let left = engine.leave(room.id, player).await.unwrap();

        assert_eq!(left.state.phase, GamePhase::Cancelled);
        assert_eq!(
            left.state.outcome,
            Some(RoundOutcome::NoWinner { reason: NoWinnerReason::Abandoned })
        );
    }

    #[tokio::test]
    async fn test_disconnect_keeps_clock_running() {
        let (engine, clock) = test_engine();
        let (room, players) = full_room(&engine).await;
        engine.start_game(room).await.unwrap();

        let dropped = engine.mark_disconnected(room, players[0]).await.unwrap();
        let p = dropped.state.player(&players[0]).unwrap();
        assert!(!p.connected);
        assert_eq!(p.hand.len(), engine.rules().hand_size);
        assert_eq!(dropped.state.turn.as_ref().unwrap().player, players[0]);

        clock.advance(engine.rules().turn_duration());
        let (outcome, _) = engine.on_turn_timeout(room, 1).await.unwrap();
        assert_eq!(outcome, TimeoutOutcome::AutoPlayed { turn_number: 1 });

        let back = engine.mark_connected(room, players[0]).await.unwrap();
        assert!(back.state.player(&players[0]).unwrap().connected);
    }

    #[tokio::test]
    async fn test_start_requires_connected_players() {
        let (engine, _) = test_engine();
        let (room, players) = full_room(&engine).await;
        engine.mark_disconnected(room, players[2]).await.unwrap();

        let err = engine.start_game(room).await.unwrap_err();
        assert!(matches!(err, GameError::IllegalAction(_)));
        assert!(!engine.get_room(room).await.unwrap().fairness.is_sealed());
    }

    #[tokio::test]
    async fn test_missing_room() {
        let (engine, _) = test_engine();
        let err = engine.draw(RoomId::random(), PlayerId::random()).await.unwrap_err();
        assert!(matches!(err, GameError::NotFound { kind: "room", .. }));
    }
}
