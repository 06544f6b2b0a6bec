//! Protocol Messages
//!
//! Wire format for client-server communication. All messages are JSON.
//!
//! Room state never leaves the server as is: every recipient gets a
//! [`RoomView`] built for them, with their own hand in full, other hands as
//! counts and the fairness secrets only once they have been revealed.

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::error::GameError;
use crate::game::events::GameEvent;
use crate::game::rules::PLAYERS_PER_ROOM;
use crate::game::state::{
    GamePhase, PlayerId, RoomId, RoomState, RoundOutcome, Seat, TurnPhase,
};
use crate::game::tile::TileId;
use crate::proof::commitment::{CommitmentDisclosure, RevealDisclosure};

/// Rooms accept client seed contributions until the shuffle is committed.
pub const ACCEPTS_CLIENT_SEED: bool = true;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate the connection.
    Auth { token: String },

    /// Request the open room list.
    ListRooms,

    /// Open a new room.
    CreateRoom { name: String, stake: u64 },

    /// Take a seat.
    Join { room_id: RoomId },

    /// Leave before the game starts.
    Leave,

    /// Contribute to the shuffle seed.
    ClientSeed { seed: String },

    /// Deal and start the round.
    StartGame,

    /// A turn action.
    Turn { command: TurnCommand },

    /// Ask for a full snapshot.
    SyncRequest,

    /// Ping for latency measurement.
    Ping { timestamp: u64 },
}

/// Turn actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnAction {
    /// Draw from the draw pile.
    Draw,
    /// Discard `tile_id`.
    Discard,
    /// Take the top discard.
    PickupDiscard,
}

/// Inbound turn command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnCommand {
    /// What to do
    #[serde(rename = "type")]
    pub action: TurnAction,
    /// Acting player; must match the authenticated connection
    pub player_id: PlayerId,
    /// Tile to discard
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tile_id: Option<TileId>,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication accepted.
    Authenticated { player_id: PlayerId, name: String },

    /// Room list.
    Rooms { rooms: Vec<RoomSummary> },

    /// Room state after a change.
    State(RoomView),

    /// Full snapshot after (re)connecting.
    Resync(RoomView),

    /// Shuffle commitment for the round that just started.
    Commitment(CommitmentDisclosure),

    /// Shuffle inputs for the round that just ended.
    Reveal(RevealDisclosure),

    /// Something happened in the room.
    Event { event: GameEvent },

    /// Pong response.
    Pong { timestamp: u64, server_time: u64 },

    /// Error message.
    Error(ServerError),
}

/// Server error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Not authenticated.
    NotAuthenticated,
    /// JWT token has expired.
    TokenExpired,
    /// Invalid JWT token (signature, format, claims).
    InvalidToken,
    /// Message could not be parsed.
    InvalidMessage,
    /// Malformed request.
    Validation,
    /// Request not allowed in the current state.
    IllegalAction,
    /// Room, player or connection unknown.
    NotFound,
    /// Contention on the room; retry.
    Conflict,
    /// Store unreachable; retry.
    Unavailable,
    /// Internal error.
    InternalError,
}

impl From<&GameError> for ErrorCode {
    fn from(err: &GameError) -> Self {
        match err {
            GameError::Validation(_) => ErrorCode::Validation,
            GameError::IllegalAction(_) => ErrorCode::IllegalAction,
            GameError::NotFound { .. } => ErrorCode::NotFound,
            GameError::ConcurrencyConflict { .. } => ErrorCode::Conflict,
            GameError::StoreUnavailable(_) => ErrorCode::Unavailable,
            GameError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

// =============================================================================
// ROOM VIEWS
// =============================================================================

/// Lobby listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSummary {
    /// Room id
    pub id: RoomId,
    /// Display name
    pub name: String,
    /// Stake per player
    pub stake: u64,
    /// Seated players
    pub current_player_count: usize,
    /// Always 4
    pub max_players: usize,
    /// Past `ReadyToStart`
    pub is_game_started: bool,
}

impl From<&RoomState> for RoomSummary {
    fn from(state: &RoomState) -> Self {
        Self {
            id: state.id,
            name: state.name.clone(),
            stake: state.stake,
            current_player_count: state.players.len(),
            max_players: PLAYERS_PER_ROOM,
            is_game_started: state.phase.is_game_started(),
        }
    }
}

/// A seat as seen by one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerView {
    /// Player id
    pub id: PlayerId,
    /// Display name
    pub name: String,
    /// Seat
    pub seat: Seat,
    /// Connection status
    pub connected: bool,
    /// Tiles in hand
    pub tile_count: usize,
    /// The tiles themselves; only in the owner's view
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hand: Option<Vec<TileId>>,
}

/// Public part of the turn in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnView {
    /// Seat to move
    pub seat: Seat,
    /// Player to move
    pub player: PlayerId,
    /// Turn number
    pub number: u32,
    /// Step within the turn
    pub phase: TurnPhase,
    /// Turn start
    pub started_at: DateTime<Utc>,
    /// Auto-play deadline
    pub expires_at: DateTime<Utc>,
    /// Tile taken
    pub has_drawn: bool,
}

/// Room state filtered for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomView {
    /// Room id
    pub id: RoomId,
    /// Display name
    pub name: String,
    /// Stake per player
    pub stake: u64,
    /// Record version
    pub version: u64,
    /// Room phase
    pub phase: GamePhase,
    /// Seated players in seat order
    pub players: Vec<PlayerView>,
    /// Turn in progress
    pub turn: Option<TurnView>,
    /// Tiles left to draw
    pub draw_pile_count: usize,
    /// Face-up discards, top last
    pub discard_pile: Vec<TileId>,
    /// Face-up indicator
    pub indicator: Option<TileId>,
    /// Published commitment
    pub commitment: Option<CommitmentDisclosure>,
    /// Shuffle inputs; present only after the round ended
    pub reveal: Option<RevealDisclosure>,
    /// How the round ended
    pub outcome: Option<RoundOutcome>,
    /// Hex digest of the full authoritative state
    pub state_hash: String,
}

impl RoomView {
    /// Build the view `viewer` is allowed to see. `None` is a spectator.
    pub fn for_player(state: &RoomState, viewer: Option<PlayerId>) -> Self {
        let mut players: Vec<PlayerView> = state.players.values()
            .map(|p| PlayerView {
                id: p.id,
                name: p.name.clone(),
                seat: p.seat,
                connected: p.connected,
                tile_count: p.hand.len(),
                hand: (Some(p.id) == viewer).then(|| p.hand.clone()),
            })
            .collect();
        players.sort_by_key(|p| p.seat);

        let turn = state.turn.as_ref().map(|t| TurnView {
            seat: t.position,
            player: t.player,
            number: t.number,
            phase: t.phase,
            started_at: t.started_at,
            expires_at: t.expires_at,
            has_drawn: t.has_drawn,
        });

        Self {
            id: state.id,
            name: state.name.clone(),
            stake: state.stake,
            version: state.version,
            phase: state.phase,
            players,
            turn,
            draw_pile_count: state.tiles.draw_pile.len(),
            discard_pile: state.tiles.discard_pile.clone(),
            indicator: state.tiles.indicator,
            commitment: state.fairness.commitment_disclosure(ACCEPTS_CLIENT_SEED),
            reveal: state.fairness.disclosure(&state.tiles.dealt_order),
            outcome: state.outcome,
            state_hash: hex::encode(state.compute_hash()),
        }
    }
}

// =============================================================================
// FAN-OUT
// =============================================================================

impl ServerMessage {
    /// Error message for a failed request.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ServerError { code, message: message.into() })
    }

    /// Error message for an engine error.
    pub fn from_game_error(err: &GameError) -> Self {
        Self::error(ErrorCode::from(err), err.to_string())
    }

    /// Messages `viewer` receives for one persisted change: the events, any
    /// commitment or reveal they announce, then the new state.
    pub fn for_update(state: &RoomState, events: &[GameEvent], viewer: PlayerId) -> Vec<ServerMessage> {
        let mut messages = Vec::with_capacity(events.len() + 2);
        for event in events {
            match event {
                GameEvent::CommitmentPublished { .. } => {
                    if let Some(c) = state.fairness.commitment_disclosure(ACCEPTS_CLIENT_SEED) {
                        messages.push(ServerMessage::Commitment(c));
                    }
                }
                GameEvent::SeedRevealed { .. } => {
                    if let Some(r) = state.fairness.disclosure(&state.tiles.dealt_order) {
                        messages.push(ServerMessage::Reveal(r));
                    }
                }
                _ => {}
            }
            messages.push(ServerMessage::Event { event: event.clone() });
        }
        messages.push(ServerMessage::State(RoomView::for_player(state, Some(viewer))));
        messages
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{full_room, test_engine};
    use crate::game::state::NoWinnerReason;

    #[test]
    fn test_turn_command_wire_format() {
        let player = PlayerId::random();
        let json = format!(r#"{{"type":"discard","player_id":"{}","tile_id":17}}"#, player);
        let cmd: TurnCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(cmd.action, TurnAction::Discard);
        assert_eq!(cmd.player_id, player);
        assert_eq!(cmd.tile_id, Some(TileId(17)));

        let draw = TurnCommand { action: TurnAction::PickupDiscard, player_id: player, tile_id: None };
        let json = serde_json::to_string(&draw).unwrap();
        assert!(json.contains(r#""type":"pickup_discard""#));
        assert!(!json.contains("tile_id"));
    }

    #[test]
    fn test_client_message_parse() {
        let msg = ClientMessage::from_json(r#"{"type":"create_room","name":"salon","stake":50}"#).unwrap();
        assert_eq!(msg, ClientMessage::CreateRoom { name: "salon".into(), stake: 50 });
        assert!(ClientMessage::from_json(r#"{"type":"teleport"}"#).is_err());
    }

    #[test]
    fn test_error_codes() {
        let err = GameError::ConcurrencyConflict { room_id: RoomId::random(), attempts: 8 };
        let json = ServerMessage::from_game_error(&err).to_json().unwrap();
        assert!(json.contains(r#""code":"conflict""#));
        assert_eq!(ErrorCode::from(&GameError::Validation("x".into())), ErrorCode::Validation);
    }

    #[tokio::test]
    async fn test_summary_counts_players() {
        let (engine, _) = test_engine();
        let (room, _) = full_room(&engine).await;
        let summary = RoomSummary::from(&engine.get_room(room).await.unwrap());
        assert_eq!(summary.current_player_count, 4);
        assert_eq!(summary.max_players, 4);
        assert!(!summary.is_game_started);
    }

    #[tokio::test]
    async fn test_view_hides_other_hands_and_seed() {
        let (engine, _) = test_engine();
        let (room, players) = full_room(&engine).await;
        let state = engine.start_game(room).await.unwrap().state;

        let view = RoomView::for_player(&state, Some(players[1]));
        for p in &view.players {
            assert_eq!(p.tile_count, engine.rules().hand_size);
            assert_eq!(p.hand.is_some(), p.id == players[1]);
        }
        assert!(view.commitment.is_some());
        assert!(view.reveal.is_none());

        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains("server_seed"));
        assert!(!json.contains("dealt_order"));
        assert_eq!(view.state_hash, hex::encode(state.compute_hash()));

        let spectator = RoomView::for_player(&state, None);
        assert!(spectator.players.iter().all(|p| p.hand.is_none()));
    }

    #[tokio::test]
    async fn test_reveal_visible_after_round() {
        let (engine, _) = test_engine();
        let (room, players) = full_room(&engine).await;
        engine.start_game(room).await.unwrap();
        let ended = engine.cancel(room, NoWinnerReason::Cancelled).await.unwrap();

        let view = RoomView::for_player(&ended.state, Some(players[0]));
        let reveal = view.reveal.unwrap();
        assert_eq!(reveal.commitment_hash, view.commitment.unwrap().commitment_hash);

        let messages = ServerMessage::for_update(&ended.state, &ended.events, players[0]);
        assert!(messages.iter().any(|m| matches!(m, ServerMessage::Reveal(_))));
        assert!(matches!(messages.last(), Some(ServerMessage::State(_))));
    }
}
