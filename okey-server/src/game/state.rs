//! Room State Definitions
//!
//! Everything persisted for one room. A `RoomState` is the unit of
//! persistence and of atomic mutation in the state store.
//! Uses BTreeMap for deterministic iteration order.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use uuid::Uuid;

use crate::core::hash::{hash_with_domain, Hash32, StateHasher};
use crate::error::GameError;
use crate::game::rules::PLAYERS_PER_ROOM;
use crate::game::tile::{full_tile_set, TileId};
use crate::proof::commitment::FairnessRecord;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Domain separator for deriving player ids from auth subjects.
const PLAYER_ID_DOMAIN: &[u8] = b"OKEY_PLAYER_V1";

/// Stable player identifier.
///
/// Implements Ord for deterministic BTreeMap ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub Uuid);

impl PlayerId {
    /// Random id (tests and anonymous demo players).
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Derive the id for an authenticated subject.
    ///
    /// The same `sub` always maps to the same player, across instances and
    /// restarts.
    pub fn from_subject(subject: &str) -> Self {
        let digest = hash_with_domain(PLAYER_ID_DOMAIN, subject.as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Self(Uuid::from_bytes(bytes))
    }

    /// Create from UUID string.
    pub fn from_uuid_str(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Room identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub Uuid);

impl RoomId {
    /// Fresh random room id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from UUID string.
    pub fn from_uuid_str(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of one transport connection.
///
/// A player gets a new connection id every time they reconnect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Fresh random connection id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// SEATS
// =============================================================================

/// Table seat. Turn order is East, South, West, North, then East again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Seat {
    /// Deals to and plays first
    East = 0,
    /// Second
    South = 1,
    /// Third
    West = 2,
    /// Fourth
    North = 3,
}

impl Seat {
    /// All seats in turn order.
    pub const ALL: [Seat; PLAYERS_PER_ROOM] = [Seat::East, Seat::South, Seat::West, Seat::North];

    /// Seat that plays after this one.
    pub fn next(self) -> Seat {
        Seat::ALL[(self.index() + 1) % PLAYERS_PER_ROOM]
    }

    /// Position in turn order.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Seat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// PHASES
// =============================================================================

/// Room lifecycle.
///
/// Phases only move forward. `Cancelled` is reachable from every
/// non-terminal phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum GamePhase {
    /// Seats still open
    #[default]
    WaitingForPlayers,
    /// All four seats taken
    ReadyToStart,
    /// Seed drawn and committed
    Shuffling,
    /// Hands and indicator being laid out
    Dealing,
    /// Turns in progress
    Playing,
    /// Round over with an outcome
    Finished,
    /// Stopped before a normal finish
    Cancelled,
}

impl GamePhase {
    /// Whether `self -> next` is a legal lifecycle step.
    pub fn can_transition_to(self, next: GamePhase) -> bool {
        use GamePhase::*;
        match (self, next) {
            (WaitingForPlayers, ReadyToStart) => true,
            (ReadyToStart, Shuffling) => true,
            (Shuffling, Dealing) => true,
            (Dealing, Playing) => true,
            (Playing, Finished) => true,
            (Finished, _) | (Cancelled, _) => false,
            (_, Cancelled) => true,
            _ => false,
        }
    }

    /// No further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, GamePhase::Finished | GamePhase::Cancelled)
    }

    /// Tiles have been dealt at some point.
    pub fn is_game_started(self) -> bool {
        !matches!(self, GamePhase::WaitingForPlayers | GamePhase::ReadyToStart)
    }
}

/// Step within a single turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnPhase {
    /// Must draw or pick up
    WaitingForDraw,
    /// Must discard
    WaitingForDiscard,
    /// Discarded; about to pass
    TurnCompleted,
}

// =============================================================================
// TURN STATE
// =============================================================================

/// Bookkeeping for the turn in progress.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnState {
    /// Seat whose turn it is
    pub position: Seat,

    /// Player in that seat
    pub player: PlayerId,

    /// 1 for the first turn, +1 per completed turn
    pub number: u32,

    /// Step within the turn
    pub phase: TurnPhase,

    /// When the turn began
    pub started_at: DateTime<Utc>,

    /// Deadline after which the turn is auto-played
    pub expires_at: DateTime<Utc>,

    /// A tile has been drawn or picked up this turn
    pub has_drawn: bool,

    /// The turn is being completed by auto-play
    pub auto_play: bool,

    /// Tile taken this turn, if any
    pub last_drawn: Option<TileId>,
}

impl TurnState {
    /// Start a fresh turn.
    pub fn begin(
        position: Seat,
        player: PlayerId,
        number: u32,
        now: DateTime<Utc>,
        duration: chrono::Duration,
    ) -> Self {
        Self {
            position,
            player,
            number,
            phase: TurnPhase::WaitingForDraw,
            started_at: now,
            expires_at: now + duration,
            has_drawn: false,
            auto_play: false,
            last_drawn: None,
        }
    }

    /// Deadline has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// =============================================================================
// TILES
// =============================================================================

/// Tiles outside the players' hands.
///
/// Both piles keep their top at the end of the vector.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileState {
    /// Face-down draw pile
    pub draw_pile: Vec<TileId>,

    /// Face-up discard pile
    pub discard_pile: Vec<TileId>,

    /// Face-up indicator designating the okey
    pub indicator: Option<TileId>,

    /// Complete shuffled sequence; immutable once dealt
    pub dealt_order: Vec<TileId>,
}

// =============================================================================
// PLAYER STATE
// =============================================================================

/// State of a seated player.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerState {
    /// Stable player id
    pub id: PlayerId,

    /// Display name
    pub name: String,

    /// Assigned seat
    pub seat: Seat,

    /// Tiles in hand
    pub hand: Vec<TileId>,

    /// Has a live connection
    pub connected: bool,

    /// Last successful (re)connection
    pub last_connected_at: Option<DateTime<Utc>>,

    /// When the connection was lost
    pub disconnected_at: Option<DateTime<Utc>>,

    /// Last command or connection event
    pub last_activity_at: DateTime<Utc>,

    /// Mirrors the room's turn state
    pub is_current_turn: bool,

    /// Mirrors the room's turn state
    pub has_drawn_this_turn: bool,
}

impl PlayerState {
    /// Newly seated, connected player.
    pub fn new(id: PlayerId, name: impl Into<String>, seat: Seat, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: name.into(),
            seat,
            hand: Vec::new(),
            connected: true,
            last_connected_at: Some(now),
            disconnected_at: None,
            last_activity_at: now,
            is_current_turn: false,
            has_drawn_this_turn: false,
        }
    }

    /// Whether `tile` is in this player's hand.
    pub fn holds(&self, tile: TileId) -> bool {
        self.hand.contains(&tile)
    }

    /// Remove one tile from the hand.
    pub fn take_tile(&mut self, tile: TileId) -> bool {
        match self.hand.iter().position(|t| *t == tile) {
            Some(index) => {
                self.hand.remove(index);
                true
            }
            None => false,
        }
    }

    fn hash_into(&self, hasher: &mut StateHasher) {
        hasher.update_uuid(&self.id.0);
        hasher.update_u8(self.seat as u8);
        hasher.update_u32(self.hand.len() as u32);
        for tile in &self.hand {
            hasher.update_u8(tile.0);
        }
        hasher.update_bool(self.connected);
    }
}

// =============================================================================
// OUTCOME
// =============================================================================

/// Why a round ended without a winner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoWinnerReason {
    /// A turn needed a tile and the draw pile was empty
    DrawPileExhausted,
    /// Auto-play found nothing to discard
    NoLegalDiscard,
    /// Every player left before the start
    Abandoned,
    /// Cancelled by an operator
    Cancelled,
}

/// How a round ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoundOutcome {
    /// Declared by the external adjudicator
    Won { winner: PlayerId },
    /// Ended without a winner
    NoWinner { reason: NoWinnerReason },
}

// =============================================================================
// ROOM STATE
// =============================================================================

/// Complete state of a room.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomState {
    /// Room identifier
    pub id: RoomId,

    /// Display name
    pub name: String,

    /// Table stake (display only; settlement is external)
    pub stake: u64,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Last mutation time
    pub updated_at: DateTime<Utc>,

    /// Store version for compare-and-swap; bumped on every write
    pub version: u64,

    /// Lifecycle phase
    pub phase: GamePhase,

    /// Seated players (BTreeMap for deterministic iteration)
    pub players: BTreeMap<PlayerId, PlayerState>,

    /// Turn in progress while `Playing`
    pub turn: Option<TurnState>,

    /// Piles, indicator and dealt order
    pub tiles: TileState,

    /// Commit-reveal record
    pub fairness: FairnessRecord,

    /// Set when the room reaches a terminal phase
    pub outcome: Option<RoundOutcome>,
}

impl RoomState {
    /// Create an empty room waiting for players.
    pub fn new(id: RoomId, name: impl Into<String>, stake: u64, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: name.into(),
            stake,
            created_at: now,
            updated_at: now,
            version: 0,
            phase: GamePhase::WaitingForPlayers,
            players: BTreeMap::new(),
            turn: None,
            tiles: TileState::default(),
            fairness: FairnessRecord::default(),
            outcome: None,
        }
    }

    /// Move to `next`, rejecting illegal lifecycle steps.
    pub fn transition_to(&mut self, next: GamePhase) -> Result<GamePhase, GameError> {
        if !self.phase.can_transition_to(next) {
            return Err(GameError::IllegalAction(format!(
                "room {} cannot move from {:?} to {:?}",
                self.id, self.phase, next
            )));
        }
        let previous = self.phase;
        self.phase = next;
        Ok(previous)
    }

    /// Get a player by ID.
    pub fn player(&self, id: &PlayerId) -> Option<&PlayerState> {
        self.players.get(id)
    }

    /// Get a player mutably by ID.
    pub fn player_mut(&mut self, id: &PlayerId) -> Option<&mut PlayerState> {
        self.players.get_mut(id)
    }

    /// Get a seated player or fail with `NotFound`.
    pub fn require_player(&self, id: &PlayerId) -> Result<&PlayerState, GameError> {
        self.players.get(id).ok_or_else(|| GameError::player_not_found(*id))
    }

    /// Player sitting in `seat`.
    pub fn player_at(&self, seat: Seat) -> Option<&PlayerState> {
        self.players.values().find(|p| p.seat == seat)
    }

    /// First unoccupied seat in turn order.
    pub fn free_seat(&self) -> Option<Seat> {
        Seat::ALL.into_iter().find(|seat| self.player_at(*seat).is_none())
    }

    /// Players with a live connection.
    pub fn connected_count(&self) -> usize {
        self.players.values().filter(|p| p.connected).count()
    }

    /// Player whose turn it is.
    pub fn current_player(&self) -> Option<&PlayerState> {
        self.turn.as_ref().and_then(|t| self.players.get(&t.player))
    }

    /// Copy the turn flags onto the player records.
    pub fn sync_turn_flags(&mut self) {
        let (current, drawn) = match &self.turn {
            Some(turn) => (Some(turn.player), turn.has_drawn),
            None => (None, false),
        };
        for player in self.players.values_mut() {
            let is_current = Some(player.id) == current;
            player.is_current_turn = is_current;
            player.has_drawn_this_turn = is_current && drawn;
        }
    }

    /// Every tile currently on the table, sorted.
    ///
    /// Hands, both piles and the indicator. From the deal onwards this equals
    /// [`full_tile_set`].
    pub fn tile_census(&self) -> Vec<TileId> {
        let mut all: Vec<TileId> = self.players.values()
            .flat_map(|p| p.hand.iter().copied())
            .chain(self.tiles.draw_pile.iter().copied())
            .chain(self.tiles.discard_pile.iter().copied())
            .chain(self.tiles.indicator)
            .collect();
        all.sort();
        all
    }

    /// Whether the census matches the full set.
    pub fn tiles_conserved(&self) -> bool {
        self.tile_census() == full_tile_set()
    }

    /// Hash of the observable game state, for desync detection.
    pub fn compute_hash(&self) -> Hash32 {
        let mut hasher = StateHasher::for_room_state();
        hasher.update_uuid(&self.id.0);
        hasher.update_u64(self.version);
        hasher.update_u8(self.phase as u8);
        for player in self.players.values() {
            player.hash_into(&mut hasher);
        }
        if let Some(turn) = &self.turn {
            hasher.update_u8(turn.position as u8);
            hasher.update_u32(turn.number);
            hasher.update_u8(turn.phase as u8);
            hasher.update_bool(turn.has_drawn);
        }
        hasher.update_prefixed(&self.tiles.draw_pile.iter().map(|t| t.0).collect::<Vec<_>>());
        hasher.update_prefixed(&self.tiles.discard_pile.iter().map(|t| t.0).collect::<Vec<_>>());
        hasher.update_u8(self.tiles.indicator.map_or(u8::MAX, |t| t.0));
        hasher.finalize()
    }
}
