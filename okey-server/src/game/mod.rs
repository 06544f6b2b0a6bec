//! Game Logic Module
//!
//! Table rules and the turn state machine. Pure and synchronous.
//!
//! ## Module Structure
//!
//! - `tile`: Tile set and okey designation
//! - `rules`: Rule-set parameters and auto-play tile choice
//! - `state`: Room state, players, turn bookkeeping
//! - `turn`: State transitions (seat, start, draw, discard, timeout, end)
//! - `events`: Events describing each transition

pub mod tile;
pub mod rules;
pub mod state;
pub mod turn;
pub mod events;

// Re-export key types
pub use tile::{Tile, TileId};
pub use rules::{AutoDiscardPolicy, RuleSet};
pub use state::{
    ConnectionId, GamePhase, NoWinnerReason, PlayerId, PlayerState, RoomId, RoomState,
    RoundOutcome, Seat, TurnPhase,
};
pub use turn::TimeoutOutcome;
pub use events::GameEvent;
