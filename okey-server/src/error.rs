//! Engine error type.
//!
//! Returned by every turn-engine and session operation. Variants map one to
//! one onto the wire [`ErrorCode`](crate::network::protocol::ErrorCode).

use crate::game::state::{ConnectionId, PlayerId, RoomId};
use crate::store::StoreError;

/// Errors surfaced to callers of the engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GameError {
    /// Malformed input (bad tile id, oversized client seed, ...).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Well-formed request that the current state does not allow.
    #[error("illegal action: {0}")]
    IllegalAction(String),

    /// Referenced room, player or connection does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Optimistic update kept losing the race.
    #[error("room {room_id}: update lost {attempts} consecutive races")]
    ConcurrencyConflict { room_id: RoomId, attempts: u32 },

    /// The state store could not be reached in time.
    #[error("state store unavailable: {0}")]
    StoreUnavailable(String),

    /// Invariant violation or corrupt record.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GameError {
    /// Unknown room.
    pub fn room_not_found(id: RoomId) -> Self {
        GameError::NotFound { kind: "room", id: id.to_string() }
    }

    /// Unknown or unseated player.
    pub fn player_not_found(id: PlayerId) -> Self {
        GameError::NotFound { kind: "player", id: id.to_string() }
    }

    /// Unbound connection.
    pub fn connection_not_found(id: ConnectionId) -> Self {
        GameError::NotFound { kind: "connection", id: id.to_string() }
    }

    /// Retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GameError::ConcurrencyConflict { .. } | GameError::StoreUnavailable(_)
        )
    }
}

impl From<StoreError> for GameError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => GameError::StoreUnavailable(msg),
            StoreError::Conflict(room_id) => GameError::ConcurrencyConflict { room_id, attempts: 1 },
            StoreError::AlreadyExists(room_id) => {
                GameError::IllegalAction(format!("room {} already exists", room_id))
            }
            StoreError::Codec(msg) => GameError::Internal(format!("stored record: {}", msg)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_game_errors() {
        let err: GameError = StoreError::Unavailable("timeout".into()).into();
        assert!(matches!(err, GameError::StoreUnavailable(_)));
        assert!(err.is_transient());

        let err: GameError = StoreError::Codec("bad json".into()).into();
        assert!(matches!(err, GameError::Internal(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_not_found_message() {
        let id = RoomId::random();
        assert_eq!(GameError::room_not_found(id).to_string(), format!("room not found: {}", id));
    }
}
