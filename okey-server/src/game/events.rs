//! Game Events
//!
//! Every transition reports what happened as a list of events. They are
//! broadcast to the room and logged; they never carry hidden information
//! (a tile drawn from the face-down pile is not named).

use serde::{Serialize, Deserialize};

use crate::game::state::{GamePhase, NoWinnerReason, PlayerId, RoundOutcome, Seat};
use crate::game::tile::TileId;

/// Where a drawn tile came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawSource {
    DrawPile,
    DiscardPile,
}

/// Game event data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GameEvent {
    /// Player took a seat
    PlayerSeated {
        player: PlayerId,
        seat: Seat,
        name: String,
    },

    /// Player left before the start
    PlayerLeft {
        player: PlayerId,
        seat: Seat,
    },

    /// Player contributed entropy to the next shuffle
    ClientSeedAccepted {
        player: PlayerId,
        seat: Seat,
    },

    /// Room lifecycle moved
    PhaseChanged {
        from: GamePhase,
        to: GamePhase,
    },

    /// Commitment published before dealing
    CommitmentPublished {
        commitment_hash: String,
        nonce: u64,
    },

    /// Hands dealt and indicator turned up
    TilesDealt {
        indicator: TileId,
        draw_pile_size: usize,
    },

    /// A new turn began
    TurnStarted {
        player: PlayerId,
        seat: Seat,
        turn_number: u32,
        expires_at: chrono::DateTime<chrono::Utc>,
    },

    /// Player took a tile. Only pickups from the open discard pile name it.
    TileDrawn {
        player: PlayerId,
        source: DrawSource,
        tile: Option<TileId>,
        draw_pile_remaining: usize,
    },

    /// Player threw a tile onto the discard pile
    TileDiscarded {
        player: PlayerId,
        tile: TileId,
    },

    /// The clock ran out and the server completed the turn
    AutoPlayed {
        player: PlayerId,
        turn_number: u32,
        drew: bool,
        discarded: Option<TileId>,
    },

    /// Connection status changed
    PlayerConnection {
        player: PlayerId,
        connected: bool,
    },

    /// Round is over
    RoundEnded {
        outcome: RoundOutcome,
    },

    /// Secret shuffle inputs disclosed
    SeedRevealed {
        commitment_hash: String,
        nonce: u64,
    },
}

impl GameEvent {
    /// Player the event is about, if any.
    pub fn player(&self) -> Option<PlayerId> {
        match self {
            GameEvent::PlayerSeated { player, .. }
            | GameEvent::PlayerLeft { player, .. }
            | GameEvent::ClientSeedAccepted { player, .. }
            | GameEvent::TurnStarted { player, .. }
            | GameEvent::TileDrawn { player, .. }
            | GameEvent::TileDiscarded { player, .. }
            | GameEvent::AutoPlayed { player, .. }
            | GameEvent::PlayerConnection { player, .. } => Some(*player),
            GameEvent::RoundEnded { outcome: RoundOutcome::Won { winner } } => Some(*winner),
            _ => None,
        }
    }

    /// Round ended without a winner for `reason`.
    pub fn ended_without_winner(&self, reason: NoWinnerReason) -> bool {
        matches!(
            self,
            GameEvent::RoundEnded { outcome: RoundOutcome::NoWinner { reason: r } } if *r == reason
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let event = GameEvent::TileDrawn {
            player: PlayerId::random(),
            source: DrawSource::DrawPile,
            tile: None,
            draw_pile_remaining: 40,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "tile_drawn");
        assert_eq!(json["source"], "draw_pile");
        assert!(json["tile"].is_null());
    }

    #[test]
    fn test_event_player() {
        let id = PlayerId::random();
        let won = GameEvent::RoundEnded { outcome: RoundOutcome::Won { winner: id } };
        assert_eq!(won.player(), Some(id));
        let changed = GameEvent::PhaseChanged { from: GamePhase::Dealing, to: GamePhase::Playing };
        assert_eq!(changed.player(), None);
    }

    #[test]
    fn test_ended_without_winner() {
        let event = GameEvent::RoundEnded {
            outcome: RoundOutcome::NoWinner { reason: NoWinnerReason::DrawPileExhausted },
        };
        assert!(event.ended_without_winner(NoWinnerReason::DrawPileExhausted));
        assert!(!event.ended_without_winner(NoWinnerReason::Cancelled));
    }
}
