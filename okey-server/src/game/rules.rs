//! Rule set.
//!
//! Parameters that vary between rule variants live here rather than being
//! hard-coded in the turn logic: hand size, turn clock, whether the top
//! discard may be taken instead of drawing, and how auto-play picks a tile.

use std::str::FromStr;
use std::time::Duration;

use serde::{Serialize, Deserialize};

use crate::game::tile::{Tile, TileId};

/// Seats at every table.
pub const PLAYERS_PER_ROOM: usize = 4;

/// How auto-play chooses the tile to throw when a turn times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoDiscardPolicy {
    /// Least valuable tile; ties broken by lowest [`TileId`].
    LowestValue,
    /// The tile drawn this turn, falling back to `LowestValue`.
    DrawnTile,
}

impl FromStr for AutoDiscardPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lowest_value" => Ok(Self::LowestValue),
            "drawn_tile" => Ok(Self::DrawnTile),
            other => Err(format!("unknown auto-discard policy: {}", other)),
        }
    }
}

/// Rule-set parameters for a room.
#[derive(Debug, Clone)]
pub struct RuleSet {
    /// Tiles dealt to each player.
    pub hand_size: usize,
    /// Time a player has to finish a turn.
    pub turn_timeout: Duration,
    /// Taking the top discard is a legal alternative to drawing.
    pub allow_discard_pickup: bool,
    /// Tile selection for auto-play.
    pub auto_discard: AutoDiscardPolicy,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            hand_size: 14,
            turn_timeout: Duration::from_secs(30),
            allow_discard_pickup: true,
            auto_discard: AutoDiscardPolicy::LowestValue,
        }
    }
}

impl RuleSet {
    /// Turn timeout as a chrono duration for timestamp arithmetic.
    pub fn turn_duration(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.turn_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(30))
    }

    /// Value of a tile for auto-play purposes (lower is thrown first).
    ///
    /// The okey is wild and never preferred; a false joker is worth the
    /// okey's face number; everything else is worth its face number.
    pub fn tile_value(&self, tile: TileId, indicator: Option<TileId>) -> u8 {
        let okey = indicator.and_then(Tile::okey_for);
        match tile.tile() {
            face @ Tile::Numbered { number, .. } => {
                if Some(face) == okey {
                    u8::MAX
                } else {
                    number
                }
            }
            Tile::FalseJoker => match okey {
                Some(Tile::Numbered { number, .. }) => number,
                _ => 0,
            },
        }
    }

    /// Pick the tile auto-play discards from `hand`.
    ///
    /// Returns `None` only for an empty hand.
    pub fn select_auto_discard(
        &self,
        hand: &[TileId],
        last_drawn: Option<TileId>,
        indicator: Option<TileId>,
    ) -> Option<TileId> {
        if self.auto_discard == AutoDiscardPolicy::DrawnTile {
            if let Some(drawn) = last_drawn.filter(|t| hand.contains(t)) {
                return Some(drawn);
            }
        }
        hand.iter()
            .copied()
            .min_by_key(|tile| (self.tile_value(*tile, indicator), *tile))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rules() {
        let rules = RuleSet::default();
        assert_eq!(rules.hand_size, 14);
        assert!(rules.allow_discard_pickup);
        assert_eq!(rules.turn_duration(), chrono::Duration::seconds(30));
    }

    #[test]
    fn test_tile_values() {
        let rules = RuleSet::default();
        // Indicator Yellow 5 (id 4) makes Yellow 6 (ids 5 and 57) the okey
        let indicator = Some(TileId(4));
        assert_eq!(rules.tile_value(TileId(5), indicator), u8::MAX);
        assert_eq!(rules.tile_value(TileId(57), indicator), u8::MAX);
        assert_eq!(rules.tile_value(TileId(104), indicator), 6);
        assert_eq!(rules.tile_value(TileId(13), indicator), 1);
        assert_eq!(rules.tile_value(TileId(104), None), 0);
    }

    #[test]
    fn test_lowest_value_tie_break_is_lowest_id() {
        let rules = RuleSet::default();
        // Blue 1 (13), Red 1 (39) and Yellow 1 copy two (52) all worth 1
        let hand = [TileId(39), TileId(52), TileId(13), TileId(20)];
        assert_eq!(rules.select_auto_discard(&hand, None, Some(TileId(30))), Some(TileId(13)));
    }

    #[test]
    fn test_okey_is_never_first_choice() {
        let rules = RuleSet::default();
        // Indicator Yellow 5 -> okey Yellow 6 (id 5)
        let hand = [TileId(5), TileId(12)];
        assert_eq!(rules.select_auto_discard(&hand, None, Some(TileId(4))), Some(TileId(12)));
        assert_eq!(rules.select_auto_discard(&[TileId(5)], None, Some(TileId(4))), Some(TileId(5)));
    }

    #[test]
    fn test_drawn_tile_policy() {
        let rules = RuleSet {
            auto_discard: AutoDiscardPolicy::DrawnTile,
            ..Default::default()
        };
        let hand = [TileId(0), TileId(12)];
        assert_eq!(rules.select_auto_discard(&hand, Some(TileId(12)), None), Some(TileId(12)));
        // Drawn tile no longer in hand falls back to lowest value
        assert_eq!(rules.select_auto_discard(&hand, Some(TileId(40)), None), Some(TileId(0)));
    }

    #[test]
    fn test_empty_hand_has_no_discard() {
        let rules = RuleSet::default();
        assert_eq!(rules.select_auto_discard(&[], None, None), None);
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("lowest_value".parse::<AutoDiscardPolicy>(), Ok(AutoDiscardPolicy::LowestValue));
        assert_eq!("drawn_tile".parse::<AutoDiscardPolicy>(), Ok(AutoDiscardPolicy::DrawnTile));
        assert!("random".parse::<AutoDiscardPolicy>().is_err());
    }
}
