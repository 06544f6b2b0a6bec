//! Tile set.
//!
//! 106 tiles: two copies of 1-13 in four colours plus two false jokers.
//! Tiles are identified by a compact [`TileId`] so hands, piles and the
//! fairness blob are plain byte sequences.

use std::fmt;

use serde::{Serialize, Deserialize};

/// Number of tiles in a full set.
pub const TOTAL_TILES: usize = 106;

/// Number of numbered (non-joker) tiles.
pub const NUMBERED_TILES: u8 = 104;

/// Highest face value.
pub const MAX_NUMBER: u8 = 13;

/// Compact tile identifier in `0..106`.
///
/// Ids below 104 encode `copy * 52 + color * 13 + (number - 1)`.
/// 104 and 105 are the false jokers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TileId(pub u8);

impl TileId {
    /// Create a tile id, rejecting values outside the set.
    pub fn new(raw: u8) -> Option<Self> {
        if (raw as usize) < TOTAL_TILES {
            Some(Self(raw))
        } else {
            None
        }
    }

    /// Decode the face of this tile.
    pub fn tile(self) -> Tile {
        if self.0 >= NUMBERED_TILES {
            return Tile::FalseJoker;
        }
        let within_copy = self.0 % 52;
        Tile::Numbered {
            color: Color::from_index(within_copy / MAX_NUMBER),
            number: within_copy % MAX_NUMBER + 1,
        }
    }

    /// Which of the two physical copies this id is (0 or 1).
    pub fn copy(self) -> u8 {
        if self.0 >= NUMBERED_TILES {
            self.0 - NUMBERED_TILES
        } else {
            self.0 / 52
        }
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.tile(), self.copy())
    }
}

/// Tile colour.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Color {
    Yellow = 0,
    Blue = 1,
    Black = 2,
    Red = 3,
}

impl Color {
    fn from_index(index: u8) -> Self {
        match index {
            0 => Color::Yellow,
            1 => Color::Blue,
            2 => Color::Black,
            _ => Color::Red,
        }
    }

    fn letter(self) -> char {
        match self {
            Color::Yellow => 'Y',
            Color::Blue => 'B',
            Color::Black => 'K',
            Color::Red => 'R',
        }
    }
}

/// Decoded tile face.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tile {
    /// Coloured tile numbered 1-13.
    Numbered { color: Color, number: u8 },
    /// Stands in for the okey face.
    FalseJoker,
}

impl Tile {
    /// Face designated as wild by an indicator tile.
    ///
    /// The okey is the indicator's colour, one number higher (13 wraps to 1).
    /// A false-joker indicator designates no okey.
    pub fn okey_for(indicator: TileId) -> Option<Tile> {
        match indicator.tile() {
            Tile::Numbered { color, number } => Some(Tile::Numbered {
                color,
                number: number % MAX_NUMBER + 1,
            }),
            Tile::FalseJoker => None,
        }
    }
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tile::Numbered { color, number } => write!(f, "{}{}", color.letter(), number),
            Tile::FalseJoker => write!(f, "FJ"),
        }
    }
}

/// The canonical, unshuffled tile sequence.
pub fn full_tile_set() -> Vec<TileId> {
    (0..TOTAL_TILES as u8).map(TileId).collect()
}
