//! Core primitives.
//!
//! Deterministic building blocks shared by the game rules and the fairness
//! protocol, plus the clock seam the turn engine reads time through.

pub mod rng;
pub mod hash;
pub mod clock;

// Re-export core types
pub use rng::DeterministicRng;
pub use hash::{Hash32, StateHasher, hash_with_domain};
pub use clock::{Clock, ManualClock, SystemClock};
