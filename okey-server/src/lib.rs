//! # Okey Room Server
//!
//! Authoritative room server for four-player Okey. Any number of instances
//! share one state store; no instance owns a room.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     OKEY ROOM SERVER                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                 │
//! │  ├── rng.rs      - xoroshiro128+ PRNG for the shuffle       │
//! │  ├── hash.rs     - Domain-separated SHA-256 hashing         │
//! │  └── clock.rs    - Injected wall clock                      │
//! │                                                             │
//! │  game/           - Rules and turn logic (pure)              │
//! │  ├── tile.rs     - 106-tile set, okey designation           │
//! │  ├── rules.rs    - Rule-set parameters, auto-discard        │
//! │  ├── state.rs    - Room, player, turn and tile state        │
//! │  ├── turn.rs     - State machine transitions                │
//! │  └── events.rs   - Transition events                        │
//! │                                                             │
//! │  proof/          - Provably-fair shuffle                    │
//! │  ├── commitment.rs - Seed, commitment, fairness record      │
//! │  ├── shuffle.rs  - Canonical state, permutation             │
//! │  └── verify.rs   - Reveal verification                      │
//! │                                                             │
//! │  store/          - Shared versioned room state              │
//! │  engine/         - Async operations, turn timer             │
//! │  network/        - Auth, protocol, sessions, fan-out        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Consistency
//!
//! Every room change is one compare-and-swap on the room's version. Turn
//! timeouts go through the same path guarded by the observed turn number, so
//! concurrent instances can never play the same turn twice.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod game;
pub mod network;
pub mod proof;
pub mod store;

// Re-export commonly used types
pub use config::AppConfig;
pub use engine::{EngineOutcome, TurnEngine, TurnTimer};
pub use error::GameError;
pub use game::state::{GamePhase, PlayerId, RoomId, RoomState, RoundOutcome};
pub use network::session::SessionManager;
pub use proof::verify::{verify_reveal, VerificationReport};
pub use store::StateStore;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
