//! Provably-Fair Shuffle
//!
//! Commit-reveal protocol for the deal:
//! - A fresh server seed is drawn and committed to before any tile moves
//! - The deal is a seeded, reproducible permutation of the canonical set
//! - At round end the seed and initial state are revealed for checking
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    FAIRNESS ENGINE                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  commitment.rs - Server seed, commitment hash, record       │
//! │  shuffle.rs    - Canonical state encoding, permutation      │
//! │  verify.rs     - Reveal verification report                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod commitment;
pub mod shuffle;
pub mod verify;

// Re-export key types
pub use commitment::{
    compute_commitment, CommitmentDisclosure, CommitmentHash, FairnessError, FairnessRecord,
    RevealDisclosure, ServerSeed,
};
pub use shuffle::{derive_permutation, seal_round, SealedRound};
pub use verify::{verify_reveal, verify_room, CheckOutcome, Verdict, VerificationReport};
