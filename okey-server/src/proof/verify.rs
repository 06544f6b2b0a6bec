//! Verification API
//!
//! Check a revealed round against its published commitment and against the
//! tile order that was actually dealt. The two checks are independent and are
//! reported separately so a failure always names the guarantee that broke.

use serde::{Serialize, Deserialize};

use crate::game::state::RoomState;
use crate::game::tile::TileId;
use crate::proof::commitment::{compute_commitment, CommitmentHash, RevealDisclosure, ServerSeed};
use crate::proof::shuffle::{decode_initial_state, derive_permutation};

/// Result of one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    /// Check ran and passed.
    Passed,
    /// Check ran and failed.
    Failed,
    /// Check could not run on the supplied input.
    Skipped,
}

/// Overall verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Verdict {
    /// Reveal reproduces the commitment and the dealt order.
    Valid,
    /// Revealed inputs do not hash to the published commitment.
    HashMismatch,
    /// Inputs match the commitment but do not reproduce the dealt order.
    PermutationMismatch,
    /// Input was malformed or incomplete.
    Error { message: String },
}

/// Full verification report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Commitment recomputation.
    pub hash_check: CheckOutcome,
    /// Permutation recomputation.
    pub permutation_check: CheckOutcome,
    /// Combined verdict.
    pub verdict: Verdict,
    /// Hex commitment recomputed from the reveal, when computable.
    pub computed_commitment: Option<String>,
}

impl VerificationReport {
    fn error(message: impl Into<String>) -> Self {
        Self {
            hash_check: CheckOutcome::Skipped,
            permutation_check: CheckOutcome::Skipped,
            verdict: Verdict::Error { message: message.into() },
            computed_commitment: None,
        }
    }

    /// Both checks passed.
    pub fn is_valid(&self) -> bool {
        self.verdict == Verdict::Valid
    }
}

/// Verify a reveal.
///
/// `published_commitment` is the hash the verifier received at round start
/// (not the copy inside the reveal). `dealt_order` is the order the verifier
/// observed being dealt.
pub fn verify_reveal(
    reveal: &RevealDisclosure,
    published_commitment: Option<&str>,
    dealt_order: &[TileId],
) -> VerificationReport {
    let published = match published_commitment.filter(|c| !c.is_empty()) {
        Some(hex) => match CommitmentHash::from_hex(hex) {
            Ok(c) => c,
            Err(e) => return VerificationReport::error(format!("published commitment: {}", e)),
        },
        None => return VerificationReport::error("no commitment was published"),
    };

    let seed = match ServerSeed::from_hex(&reveal.server_seed) {
        Ok(s) => s,
        Err(e) => return VerificationReport::error(format!("server seed: {}", e)),
    };

    let initial_bytes = match hex::decode(&reveal.initial_state) {
        Ok(b) => b,
        Err(e) => return VerificationReport::error(format!("initial state: invalid hex: {}", e)),
    };

    let computed = compute_commitment(
        &seed,
        &initial_bytes,
        reveal.nonce,
        reveal.client_seed.as_deref(),
    );
    let hash_check = if computed == published {
        CheckOutcome::Passed
    } else {
        CheckOutcome::Failed
    };

    let permutation_check = match decode_initial_state(&initial_bytes) {
        Ok(initial) => {
            let recomputed = derive_permutation(
                &seed,
                &initial,
                reveal.nonce,
                reveal.client_seed.as_deref(),
            );
            if recomputed == dealt_order {
                CheckOutcome::Passed
            } else {
                CheckOutcome::Failed
            }
        }
        Err(_) => CheckOutcome::Skipped,
    };

    let verdict = match (hash_check, permutation_check) {
        (CheckOutcome::Failed, _) => Verdict::HashMismatch,
        (CheckOutcome::Passed, CheckOutcome::Passed) => Verdict::Valid,
        (CheckOutcome::Passed, CheckOutcome::Failed) => Verdict::PermutationMismatch,
        _ => Verdict::Error { message: "initial state could not be decoded".into() },
    };

    VerificationReport {
        hash_check,
        permutation_check,
        verdict,
        computed_commitment: Some(computed.to_hex()),
    }
}

/// Verify a room's own reveal against its recorded commitment and deal.
///
/// Returns `None` while the round has not been revealed.
pub fn verify_room(state: &RoomState) -> Option<VerificationReport> {
    let reveal = state.fairness.disclosure(&state.tiles.dealt_order)?;
    let published = state.fairness.commitment.map(|c| c.to_hex());
    Some(verify_reveal(&reveal, published.as_deref(), &state.tiles.dealt_order))
}
