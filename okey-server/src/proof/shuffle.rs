//! Seeded shuffle.
//!
//! The dealt order is a pure function of (server seed, nonce, client seed)
//! applied to the canonical tile sequence, so it can be recomputed by anyone
//! holding the reveal.

use crate::core::hash::{Hash32, StateHasher};
use crate::core::rng::DeterministicRng;
use crate::game::tile::{full_tile_set, TileId, TOTAL_TILES};
use crate::proof::commitment::{
    compute_commitment, fold_client_seed, CommitmentHash, FairnessError, ServerSeed,
};

/// Domain separator for shuffle seed derivation.
const SHUFFLE_DOMAIN: &[u8] = b"OKEY_SHUFFLE_V1";

/// Canonical byte encoding of a tile sequence (bincode: u64 LE length, then ids).
pub fn encode_initial_state(tiles: &[TileId]) -> Result<Vec<u8>, FairnessError> {
    bincode::serialize(tiles).map_err(|e| FairnessError::Codec(e.to_string()))
}

/// Decode and validate a canonical tile sequence.
pub fn decode_initial_state(bytes: &[u8]) -> Result<Vec<TileId>, FairnessError> {
    let tiles: Vec<TileId> =
        bincode::deserialize(bytes).map_err(|e| FairnessError::Codec(e.to_string()))?;
    if tiles.len() > TOTAL_TILES {
        return Err(FairnessError::Codec(format!("{} tiles exceeds the set size", tiles.len())));
    }
    if let Some(bad) = tiles.iter().find(|t| TileId::new(t.0).is_none()) {
        return Err(FairnessError::Codec(format!("tile id {} out of range", bad.0)));
    }
    Ok(tiles)
}

/// Derive the PRNG seed for a round.
pub fn shuffle_seed(seed: &ServerSeed, nonce: u64, client_seed: Option<&str>) -> Hash32 {
    let mut hasher = StateHasher::new(SHUFFLE_DOMAIN);
    hasher.update_bytes(seed.as_bytes());
    hasher.update_u64(nonce);
    fold_client_seed(&mut hasher, client_seed);
    hasher.finalize()
}

/// Fisher-Yates permutation of `initial` driven by the round's seed.
pub fn derive_permutation(
    seed: &ServerSeed,
    initial: &[TileId],
    nonce: u64,
    client_seed: Option<&str>,
) -> Vec<TileId> {
    let mut rng = DeterministicRng::from_seed_bytes(&shuffle_seed(seed, nonce, client_seed));
    let mut tiles = initial.to_vec();
    rng.shuffle(&mut tiles);
    tiles
}

/// A committed round: commitment, shuffled order, and the secret inputs.
#[derive(Debug, Clone)]
pub struct SealedRound {
    /// Commitment to publish.
    pub commitment: CommitmentHash,
    /// Canonical initial-state blob.
    pub initial_state: Vec<u8>,
    /// Shuffled tile order to deal from.
    pub shuffled: Vec<TileId>,
    /// Round nonce.
    pub nonce: u64,
    /// Combined client seed folded into the round.
    pub client_seed: Option<String>,
    seed: ServerSeed,
}

impl SealedRound {
    /// The secret seed; only the fairness record reads this.
    pub(crate) fn seed(&self) -> &ServerSeed {
        &self.seed
    }
}

/// Commit to and shuffle a full tile set.
pub fn seal_round(
    seed: ServerSeed,
    nonce: u64,
    client_seed: Option<String>,
) -> Result<SealedRound, FairnessError> {
    let initial = full_tile_set();
    let initial_state = encode_initial_state(&initial)?;
    let commitment = compute_commitment(&seed, &initial_state, nonce, client_seed.as_deref());
    let shuffled = derive_permutation(&seed, &initial, nonce, client_seed.as_deref());
    Ok(SealedRound {
        commitment,
        initial_state,
        shuffled,
        nonce,
        client_seed,
        seed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_encoding_is_canonical() {
        let tiles = full_tile_set();
        let bytes = encode_initial_state(&tiles).unwrap();
        // u64 length prefix followed by one byte per tile
        assert_eq!(bytes.len(), 8 + TOTAL_TILES);
        assert_eq!(&bytes[..8], &(TOTAL_TILES as u64).to_le_bytes());
        assert_eq!(bytes[8], 0);
        assert_eq!(bytes[8 + 105], 105);
        assert_eq!(decode_initial_state(&bytes).unwrap(), tiles);
    }

    #[test]
    fn test_decode_rejects_out_of_range_tiles() {
        let mut bytes = encode_initial_state(&full_tile_set()).unwrap();
        bytes[8] = 200;
        assert!(decode_initial_state(&bytes).is_err());
        assert!(decode_initial_state(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_permutation_is_reproducible() {
        let seed = ServerSeed::from_bytes([3; 32]);
        let initial = full_tile_set();
        let a = derive_permutation(&seed, &initial, 1, None);
        let b = derive_permutation(&seed, &initial, 1, None);
        assert_eq!(a, b);

        let mut sorted = a.clone();
        sorted.sort();
        assert_eq!(sorted, initial);
    }

    #[test]
    fn test_permutation_depends_on_all_inputs() {
        let seed = ServerSeed::from_bytes([3; 32]);
        let initial = full_tile_set();
        let base = derive_permutation(&seed, &initial, 1, None);
        assert_ne!(base, derive_permutation(&ServerSeed::from_bytes([4; 32]), &initial, 1, None));
        assert_ne!(base, derive_permutation(&seed, &initial, 2, None));
        assert_ne!(base, derive_permutation(&seed, &initial, 1, Some("player")));
    }

    #[test]
    fn test_seal_round() {
        let seed = ServerSeed::from_bytes([9; 32]);
        let round = seal_round(seed.clone(), 3, Some("abc".into())).unwrap();
        assert_eq!(round.nonce, 3);
        assert_eq!(round.shuffled.len(), TOTAL_TILES);
        assert_eq!(
            round.commitment,
            compute_commitment(&seed, &round.initial_state, 3, Some("abc"))
        );
        assert_eq!(round.seed(), &seed);
    }
}
