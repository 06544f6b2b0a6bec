//! Shuffle Commitment Protocol
//!
//! Commit to the shuffle inputs before dealing.
//! Reveal them when the round ends so anyone can check the deal.

use std::collections::BTreeMap;
use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Serialize, Deserialize, Serializer, Deserializer};

use crate::core::hash::{Hash32, StateHasher};
use crate::game::state::Seat;
use crate::game::tile::TileId;
use crate::proof::shuffle::SealedRound;

/// Domain separator for commitments.
pub const COMMITMENT_DOMAIN: &[u8] = b"OKEY_COMMIT_V1";

/// Longest accepted client seed contribution.
pub const MAX_CLIENT_SEED_LEN: usize = 64;

/// Secret server seed.
///
/// `Debug` is redacted so the seed cannot leak through log statements or
/// error messages before the reveal.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerSeed([u8; 32]);

impl ServerSeed {
    /// Draw a fresh seed from the operating system CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap known bytes (tests and verification).
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, String> {
        decode_hash32(s).map(Self)
    }

    /// Raw seed bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex encoding, only called when building a reveal.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ServerSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ServerSeed(<redacted>)")
    }
}

impl Serialize for ServerSeed {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ServerSeed {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Published commitment hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommitmentHash(pub Hash32);

impl CommitmentHash {
    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, String> {
        decode_hash32(s).map(Self)
    }

    /// Hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for CommitmentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitmentHash({})", self.to_hex())
    }
}

impl fmt::Display for CommitmentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for CommitmentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for CommitmentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

fn decode_hash32(s: &str) -> Result<[u8; 32], String> {
    let bytes = hex::decode(s).map_err(|e| format!("invalid hex: {}", e))?;
    if bytes.len() != 32 {
        return Err(format!("expected 32 bytes, got {}", bytes.len()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Compute `H(seed || initial_state || nonce [|| client_seed])`.
///
/// The initial state is length-prefixed and the optional client seed carries
/// a presence byte, so no two distinct input tuples share a preimage.
pub fn compute_commitment(
    seed: &ServerSeed,
    initial_state: &[u8],
    nonce: u64,
    client_seed: Option<&str>,
) -> CommitmentHash {
    let mut hasher = StateHasher::new(COMMITMENT_DOMAIN);
    hasher.update_bytes(seed.as_bytes());
    hasher.update_prefixed(initial_state);
    hasher.update_u64(nonce);
    fold_client_seed(&mut hasher, client_seed);
    CommitmentHash(hasher.finalize())
}

pub(crate) fn fold_client_seed(hasher: &mut StateHasher, client_seed: Option<&str>) {
    match client_seed {
        Some(seed) => {
            hasher.update_u8(1);
            hasher.update_prefixed(seed.as_bytes());
        }
        None => hasher.update_u8(0),
    }
}

/// Check a client seed contribution before accepting it.
pub fn validate_client_seed(seed: &str) -> Result<(), String> {
    if seed.is_empty() || seed.len() > MAX_CLIENT_SEED_LEN {
        return Err(format!("client seed must be 1-{} characters", MAX_CLIENT_SEED_LEN));
    }
    if !seed.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err("client seed may only contain [A-Za-z0-9_-]".into());
    }
    Ok(())
}

/// Commitment disclosure (sent at round start).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentDisclosure {
    /// Hex commitment hash.
    pub commitment_hash: String,
    /// Whether players could contribute client seeds.
    pub accepts_client_seed: bool,
    /// Round nonce.
    pub nonce: u64,
}

/// Reveal disclosure (sent at round end).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealDisclosure {
    /// Hex server seed.
    pub server_seed: String,
    /// Hex canonical initial tile sequence.
    pub initial_state: String,
    /// Round nonce.
    pub nonce: u64,
    /// Hex commitment hash as published at round start.
    pub commitment_hash: String,
    /// Combined client seed folded into the commitment, if any.
    pub client_seed: Option<String>,
    /// Tile order actually dealt.
    pub dealt_order: Vec<TileId>,
}

/// Errors raised while sealing or revealing a round.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FairnessError {
    /// The round already has a commitment.
    #[error("round is already sealed")]
    AlreadySealed,

    /// Initial state could not be encoded or decoded.
    #[error("initial state codec error: {0}")]
    Codec(String),
}

/// Fairness fields persisted with the room.
///
/// The seed and initial state are private: they are written once by
/// [`FairnessRecord::seal`] and only leave the record through
/// [`FairnessRecord::reveal`] / [`FairnessRecord::disclosure`] after the
/// round ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FairnessRecord {
    /// Nonce of the current (or last) round; 0 before the first round.
    pub nonce: u64,
    /// Published commitment.
    pub commitment: Option<CommitmentHash>,
    /// Client seed contributions by seat.
    #[serde(default)]
    pub client_seeds: BTreeMap<Seat, String>,
    server_seed: Option<ServerSeed>,
    #[serde(default, with = "hex_option")]
    initial_state: Option<Vec<u8>>,
    client_seed: Option<String>,
    revealed: bool,
}

impl FairnessRecord {
    /// Nonce the next sealed round will use.
    pub fn next_nonce(&self) -> u64 {
        self.nonce + 1
    }

    /// Client seed contributions joined in seat order.
    pub fn combined_client_seed(&self) -> Option<String> {
        if self.client_seeds.is_empty() {
            return None;
        }
        let joined = self.client_seeds.values()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(":");
        Some(joined)
    }

    /// Store a sealed round. Fails if a commitment is already in place.
    pub fn seal(&mut self, round: &SealedRound) -> Result<(), FairnessError> {
        if self.commitment.is_some() {
            return Err(FairnessError::AlreadySealed);
        }
        self.nonce = round.nonce;
        self.commitment = Some(round.commitment);
        self.server_seed = Some(round.seed().clone());
        self.initial_state = Some(round.initial_state.clone());
        self.client_seed = round.client_seed.clone();
        self.revealed = false;
        Ok(())
    }

    /// Whether a commitment has been published.
    pub fn is_sealed(&self) -> bool {
        self.commitment.is_some()
    }

    /// Whether the secret inputs have been disclosed.
    pub fn is_revealed(&self) -> bool {
        self.revealed
    }

    /// Drop the server seed and initial arrangement unless already revealed.
    ///
    /// Used on copies of the room that leave the state store.
    pub fn redact_secrets(&mut self) {
        if !self.revealed {
            self.server_seed = None;
            self.initial_state = None;
        }
    }

    /// Commitment payload for the round start broadcast.
    pub fn commitment_disclosure(&self, accepts_client_seed: bool) -> Option<CommitmentDisclosure> {
        self.commitment.map(|c| CommitmentDisclosure {
            commitment_hash: c.to_hex(),
            accepts_client_seed,
            nonce: self.nonce,
        })
    }

    /// Mark the round revealed and return the disclosure.
    pub fn reveal(&mut self, dealt_order: &[TileId]) -> Option<RevealDisclosure> {
        if !self.is_sealed() {
            return None;
        }
        self.revealed = true;
        self.disclosure(dealt_order)
    }

    /// Disclosure of a round that has already been revealed.
    pub fn disclosure(&self, dealt_order: &[TileId]) -> Option<RevealDisclosure> {
        if !self.revealed {
            return None;
        }
        let commitment = self.commitment?;
        let seed = self.server_seed.as_ref()?;
        let initial_state = self.initial_state.as_ref()?;
        Some(RevealDisclosure {
            server_seed: seed.to_hex(),
            initial_state: hex::encode(initial_state),
            nonce: self.nonce,
            commitment_hash: commitment.to_hex(),
            client_seed: self.client_seed.clone(),
            dealt_order: dealt_order.to_vec(),
        })
    }
}

mod hex_option {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let value: Option<String> = Option::deserialize(deserializer)?;
        value
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proof::shuffle::seal_round;

    fn test_seed() -> ServerSeed {
        ServerSeed::from_bytes([7; 32])
    }

    #[test]
    fn test_commitment_determinism() {
        let a = compute_commitment(&test_seed(), b"state", 1, None);
        let b = compute_commitment(&test_seed(), b"state", 1, None);
        assert_eq!(a, b);
    }

    #[test]
    fn test_commitment_binds_every_input() {
        let base = compute_commitment(&test_seed(), b"state", 1, None);
        assert_ne!(base, compute_commitment(&ServerSeed::from_bytes([8; 32]), b"state", 1, None));
        assert_ne!(base, compute_commitment(&test_seed(), b"statf", 1, None));
        assert_ne!(base, compute_commitment(&test_seed(), b"state", 2, None));
        assert_ne!(base, compute_commitment(&test_seed(), b"state", 1, Some("abc")));
        assert_ne!(
            compute_commitment(&test_seed(), b"state", 1, Some("abc")),
            compute_commitment(&test_seed(), b"state", 1, Some("abd")),
        );
    }

    #[test]
    fn test_seed_debug_is_redacted() {
        let seed = test_seed();
        let printed = format!("{:?}", seed);
        assert!(!printed.contains(&seed.to_hex()));
        assert!(printed.contains("redacted"));
    }

    #[test]
    fn test_generated_seeds_differ() {
        assert_ne!(ServerSeed::generate(), ServerSeed::generate());
    }

    #[test]
    fn test_hex_roundtrip_and_errors() {
        let commitment = compute_commitment(&test_seed(), b"x", 1, None);
        assert_eq!(CommitmentHash::from_hex(&commitment.to_hex()), Ok(commitment));
        assert!(CommitmentHash::from_hex("zz").is_err());
        assert!(CommitmentHash::from_hex("abcd").is_err());
    }

    #[test]
    fn test_client_seed_validation() {
        assert!(validate_client_seed("lucky-7_seed").is_ok());
        assert!(validate_client_seed("").is_err());
        assert!(validate_client_seed("has space").is_err());
        assert!(validate_client_seed(&"a".repeat(MAX_CLIENT_SEED_LEN + 1)).is_err());
    }

    #[test]
    fn test_combined_client_seed_in_seat_order() {
        let mut record = FairnessRecord::default();
        assert_eq!(record.combined_client_seed(), None);
        record.client_seeds.insert(Seat::West, "w".into());
        record.client_seeds.insert(Seat::East, "e".into());
        assert_eq!(record.combined_client_seed().as_deref(), Some("e:w"));
    }

    #[test]
    fn test_seal_is_write_once() {
        let mut record = FairnessRecord::default();
        let round = seal_round(test_seed(), record.next_nonce(), None).unwrap();
        record.seal(&round).unwrap();
        assert_eq!(record.nonce, 1);
        assert_eq!(record.seal(&round), Err(FairnessError::AlreadySealed));
    }

    #[test]
    fn test_redact_keeps_secrets_only_after_reveal() {
        let mut record = FairnessRecord::default();
        let round = seal_round(test_seed(), 1, None).unwrap();
        record.seal(&round).unwrap();

        let mut sealed = record.clone();
        sealed.redact_secrets();
        assert_eq!(sealed.commitment, record.commitment);
        let json = serde_json::to_string(&sealed).unwrap();
        assert!(!json.contains(&test_seed().to_hex()));

        record.reveal(&round.shuffled).unwrap();
        let mut revealed = record.clone();
        revealed.redact_secrets();
        assert_eq!(revealed, record);
        assert!(revealed.disclosure(&round.shuffled).is_some());
    }

    #[test]
    fn test_no_disclosure_before_reveal() {
        let mut record = FairnessRecord::default();
        let round = seal_round(test_seed(), 1, None).unwrap();
        record.seal(&round).unwrap();

        assert!(record.disclosure(&round.shuffled).is_none());
        let json = serde_json::to_string(&record.commitment_disclosure(true)).unwrap();
        assert!(!json.contains(&test_seed().to_hex()));

        let reveal = record.reveal(&round.shuffled).unwrap();
        assert!(record.is_revealed());
        assert_eq!(reveal.server_seed, test_seed().to_hex());
        assert_eq!(reveal.commitment_hash, round.commitment.to_hex());
        assert_eq!(record.disclosure(&round.shuffled), Some(reveal));
    }

    #[test]
    fn test_record_persists_through_json() {
        let mut record = FairnessRecord::default();
        let round = seal_round(test_seed(), 1, Some("abc".into())).unwrap();
        record.seal(&round).unwrap();

        let json = serde_json::to_string(&record).unwrap();
        let restored: FairnessRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, record);
    }

    #[test]
    fn test_reveal_without_commitment() {
        let mut record = FairnessRecord::default();
        assert!(record.reveal(&[]).is_none());
        assert!(!record.is_revealed());
    }
}
