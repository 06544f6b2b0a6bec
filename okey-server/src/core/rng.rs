//! Deterministic Random Number Generator
//!
//! Uses xoroshiro128+ for fast, reproducible randomness.
//! Given the same seed material the shuffle is identical on every platform,
//! which is what lets a player re-derive the dealt order after a reveal.

/// Deterministic PRNG using the xoroshiro128+ algorithm.
///
/// # Determinism Guarantee
///
/// Given the same seed, this RNG produces the exact same sequence
/// of values on any platform.
///
/// # Example
///
/// ```
/// use okey_server::core::rng::DeterministicRng;
///
/// let mut rng = DeterministicRng::new(42);
/// assert_eq!(rng.next_u64(), 16629283624882167704);
/// ```
#[derive(Clone, Debug)]
pub struct DeterministicRng {
    state: [u64; 2],
}

impl DeterministicRng {
    /// Create a new RNG from a 64-bit seed.
    ///
    /// Uses SplitMix64 to initialize the internal state, ensuring
    /// good distribution even from weak seeds.
    pub fn new(seed: u64) -> Self {
        let mut s = seed;
        let state0 = splitmix64(&mut s);
        let state1 = splitmix64(&mut s);
        Self::from_state(state0, state1)
    }

    /// Create a new RNG from 32 bytes of seed material (a SHA-256 digest).
    ///
    /// Each 64-bit lane of the state is derived from one half of the digest,
    /// so every input byte influences the sequence.
    pub fn from_seed_bytes(seed: &[u8; 32]) -> Self {
        let mut lo = read_u64(&seed[0..8]) ^ read_u64(&seed[16..24]);
        let mut hi = read_u64(&seed[8..16]) ^ read_u64(&seed[24..32]);
        let state0 = splitmix64(&mut lo);
        let state1 = splitmix64(&mut hi);
        Self::from_state(state0, state1)
    }

    fn from_state(state0: u64, state1: u64) -> Self {
        // The generator must never run from an all-zero state
        let state = if state0 == 0 && state1 == 0 {
            [1, 1]
        } else {
            [state0, state1]
        };
        Self { state }
    }

    /// Generate the next 64-bit random value.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let s0 = self.state[0];
        let mut s1 = self.state[1];
        let result = s0.wrapping_add(s1);

        s1 ^= s0;
        self.state[0] = s0.rotate_left(24) ^ s1 ^ (s1 << 16);
        self.state[1] = s1.rotate_left(37);

        result
    }

    /// Generate a random integer in range [0, bound).
    ///
    /// Rejection sampling keeps the distribution exactly uniform. A shuffle
    /// that players audit cannot carry modulo bias.
    #[inline]
    pub fn next_below(&mut self, bound: u32) -> u32 {
        if bound <= 1 {
            return 0;
        }
        let bound = bound as u64;
        let zone = u64::MAX - (u64::MAX % bound);
        loop {
            let value = self.next_u64();
            if value < zone {
                return (value % bound) as u32;
            }
        }
    }

    /// Shuffle a slice in place using Fisher-Yates algorithm.
    pub fn shuffle<T>(&mut self, slice: &mut [T]) {
        let len = slice.len();
        for i in (1..len).rev() {
            let j = self.next_below((i + 1) as u32) as usize;
            slice.swap(i, j);
        }
    }

    /// Current internal state.
    pub fn state(&self) -> [u64; 2] {
        self.state
    }
}

/// SplitMix64 for seed initialization.
/// Produces well-distributed values from sequential seeds.
#[inline]
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

#[inline]
fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

// =============================================================================
// TESTS
// =============================================================================
