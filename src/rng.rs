//! Random number generation based on PCG32.
//!
//! The peer protocol needs randomness for two things only: handshake nonces and the
//! per-connection session token. Neither feeds the simulation, so timing entropy is
//! good enough, and a fixed seed makes handshakes reproducible in tests.
//!
//! Reference: <https://www.pcg-random.org/>
//!
//! ```rust
//! use lockstep_rollback::rng::{Pcg32, Rng, SeedableRng};
//!
//! let mut rng = Pcg32::seed_from_u64(12345);
//! let value = rng.gen_range(0..100);
//! assert!(value < 100);
//! ```

use crate::{
    report_violation,
    telemetry::{ViolationKind, ViolationSeverity},
};
use std::cell::RefCell;

/// PCG32 random number generator (PCG-XSH-RR, 64-bit state). Not cryptographically secure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

/// Default increment for single-stream PCG32.
const PCG_DEFAULT_INCREMENT: u64 = 1442695040888963407;

/// Multiplier constant for the LCG step.
const PCG_MULTIPLIER: u64 = 6364136223846793005;

impl Pcg32 {
    /// Creates a new generator with the given state and stream.
    #[must_use]
    pub const fn new(state: u64, stream: u64) -> Self {
        let inc = (stream << 1) | 1;
        let mut pcg = Self { state: 0, inc };
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg.state = pcg.state.wrapping_add(state);
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg
    }

    /// Generates the next 32-bit random value.
    #[inline]
    #[must_use]
    pub fn next_u32(&mut self) -> u32 {
        let old_state = self.state;
        self.state = old_state
            .wrapping_mul(PCG_MULTIPLIER)
            .wrapping_add(self.inc);
        // XSH-RR output permutation
        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        xorshifted.rotate_right(rot)
    }
}

/// Trait for seeding random number generators.
pub trait SeedableRng: Sized {
    /// Creates a new RNG seeded from a 64-bit value.
    #[must_use]
    fn seed_from_u64(seed: u64) -> Self;

    /// Creates a new RNG with a seed derived from timing information.
    #[must_use]
    fn from_entropy() -> Self;
}

impl SeedableRng for Pcg32 {
    fn seed_from_u64(seed: u64) -> Self {
        Self::new(seed, PCG_DEFAULT_INCREMENT)
    }

    fn from_entropy() -> Self {
        Self::seed_from_u64(timing_entropy_seed())
    }
}

/// Trait for random number generation.
pub trait Rng {
    /// Returns the next 32-bit random value.
    fn next_u32(&mut self) -> u32;

    /// Generates a random value of type `T`.
    fn gen<T: RandomValue>(&mut self) -> T {
        T::random(self)
    }

    /// Generates a random `u32` value in the given range `[low, high)`.
    ///
    /// If `range.is_empty()`, reports a violation via telemetry and returns `range.start`.
    fn gen_range(&mut self, range: std::ops::Range<u32>) -> u32 {
        let span = range.end.wrapping_sub(range.start);
        if range.is_empty() || span == 0 {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Configuration,
                "gen_range called with empty range [{}..{})",
                range.start,
                range.end
            );
            return range.start;
        }

        // rejection sampling keeps the distribution unbiased
        let threshold = span.wrapping_neg() % span;
        loop {
            let random_value = self.next_u32();
            if random_value >= threshold {
                return range.start.wrapping_add(random_value % span);
            }
        }
    }
}

impl Rng for Pcg32 {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        Pcg32::next_u32(self)
    }
}

/// Types that can be drawn from an [`Rng`].
pub trait RandomValue {
    /// Draws a value.
    fn random<R: Rng + ?Sized>(rng: &mut R) -> Self;
}

impl RandomValue for u16 {
    fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        (rng.next_u32() >> 16) as u16
    }
}

impl RandomValue for u32 {
    fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        rng.next_u32()
    }
}

impl RandomValue for u64 {
    fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        (u64::from(rng.next_u32()) << 32) | u64::from(rng.next_u32())
    }
}

impl RandomValue for bool {
    fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        rng.next_u32() & 1 == 1
    }
}

thread_local! {
    static THREAD_RNG: RefCell<Pcg32> = RefCell::new(Pcg32::from_entropy());
}

/// Generates a random value using the thread-local RNG.
///
/// ```rust
/// use lockstep_rollback::rng::random;
///
/// let value: u32 = random();
/// let coin_flip: bool = random();
/// # let _ = (value, coin_flip);
/// ```
#[must_use]
pub fn random<T: RandomValue>() -> T {
    THREAD_RNG.with(|rng| {
        let mut rng = rng.borrow_mut();
        T::random(&mut *rng)
    })
}

/// Mixes wall-clock time, a monotonic reading and the thread identity into a seed.
/// Intentionally non-deterministic; use [`Pcg32::seed_from_u64`] for reproducible sequences.
fn timing_entropy_seed() -> u64 {
    use std::hash::{BuildHasher, Hash, Hasher};
    use web_time::{Instant, SystemTime, UNIX_EPOCH};

    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64);

    let mut hasher = std::collections::hash_map::RandomState::new().build_hasher();
    std::thread::current().id().hash(&mut hasher);
    Instant::now().elapsed().as_nanos().hash(&mut hasher);
    wall.hash(&mut hasher);

    hasher.finish().wrapping_add(0x9e3779b97f4a7c15)
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn test_pcg32_deterministic() {
        let mut a = Pcg32::seed_from_u64(42);
        let mut b = Pcg32::seed_from_u64(42);
        for _ in 0..100 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn test_pcg32_different_seeds() {
        let mut a = Pcg32::seed_from_u64(1);
        let mut b = Pcg32::seed_from_u64(2);
        let same = (0..32).filter(|_| a.next_u32() == b.next_u32()).count();
        assert!(same < 4);
    }

    #[test]
    fn test_gen_range_stays_in_bounds() {
        let mut rng = Pcg32::seed_from_u64(7);
        for _ in 0..1000 {
            let value = rng.gen_range(3..9);
            assert!((3..9).contains(&value));
        }
    }

    #[test]
    fn test_gen_range_empty_returns_start() {
        let mut rng = Pcg32::seed_from_u64(7);
        assert_eq!(rng.gen_range(5..5), 5);
    }

    #[test]
    fn test_random_types() {
        let mut rng = Pcg32::seed_from_u64(99);
        let _: u16 = rng.gen();
        let _: u64 = rng.gen();
        let flips: Vec<bool> = (0..64).map(|_| rng.gen()).collect();
        assert!(flips.iter().any(|b| *b));
        assert!(flips.iter().any(|b| !*b));
    }

    #[test]
    fn test_from_entropy_produces_values() {
        let mut rng = Pcg32::from_entropy();
        let values: Vec<u32> = (0..8).map(|_| rng.next_u32()).collect();
        assert!(values.windows(2).any(|w| w[0] != w[1]));
        let _: u32 = random();
    }
}
