use serde::{Deserialize, Serialize};

/// Small reproducible generator driving workloads.
///
/// Same seed, same workload, on every platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterministicRng {
    state: u64,
}

impl DeterministicRng {
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self {
            state: seed ^ 0x9E37_79B9_7F4A_7C15,
        }
    }

    /// Next pseudo-random `u64` (PCG-style LCG step with an xorshift output mix).
    pub const fn next_u64(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        let x = self.state;
        (x ^ (x >> 29)).wrapping_mul(0xBF58_476D_1CE4_E5B9) ^ (x >> 32)
    }

    /// Next value in `[0, upper_exclusive)`; zero when the range is empty.
    pub const fn below(&mut self, upper_exclusive: u64) -> u64 {
        if upper_exclusive == 0 {
            return 0;
        }
        self.next_u64() % upper_exclusive
    }

    /// Uniform integer in the inclusive range `[low, high]`.
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    pub const fn between(&mut self, low: i64, high: i64) -> i64 {
        if high <= low {
            return low;
        }
        let span = high.abs_diff(low) + 1;
        low.wrapping_add(self.below(span) as i64)
    }

    /// Index into a collection of `len` elements, if any.
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index(&mut self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        Some(self.below(len as u64) as usize)
    }

    /// Bernoulli trial with integer percent.
    pub fn chance(&mut self, percent: u8) -> bool {
        if percent == 0 {
            return false;
        }
        if percent >= 100 {
            return true;
        }
        self.below(100) < u64::from(percent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        let mut a = DeterministicRng::new(7);
        let mut b = DeterministicRng::new(7);
        for _ in 0..32 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn between_stays_in_range() {
        let mut rng = DeterministicRng::new(3);
        for _ in 0..1_000 {
            let value = rng.between(-20, 50);
            assert!((-20..=50).contains(&value));
        }
        assert_eq!(rng.between(4, 4), 4);
    }

    #[test]
    fn index_of_empty_collection_is_none() {
        let mut rng = DeterministicRng::new(1);
        assert_eq!(rng.index(0), None);
        assert!(rng.index(3).is_some_and(|i| i < 3));
    }

    #[test]
    fn chance_extremes_are_fixed() {
        let mut rng = DeterministicRng::new(9);
        assert!(!rng.chance(0));
        assert!(rng.chance(100));
    }
}
