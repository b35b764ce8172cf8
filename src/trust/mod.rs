//! Sigmoid-with-noise trust computation (spec §4.4 "TrustMath").

use rand::rngs::OsRng;
use rand_distr::{Distribution, Normal};

/// Sigmoid cutoff: the friend-fraction at which the multiplier is 0.5.
pub const CUTOFF: f64 = 0.3;
/// Sigmoid steepness.
pub const RATE: f64 = 13.0;
/// Variance of the Gaussian noise added to the multiplier.
pub const NOISE_VARIANCE: f64 = 0.003;

/// `1 / (1 + e^{-rate·(x - cutoff)})`. Part of the wire-compatible
/// contract: constants must not change without a protocol version bump.
pub fn sigmoid(x: f64, cutoff: f64, rate: f64) -> f64 {
    1.0 / (1.0 + (-rate * (x - cutoff)).exp())
}

/// Source of Gaussian noise, abstracted so tests can pin it to zero
/// (spec §8 scenario 2: "with noise seeded to 0").
pub trait NoiseSource {
    fn sample(&mut self, variance: f64) -> f64;
}

/// Default noise source backed by the OS RNG.
pub struct OsNoise;

impl NoiseSource for OsNoise {
    fn sample(&mut self, variance: f64) -> f64 {
        let normal = Normal::new(0.0, variance.sqrt()).expect("variance must be non-negative");
        normal.sample(&mut OsRng)
    }
}

/// Noise source that always returns zero, for deterministic tests.
pub struct ZeroNoise;

impl NoiseSource for ZeroNoise {
    fn sample(&mut self, _variance: f64) -> f64 {
        0.0
    }
}

/// `compute(priority, shared, mine)` per spec §4.4, with an injectable
/// noise source.
pub fn compute_with_noise(
    priority: f64,
    shared: u32,
    mine: u32,
    noise: &mut dyn NoiseSource,
) -> f64 {
    let fraction = if mine > 0 {
        shared as f64 / mine as f64
    } else {
        0.0
    };

    let mut multiplier = sigmoid(fraction, CUTOFF, RATE) + noise.sample(NOISE_VARIANCE);
    multiplier = multiplier.clamp(0.0, 1.0);

    if shared == 0 {
        multiplier = 0.001;
    }

    priority * multiplier
}

/// `compute(priority, shared, mine)` using the default OS-backed noise
/// source.
pub fn compute(priority: f64, shared: u32, mine: u32) -> f64 {
    compute_with_noise(priority, shared, mine, &mut OsNoise)
}

/// `new_priority(remote, stored, shared, mine)` per spec §4.4: trust never
/// decreases under a merge (documented asymmetry, spec §9).
pub fn new_priority(remote: f64, stored: f64, shared: u32, mine: u32) -> f64 {
    compute(remote, shared, mine).max(stored)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigmoid_bounds_hold_for_any_input() {
        for x in [-1000.0, -1.0, 0.0, 0.3, 1.0, 1000.0] {
            let y = sigmoid(x, CUTOFF, RATE);
            assert!((0.0..=1.0).contains(&y), "sigmoid({x}) = {y} out of bounds");
        }
    }

    #[test]
    fn sigmoid_at_cutoff_is_one_half() {
        assert!((sigmoid(CUTOFF, CUTOFF, RATE) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn compute_at_cutoff_with_zero_noise_is_one_half() {
        // shared/mine = 30/100 = 0.3 = CUTOFF exactly.
        let result = compute_with_noise(1.0, 30, 100, &mut ZeroNoise);
        assert!((result - 0.5).abs() < 1e-12);
    }

    #[test]
    fn zero_shared_friends_yields_fixed_floor() {
        assert_eq!(compute_with_noise(1.0, 0, 100, &mut ZeroNoise), 0.001);
        // Regardless of noise: even with noise pushing multiplier elsewhere,
        // shared == 0 always overrides to the floor.
        struct BigNoise;
        impl NoiseSource for BigNoise {
            fn sample(&mut self, _variance: f64) -> f64 {
                10.0
            }
        }
        assert_eq!(compute_with_noise(1.0, 0, 100, &mut BigNoise), 0.001);
    }

    #[test]
    fn compute_is_clamped_to_priority_upper_bound() {
        for shared in [0u32, 1, 30, 99, 1000] {
            for mine in [0u32, 1, 100, 1000] {
                let result = compute_with_noise(1.0, shared, mine, &mut ZeroNoise);
                assert!((0.0..=1.0).contains(&result));
            }
        }
    }

    #[test]
    fn new_priority_never_decreases_stored_value() {
        let stored = 0.7;
        let result = new_priority(0.0, stored, 0, 100);
        assert!(result >= stored);
    }

    #[test]
    fn mine_zero_treats_fraction_as_zero() {
        let result = compute_with_noise(1.0, 5, 0, &mut ZeroNoise);
        // shared != 0 so the floor doesn't apply, but fraction is defined as 0.
        let expected = sigmoid(0.0, CUTOFF, RATE).clamp(0.0, 1.0);
        assert!((result - expected).abs() < 1e-12);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// `compute` never leaves `[0, priority]`, no matter what
        /// `(priority, shared, mine)` or OS-backed noise draw it sees
        /// (spec §8 "trust multiplier stays within [0, 1]").
        #[test]
        fn compute_stays_within_zero_and_priority(
            priority in 0.0f64..=1.0,
            shared in 0u32..1000,
            mine in 0u32..1000,
        ) {
            let result = compute(priority, shared, mine);
            prop_assert!(result >= 0.0);
            prop_assert!(result <= priority + 1e-9);
        }

        /// `new_priority` never lowers the stored value under merge
        /// (spec §4.4, §9 "never lower" policy).
        #[test]
        fn new_priority_never_lowers_stored_value(
            remote in 0.0f64..=1.0,
            stored in 0.0f64..=1.0,
            shared in 0u32..1000,
            mine in 0u32..1000,
        ) {
            let result = new_priority(remote, stored, shared, mine);
            prop_assert!(result >= stored);
        }
    }
}
