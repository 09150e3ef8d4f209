// Seeded randomness for note augmentation.
//
// `ImprovRng` is xoshiro256++ with its 256-bit state expanded from a single
// `u64` through SplitMix64. The augmenter in `improv_music` makes three kinds
// of draw per appended note: a perturbation coin (`random_bool`), a pitch
// shift (`range_i32_inclusive`) and a duration factor (`range_f64`).
// `improv_rag` seeds one generator per rendered response.
//
// Output depends only on the seed and the sequence of calls. The generator
// core is integer-only; floats are derived from the top 53 bits of a draw,
// so a seed yields the same score on any platform.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImprovRng {
    state: [u64; 4],
}

impl ImprovRng {
    pub fn new(seed: u64) -> Self {
        let mut mix = seed;
        let state = [(); 4].map(|_| splitmix64(&mut mix));
        Self { state }
    }

    /// Seed from the wall clock, for runs that need not be reproducible.
    pub fn from_time() -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos() as u64);
        Self::new(nanos)
    }

    pub fn next_u64(&mut self) -> u64 {
        let [a, b, c, d] = &mut self.state;
        let out = a.wrapping_add(*d).rotate_left(23).wrapping_add(*a);
        let shifted = *b << 17;
        *c ^= *a;
        *d ^= *b;
        *b ^= *c;
        *a ^= *d;
        *c ^= shifted;
        *d = d.rotate_left(45);
        out
    }

    /// Uniform in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        const SCALE: f64 = 1.0 / (1u64 << 53) as f64;
        (self.next_u64() >> 11) as f64 * SCALE
    }

    /// Uniform in `[low, high)`; `low == high` returns `low`.
    pub fn range_f64(&mut self, low: f64, high: f64) -> f64 {
        assert!(low <= high, "range_f64 needs low <= high, got {low} > {high}");
        low + (high - low) * self.next_f64()
    }

    /// Uniform over `low..=high`.
    pub fn range_i32_inclusive(&mut self, low: i32, high: i32) -> i32 {
        assert!(low <= high, "range_i32_inclusive needs low <= high, got {low} > {high}");
        let width = (i64::from(high) - i64::from(low) + 1) as u64;
        (i64::from(low) + self.below(width) as i64) as i32
    }

    /// `true` with probability `p`. Never for `p <= 0`, always for `p >= 1`.
    pub fn random_bool(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    /// Uniform in `0..n` without modulo bias. `n` must be non-zero.
    fn below(&mut self, n: u64) -> u64 {
        if n.is_power_of_two() {
            return self.next_u64() & (n - 1);
        }
        // Reject the low `2^64 mod n` values so every residue is equally likely.
        let reject_below = n.wrapping_neg() % n;
        loop {
            let x = self.next_u64();
            if x >= reject_below {
                return x % n;
            }
        }
    }
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One appended note's worth of draws, in the augmenter's order.
    fn perturbation(rng: &mut ImprovRng) -> (bool, i32, f64) {
        (
            rng.random_bool(0.3),
            rng.range_i32_inclusive(-3, 3),
            rng.range_f64(0.8, 1.2),
        )
    }

    #[test]
    fn seed_fixes_the_perturbation_sequence() {
        let mut a = ImprovRng::new(2024);
        let mut b = ImprovRng::new(2024);
        let mut c = ImprovRng::new(2025);
        let run_a: Vec<_> = (0..200).map(|_| perturbation(&mut a)).collect();
        let run_b: Vec<_> = (0..200).map(|_| perturbation(&mut b)).collect();
        let run_c: Vec<_> = (0..200).map(|_| perturbation(&mut c)).collect();
        assert_eq!(run_a, run_b);
        assert_ne!(run_a, run_c);
    }

    #[test]
    fn pitch_shift_hits_every_step() {
        let mut rng = ImprovRng::new(5);
        let mut counts = [0usize; 7];
        for _ in 0..7_000 {
            let shift = rng.range_i32_inclusive(-3, 3);
            counts[(shift + 3) as usize] += 1;
        }
        // Each of the seven shifts lands near 1000 times.
        for (i, &n) in counts.iter().enumerate() {
            assert!((850..1150).contains(&n), "shift {} drawn {n} times", i as i32 - 3);
        }
    }

    #[test]
    fn single_value_range_is_constant() {
        let mut rng = ImprovRng::new(11);
        for _ in 0..50 {
            assert_eq!(rng.range_i32_inclusive(-10, -10), -10);
            assert_eq!(rng.range_f64(1.0, 1.0), 1.0);
        }
    }

    #[test]
    fn extreme_i32_bounds_do_not_overflow() {
        let mut rng = ImprovRng::new(3);
        for _ in 0..100 {
            let _ = rng.range_i32_inclusive(i32::MIN, i32::MAX);
        }
    }

    #[test]
    fn duration_factor_stays_in_bounds_and_centres_on_one() {
        let mut rng = ImprovRng::new(8);
        let n = 10_000;
        let mut sum = 0.0;
        for _ in 0..n {
            let factor = rng.range_f64(0.8, 1.2);
            assert!((0.8..1.2).contains(&factor), "factor {factor}");
            sum += factor;
        }
        let mean = sum / f64::from(n);
        assert!((mean - 1.0).abs() < 0.01, "mean factor {mean}");
    }

    #[test]
    fn perturbation_coin_lands_near_thirty_percent() {
        let mut rng = ImprovRng::new(13);
        let heads = (0..10_000).filter(|_| rng.random_bool(0.3)).count();
        assert!((2_700..3_300).contains(&heads), "{heads} of 10000");
    }

    #[test]
    fn coin_probabilities_zero_and_one_are_certain() {
        let mut rng = ImprovRng::new(17);
        assert!((0..500).all(|_| !rng.random_bool(0.0)));
        assert!((0..500).all(|_| rng.random_bool(1.0)));
    }

    #[test]
    fn snapshot_resumes_mid_run() {
        let mut rng = ImprovRng::new(99);
        for _ in 0..37 {
            perturbation(&mut rng);
        }
        let saved = serde_json::to_string(&rng).unwrap();
        let mut resumed: ImprovRng = serde_json::from_str(&saved).unwrap();
        assert_eq!(resumed, rng);
        for _ in 0..50 {
            assert_eq!(perturbation(&mut resumed), perturbation(&mut rng));
        }
    }
}
