use crate::cache::{ByteCache, TrialDedupCache};
use crate::counter::BoundedCounter;
use crate::image::{Interval, PatchCandidate, Section};
use rand::Rng;

/// One in this many freshly drawn bytes is forced to `0x00` or `0xFF`.
const EXTREME_BYTE_ODDS: u32 = 128;
/// Bounds for the divisor that scales cache-use probability by interval width.
const CACHE_SCALE_MIN: u64 = 4;
const CACHE_SCALE_MAX: u64 = 64;

/// Produces broad random patches anywhere inside the section.
#[derive(Debug, Clone, Copy)]
pub struct ExplorationMutator {
    section: Section,
    max_bytes_to_change: u64,
}

impl ExplorationMutator {
    pub fn new(section: Section, max_bytes_to_change: u64) -> Self {
        Self {
            section,
            max_bytes_to_change,
        }
    }

    /// Picks a width in `[1, min(size, max_bytes_to_change))` (or exactly 1
    /// when that range is empty), a start that keeps the range inside the
    /// section, and fills it with uniform random bytes.
    pub fn mutate<R: Rng + ?Sized>(&self, rng: &mut R) -> PatchCandidate {
        let width_limit = self.section.size.min(self.max_bytes_to_change);
        let byte_count = if width_limit <= 1 {
            1
        } else {
            rng.random_range(1..width_limit)
        };
        let offset = rng.random_range(0..=self.section.size - byte_count);
        let start = self.section.address + offset;

        let mut bytes = vec![0u8; byte_count as usize];
        rng.fill(bytes.as_mut_slice());
        PatchCandidate::new(Interval::new(start, start + byte_count), bytes)
    }
}

/// Rejection-samples a sub-interval of `bounds` whose width lies in
/// `[min_width, best_width)`.
///
/// Returns `None` when no such width fits inside `bounds`.
pub fn sample_subinterval<R: Rng + ?Sized>(
    bounds: Interval,
    best_width: u64,
    min_width: u64,
    rng: &mut R,
) -> Option<Interval> {
    let min_width = min_width.max(1);
    if min_width >= best_width || min_width > bounds.width() {
        return None;
    }
    loop {
        let start = rng.random_range(bounds.start..bounds.end);
        let end = rng.random_range(start + 1..=bounds.end);
        let width = end - start;
        if width >= min_width && width < best_width {
            return Some(Interval::new(start, end));
        }
    }
}

/// Assigns bytes inside a narrowing interval, biased by past hits and
/// checked against what has already been tried.
#[derive(Debug, Clone, Copy)]
pub struct MinimizationMutator {
    cache_threshold: f64,
    dedup_attempt_limit: u64,
}

impl MinimizationMutator {
    pub fn new(max_bytes_to_change: u64, dedup_attempt_limit: u64) -> Self {
        let scale = max_bytes_to_change
            .saturating_mul(2)
            .clamp(CACHE_SCALE_MIN, CACHE_SCALE_MAX);
        Self {
            cache_threshold: 1.0 / scale as f64,
            dedup_attempt_limit,
        }
    }

    /// Chance of reusing a cached byte at one offset; shrinks with the interval.
    pub fn cache_use_probability(&self, width: u64) -> f64 {
        (width as f64 * self.cache_threshold).min(1.0)
    }

    /// Draws one byte string for `interval`.
    pub fn assign<R: Rng + ?Sized>(
        &self,
        interval: Interval,
        byte_cache: &ByteCache,
        use_cache: bool,
        rng: &mut R,
    ) -> Vec<u8> {
        let cache_probability = self.cache_use_probability(interval.width());
        let mut bytes = Vec::with_capacity(interval.width() as usize);
        for address in interval.addresses() {
            if use_cache && rng.random_bool(cache_probability) {
                if let Some(value) = byte_cache.choose(address, rng) {
                    bytes.push(value);
                    continue;
                }
            }
            if rng.random_ratio(1, EXTREME_BYTE_ODDS) {
                bytes.push(if rng.random_bool(0.5) { 0x00 } else { 0xFF });
                continue;
            }
            bytes.push(rng.random());
        }
        bytes
    }

    /// Resamples until it finds a byte string not yet tried for `interval`,
    /// recording it in `dedup`. Returns `None` once the attempt budget runs out.
    pub fn propose<R: Rng + ?Sized>(
        &self,
        interval: Interval,
        byte_cache: &ByteCache,
        dedup: &mut TrialDedupCache,
        use_cache: bool,
        rng: &mut R,
    ) -> Option<PatchCandidate> {
        let mut attempts = BoundedCounter::new(self.dedup_attempt_limit);
        loop {
            let bytes = self.assign(interval, byte_cache, use_cache, rng);
            if dedup.insert(interval, &bytes) {
                return Some(PatchCandidate::new(interval, bytes));
            }
            attempts.increment();
            if attempts.is_at_limit() {
                return None;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::{RngCore, SeedableRng};

    /// Always yields zero, so every draw repeats.
    pub(crate) struct ZeroRng;

    impl RngCore for ZeroRng {
        fn next_u32(&mut self) -> u32 {
            0
        }
        fn next_u64(&mut self) -> u64 {
            0
        }
        fn fill_bytes(&mut self, dst: &mut [u8]) {
            dst.fill(0);
        }
    }

    #[test]
    fn exploration_stays_inside_section() {
        let section = Section::new(0x100, 0x10);
        let mutator = ExplorationMutator::new(section, 32);
        let mut rng = ChaCha8Rng::seed_from_u64(11);

        for _ in 0..10_000 {
            let candidate = mutator.mutate(&mut rng);
            let iv = candidate.interval;
            assert!(section.interval().contains_interval(&iv), "{iv} escaped");
            assert!(iv.width() >= 1 && iv.width() < 0x10, "width {}", iv.width());
            assert_eq!(candidate.bytes.len() as u64, iv.width());
        }
    }

    #[test]
    fn exploration_respects_max_bytes_and_tiny_sections() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);

        let capped = ExplorationMutator::new(Section::new(0, 0x1000), 4);
        for _ in 0..1_000 {
            assert!(capped.mutate(&mut rng).width() < 4);
        }

        let single = ExplorationMutator::new(Section::new(0x20, 1), 32);
        for _ in 0..100 {
            assert_eq!(single.mutate(&mut rng).interval, Interval::single(0x20));
        }
    }

    #[test]
    fn subinterval_is_narrower_and_inside_bounds() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let bounds = Interval::new(0x40, 0x50);

        for _ in 0..5_000 {
            let iv = sample_subinterval(bounds, 0x10, 1, &mut rng).unwrap();
            assert!(bounds.contains_interval(&iv));
            assert!(iv.width() >= 1 && iv.width() < 0x10);
        }
        for _ in 0..1_000 {
            let iv = sample_subinterval(bounds, 5, 2, &mut rng).unwrap();
            assert!((2..5).contains(&iv.width()));
        }
    }

    #[test]
    fn subinterval_reports_impossible_requests() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert_eq!(sample_subinterval(Interval::new(0, 8), 2, 2, &mut rng), None);
        assert_eq!(sample_subinterval(Interval::new(0, 1), 3, 2, &mut rng), None);
    }

    #[test]
    fn same_seed_replays_same_proposals() {
        let section = Section::new(0, 0x80);
        let explorer = ExplorationMutator::new(section, 16);
        let minimizer = MinimizationMutator::new(16, 100);
        let cache = ByteCache::new();

        let trace = |seed: u64| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut dedup = TrialDedupCache::new();
            let mut out = Vec::new();
            for _ in 0..50 {
                let explored = explorer.mutate(&mut rng);
                let iv = sample_subinterval(section.interval(), 0x20, 1, &mut rng).unwrap();
                let narrowed = minimizer.propose(iv, &cache, &mut dedup, true, &mut rng);
                out.push((explored, narrowed));
            }
            out
        };

        assert_eq!(trace(42), trace(42));
        assert_ne!(trace(42), trace(43));
    }

    #[test]
    fn cache_probability_shrinks_with_width() {
        let mutator = MinimizationMutator::new(32, 100);
        assert_eq!(mutator.cache_use_probability(64), 1.0);
        assert!(mutator.cache_use_probability(32) > mutator.cache_use_probability(3));

        // Small max_bytes clamps the scale to 4.
        let small = MinimizationMutator::new(1, 100);
        assert_eq!(small.cache_use_probability(3), 0.75);
    }

    #[test]
    fn assign_uses_cached_values_when_forced() {
        let mut cache = ByteCache::new();
        cache.record_hit(&PatchCandidate::new(Interval::new(0x10, 0x13), vec![0xAA, 0xBB, 0xCC]));
        let mutator = MinimizationMutator::new(1, 100);

        let bytes = mutator.assign(Interval::new(0x10, 0x13), &cache, true, &mut ZeroRng);
        assert_eq!(bytes, vec![0xAA, 0xBB, 0xCC]);

        let uncached = mutator.assign(Interval::new(0x10, 0x13), &cache, false, &mut ZeroRng);
        assert_ne!(uncached, bytes);
    }

    #[test]
    fn propose_never_repeats_for_an_interval() {
        let mutator = MinimizationMutator::new(32, 100_000);
        let cache = ByteCache::new();
        let mut dedup = TrialDedupCache::new();
        let mut rng = ChaCha8Rng::seed_from_u64(77);
        let iv = Interval::single(0x30);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..256 {
            let candidate = mutator.propose(iv, &cache, &mut dedup, false, &mut rng).unwrap();
            assert!(seen.insert(candidate.bytes[0]), "repeated {:#x}", candidate.bytes[0]);
        }
        assert_eq!(dedup.tried_count(iv), 256);
        assert!(mutator.propose(iv, &cache, &mut dedup, false, &mut rng).is_none());
    }

    #[test]
    fn propose_gives_up_after_attempt_budget() {
        let mut cache = ByteCache::new();
        cache.record_hit(&PatchCandidate::new(Interval::new(0x10, 0x13), vec![1, 2, 3]));
        let mutator = MinimizationMutator::new(1, 50);
        let mut dedup = TrialDedupCache::new();
        let iv = Interval::new(0x10, 0x13);

        let first = mutator.propose(iv, &cache, &mut dedup, true, &mut ZeroRng);
        assert_eq!(first.map(|c| c.bytes), Some(vec![1, 2, 3]));
        assert!(mutator.propose(iv, &cache, &mut dedup, true, &mut ZeroRng).is_none());
        assert_eq!(dedup.tried_count(iv), 1);
    }
}
