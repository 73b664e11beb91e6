use crate::image::{Interval, PatchCandidate};
use rand::Rng;
use std::collections::{HashMap, HashSet};

/// Byte values that have been confirmed to provoke the anomaly, per address.
///
/// Append-only. Repeats are kept on purpose so values that keep showing up
/// get picked more often.
#[derive(Debug, Default, Clone)]
pub struct ByteCache {
    values: HashMap<u64, Vec<u8>>,
}

impl ByteCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records every byte of a patch that produced a confirmed hit.
    pub fn record_hit(&mut self, candidate: &PatchCandidate) {
        for (address, byte) in candidate.interval.addresses().zip(&candidate.bytes) {
            self.values.entry(address).or_default().push(*byte);
        }
    }

    pub fn values_at(&self, address: u64) -> &[u8] {
        self.values
            .get(&address)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Uniformly picks one historical value at `address`, if there are any.
    pub fn choose<R: Rng + ?Sized>(&self, address: u64, rng: &mut R) -> Option<u8> {
        let values = self.values_at(address);
        if values.is_empty() {
            return None;
        }
        Some(values[rng.random_range(0..values.len())])
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Byte strings already tried for an interval.
///
/// Keyed by `(start, end)`, so intervals that only share a start address do
/// not suppress each other. Stores MD5 digests rather than the bytes.
#[derive(Debug, Default, Clone)]
pub struct TrialDedupCache {
    tried: HashMap<Interval, HashSet<[u8; 16]>>,
}

impl TrialDedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `bytes` for `interval`. Returns false if they were already tried.
    pub fn insert(&mut self, interval: Interval, bytes: &[u8]) -> bool {
        let digest = md5::compute(bytes);
        self.tried.entry(interval).or_default().insert(digest.0)
    }

    pub fn tried_count(&self, interval: Interval) -> usize {
        self.tried.get(&interval).map_or(0, HashSet::len)
    }
}
