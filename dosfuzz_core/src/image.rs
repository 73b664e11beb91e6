use serde::Serialize;
use std::fmt;

/// The original file contents. Never mutated; every trial derives its own copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryImage {
    bytes: Vec<u8>,
}

impl BinaryImage {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// The byte range of the image that is eligible for mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Section {
    pub address: u64,
    pub size: u64,
}

impl Section {
    pub fn new(address: u64, size: u64) -> Self {
        Self { address, size }
    }

    pub fn end(&self) -> u64 {
        self.address.saturating_add(self.size)
    }

    pub fn interval(&self) -> Interval {
        Interval::new(self.address, self.end())
    }

    /// True if the whole section lies inside an image of `image_len` bytes.
    pub fn fits_within(&self, image_len: usize) -> bool {
        match self.address.checked_add(self.size) {
            Some(end) => end <= image_len as u64,
            None => false,
        }
    }
}

/// Half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
}

impl Interval {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn single(address: u64) -> Self {
        Self::new(address, address + 1)
    }

    pub fn width(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn contains(&self, address: u64) -> bool {
        self.start <= address && address < self.end
    }

    pub fn contains_interval(&self, other: &Interval) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn addresses(&self) -> std::ops::Range<u64> {
        self.start..self.end
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end)
    }
}

/// An interval plus the bytes to place at each of its offsets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchCandidate {
    pub interval: Interval,
    pub bytes: Vec<u8>,
}

impl PatchCandidate {
    pub fn new(interval: Interval, bytes: Vec<u8>) -> Self {
        assert_eq!(
            interval.width(),
            bytes.len() as u64,
            "patch bytes must cover the interval exactly"
        );
        Self { interval, bytes }
    }

    pub fn width(&self) -> u64 {
        self.interval.width()
    }

    /// Copies `image` and overwrites the patched range.
    ///
    /// Panics if the interval does not lie inside the image.
    pub fn apply(&self, image: &BinaryImage) -> Vec<u8> {
        let mut patched = image.as_bytes().to_vec();
        let start = self.interval.start as usize;
        let end = self.interval.end as usize;
        assert!(
            start < end && end <= patched.len(),
            "patch interval {} outside image of {} bytes",
            self.interval,
            patched.len()
        );
        patched[start..end].copy_from_slice(&self.bytes);
        patched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_bounds_check() {
        assert!(Section::new(0x10, 0x10).fits_within(0x20));
        assert!(!Section::new(0x10, 0x11).fits_within(0x20));
        assert!(!Section::new(u64::MAX, 2).fits_within(usize::MAX));
        assert_eq!(Section::new(0x100, 0x10).interval(), Interval::new(0x100, 0x110));
    }

    #[test]
    fn interval_width_and_containment() {
        let outer = Interval::new(4, 10);
        let inner = Interval::new(5, 7);
        assert_eq!(outer.width(), 6);
        assert!(outer.contains(4));
        assert!(!outer.contains(10));
        assert!(outer.contains_interval(&inner));
        assert!(!inner.contains_interval(&outer));
        assert_eq!(Interval::single(9).width(), 1);
        assert_eq!(format!("{inner}"), "[0x5, 0x7)");
    }

    #[test]
    fn apply_leaves_original_untouched() {
        let image = BinaryImage::new(vec![0u8; 8]);
        let patch = PatchCandidate::new(Interval::new(2, 4), vec![0xAA, 0xBB]);

        let patched = patch.apply(&image);
        assert_eq!(patched, vec![0, 0, 0xAA, 0xBB, 0, 0, 0, 0]);
        assert_eq!(image.as_bytes(), &[0u8; 8]);
    }

    #[test]
    #[should_panic(expected = "outside image")]
    fn apply_panics_on_out_of_bounds_interval() {
        let image = BinaryImage::new(vec![0u8; 4]);
        PatchCandidate::new(Interval::new(3, 5), vec![1, 2]).apply(&image);
    }
}
