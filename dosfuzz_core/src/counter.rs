/// A monotonic counter with a fixed limit.
///
/// Used as a give-up signal: each heuristic that may need to back off owns its
/// own instance, and nothing resets it implicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedCounter {
    value: u64,
    limit: u64,
}

impl BoundedCounter {
    pub fn new(limit: u64) -> Self {
        Self { value: 0, limit }
    }

    pub fn increment(&mut self) {
        self.value = self.value.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.value = 0;
    }

    pub fn has_incremented(&self) -> bool {
        self.value != 0
    }

    pub fn is_at_limit(&self) -> bool {
        self.value >= self.limit
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }
}
