use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open index range `[start, end)` along a single tensor axis or over a
/// dataset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexRange {
    pub start: u64,
    pub end: u64,
}

impl IndexRange {
    pub fn new(start: u64, end: u64) -> Self {
        assert!(start <= end, "IndexRange start {start} > end {end}");
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, index: u64) -> bool {
        self.start <= index && index < self.end
    }

    pub fn intersects(&self, other: &IndexRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Last index covered, for display as a closed interval.
    pub fn last(&self) -> Option<u64> {
        (!self.is_empty()).then(|| self.end - 1)
    }
}

impl fmt::Display for IndexRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intersects() {
        let a = IndexRange::new(0, 2);
        let b = IndexRange::new(2, 4);
        let c = IndexRange::new(1, 3);
        assert!(!a.intersects(&b));
        assert!(a.intersects(&c));
        assert!(b.intersects(&c));
        assert!(!IndexRange::new(1, 1).intersects(&a));
    }

    #[test]
    fn test_last() {
        assert_eq!(IndexRange::new(6, 8).last(), Some(7));
        assert_eq!(IndexRange::new(3, 3).last(), None);
    }
}
