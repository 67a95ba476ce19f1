//! Received chunk range tracking.
//!
//! Records which byte ranges of a transfer have arrived, so that:
//! - A chunk resent after a lost acknowledgment is recognised as a duplicate
//!   and not counted twice
//! - Overlapping (inconsistent) chunks are detected
//! - The contiguous prefix from offset 0 is known, which decides when a
//!   batch is fully delivered

use std::collections::BTreeMap;

/// Classification of an incoming chunk range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeCheck {
    /// Not seen before and disjoint from everything seen.
    New,
    /// Exactly this range was already recorded.
    Duplicate,
    /// Partially overlaps a recorded range.
    Overlap,
}

/// Set of disjoint received ranges, keyed by start offset.
#[derive(Debug, Clone, Default)]
pub struct ReceivedRanges {
    /// start -> end (exclusive)
    ranges: BTreeMap<u64, u64>,
    /// Sum of all recorded range lengths.
    received: u64,
    /// Everything below this offset has arrived.
    contiguous: u64,
}

impl ReceivedRanges {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify `[offset, offset + len)` without recording it.
    pub fn check(&self, offset: u64, len: u64) -> RangeCheck {
        let end = offset + len;
        if self.ranges.get(&offset) == Some(&end) {
            return RangeCheck::Duplicate;
        }
        // Closest range starting at or before `offset`
        if let Some((_, &prev_end)) = self.ranges.range(..=offset).next_back() {
            if prev_end > offset {
                return RangeCheck::Overlap;
            }
        }
        // Closest range starting after `offset`
        if let Some((&next_start, _)) = self.ranges.range(offset + 1..).next() {
            if next_start < end {
                return RangeCheck::Overlap;
            }
        }
        RangeCheck::New
    }

    /// Record a range. Returns `true` if it was new.
    ///
    /// Duplicates and overlaps are left unrecorded.
    pub fn insert(&mut self, offset: u64, len: u64) -> bool {
        if len == 0 || self.check(offset, len) != RangeCheck::New {
            return false;
        }
        self.ranges.insert(offset, offset + len);
        self.received += len;
        self.advance_contiguous();
        true
    }

    /// Total bytes recorded.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Offset below which every byte has arrived.
    pub fn contiguous(&self) -> u64 {
        self.contiguous
    }

    /// Check if anything beyond the contiguous prefix has arrived.
    pub fn has_gaps(&self) -> bool {
        self.received > self.contiguous
    }

    fn advance_contiguous(&mut self) {
        while let Some(&end) = self.ranges.get(&self.contiguous) {
            self.contiguous = end;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let r = ReceivedRanges::new();
        assert_eq!(r.received(), 0);
        assert_eq!(r.contiguous(), 0);
        assert!(!r.has_gaps());
    }

    #[test]
    fn in_order_ranges_extend_prefix() {
        let mut r = ReceivedRanges::new();
        assert!(r.insert(0, 10));
        assert!(r.insert(10, 10));
        assert_eq!(r.received(), 20);
        assert_eq!(r.contiguous(), 20);
    }

    #[test]
    fn out_of_order_ranges_fill_gap() {
        let mut r = ReceivedRanges::new();
        assert!(r.insert(20, 10));
        assert_eq!(r.contiguous(), 0);
        assert!(r.has_gaps());
        assert!(r.insert(0, 10));
        assert_eq!(r.contiguous(), 10);
        assert!(r.insert(10, 10));
        assert_eq!(r.contiguous(), 30);
        assert!(!r.has_gaps());
    }

    #[test]
    fn duplicates_are_not_counted_twice() {
        let mut r = ReceivedRanges::new();
        assert!(r.insert(0, 10));
        assert_eq!(r.check(0, 10), RangeCheck::Duplicate);
        assert!(!r.insert(0, 10));
        assert_eq!(r.received(), 10);
    }

    #[test]
    fn overlaps_are_detected() {
        let mut r = ReceivedRanges::new();
        r.insert(10, 10);
        assert_eq!(r.check(5, 10), RangeCheck::Overlap);
        assert_eq!(r.check(15, 10), RangeCheck::Overlap);
        assert_eq!(r.check(10, 5), RangeCheck::Overlap);
        assert_eq!(r.check(0, 10), RangeCheck::New);
        assert_eq!(r.check(20, 10), RangeCheck::New);
        assert!(!r.insert(5, 10));
        assert_eq!(r.received(), 10);
    }

    #[test]
    fn zero_length_is_ignored() {
        let mut r = ReceivedRanges::new();
        assert!(!r.insert(0, 0));
        assert_eq!(r.received(), 0);
    }
}
