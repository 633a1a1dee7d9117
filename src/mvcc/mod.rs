//! MVCC primitives: sequence numbers, the commit clock and read bounds.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

/// Commit sequence number assigned to every entry of a repository.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    /// Least possible sequence number.
    pub const MIN: Self = Self(0);
    /// Greatest possible sequence number (used for open-ended visibility).
    pub const MAX: Self = Self(u64::MAX);

    /// Construct a sequence number from a raw `u64`.
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw `u64` value backing this sequence number.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the next sequence number, saturating on overflow.
    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl From<u64> for SequenceNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<SequenceNumber> for u64 {
    fn from(seq: SequenceNumber) -> Self {
        seq.0
    }
}

impl fmt::Debug for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Seq").field(&self.0).finish()
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out strictly increasing sequence numbers for one repository.
///
/// The clock stores the *next* number to allocate; `high_water_mark` is the
/// last number handed out (or observed through [`SequenceClock::observe`]).
#[derive(Debug)]
pub struct SequenceClock {
    next: AtomicU64,
}

impl SequenceClock {
    /// Create a clock whose first allocation is `start`.
    ///
    /// Sequence number zero is reserved, so a zero `start` is bumped to one.
    pub const fn new(start: SequenceNumber) -> Self {
        let start = if start.0 == 0 { 1 } else { start.0 };
        Self {
            next: AtomicU64::new(start),
        }
    }

    /// Allocate one sequence number.
    pub fn allocate(&self) -> SequenceNumber {
        SequenceNumber(self.next.fetch_add(1, Ordering::AcqRel))
    }

    /// Allocate `count` consecutive sequence numbers, returning the first.
    pub fn allocate_many(&self, count: u64) -> SequenceNumber {
        SequenceNumber(self.next.fetch_add(count, Ordering::AcqRel))
    }

    /// Record an externally assigned sequence number.
    ///
    /// Returns `false` when `seq` is not strictly greater than every number
    /// allocated or observed so far.
    pub fn observe(&self, seq: SequenceNumber) -> bool {
        let mut current = self.next.load(Ordering::Acquire);
        loop {
            if seq.0 < current {
                return false;
            }
            match self.next.compare_exchange_weak(
                current,
                seq.0.saturating_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// The number that will be handed out next.
    pub fn peek(&self) -> SequenceNumber {
        SequenceNumber(self.next.load(Ordering::Acquire))
    }

    /// Greatest sequence number handed out so far, if any.
    pub fn high_water_mark(&self) -> Option<SequenceNumber> {
        match self.next.load(Ordering::Acquire) {
            0 | 1 => None,
            next => Some(SequenceNumber(next - 1)),
        }
    }
}

impl Default for SequenceClock {
    fn default() -> Self {
        Self::new(SequenceNumber(1))
    }
}

/// Inclusive `[lowest, highest]` sequence bounds of a layer or generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqBounds {
    /// Smallest sequence number contained.
    pub lowest: SequenceNumber,
    /// Greatest sequence number contained.
    pub highest: SequenceNumber,
}

impl SeqBounds {
    /// Bounds containing exactly `seq`.
    pub const fn single(seq: SequenceNumber) -> Self {
        Self {
            lowest: seq,
            highest: seq,
        }
    }

    /// Widen the bounds to include `seq`.
    pub fn include(&mut self, seq: SequenceNumber) {
        if seq < self.lowest {
            self.lowest = seq;
        }
        if seq > self.highest {
            self.highest = seq;
        }
    }

    /// Merge two optional bounds.
    pub fn union(a: Option<Self>, b: Option<Self>) -> Option<Self> {
        match (a, b) {
            (Some(mut a), Some(b)) => {
                a.include(b.lowest);
                a.include(b.highest);
                Some(a)
            }
            (a, None) => a,
            (None, b) => b,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_allocates_monotonically() {
        let clock = SequenceClock::default();
        assert_eq!(clock.high_water_mark(), None);
        assert_eq!(clock.allocate(), SequenceNumber::new(1));
        assert_eq!(clock.allocate_many(3), SequenceNumber::new(2));
        assert_eq!(clock.high_water_mark(), Some(SequenceNumber::new(4)));
        assert_eq!(clock.peek(), SequenceNumber::new(5));
    }

    #[test]
    fn clock_rejects_stale_observations() {
        let clock = SequenceClock::default();
        assert!(clock.observe(SequenceNumber::new(10)));
        assert!(!clock.observe(SequenceNumber::new(10)));
        assert!(!clock.observe(SequenceNumber::new(3)));
        assert_eq!(clock.allocate(), SequenceNumber::new(11));
    }

    #[test]
    fn bounds_union() {
        let a = SeqBounds::single(SequenceNumber::new(4));
        let mut b = SeqBounds::single(SequenceNumber::new(9));
        b.include(SequenceNumber::new(7));
        let merged = SeqBounds::union(Some(a), Some(b)).unwrap();
        assert_eq!(merged.lowest, SequenceNumber::new(4));
        assert_eq!(merged.highest, SequenceNumber::new(9));
        assert_eq!(SeqBounds::union(None, Some(a)), Some(a));
    }
}
