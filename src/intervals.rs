//! Time coverage bookkeeping: half-open intervals and normalized interval sets.

use crate::types::Timestamp;
use std::fmt;

/// Half-open range `[start, end)` of Unix timestamps.
///
/// Unbounded windows use `Timestamp::MIN` / `Timestamp::MAX` as sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Interval {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl Interval {
    /// Builds an interval, or `None` when `start >= end` (an empty interval is discarded).
    pub fn new(start: Timestamp, end: Timestamp) -> Option<Self> {
        if start < end {
            Some(Interval { start, end })
        } else {
            None
        }
    }

    /// The interval covering all time.
    pub fn unbounded() -> Self {
        Interval {
            start: Timestamp::MIN,
            end: Timestamp::MAX,
        }
    }

    /// Builds a window from optional bounds; a missing bound is unbounded.
    /// Returns `None` when both bounds are present and the window is empty.
    pub fn window(start: Option<Timestamp>, end: Option<Timestamp>) -> Option<Self> {
        Interval::new(start.unwrap_or(Timestamp::MIN), end.unwrap_or(Timestamp::MAX))
    }

    /// Length in seconds (saturating for unbounded intervals).
    pub fn size(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start <= ts && ts < self.end
    }

    /// True when the intervals share at least one instant.
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// True when the intervals overlap or touch end-to-start.
    pub fn touches(&self, other: &Interval) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn intersect(&self, other: &Interval) -> Option<Interval> {
        Interval::new(self.start.max(other.start), self.end.min(other.end))
    }

    /// Smallest interval spanning both. Only meaningful when `touches` holds.
    pub fn span(&self, other: &Interval) -> Interval {
        Interval {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Sorted, non-overlapping, non-adjacent sequence of intervals.
///
/// Every constructor and mutator keeps that normal form, so two sets covering
/// the same instants always compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalSet {
    intervals: Vec<Interval>,
}

impl IntervalSet {
    pub fn new() -> Self {
        IntervalSet::default()
    }

    /// Normalizes an arbitrary collection of intervals.
    pub fn from_intervals(intervals: impl IntoIterator<Item = Interval>) -> Self {
        let mut sorted: Vec<Interval> = intervals.into_iter().collect();
        sorted.sort_unstable();
        IntervalSet {
            intervals: union_overlapping(sorted),
        }
    }

    /// Inserts an interval, merging it with every overlapping or adjacent member.
    pub fn insert(&mut self, interval: Interval) {
        // First member that could touch the new interval.
        let lo = self.intervals.partition_point(|i| i.end < interval.start);
        // One past the last member that could touch it.
        let hi = self.intervals.partition_point(|i| i.start <= interval.end);

        let mut merged = interval;
        for existing in &self.intervals[lo..hi] {
            merged = merged.span(existing);
        }
        self.intervals.splice(lo..hi, std::iter::once(merged));
    }

    pub fn union(&self, other: &IntervalSet) -> IntervalSet {
        IntervalSet::from_intervals(self.intervals.iter().chain(other.intervals.iter()).copied())
    }

    pub fn intersect(&self, other: &IntervalSet) -> IntervalSet {
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.intervals.len() && j < other.intervals.len() {
            let a = self.intervals[i];
            let b = other.intervals[j];
            if let Some(x) = a.intersect(&b) {
                out.push(x);
            }
            if a.end < b.end {
                i += 1;
            } else {
                j += 1;
            }
        }
        // Inputs are normalized, so intersections are already sorted and disjoint.
        IntervalSet { intervals: out }
    }

    /// Instants covered by `self` but not by `other`.
    pub fn difference(&self, other: &IntervalSet) -> IntervalSet {
        let mut out = Vec::new();
        for a in &self.intervals {
            let mut cursor = a.start;
            for b in other.intervals.iter().filter(|b| b.overlaps(a)) {
                if b.start > cursor {
                    out.push(Interval { start: cursor, end: b.start });
                }
                cursor = cursor.max(b.end);
            }
            if cursor < a.end {
                out.push(Interval { start: cursor, end: a.end });
            }
        }
        IntervalSet { intervals: out }
    }

    /// True when any member shares an instant with `window`.
    pub fn intersects(&self, window: &Interval) -> bool {
        self.intervals.iter().any(|i| i.overlaps(window))
    }

    /// Number of seconds of `window` covered by this set.
    pub fn coverage(&self, window: &Interval) -> i64 {
        self.intervals
            .iter()
            .filter_map(|i| i.intersect(window))
            .fold(0i64, |acc, i| acc.saturating_add(i.size()))
    }

    /// True when `window` lies entirely inside a single member.
    pub fn covers(&self, window: &Interval) -> bool {
        self.intervals
            .iter()
            .any(|i| i.start <= window.start && window.end <= i.end)
    }

    /// Total covered length in seconds.
    pub fn size(&self) -> i64 {
        self.intervals.iter().fold(0i64, |acc, i| acc.saturating_add(i.size()))
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Interval> {
        self.intervals.iter()
    }

    pub fn as_slice(&self) -> &[Interval] {
        &self.intervals
    }
}

impl FromIterator<Interval> for IntervalSet {
    fn from_iter<I: IntoIterator<Item = Interval>>(iter: I) -> Self {
        IntervalSet::from_intervals(iter)
    }
}

/// Collapses a start-sorted list into disjoint, non-adjacent intervals.
fn union_overlapping(sorted: Vec<Interval>) -> Vec<Interval> {
    let mut out: Vec<Interval> = Vec::with_capacity(sorted.len());
    for interval in sorted {
        match out.last_mut() {
            Some(last) if last.touches(&interval) => *last = last.span(&interval),
            _ => out.push(interval),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iv(start: i64, end: i64) -> Interval {
        Interval::new(start, end).unwrap()
    }

    #[test]
    fn empty_interval_is_discarded() {
        assert!(Interval::new(5, 5).is_none());
        assert!(Interval::new(6, 5).is_none());
        assert!(Interval::window(Some(10), Some(10)).is_none());
        assert_eq!(Interval::window(None, Some(10)), Some(iv(i64::MIN, 10)));
    }

    #[test]
    fn interval_relations() {
        let a = iv(0, 10);
        let b = iv(10, 20);
        assert!(!a.overlaps(&b));
        assert!(a.touches(&b));
        assert_eq!(a.intersect(&b), None);
        assert_eq!(a.intersect(&iv(5, 15)), Some(iv(5, 10)));
        assert_eq!(a.span(&b), iv(0, 20));
        assert!(a.contains(0));
        assert!(!a.contains(10));
    }

    #[test]
    fn insert_merges_overlapping_and_adjacent() {
        let mut set = IntervalSet::new();
        set.insert(iv(0, 10));
        set.insert(iv(20, 30));
        set.insert(iv(40, 50));
        assert_eq!(set.len(), 3);

        set.insert(iv(10, 20));
        assert_eq!(set.as_slice(), &[iv(0, 30), iv(40, 50)]);

        set.insert(iv(25, 45));
        assert_eq!(set.as_slice(), &[iv(0, 50)]);
    }

    #[test]
    fn insert_is_idempotent() {
        let mut set = IntervalSet::from_intervals([iv(0, 10), iv(30, 40)]);
        let before = set.clone();
        set.insert(iv(30, 40));
        assert_eq!(set, before);
        set.insert(iv(32, 35));
        assert_eq!(set, before);
    }

    #[test]
    fn insert_order_does_not_matter() {
        let mut ab = IntervalSet::new();
        ab.insert(iv(0, 10));
        ab.insert(iv(5, 20));
        let mut ba = IntervalSet::new();
        ba.insert(iv(5, 20));
        ba.insert(iv(0, 10));
        assert_eq!(ab, ba);
        assert_eq!(ab.as_slice(), &[iv(0, 20)]);
    }

    #[test]
    fn union_intersect_difference() {
        let a = IntervalSet::from_intervals([iv(0, 10), iv(20, 30)]);
        let b = IntervalSet::from_intervals([iv(5, 25)]);

        assert_eq!(a.union(&b).as_slice(), &[iv(0, 30)]);
        assert_eq!(a.union(&b), b.union(&a));
        assert_eq!(a.intersect(&b).as_slice(), &[iv(5, 10), iv(20, 25)]);
        assert_eq!(a.difference(&b).as_slice(), &[iv(0, 5), iv(25, 30)]);
        assert!(IntervalSet::new().intersect(&a).is_empty());
    }

    #[test]
    fn coverage_and_covers() {
        let set = IntervalSet::from_intervals([iv(0, 100), iv(150, 200)]);
        assert_eq!(set.coverage(&iv(50, 175)), 75);
        assert!(set.covers(&iv(10, 90)));
        assert!(!set.covers(&iv(90, 160)));
        assert!(set.intersects(&iv(120, 151)));
        assert!(!set.intersects(&iv(100, 150)));
        assert_eq!(set.size(), 150);
    }

    #[test]
    fn unbounded_coverage_saturates() {
        let set = IntervalSet::from_intervals([Interval::unbounded()]);
        assert_eq!(set.coverage(&Interval::unbounded()), i64::MAX);
        assert!(set.covers(&iv(0, 10)));
    }
}
