//! Ranges and range sets
//!
//! - Range: inclusive `[min, max]` byte interval
//! - RangeSet: disjoint, sorted collection of ranges; overlapping or adjacent
//!   ranges are merged on insert, so no two stored ranges ever touch

use std::collections::BTreeMap;
use std::fmt;

/// Inclusive byte interval `[min, max]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Range {
    /// First byte offset
    pub min: u64,

    /// Last byte offset (inclusive)
    pub max: u64,
}

impl Range {
    /// New range. `min` must not exceed `max`.
    pub fn new(min: u64, max: u64) -> Self {
        debug_assert!(min <= max, "range [{min}, {max}] is inverted");
        Self { min, max }
    }

    /// Number of bytes covered
    pub fn size(&self) -> u64 {
        self.max - self.min + 1
    }

    /// Whether `point` falls inside this range
    pub fn contains(&self, point: u64) -> bool {
        self.min <= point && point <= self.max
    }

    /// Whether the two ranges share at least one byte
    pub fn overlaps(&self, other: &Range) -> bool {
        self.min <= other.max && other.min <= self.max
    }

    /// Whether the two ranges overlap or touch (`max + 1 == min`)
    pub fn touches(&self, other: &Range) -> bool {
        self.min <= other.max.saturating_add(1) && other.min <= self.max.saturating_add(1)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// Disjoint, merged, sorted set of ranges
///
/// Invariant after every mutation: no two stored ranges overlap or are
/// adjacent. `add` merges, `remove` splits or shrinks as needed. Both are
/// `O(log n + k)` in the number of affected ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    /// min -> max, keyed by range start
    ranges: BTreeMap<u64, u64>,
}

impl RangeSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Set covering a single range
    pub fn from_range(range: Range) -> Self {
        let mut set = Self::new();
        set.add(range);
        set
    }

    /// Insert a range, merging with any overlapping or adjacent ranges
    pub fn add(&mut self, range: Range) {
        let mut new_min = range.min;
        let mut new_max = range.max;

        // A predecessor that overlaps or touches range.min extends the merge
        // window to the left.
        let start = match self.ranges.range(..range.min).next_back() {
            Some((&min, &max)) if max.saturating_add(1) >= range.min => min,
            _ => range.min,
        };

        let upper = range.max.saturating_add(1);
        let absorbed: Vec<u64> = self
            .ranges
            .range(start..=upper)
            .map(|(&min, &max)| {
                new_min = new_min.min(min);
                new_max = new_max.max(max);
                min
            })
            .collect();

        for min in absorbed {
            self.ranges.remove(&min);
        }
        self.ranges.insert(new_min, new_max);
    }

    /// Remove a range. Only the overlapping portions of stored ranges are
    /// removed; a stored range strictly containing `range` is split in two.
    pub fn remove(&mut self, range: Range) {
        let start = match self.ranges.range(..range.min).next_back() {
            Some((&min, &max)) if max >= range.min => min,
            _ => range.min,
        };

        let affected: Vec<(u64, u64)> = self
            .ranges
            .range(start..=range.max)
            .map(|(&min, &max)| (min, max))
            .collect();

        for (min, max) in affected {
            self.ranges.remove(&min);
            if min < range.min {
                self.ranges.insert(min, range.min - 1);
            }
            if max > range.max {
                self.ranges.insert(range.max + 1, max);
            }
        }
    }

    /// Whether `point` is covered
    pub fn contains_point(&self, point: u64) -> bool {
        match self.ranges.range(..=point).next_back() {
            Some((_, &max)) => point <= max,
            None => false,
        }
    }

    /// Whether the whole of `range` is covered by a single stored range
    pub fn contains_range(&self, range: &Range) -> bool {
        match self.ranges.range(..=range.min).next_back() {
            Some((_, &max)) => range.max <= max,
            None => false,
        }
    }

    /// Total number of bytes covered
    pub fn size(&self) -> u64 {
        self.ranges.iter().map(|(min, max)| max - min + 1).sum()
    }

    /// Number of stored ranges
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Lowest stored range, if any
    pub fn first(&self) -> Option<Range> {
        self.ranges
            .iter()
            .next()
            .map(|(&min, &max)| Range::new(min, max))
    }

    /// Stored ranges in ascending order
    pub fn iter(&self) -> impl Iterator<Item = Range> + '_ {
        self.ranges.iter().map(|(&min, &max)| Range::new(min, max))
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Remove every range of `other` from this set
    pub fn subtract(&mut self, other: &RangeSet) {
        for range in other.iter() {
            self.remove(range);
        }
    }

    /// Bytes covered by both sets
    pub fn intersection(&self, other: &RangeSet) -> RangeSet {
        let mut result = self.clone();
        let mut gaps = self.clone();
        gaps.subtract(other);
        result.subtract(&gaps);
        result
    }

    /// Add every range of `other` to this set
    pub fn extend(&mut self, other: &RangeSet) {
        for range in other.iter() {
            self.add(range);
        }
    }
}

impl FromIterator<Range> for RangeSet {
    fn from_iter<T: IntoIterator<Item = Range>>(iter: T) -> Self {
        let mut set = RangeSet::new();
        for range in iter {
            set.add(range);
        }
        set
    }
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, range) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{range}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_disjoint_and_merged(set: &RangeSet) {
        let ranges: Vec<Range> = set.iter().collect();
        for pair in ranges.windows(2) {
            assert!(
                pair[0].max + 1 < pair[1].min,
                "ranges {} and {} overlap or touch",
                pair[0],
                pair[1]
            );
        }
        let sum: u64 = ranges.iter().map(Range::size).sum();
        assert_eq!(set.size(), sum);
    }

    #[test]
    fn test_add_merges_overlap() {
        let mut set = RangeSet::from_range(Range::new(0, 9));
        set.add(Range::new(5, 14));

        assert_eq!(set.iter().collect::<Vec<_>>(), vec![Range::new(0, 14)]);
        assert_disjoint_and_merged(&set);
    }

    #[test]
    fn test_remove_splits_interior() {
        let mut set = RangeSet::from_range(Range::new(0, 14));
        set.remove(Range::new(3, 7));

        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec![Range::new(0, 2), Range::new(8, 14)]
        );
        assert_eq!(set.size(), 10);
        assert_disjoint_and_merged(&set);
    }

    #[test]
    fn test_add_merges_adjacent() {
        let mut set = RangeSet::new();
        set.add(Range::new(0, 4));
        set.add(Range::new(5, 9));

        assert_eq!(set.len(), 1);
        assert_eq!(set.first(), Some(Range::new(0, 9)));
        assert_disjoint_and_merged(&set);
    }

    #[test]
    fn test_add_bridges_gap() {
        let mut set = RangeSet::new();
        set.add(Range::new(0, 3));
        set.add(Range::new(10, 13));
        set.add(Range::new(4, 9));

        assert_eq!(set.iter().collect::<Vec<_>>(), vec![Range::new(0, 13)]);
    }

    #[test]
    fn test_add_idempotent() {
        let mut once = RangeSet::new();
        once.add(Range::new(3, 8));

        let mut twice = once.clone();
        twice.add(Range::new(3, 8));

        assert_eq!(once, twice);
    }

    #[test]
    fn test_remove_non_overlapping_is_noop() {
        let mut set = RangeSet::from_range(Range::new(10, 20));
        set.remove(Range::new(30, 40));
        assert_eq!(set.first(), Some(Range::new(10, 20)));

        let mut empty = RangeSet::new();
        empty.remove(Range::new(0, 100));
        assert!(empty.is_empty());
    }

    #[test]
    fn test_remove_partial_overlap() {
        let mut set = RangeSet::new();
        set.add(Range::new(0, 9));
        set.add(Range::new(20, 29));
        set.remove(Range::new(5, 24));

        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec![Range::new(0, 4), Range::new(25, 29)]
        );
        assert_disjoint_and_merged(&set);
    }

    #[test]
    fn test_contains() {
        let mut set = RangeSet::new();
        set.add(Range::new(0, 9));
        set.add(Range::new(20, 29));

        assert!(set.contains_point(0));
        assert!(set.contains_point(9));
        assert!(!set.contains_point(10));
        assert!(set.contains_range(&Range::new(21, 28)));
        assert!(!set.contains_range(&Range::new(5, 25)));
    }

    #[test]
    fn test_subtract_and_intersection() {
        let mut a = RangeSet::from_range(Range::new(0, 99));
        let b: RangeSet = [Range::new(10, 19), Range::new(50, 59)]
            .into_iter()
            .collect();

        let inter = a.intersection(&b);
        assert_eq!(inter, b);

        a.subtract(&b);
        assert_eq!(a.size(), 80);
        assert!(!a.contains_point(15));
        assert!(a.contains_point(9));
        assert!(a.contains_point(20));
        assert_disjoint_and_merged(&a);
    }

    #[test]
    fn test_mutation_sequence_keeps_invariant() {
        let mut set = RangeSet::new();
        let ops: [(bool, u64, u64); 12] = [
            (true, 0, 9),
            (true, 100, 199),
            (true, 8, 99),
            (false, 50, 149),
            (true, 300, 300),
            (true, 301, 301),
            (false, 0, 0),
            (true, 0, 0),
            (false, 150, 400),
            (true, 20, 30),
            (true, 31, 40),
            (false, 25, 35),
        ];

        for (add, min, max) in ops {
            if add {
                set.add(Range::new(min, max));
            } else {
                set.remove(Range::new(min, max));
            }
            assert_disjoint_and_merged(&set);
        }
    }
}
