use serde::{Deserialize, Serialize};

use crate::Range;

/// Sorted list of disjoint, non-touching ranges.
///
/// Deserializing normalizes the input, so a stored list that was written by
/// an older process with touching entries still comes back coalesced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Range>", into = "Vec<Range>")]
pub struct RangeSet {
    ranges: Vec<Range>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Range> {
        self.ranges.iter()
    }

    pub fn as_slice(&self) -> &[Range] {
        &self.ranges
    }

    /// Insert `range`, merging every entry it overlaps or touches.
    ///
    /// Returns `false` when the range was already fully covered.
    pub fn insert(&mut self, range: Range) -> bool {
        if self.covers(&range) {
            return false;
        }

        // Entries are sorted by start and disjoint, so ends are sorted too.
        let first = self.ranges.partition_point(|r| r.end() < range.start());
        let mut last = first;
        let mut merged = range;
        while last < self.ranges.len() && self.ranges[last].start() <= range.end() {
            merged = merged.span(&self.ranges[last]);
            last += 1;
        }

        self.ranges.splice(first..last, std::iter::once(merged));
        true
    }

    /// Whether a single stored entry contains `range`.
    pub fn covers(&self, range: &Range) -> bool {
        let idx = self.ranges.partition_point(|r| r.end() < range.end());
        self.ranges
            .get(idx)
            .is_some_and(|r| r.start() <= range.start())
    }

    /// The parts of `within` not covered by this set, in order.
    pub fn gaps(&self, within: &Range) -> Vec<Range> {
        let mut gaps = Vec::new();
        let mut cursor = within.start();

        let first = self.ranges.partition_point(|r| r.end() <= within.start());
        for stored in &self.ranges[first..] {
            if stored.start() >= within.end() || cursor >= within.end() {
                break;
            }
            if stored.start() > cursor {
                gaps.push(Range::from_ordered(cursor, stored.start()));
            }
            cursor = cursor.max(stored.end());
        }

        if cursor < within.end() {
            gaps.push(Range::from_ordered(cursor, within.end()));
        }
        gaps
    }

    /// The smallest range spanning every gap inside `within`, if any.
    pub fn uncovered_span(&self, within: &Range) -> Option<Range> {
        let gaps = self.gaps(within);
        let first = gaps.first()?;
        let last = gaps.last()?;
        Some(first.span(last))
    }
}

impl From<Vec<Range>> for RangeSet {
    fn from(ranges: Vec<Range>) -> Self {
        ranges.into_iter().collect()
    }
}

impl From<RangeSet> for Vec<Range> {
    fn from(set: RangeSet) -> Self {
        set.ranges
    }
}

impl FromIterator<Range> for RangeSet {
    fn from_iter<I: IntoIterator<Item = Range>>(iter: I) -> Self {
        let mut set = RangeSet::new();
        for range in iter {
            set.insert(range);
        }
        set
    }
}

impl<'a> IntoIterator for &'a RangeSet {
    type Item = &'a Range;
    type IntoIter = std::slice::Iter<'a, Range>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranges.iter()
    }
}
