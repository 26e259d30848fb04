use std::fmt;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::RangeError;

/// Truncate a timestamp to 00:00:00 UTC of the same day.
pub fn start_of_day(at: DateTime<Utc>) -> DateTime<Utc> {
    at.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// A half-open interval `[start, end)` of UTC instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawRange")]
pub struct Range {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RawRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TryFrom<RawRange> for Range {
    type Error = RangeError;

    fn try_from(raw: RawRange) -> Result<Self, Self::Error> {
        Range::new(raw.start, raw.end)
    }
}

impl Range {
    /// Create a range, rejecting empty or inverted bounds.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, RangeError> {
        if start >= end {
            return Err(RangeError::Empty { start, end });
        }
        Ok(Self { start, end })
    }

    /// The `days`-long window that ends at the start of `end`'s UTC day.
    ///
    /// `Range::days_ending(2024-01-10T13:00Z, 1)` is `[2024-01-09, 2024-01-10)`.
    pub fn days_ending(end: DateTime<Utc>, days: i64) -> Result<Self, RangeError> {
        let end = start_of_day(end);
        let start = end
            .checked_sub_signed(Duration::days(days))
            .ok_or_else(|| RangeError::OutOfBounds(format!("{end} - {days} days")))?;
        Self::new(start, end)
    }

    pub(crate) fn from_ordered(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        debug_assert!(start < end);
        Self { start, end }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Whether `at` falls inside `[start, end)`.
    pub fn contains_instant(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    /// Whether `other` lies entirely within this range.
    pub fn contains(&self, other: &Range) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Whether the two ranges share at least one instant.
    pub fn overlaps(&self, other: &Range) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Whether the two ranges overlap or meet end-to-start.
    pub fn touches(&self, other: &Range) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn intersect(&self, other: &Range) -> Option<Range> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then(|| Self::from_ordered(start, end))
    }

    /// The smallest range containing both.
    pub fn span(&self, other: &Range) -> Range {
        Self::from_ordered(self.start.min(other.start), self.end.max(other.end))
    }

    /// Split into UTC-day aligned pieces. The first and last piece may be
    /// partial days when the bounds are not at midnight.
    pub fn split_by_day(&self) -> Vec<Range> {
        let mut pieces = Vec::new();
        let mut cursor = self.start;
        while cursor < self.end {
            let next_day = start_of_day(cursor) + Duration::days(1);
            let piece_end = next_day.min(self.end);
            pieces.push(Self::from_ordered(cursor, piece_end));
            cursor = piece_end;
        }
        pieces
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}
