//! Half-open UTC date ranges and sorted, coalescing range sets.
//!
//! A [`Range`] is `[start, end)` with `start < end`. A [`RangeSet`] keeps a
//! sorted list of disjoint ranges; after every insertion no two entries touch
//! or overlap.

mod range;
mod set;

pub use range::{Range, start_of_day};
pub use set::RangeSet;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors produced when constructing ranges.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    #[error("invalid range: start {start} is not before end {end}")]
    Empty {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("range bound out of representable time: {0}")]
    OutOfBounds(String),
}
