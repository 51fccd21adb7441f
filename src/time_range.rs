//! Half-open ranges over entity timestamps
//!
//! `[init_timestamp, end_timestamp)`. Used to partition history for snapshots.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    pub init_timestamp: Timestamp,
    pub end_timestamp: Timestamp,
}

impl TimeRange {
    /// Create a range. An inverted range collapses to an empty one at `init`.
    pub fn new(init_timestamp: Timestamp, end_timestamp: Timestamp) -> Self {
        Self {
            init_timestamp,
            end_timestamp: end_timestamp.max(init_timestamp),
        }
    }

    pub fn duration(&self) -> u64 {
        self.end_timestamp - self.init_timestamp
    }

    pub fn is_empty(&self) -> bool {
        self.duration() == 0
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        self.init_timestamp <= ts && ts < self.end_timestamp
    }

    /// Whether `other` lies entirely inside this range
    pub fn contains_range(&self, other: &TimeRange) -> bool {
        self.init_timestamp <= other.init_timestamp && other.end_timestamp <= self.end_timestamp
    }

    pub fn intersects(&self, other: &TimeRange) -> bool {
        self.init_timestamp < other.end_timestamp && other.init_timestamp < self.end_timestamp
    }

    /// Entirely before `other`
    pub fn is_before(&self, other: &TimeRange) -> bool {
        self.end_timestamp <= other.init_timestamp
    }

    /// Entirely after `other`
    pub fn is_after(&self, other: &TimeRange) -> bool {
        other.end_timestamp <= self.init_timestamp
    }

    /// Split into `n` disjoint, contiguous sub-ranges covering the same span.
    ///
    /// The last sub-range absorbs the remainder. When the span is shorter than
    /// `n`, fewer (unit-width) ranges are returned so none is empty.
    pub fn split(&self, n: u64) -> Vec<TimeRange> {
        let n = n.max(1).min(self.duration().max(1));
        if self.is_empty() {
            return vec![*self];
        }
        let width = self.duration() / n;
        (0..n)
            .map(|i| {
                let init = self.init_timestamp + i * width;
                let end = if i == n - 1 {
                    self.end_timestamp
                } else {
                    init + width
                };
                TimeRange::new(init, end)
            })
            .collect()
    }

    /// Union with an adjacent or overlapping range
    pub fn merge(&self, other: &TimeRange) -> Option<TimeRange> {
        if self.end_timestamp < other.init_timestamp || other.end_timestamp < self.init_timestamp {
            return None;
        }
        Some(TimeRange::new(
            self.init_timestamp.min(other.init_timestamp),
            self.end_timestamp.max(other.end_timestamp),
        ))
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.init_timestamp, self.end_timestamp)
    }
}
