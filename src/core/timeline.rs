//! Time axis: the ascending list of dumped time values

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::RangeInclusive;

/// Sorted, de-duplicated time values of a dataset
///
/// The position of a time value in this list is its time-index, which is
/// also the row index in the ordered store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeAxis {
    times: Vec<u64>,
}

impl TimeAxis {
    /// Create an axis from unordered time values
    pub fn new(times: impl IntoIterator<Item = u64>) -> Self {
        let set: BTreeSet<u64> = times.into_iter().collect();
        Self {
            times: set.into_iter().collect(),
        }
    }

    pub fn times(&self) -> &[u64] {
        &self.times
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Time-index of an exact time value
    pub fn index_of(&self, time: u64) -> Option<usize> {
        self.times.binary_search(&time).ok()
    }

    /// Time value at a time-index
    pub fn time_at(&self, index: usize) -> Option<u64> {
        self.times.get(index).copied()
    }

    /// Last time value, if any
    pub fn last(&self) -> Option<u64> {
        self.times.last().copied()
    }

    /// Time-index of the value closest to `time` (ties go to the earlier one)
    pub fn nearest(&self, time: u64) -> Option<usize> {
        let pos = self.times.partition_point(|&t| t < time);
        let after = (pos < self.times.len()).then_some(pos);
        let before = pos.checked_sub(1);
        match (before, after) {
            (Some(b), Some(a)) => {
                if time - self.times[b] <= self.times[a] - time {
                    Some(b)
                } else {
                    Some(a)
                }
            }
            (Some(b), None) => Some(b),
            (None, a) => a,
        }
    }

    /// Resolve a window to the inclusive range of time-indices it covers
    pub fn resolve(&self, window: TimeWindow) -> Result<RangeInclusive<usize>> {
        let range = match window {
            TimeWindow::All => (!self.is_empty()).then(|| 0..=self.len() - 1),
            TimeWindow::Nearest(t) => self.nearest(t).map(|i| i..=i),
            TimeWindow::Between(start, end) => {
                let first = self.times.partition_point(|&t| t < start);
                let stop = self.times.partition_point(|&t| t <= end);
                (first < stop).then(|| first..=stop - 1)
            }
        };
        range.ok_or_else(|| Error::Configuration(format!("No time values in window {:?}", window)))
    }
}

/// Active time window of a query session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeWindow {
    /// Every available time
    #[default]
    All,
    /// The single available time closest to the given value
    Nearest(u64),
    /// All available times within inclusive bounds
    Between(u64, u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_sorted_and_deduplicated() {
        let axis = TimeAxis::new(vec![30, 10, 20, 10]);
        assert_eq!(axis.times(), &[10, 20, 30]);
        assert_eq!(axis.index_of(20), Some(1));
        assert_eq!(axis.index_of(25), None);
        assert_eq!(axis.last(), Some(30));
    }

    #[test]
    fn test_nearest() {
        let axis = TimeAxis::new(vec![0, 10, 20]);
        assert_eq!(axis.nearest(0), Some(0));
        assert_eq!(axis.nearest(4), Some(0));
        assert_eq!(axis.nearest(5), Some(0));
        assert_eq!(axis.nearest(6), Some(1));
        assert_eq!(axis.nearest(100), Some(2));
        assert_eq!(TimeAxis::default().nearest(3), None);
    }

    #[test]
    fn test_resolve_windows() {
        let axis = TimeAxis::new(vec![0, 10, 20, 30]);
        assert_eq!(axis.resolve(TimeWindow::All).unwrap(), 0..=3);
        assert_eq!(axis.resolve(TimeWindow::Nearest(12)).unwrap(), 1..=1);
        assert_eq!(axis.resolve(TimeWindow::Between(5, 20)).unwrap(), 1..=2);
        assert!(matches!(
            axis.resolve(TimeWindow::Between(11, 19)),
            Err(Error::Configuration(_))
        ));
    }
}
