use core::convert::TryFrom;
use core::iter::FromIterator;
use std::fmt;

use itertools::Itertools;

/// Trial samples in nanoseconds, kept in trial order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleSeries {
    samples: Vec<u64>,
}

impl SampleSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, sample: u64) {
        self.samples.push(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[u64] {
        &self.samples
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.samples.iter().copied()
    }

    /// Sorted copy, the series itself keeps trial order.
    pub fn sorted(&self) -> Vec<u64> {
        self.iter().sorted().collect()
    }

    /// Middle element of the sorted series; the lower one for even lengths.
    pub fn median(&self) -> Option<u64> {
        if self.is_empty() {
            return None;
        }
        let sorted = self.sorted();
        Some(sorted[(sorted.len() - 1) / 2])
    }

    pub fn mean(&self) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        let sum: u128 = self.iter().map(u128::from).sum();
        Some(sum as f64 / self.len() as f64)
    }

    pub fn total(&self) -> u64 {
        self.iter().fold(0u64, |acc, s| acc.saturating_add(s))
    }

    pub fn min(&self) -> Option<u64> {
        self.iter().min()
    }

    pub fn max(&self) -> Option<u64> {
        self.iter().max()
    }

    pub fn summary(&self) -> Option<Summary> {
        Some(Summary {
            count: self.len(),
            min: self.min()?,
            median: self.median()?,
            mean: self.mean()?,
            max: self.max()?,
        })
    }
}

impl FromIterator<u64> for SampleSeries {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        Self {
            samples: iter.into_iter().collect(),
        }
    }
}

impl Extend<u64> for SampleSeries {
    fn extend<I: IntoIterator<Item = u64>>(&mut self, iter: I) {
        self.samples.extend(iter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub count: usize,
    pub min: u64,
    pub median: u64,
    pub mean: f64,
    pub max: u64,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "median {} ns, mean {:.1} ns, min {} ns, max {} ns (n = {})",
            self.median, self.mean, self.min, self.max, self.count
        )
    }
}

/// `a - b` as a signed value, saturating at the `i64` range.
pub fn signed_delta(a: u64, b: u64) -> i64 {
    if a >= b {
        i64::try_from(a - b).unwrap_or(i64::MAX)
    } else {
        i64::try_from(b - a).map(|d| -d).unwrap_or(i64::MIN)
    }
}
