use core::cmp::min;
use std::fmt;

use crate::stats::SampleSeries;

/// Buckets holding this many samples or fewer are treated as noise
/// (context switches, interrupts).
pub const SPURIOUS_THRESHOLD: u32 = 1;

pub const BUCKET_SIZE: u64 = 5;
pub const BUCKET_NUMBER: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistParams {
    pub bucket_size: u64,
    pub bucket_number: usize,
}

impl Default for HistParams {
    fn default() -> Self {
        HistParams {
            bucket_size: BUCKET_SIZE,
            bucket_number: BUCKET_NUMBER,
        }
    }
}

/// Latency histogram; the last bucket collects everything above range.
#[derive(Debug, Clone)]
pub struct Histogram {
    params: HistParams,
    buckets: Vec<u32>,
}

impl Histogram {
    pub fn new(params: HistParams) -> Self {
        assert_ne!(params.bucket_size, 0);
        assert!(params.bucket_number >= 2);
        Histogram {
            params,
            buckets: vec![0; params.bucket_number],
        }
    }

    pub fn from_samples(params: HistParams, samples: &SampleSeries) -> Self {
        let mut hist = Self::new(params);
        for time in samples.iter() {
            hist.record(time);
        }
        hist
    }

    pub fn record(&mut self, time: u64) {
        let bucket = self.to_bucket(time);
        self.buckets[bucket] += 1;
    }

    pub fn buckets(&self) -> &[u32] {
        &self.buckets
    }

    pub fn params(&self) -> HistParams {
        self.params
    }

    /// Bucket holding `time`, the overflow bucket for anything above range.
    pub fn to_bucket(&self, time: u64) -> usize {
        let last = (self.params.bucket_number - 1) as u64;
        min(time / self.params.bucket_size, last) as usize
    }

    pub fn from_bucket(&self, bucket: usize) -> u64 {
        bucket as u64 * self.params.bucket_size
    }
}

/// Latencies strictly below `bound` are hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Threshold {
    pub bound: u64,
}

impl Threshold {
    pub fn is_hit(&self, time: u64) -> bool {
        time < self.bound
    }

    /// Picks the least populated bucket between the hit mode and the first
    /// non spurious miss bucket. `None` when the two distributions overlap
    /// the wrong way round or there is no miss signal at all.
    pub fn from_histograms(hit: &Histogram, miss: &Histogram) -> Option<Threshold> {
        assert_eq!(hit.params(), miss.params());
        // the last bucket is overflow, ignore it
        let usable = hit.params().bucket_number - 1;
        let hit_buckets = &hit.buckets()[..usable];
        let miss_buckets = &miss.buckets()[..usable];

        let mut hit_max = 0;
        let mut hit_max_i = 0;
        for (i, &count) in hit_buckets.iter().enumerate() {
            if count > hit_max {
                hit_max = count;
                hit_max_i = i;
            }
        }
        if hit_max == 0 {
            return None;
        }
        let miss_min_i = miss_buckets
            .iter()
            .position(|&count| count > SPURIOUS_THRESHOLD)?;
        if miss_min_i <= hit_max_i {
            return None;
        }

        let mut min_count = u32::max_value();
        let mut min_i = hit_max_i;
        for i in hit_max_i..miss_min_i {
            let count = hit_buckets[i] + miss_buckets[i];
            if count < min_count {
                min_count = count;
                min_i = i;
            }
        }
        Some(Threshold {
            bound: hit.from_bucket(min_i + 1),
        })
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hit below {} ns", self.bound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hist(samples: &[u64]) -> Histogram {
        let series: SampleSeries = samples.iter().copied().collect();
        Histogram::from_samples(
            HistParams {
                bucket_size: 5,
                bucket_number: 100,
            },
            &series,
        )
    }

    #[test]
    fn overflow_goes_to_last_bucket() {
        let h = hist(&[0, 4, 5, 10_000]);
        assert_eq!(h.buckets()[0], 2);
        assert_eq!(h.buckets()[1], 1);
        assert_eq!(h.buckets()[99], 1);
    }

    #[test]
    fn huge_samples_land_in_overflow_bucket() {
        let h = hist(&[u64::MAX, u64::MAX - 3, 1 << 40]);
        assert_eq!(h.to_bucket(u64::MAX), 99);
        assert_eq!(h.to_bucket(1 << 40), 99);
        assert_eq!(h.buckets()[99], 3);
        assert_eq!(h.buckets()[..99].iter().sum::<u32>(), 0);
    }

    #[test]
    fn threshold_separates_hits_and_misses() {
        let hit = hist(&[10, 10, 11, 12, 10, 13]);
        let miss = hist(&[200, 201, 205, 199, 200]);
        let threshold = Threshold::from_histograms(&hit, &miss).unwrap();
        assert_eq!(threshold.bound, 20);
        assert!(threshold.is_hit(10));
        assert!(threshold.is_hit(14));
        assert!(!threshold.is_hit(200));
    }

    #[test]
    fn adjacent_distributions_keep_the_hit_bucket() {
        let hit = hist(&[10, 11, 12, 13]);
        let miss = hist(&[15, 16, 17]);
        let threshold = Threshold::from_histograms(&hit, &miss).unwrap();
        assert!(threshold.is_hit(14));
        assert!(!threshold.is_hit(15));
    }

    #[test]
    fn inverted_distributions_have_no_threshold() {
        let hit = hist(&[200, 200, 200]);
        let miss = hist(&[10, 10, 10]);
        assert_eq!(Threshold::from_histograms(&hit, &miss), None);
    }

    #[test]
    fn spurious_misses_are_ignored() {
        let hit = hist(&[10, 10, 10]);
        let miss = hist(&[12, 300, 300]);
        let threshold = Threshold::from_histograms(&hit, &miss).unwrap();
        assert!(threshold.is_hit(12));
        assert!(!threshold.is_hit(300));
    }
}
