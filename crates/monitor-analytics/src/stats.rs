//! Sample statistics and histogram binning.
//!
//! Every function here is total: an empty sample set yields zeros, never an error.

use serde::{Deserialize, Serialize};

/// Summary statistics over a scalar sample set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleStats {
    pub count: usize,
    pub avg: f64,
    pub median: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
    /// Histogram over `[min, max]`.
    pub distribution: Vec<u64>,
}

impl SampleStats {
    /// Compute statistics with a `bins`-wide distribution.
    pub fn from_samples(samples: &[f64], bins: usize) -> Self {
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);

        if sorted.is_empty() {
            return Self {
                distribution: vec![0; bins],
                ..Self::default()
            };
        }

        Self {
            count: sorted.len(),
            avg: mean(&sorted),
            median: median(&sorted),
            p90: percentile(&sorted, 0.90),
            p95: percentile(&sorted, 0.95),
            p99: percentile(&sorted, 0.99),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            distribution: distribution(&sorted, bins),
        }
    }
}

/// Arithmetic mean; 0 for no samples.
pub fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

/// Median of an ascending-sorted sample set; 0 for no samples.
pub fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    match n {
        0 => 0.0,
        _ if n % 2 == 1 => sorted[n / 2],
        _ => (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0,
    }
}

/// Nearest-rank percentile of an ascending-sorted sample set.
///
/// Uses `index = floor(n * p)` clamped to the last element; 0 for no samples.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    let index = ((n as f64 * p).floor() as usize).min(n - 1);
    sorted[index]
}

/// Bin samples into `bins` equal-width buckets between their min and max.
///
/// The result always has `bins` entries and sums to `samples.len()`. When all
/// samples are equal every one of them lands in bin 0.
pub fn distribution(samples: &[f64], bins: usize) -> Vec<u64> {
    let mut counts = vec![0u64; bins];
    if samples.is_empty() || bins == 0 {
        return counts;
    }

    let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
    let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    if min == max {
        counts[0] = samples.len() as u64;
        return counts;
    }

    let width = (max - min) / bins as f64;
    for &x in samples {
        let bin = (((x - min) / width).floor() as usize).min(bins - 1);
        counts[bin] += 1;
    }
    counts
}

/// `numerator / denominator`, or 0 when the denominator is 0.
pub fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}
