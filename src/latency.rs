//! Latency statistics over a batch of round-trip samples.
//!
//! Percentiles use nearest-rank indexing with a guard for a single sample:
//!
//! ```text
//! count_fixed = max(n, 2)
//! pXX         = sorted[floor(count_fixed * XX / 100) - 1]
//! ```
//!
//! With `n == 1` every index resolves to 0, so the lone sample is reported
//! for every percentile. This is an approximation, not an interpolating
//! estimator, and is kept as is because it defines the reported numbers.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reduced statistics for one batch of round trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: u64,
    pub avg: Duration,
    pub min: Duration,
    pub max: Duration,
    pub p50: Duration,
    pub p90: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub p999: Duration,
    pub p9999: Duration,
    /// Mean absolute difference between consecutive samples
    pub jitter: Duration,
}

impl LatencyStats {
    /// Reduces `samples` (in the order they were measured).
    ///
    /// Returns `None` for an empty batch.
    ///
    /// # Examples
    ///
    /// ```
    /// use ethrs::latency::LatencyStats;
    /// use std::time::Duration;
    ///
    /// let samples = [10, 20, 30].map(Duration::from_millis);
    /// let stats = LatencyStats::calculate(&samples).unwrap();
    ///
    /// assert_eq!(stats.min, Duration::from_millis(10));
    /// assert_eq!(stats.max, Duration::from_millis(30));
    /// assert_eq!(stats.avg, Duration::from_millis(20));
    /// assert_eq!(stats.jitter, Duration::from_millis(10));
    /// ```
    pub fn calculate(samples: &[Duration]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let count = samples.len();

        let sum: u128 = samples.iter().map(|d| d.as_nanos()).sum();
        let avg = nanos(sum / count as u128);

        // Needs temporal adjacency, so before sorting.
        let jitter = if count > 1 {
            let total: u128 = samples
                .windows(2)
                .map(|pair| pair[1].abs_diff(pair[0]).as_nanos())
                .sum();
            nanos(total / (count as u128 - 1))
        } else {
            Duration::ZERO
        };

        let mut sorted = samples.to_vec();
        sorted.sort_unstable();

        let count_fixed = count.max(2);
        let at = |pct: f64| sorted[percentile_index(count_fixed, pct)];

        Some(Self {
            count: count as u64,
            avg,
            min: sorted[0],
            max: sorted[count - 1],
            p50: at(50.0),
            p90: at(90.0),
            p95: at(95.0),
            p99: at(99.0),
            p999: at(99.9),
            p9999: at(99.99),
            jitter,
        })
    }
}

/// Nearest-rank index for `pct` over `count_fixed` (>= 2) samples.
pub(crate) fn percentile_index(count_fixed: usize, pct: f64) -> usize {
    let rank = (count_fixed as f64 * pct / 100.0).floor() as usize;
    rank.saturating_sub(1)
}

fn nanos(n: u128) -> Duration {
    Duration::from_nanos(n.min(u64::MAX as u128) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_three_samples() {
        let stats = LatencyStats::calculate(&[ms(10), ms(20), ms(30)]).unwrap();

        assert_eq!(stats.count, 3);
        assert_eq!(stats.min, ms(10));
        assert_eq!(stats.max, ms(30));
        assert_eq!(stats.avg, ms(20));

        let allowed = [ms(10), ms(20), ms(30)];
        for p in [
            stats.p50,
            stats.p90,
            stats.p95,
            stats.p99,
            stats.p999,
            stats.p9999,
        ] {
            assert!(allowed.contains(&p), "{:?} not a sample", p);
        }
        // floor(3 * 0.5) - 1 = 0, floor(3 * 0.9) - 1 = 1
        assert_eq!(stats.p50, ms(10));
        assert_eq!(stats.p90, ms(20));
    }

    #[test]
    fn test_single_sample() {
        let stats = LatencyStats::calculate(&[ms(15)]).unwrap();

        assert_eq!(stats.min, ms(15));
        assert_eq!(stats.max, ms(15));
        assert_eq!(stats.avg, ms(15));
        assert_eq!(stats.p50, ms(15));
        assert_eq!(stats.p90, ms(15));
        assert_eq!(stats.p95, ms(15));
        assert_eq!(stats.p99, ms(15));
        assert_eq!(stats.p999, ms(15));
        assert_eq!(stats.p9999, ms(15));
        assert_eq!(stats.jitter, Duration::ZERO);
    }

    #[test]
    fn test_empty_batch() {
        assert!(LatencyStats::calculate(&[]).is_none());
    }

    #[test]
    fn test_jitter_uses_measurement_order() {
        // Sorted these would be 10,10,30,30 with a jitter of 20/3.
        let stats = LatencyStats::calculate(&[ms(10), ms(30), ms(10), ms(30)]).unwrap();
        assert_eq!(stats.jitter, ms(20));
    }

    #[test]
    fn test_thousand_samples_percentiles() {
        let samples: Vec<Duration> = (1..=1000).rev().map(Duration::from_micros).collect();
        let stats = LatencyStats::calculate(&samples).unwrap();

        assert_eq!(stats.min, Duration::from_micros(1));
        assert_eq!(stats.max, Duration::from_micros(1000));
        assert_eq!(stats.p50, Duration::from_micros(500));
        assert_eq!(stats.p99, Duration::from_micros(990));
        assert_eq!(stats.p999, Duration::from_micros(999));
        assert_eq!(stats.p9999, Duration::from_micros(999));
    }

    #[test]
    fn test_percentile_index_never_underflows() {
        for n in 2..50 {
            for pct in [50.0, 90.0, 95.0, 99.0, 99.9, 99.99] {
                assert!(percentile_index(n, pct) < n);
            }
        }
    }
}
