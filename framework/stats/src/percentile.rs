use std::time::Duration;

use gust_core::prelude::Report;

/// Read a percentile cut point from sorted samples by index.
///
/// Returns the sample at index `max(ceil(n * percent / 100) - 1, 0)`, so with a single sample
/// every percentile is that sample. An empty slice yields zero.
pub fn percentile(sorted: &[Duration], percent: u32) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }

    let n = sorted.len() as u64;
    let rank = (n * u64::from(percent)).div_ceil(100);
    let index = rank.saturating_sub(1).min(n - 1);
    sorted[index as usize]
}

/// The latency figures of one reporting window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub mean: Duration,
    pub p50: Duration,
    pub p75: Duration,
    pub p95: Duration,
    pub p99: Duration,
}

impl Summary {
    /// Summarise sorted samples. The mean is `total / count` over every call in the window rather
    /// than over the retained samples, which may have been folded.
    pub fn from_sorted(sorted: &[Duration], count: u64, total: Duration) -> Self {
        let mean = if count == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(u64::try_from(total.as_nanos() / u128::from(count)).unwrap_or(u64::MAX))
        };

        Self {
            mean,
            p50: percentile(sorted, 50),
            p75: percentile(sorted, 75),
            p95: percentile(sorted, 95),
            p99: percentile(sorted, 99),
        }
    }

    pub fn into_report(self, iterations: u64, errors: u64, duration: Duration) -> Report {
        Report {
            iterations,
            errors,
            duration,
            mean: self.mean,
            p50: self.p50,
            p75: self.p75,
            p95: self.p95,
            p99: self.p99,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ms(values: &[u64]) -> Vec<Duration> {
        values.iter().map(|v| Duration::from_millis(*v)).collect()
    }

    #[test]
    fn single_sample_is_every_percentile() {
        let samples = ms(&[7]);
        for p in [0, 1, 50, 75, 95, 99, 100] {
            assert_eq!(Duration::from_millis(7), percentile(&samples, p));
        }
    }

    #[test]
    fn index_is_ceiling_rank_minus_one() {
        let samples = ms(&(1..=100).collect::<Vec<_>>());
        assert_eq!(Duration::from_millis(50), percentile(&samples, 50));
        assert_eq!(Duration::from_millis(75), percentile(&samples, 75));
        assert_eq!(Duration::from_millis(95), percentile(&samples, 95));
        assert_eq!(Duration::from_millis(99), percentile(&samples, 99));

        let samples = ms(&[1, 2, 3]);
        // ceil(3 * 0.5) - 1 = 1
        assert_eq!(Duration::from_millis(2), percentile(&samples, 50));
        // ceil(3 * 0.99) - 1 = 2
        assert_eq!(Duration::from_millis(3), percentile(&samples, 99));
        assert_eq!(Duration::from_millis(1), percentile(&samples, 0));
    }

    #[test]
    fn empty_samples() {
        assert_eq!(Duration::ZERO, percentile(&[], 50));
        assert_eq!(Summary::default(), Summary::from_sorted(&[], 0, Duration::ZERO));
    }

    #[test]
    fn mean_uses_exact_total() {
        let summary = Summary::from_sorted(&ms(&[10, 20]), 4, Duration::from_millis(100));
        assert_eq!(Duration::from_millis(25), summary.mean);
        assert!(summary.p50 <= summary.p75);
        assert!(summary.p95 <= summary.p99);
    }
}
