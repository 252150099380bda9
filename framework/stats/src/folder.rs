use std::time::{Duration, Instant};

use gust_core::prelude::Report;

use crate::percentile::Summary;

/// Folds an unbounded stream of call durations into bounded memory.
///
/// Retained samples each stand for `stride` consecutive calls. Once `batch_size²` samples are
/// retained they are replaced by the means of consecutive batches of `batch_size`, leaving
/// `batch_size` samples, and the stride grows by a factor of `batch_size`. New calls are then
/// averaged in groups of `stride` before being retained, so every retained sample carries the same
/// weight and memory never exceeds `batch_size²` samples however long the window runs.
#[derive(Debug)]
pub struct Folder {
    batch_size: usize,
    samples: Vec<Duration>,
    stride: u64,
    pending_total: Duration,
    pending_count: u64,
    count: u64,
    errors: u64,
    total: Duration,
    window_start: Instant,
}

impl Folder {
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(2);
        Self {
            batch_size,
            samples: Vec::with_capacity(batch_size),
            stride: 1,
            pending_total: Duration::ZERO,
            pending_count: 0,
            count: 0,
            errors: 0,
            total: Duration::ZERO,
            window_start: Instant::now(),
        }
    }

    pub fn push(&mut self, sample: Duration) {
        self.count += 1;
        self.total += sample;

        if self.stride == 1 {
            self.samples.push(sample);
        } else {
            self.pending_total += sample;
            self.pending_count += 1;
            if self.pending_count == self.stride {
                self.samples.push(mean(self.pending_total, self.pending_count));
                self.pending_total = Duration::ZERO;
                self.pending_count = 0;
            }
        }

        if self.samples.len() >= self.batch_size * self.batch_size {
            self.fold();
        }
    }

    pub fn push_batch(&mut self, batch: &[Duration]) {
        for sample in batch {
            self.push(*sample);
        }
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    /// Number of values currently held, including the partial group awaiting a full stride.
    pub fn retained(&self) -> usize {
        self.samples.len() + usize::from(self.pending_count > 0)
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Summarise the current window and start a new one at `now`.
    pub fn take_report(&mut self, now: Instant) -> Report {
        let mut sorted = std::mem::take(&mut self.samples);
        if self.pending_count > 0 {
            sorted.push(mean(self.pending_total, self.pending_count));
        }
        sorted.sort_unstable();

        let report = Summary::from_sorted(&sorted, self.count, self.total).into_report(
            self.count,
            self.errors,
            now.saturating_duration_since(self.window_start),
        );

        self.reset_window(now);
        report
    }

    /// Discard everything recorded so far and start a new window at `now`.
    pub fn reset_window(&mut self, now: Instant) {
        self.samples.clear();
        self.stride = 1;
        self.pending_total = Duration::ZERO;
        self.pending_count = 0;
        self.count = 0;
        self.errors = 0;
        self.total = Duration::ZERO;
        self.window_start = now;
    }

    fn fold(&mut self) {
        let folded = self
            .samples
            .chunks(self.batch_size)
            .map(|batch| mean(batch.iter().sum(), batch.len() as u64))
            .collect::<Vec<_>>();
        self.samples = folded;
        self.stride *= self.batch_size as u64;
        log::trace!(
            "Folded samples, {} retained with stride {}",
            self.samples.len(),
            self.stride
        );
    }
}

fn mean(total: Duration, count: u64) -> Duration {
    Duration::from_nanos(u64::try_from(total.as_nanos() / u128::from(count.max(1))).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn memory_stays_bounded() {
        let batch_size = 8;
        let mut folder = Folder::new(batch_size);

        for i in 0..(5 * batch_size * batch_size * batch_size) as u64 {
            folder.push(Duration::from_micros(i % 100));
            assert!(
                folder.retained() <= batch_size * batch_size,
                "retained {} after {} samples",
                folder.retained(),
                i + 1
            );
        }
        assert_eq!((5 * batch_size * batch_size * batch_size) as u64, folder.count());
    }

    #[test]
    fn folding_preserves_mean_and_order() {
        let mut folder = Folder::new(4);
        for i in 1..=1000u64 {
            folder.push(Duration::from_millis(i));
        }

        let report = folder.take_report(Instant::now());
        assert_eq!(1000, report.iterations);
        assert_eq!(Duration::from_micros(500_500), report.mean);
        assert!(report.p50 <= report.p75);
        assert!(report.p75 <= report.p95);
        assert!(report.p95 <= report.p99);
        // Folding averages samples, so the tails are approximate but stay in range.
        assert!(report.p50 > Duration::from_millis(300) && report.p50 < Duration::from_millis(700));
    }

    #[test]
    fn exact_percentiles_before_folding() {
        let mut folder = Folder::new(16);
        folder.push_batch(&[
            Duration::from_millis(4),
            Duration::from_millis(1),
            Duration::from_millis(3),
            Duration::from_millis(2),
        ]);
        folder.record_error();

        let report = folder.take_report(Instant::now());
        assert_eq!(4, report.iterations);
        assert_eq!(1, report.errors);
        assert_eq!(Duration::from_millis(2), report.p50);
        assert_eq!(Duration::from_millis(3), report.p75);
        assert_eq!(Duration::from_millis(4), report.p99);
    }

    #[test]
    fn report_resets_window() {
        let mut folder = Folder::new(4);
        for _ in 0..100 {
            folder.push(Duration::from_millis(1));
        }
        let first = folder.take_report(Instant::now());
        let second = folder.take_report(Instant::now());

        assert_eq!(100, first.iterations);
        assert_eq!(0, second.iterations);
        assert_eq!(Duration::ZERO, second.p99);
        assert_eq!(0, folder.retained());
    }
}
