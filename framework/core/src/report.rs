use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A point-in-time summary of benchmark latencies.
///
/// Workers emit one per reporting window, the coordinator reduces the workers' reports into one
/// per window with [Report::reduce].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Report {
    pub iterations: u64,
    /// Calls to the target which returned an error. They are still timed.
    pub errors: u64,
    pub duration: Duration,
    pub mean: Duration,
    pub p50: Duration,
    pub p75: Duration,
    pub p95: Duration,
    pub p99: Duration,
}

impl Report {
    /// Combine the reports of several workers for the same window.
    ///
    /// Iterations and errors are summed, the duration is the longest of the workers and each
    /// latency figure is the arithmetic mean of the workers' figures.
    pub fn reduce(reports: &[Report]) -> Report {
        if reports.is_empty() {
            return Report::default();
        }

        let mean_of = |f: fn(&Report) -> Duration| -> Duration {
            let total: u128 = reports.iter().map(|r| f(r).as_nanos()).sum();
            let mean = total / reports.len() as u128;
            Duration::from_nanos(u64::try_from(mean).unwrap_or(u64::MAX))
        };

        Report {
            iterations: reports.iter().map(|r| r.iterations).sum(),
            errors: reports.iter().map(|r| r.errors).sum(),
            duration: reports
                .iter()
                .map(|r| r.duration)
                .max()
                .unwrap_or_default(),
            mean: mean_of(|r| r.mean),
            p50: mean_of(|r| r.p50),
            p75: mean_of(|r| r.p75),
            p95: mean_of(|r| r.p95),
            p99: mean_of(|r| r.p99),
        }
    }

    /// Calls per second over the report's window.
    pub fn throughput(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.iterations as f64 / secs
        } else {
            0.0
        }
    }
}

impl Display for Report {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "iterations={} errors={} duration={:.2?} ops/s={:.1} mean={:.2?} p50={:.2?} p75={:.2?} p95={:.2?} p99={:.2?}",
            self.iterations,
            self.errors,
            self.duration,
            self.throughput(),
            self.mean,
            self.p50,
            self.p75,
            self.p95,
            self.p99
        )
    }
}
