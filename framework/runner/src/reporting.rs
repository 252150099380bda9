use std::time::{Duration, Instant};

use gust_core::prelude::{Report, SuiteConfig, UnitOutcome, UnitRequest};

/// How a single test or benchmark went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitResult {
    pub suite: String,
    pub unit: String,
    pub outcome: UnitOutcome,
}

/// One report of a benchmark, numbered from 1 in the order they were taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchReport {
    pub suite: String,
    pub benchmark: String,
    pub tick: u32,
    pub report: Report,
}

/// The number of reports a benchmark bounded by `duration` produces at the given cadence.
///
/// The last report is the final window returned on stop, every other one is taken at a multiple of
/// `interval` after warm-up. Returns `None` for benchmarks without a duration budget.
pub fn report_ticks(duration: Duration, interval: Duration) -> Option<u32> {
    if duration.is_zero() {
        return None;
    }

    let interval_ms = interval.as_millis().max(1);
    let ticks = duration.as_millis().div_ceil(interval_ms).max(1);
    Some(u32::try_from(ticks).unwrap_or(u32::MAX))
}

/// Add the next report of `request`'s benchmark to `reports`, numbered after the ones already there.
pub fn push_report(reports: &mut Vec<BenchReport>, request: &UnitRequest, report: Report) -> u32 {
    let tick = reports
        .iter()
        .filter(|r| r.suite == request.suite && r.benchmark == request.unit)
        .count() as u32
        + 1;
    log::info!("{request} report {tick}: {report}");
    reports.push(BenchReport {
        suite: request.suite.clone(),
        benchmark: request.unit.clone(),
        tick,
        report,
    });
    tick
}

/// What a benchmark driver does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Take an intermediate report at this instant.
    Report(Instant),
    /// Stop the benchmark at this instant, its final window is the last report.
    Stop(Instant),
}

/// The report schedule of one benchmark run, shared by every driver so they number and keep
/// reports the same way.
#[derive(Debug, Clone)]
pub struct ReportCadence {
    measure_start: Instant,
    duration: Duration,
    interval: Duration,
    ticks: Option<u32>,
    tick: u32,
    recorded: u32,
}

impl ReportCadence {
    /// The schedule of a benchmark started at `now`. Reports are counted from the end of warm-up.
    pub fn start(config: &SuiteConfig, now: Instant) -> Self {
        let interval = config.report_interval();
        Self {
            measure_start: now + config.warmup(),
            duration: config.duration(),
            interval,
            ticks: report_ticks(config.duration(), interval),
            tick: 0,
            recorded: 0,
        }
    }

    pub fn next_tick(&mut self) -> Tick {
        self.tick += 1;
        if self.ticks == Some(self.tick) {
            Tick::Stop(self.measure_start + self.duration)
        } else {
            Tick::Report(self.measure_start + self.interval.saturating_mul(self.tick))
        }
    }

    /// Record an intermediate report.
    pub fn record(
        &mut self,
        reports: &mut Vec<BenchReport>,
        request: &UnitRequest,
        report: Report,
    ) -> u32 {
        self.recorded += 1;
        push_report(reports, request, report)
    }

    /// Record the window returned on stop.
    ///
    /// Iteration budgets finish between reports, so their final window is only kept if it measured
    /// something or nothing was reported yet. Duration budgets always keep it.
    pub fn finish(&mut self, reports: &mut Vec<BenchReport>, request: &UnitRequest, report: Report) {
        if self.ticks.is_some() || report.iterations > 0 || self.recorded == 0 {
            self.record(reports, request, report);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config(duration_s: u64, iterations: u64) -> SuiteConfig {
        SuiteConfig {
            duration_s,
            iterations,
            report_interval_s: 1,
            warmup_s: 0,
            ..Default::default()
        }
    }

    fn request() -> UnitRequest {
        UnitRequest::new("MapSuite", "BenchmarkPut", Default::default())
    }

    #[test]
    fn duration_budget_stops_after_its_last_interval() {
        let now = Instant::now();
        let mut cadence = ReportCadence::start(&config(2, 0), now);

        assert_eq!(Tick::Report(now + Duration::from_secs(1)), cadence.next_tick());
        assert_eq!(Tick::Stop(now + Duration::from_secs(2)), cadence.next_tick());
    }

    #[test]
    fn iteration_budget_reports_until_finished() {
        let now = Instant::now();
        let mut cadence = ReportCadence::start(&config(0, 100), now);

        for i in 1..=5 {
            assert_eq!(
                Tick::Report(now + Duration::from_secs(i)),
                cadence.next_tick()
            );
        }
    }

    #[test]
    fn empty_final_window_is_dropped_after_a_report() {
        let mut reports = Vec::new();
        let mut cadence = ReportCadence::start(&config(0, 100), Instant::now());
        let measured = Report {
            iterations: 100,
            ..Default::default()
        };

        assert_eq!(1, cadence.record(&mut reports, &request(), measured));
        cadence.finish(&mut reports, &request(), Report::default());
        assert_eq!(1, reports.len());

        // Nothing reported yet, so the empty window is still the result.
        let mut reports = Vec::new();
        let mut cadence = ReportCadence::start(&config(0, 100), Instant::now());
        cadence.finish(&mut reports, &request(), Report::default());
        assert_eq!(1, reports.len());
        assert_eq!(1, reports[0].tick);
    }

    #[test]
    fn duration_budget_keeps_its_final_window() {
        let mut reports = Vec::new();
        let mut cadence = ReportCadence::start(&config(2, 0), Instant::now());

        cadence.record(&mut reports, &request(), Report::default());
        cadence.finish(&mut reports, &request(), Report::default());
        assert_eq!(vec![1, 2], reports.iter().map(|r| r.tick).collect::<Vec<_>>());
    }

    #[test]
    fn reports_are_numbered_per_benchmark() {
        let mut reports = Vec::new();
        let other = UnitRequest::new("MapSuite", "BenchmarkGet", Default::default());

        assert_eq!(1, push_report(&mut reports, &request(), Report::default()));
        assert_eq!(1, push_report(&mut reports, &other, Report::default()));
        assert_eq!(2, push_report(&mut reports, &request(), Report::default()));
    }

    #[test]
    fn ticks_round_up() {
        assert_eq!(
            Some(2),
            report_ticks(Duration::from_secs(2), Duration::from_secs(1))
        );
        assert_eq!(
            Some(3),
            report_ticks(Duration::from_millis(2500), Duration::from_secs(1))
        );
        assert_eq!(
            Some(1),
            report_ticks(Duration::from_secs(1), Duration::from_secs(5))
        );
        assert_eq!(None, report_ticks(Duration::ZERO, Duration::from_secs(1)));
    }
}
