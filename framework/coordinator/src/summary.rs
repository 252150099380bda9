use std::time::Duration;

use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::coordinator::RunOutcome;

#[derive(Tabled)]
struct UnitRow {
    #[tabled(rename = "Suite")]
    suite: String,
    #[tabled(rename = "Unit")]
    unit: String,
    #[tabled(rename = "Result")]
    result: String,
}

#[derive(Tabled)]
struct ReportRow {
    #[tabled(rename = "Benchmark")]
    benchmark: String,
    #[tabled(rename = "#")]
    tick: u32,
    #[tabled(rename = "Iterations")]
    iterations: u64,
    #[tabled(rename = "Errors")]
    errors: u64,
    #[tabled(rename = "Ops/s")]
    throughput: String,
    #[tabled(rename = "Mean (ms)")]
    mean: String,
    #[tabled(rename = "p50 (ms)")]
    p50: String,
    #[tabled(rename = "p95 (ms)")]
    p95: String,
    #[tabled(rename = "p99 (ms)")]
    p99: String,
}

fn ms(d: Duration) -> String {
    format!("{:.3}", d.as_secs_f64() * 1000.0)
}

/// Render the results and benchmark reports of a run as text tables.
pub fn summary_table(outcome: &RunOutcome) -> String {
    let summary = &outcome.summary;
    let mut out = format!(
        "Run {} on {} workers: {:?} in {}s\n",
        summary.run_id,
        summary.workers,
        summary.status,
        (summary.finished_at - summary.started_at).num_seconds()
    );

    if !outcome.results.is_empty() {
        let rows = outcome
            .results
            .iter()
            .map(|r| UnitRow {
                suite: r.suite.clone(),
                unit: r.unit.clone(),
                result: r.outcome.to_string(),
            })
            .collect::<Vec<_>>();

        let mut table = Table::new(&rows);
        table.with(Style::modern());
        out.push_str(&format!("{table}\n"));
    }

    if !outcome.reports.is_empty() {
        let rows = outcome
            .reports
            .iter()
            .map(|r| ReportRow {
                benchmark: format!("{}/{}", r.suite, r.benchmark),
                tick: r.tick,
                iterations: r.report.iterations,
                errors: r.report.errors,
                throughput: format!("{:.1}", r.report.throughput()),
                mean: ms(r.report.mean),
                p50: ms(r.report.p50),
                p95: ms(r.report.p95),
                p99: ms(r.report.p99),
            })
            .collect::<Vec<_>>();

        let mut table = Table::new(&rows);
        table.with(Style::modern());
        out.push_str(&format!("{table}\n"));
    }

    if let Some(error) = &outcome.error {
        out.push_str(&format!("Error: {error}\n"));
    }

    out
}

pub fn print_summary(outcome: &RunOutcome) {
    println!("\n{}", summary_table(outcome));
}
