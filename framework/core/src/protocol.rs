//! Request and response types of the remote worker interface.
//!
//! These are plain serializable values so that any transport can carry them. Arguments travel as
//! request fields, never as process environment, which keeps workers stateless between calls apart
//! from the statistics of a running benchmark.

use std::fmt::{Display, Formatter};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::report::Report;
use crate::spec::{Args, RunMode, SuiteConfig};

/// Addresses a suite-level hook.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuiteRequest {
    pub suite: String,
    pub args: Args,
}

/// Addresses a single test or benchmark within a suite.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnitRequest {
    pub suite: String,
    pub unit: String,
    pub args: Args,
}

impl UnitRequest {
    pub fn new(suite: impl Into<String>, unit: impl Into<String>, args: Args) -> Self {
        Self {
            suite: suite.into(),
            unit: unit.into(),
            args,
        }
    }

    pub fn suite_request(&self) -> SuiteRequest {
        SuiteRequest {
            suite: self.suite.clone(),
            args: self.args.clone(),
        }
    }
}

impl Display for UnitRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.suite, self.unit)
    }
}

/// Budgets for one benchmark run on one worker.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BenchParams {
    /// Measured calls before stopping, `0` for no limit.
    pub iterations: u64,
    /// Measured time before stopping, zero for no limit.
    pub duration: Duration,
    pub warmup: Duration,
    pub batch_size: usize,
}

impl BenchParams {
    pub fn from_config(config: &SuiteConfig) -> Self {
        Self {
            iterations: config.iterations,
            duration: config.duration(),
            warmup: config.warmup(),
            batch_size: config.batch_size,
        }
    }
}

/// Runs a unit. Tests run synchronously within the call, benchmarks are started and then polled.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRequest {
    pub unit: UnitRequest,
    /// Concurrent callers for a benchmark.
    pub parallelism: usize,
    /// Time the unit has left before the run's deadline.
    pub timeout: Duration,
    pub bench: BenchParams,
}

/// The result of a benchmark report call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BenchProgress {
    /// Statistics for the window since the previous report.
    pub report: Report,
    /// Whether the benchmark reached its iteration or duration budget.
    pub finished: bool,
}

/// The result of a single unit invocation, captured at a supervised call boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnitOutcome {
    Passed,
    Failed { reason: String },
    Panicked { message: String, trace: String },
}

impl UnitOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        UnitOutcome::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, UnitOutcome::Passed)
    }
}

impl Display for UnitOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitOutcome::Passed => write!(f, "PASS"),
            UnitOutcome::Failed { reason } => write!(f, "FAIL: {reason}"),
            UnitOutcome::Panicked { message, .. } => write!(f, "PANIC: {message}"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerError {
    #[error("suite not found: {0}")]
    SuiteNotFound(String),
    #[error("unit not found: {suite}/{unit}")]
    UnitNotFound { suite: String, unit: String },
    #[error("{stage} failed: {reason}")]
    Hook { stage: String, reason: String },
    #[error("{stage} panicked: {message}")]
    Panicked {
        stage: String,
        message: String,
        trace: String,
    },
    #[error("benchmark {0} is not running")]
    BenchmarkNotRunning(String),
    #[error("benchmark {0} is already running")]
    BenchmarkAlreadyRunning(String),
    /// The worker could not be reached, the call was not delivered.
    #[error("worker unavailable: {0}")]
    Unavailable(String),
    #[error("call cancelled")]
    Canceled,
    #[error("invalid request: {0}")]
    Invalid(String),
}

/// A unit that could not be run, or whose hooks failed, fails with the error as its reason.
impl From<WorkerError> for UnitOutcome {
    fn from(e: WorkerError) -> Self {
        match e {
            WorkerError::Panicked { message, trace, .. } => UnitOutcome::Panicked { message, trace },
            e => UnitOutcome::failed(e.to_string()),
        }
    }
}

impl WorkerError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            WorkerError::SuiteNotFound(_) | WorkerError::UnitNotFound { .. }
        )
    }

    /// Errors which may go away if the call is repeated.
    pub fn is_transient(&self) -> bool {
        matches!(self, WorkerError::Unavailable(_))
    }
}

/// One suite as registered on a worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuiteInfo {
    pub name: String,
    /// Test names in declared order.
    pub tests: Vec<String>,
    /// Benchmark names in declared order.
    pub benchmarks: Vec<String>,
    /// Tests which may run concurrently with each other. Every other test runs on its own, in
    /// declared order.
    #[serde(default)]
    pub parallel_tests: Vec<String>,
}

impl SuiteInfo {
    /// The units this suite contributes in the given mode.
    pub fn units(&self, mode: RunMode) -> &[String] {
        match mode {
            RunMode::Test => &self.tests,
            RunMode::Benchmark => &self.benchmarks,
        }
    }
}

/// Every suite a worker can run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogInfo {
    pub suites: Vec<SuiteInfo>,
}

impl CatalogInfo {
    /// Resolve the run set: the suites and units matching the configured name patterns.
    ///
    /// Only units of the configured mode are kept and suites left without units are dropped.
    pub fn select(&self, config: &SuiteConfig) -> Result<CatalogInfo, WorkerError> {
        let suite_patterns = compile(&config.suites)?;
        let unit_patterns = compile(&config.tests)?;

        let suites = self
            .suites
            .iter()
            .filter(|suite| matches_any(&suite_patterns, &suite.name))
            .filter_map(|suite| {
                let units = suite
                    .units(config.mode)
                    .iter()
                    .filter(|unit| matches_any(&unit_patterns, unit))
                    .cloned()
                    .collect::<Vec<_>>();
                if units.is_empty() {
                    return None;
                }

                let parallel_tests = suite
                    .parallel_tests
                    .iter()
                    .filter(|test| units.contains(test))
                    .cloned()
                    .collect();
                let (tests, benchmarks) = match config.mode {
                    RunMode::Test => (units, Vec::new()),
                    RunMode::Benchmark => (Vec::new(), units),
                };
                Some(SuiteInfo {
                    name: suite.name.clone(),
                    tests,
                    benchmarks,
                    parallel_tests,
                })
            })
            .collect();

        Ok(CatalogInfo { suites })
    }

    pub fn is_empty(&self) -> bool {
        self.suites.is_empty()
    }

    pub fn suite(&self, name: &str) -> Option<&SuiteInfo> {
        self.suites.iter().find(|s| s.name == name)
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>, WorkerError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| WorkerError::Invalid(format!("bad name pattern {p:?}: {e}")))
        })
        .collect()
}

fn matches_any(patterns: &[Regex], name: &str) -> bool {
    patterns.is_empty() || patterns.iter().any(|p| p.is_match(name))
}
