use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use gust_core::prelude::{
    BenchProgress, CatalogInfo, Report, RunRequest, SuiteRequest, UnitOutcome, UnitRequest,
    WorkerError,
};
use gust_stats::prelude::{BenchSettings, Benchmark};
use parking_lot::Mutex;

use crate::catalog::{Catalog, Suite, SuiteStage};
use crate::executor::Executor;
use crate::monitor::Monitor;

struct RunningBenchmark {
    benchmark: Benchmark,
    _monitor: Monitor,
}

/// The worker side of the remote interface.
///
/// Every call is synchronous and carries everything it needs in its request. The only state kept
/// between calls is the suite values and the statistics of running benchmarks.
pub struct Worker {
    index: usize,
    catalog: Arc<Catalog>,
    executor: Executor,
    verbose: bool,
    benchmarks: Mutex<HashMap<String, RunningBenchmark>>,
}

impl Worker {
    pub fn new(index: usize, catalog: Arc<Catalog>, executor: Executor) -> Self {
        Self {
            index,
            catalog,
            executor,
            verbose: false,
            benchmarks: Mutex::new(HashMap::new()),
        }
    }

    /// Log the outcome of every test and sub-test at info rather than debug.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn catalog(&self) -> CatalogInfo {
        self.catalog.info()
    }

    pub fn suite_setup(&self, request: &SuiteRequest) -> Result<(), WorkerError> {
        self.suite_hook(SuiteStage::Setup, request)
    }

    pub fn suite_teardown(&self, request: &SuiteRequest) -> Result<(), WorkerError> {
        self.suite_hook(SuiteStage::Teardown, request)
    }

    pub fn worker_setup(&self, request: &SuiteRequest) -> Result<(), WorkerError> {
        self.suite_hook(SuiteStage::WorkerSetup, request)
    }

    pub fn worker_teardown(&self, request: &SuiteRequest) -> Result<(), WorkerError> {
        self.suite_hook(SuiteStage::WorkerTeardown, request)
    }

    pub fn unit_setup(&self, request: &UnitRequest) -> Result<(), WorkerError> {
        log::debug!("Worker {} unit setup for {request}", self.index);
        self.suite(&request.suite)?.unit_setup(request, &self.executor)
    }

    pub fn unit_teardown(&self, request: &UnitRequest) -> Result<(), WorkerError> {
        log::debug!("Worker {} unit teardown for {request}", self.index);
        self.suite(&request.suite)?.unit_teardown(request, &self.executor)
    }

    /// Run a test body to completion, bound to the request's timeout.
    ///
    /// Failures and panics of the body are reported in the outcome, errors are reserved for
    /// requests which could not be run.
    pub fn run_test(&self, request: &RunRequest) -> Result<UnitOutcome, WorkerError> {
        if self.executor.is_shutdown() {
            return Err(WorkerError::Canceled);
        }

        let suite = self.suite(&request.unit.suite)?;
        let deadline = Instant::now() + request.timeout;
        let outcome = suite.run_test(&request.unit, deadline, &self.executor, self.verbose)?;

        if self.verbose {
            log::info!("{}: {outcome}", request.unit);
        } else {
            log::debug!("{}: {outcome}", request.unit);
        }

        Ok(outcome)
    }

    /// Start generating load against a benchmark. Returns once the callers are running.
    pub fn start_benchmark(&self, request: &RunRequest) -> Result<(), WorkerError> {
        let key = request.unit.to_string();
        let mut benchmarks = self.benchmarks.lock();
        if benchmarks.contains_key(&key) {
            return Err(WorkerError::BenchmarkAlreadyRunning(key));
        }

        let target = self
            .suite(&request.unit.suite)?
            .benchmark(&request.unit, &self.executor)?;
        let benchmark = Benchmark::start(&key, BenchSettings::from_request(request), target)
            .map_err(|e| WorkerError::Hook {
                stage: format!("start of benchmark {key}"),
                reason: format!("{e:#}"),
            })?;

        benchmarks.insert(
            key.clone(),
            RunningBenchmark {
                benchmark,
                _monitor: Monitor::start(&key),
            },
        );
        Ok(())
    }

    /// Statistics since the previous report, starting a new window.
    pub fn report_benchmark(&self, request: &UnitRequest) -> Result<BenchProgress, WorkerError> {
        let key = request.to_string();
        let benchmarks = self.benchmarks.lock();
        let running = benchmarks
            .get(&key)
            .ok_or_else(|| WorkerError::BenchmarkNotRunning(key.clone()))?;

        let mut progress = running.benchmark.report();
        // A panicked target stops its benchmark, there is nothing more to wait for.
        progress.finished |= running.benchmark.failure().is_some();
        Ok(progress)
    }

    /// Stop the benchmark and return the final window.
    pub fn stop_benchmark(&self, request: &UnitRequest) -> Result<Report, WorkerError> {
        let key = request.to_string();
        let running = self
            .benchmarks
            .lock()
            .remove(&key)
            .ok_or_else(|| WorkerError::BenchmarkNotRunning(key.clone()))?;

        let failure = running.benchmark.failure();
        let report = running.benchmark.stop();
        if let Some(message) = failure {
            return Err(WorkerError::Panicked {
                stage: format!("benchmark {key}"),
                message,
                trace: String::new(),
            });
        }

        log::debug!("Worker {} stopped {key}: {report}", self.index);
        Ok(report)
    }

    fn suite(&self, name: &str) -> Result<&dyn Suite, WorkerError> {
        self.catalog.suite(name)
    }

    fn suite_hook(&self, stage: SuiteStage, request: &SuiteRequest) -> Result<(), WorkerError> {
        log::debug!("Worker {} running {stage} for {}", self.index, request.suite);
        self.suite(&request.suite)?
            .run_suite_hook(stage, &request.args, &self.executor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{SuiteContext, TestContext};
    use crate::definition::SuiteDefinitionBuilder;
    use gust_core::prelude::{Args, BenchParams, ShutdownHandle};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct Store {
        entries: HashMap<String, String>,
    }

    #[derive(Debug, Default)]
    struct Key(String);

    impl crate::context::UserValuesConstraint for Store {}
    impl crate::context::UserValuesConstraint for Key {}

    fn put_setup(ctx: &mut TestContext<Store, Key>) -> anyhow::Result<()> {
        ctx.get_mut().0 = ctx.args().get("key").cloned().unwrap_or_default();
        Ok(())
    }

    fn put(ctx: &mut TestContext<Store, Key>) -> anyhow::Result<()> {
        anyhow::ensure!(!ctx.get().0.is_empty(), "setup did not choose a key");
        Ok(())
    }

    fn setup(ctx: &mut SuiteContext<Store>) -> anyhow::Result<()> {
        ctx.get_mut()
            .entries
            .insert("greeting".to_string(), "hello".to_string());
        Ok(())
    }

    fn get(ctx: &mut TestContext<Store, Key>) -> anyhow::Result<()> {
        anyhow::ensure!(ctx.suite_values().entries.contains_key("greeting"));
        Ok(())
    }

    fn panics(_: &mut TestContext<Store, Key>) -> anyhow::Result<()> {
        panic!("exploded")
    }

    fn with_sub_tests(ctx: &mut TestContext<Store, Key>) -> anyhow::Result<()> {
        ctx.run("first", |_| Ok(()));
        ctx.run("second", |_| anyhow::bail!("wrong value"));
        Ok(())
    }

    fn worker(runtime: &tokio::runtime::Runtime) -> Worker {
        let catalog = Catalog::new().register(
            SuiteDefinitionBuilder::<Store, Key>::new("MapSuite")
                .use_setup(setup)
                .use_test_with_hooks("TestPut", put_setup, put, |_| Ok(()))
                .use_test("TestGet", get)
                .use_test("TestPanic", panics)
                .use_test("TestSubTests", with_sub_tests)
                .use_benchmark("BenchmarkGet", |ctx| {
                    anyhow::ensure!(ctx.suite_values().entries.contains_key("greeting"));
                    Ok(())
                }),
        );
        Worker::new(
            0,
            Arc::new(catalog),
            Executor::new(runtime.handle().clone(), ShutdownHandle::new()),
        )
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap()
    }

    fn run_request(unit: &str, args: Args) -> RunRequest {
        RunRequest {
            unit: UnitRequest::new("MapSuite", unit, args),
            parallelism: 2,
            timeout: Duration::from_secs(10),
            bench: BenchParams {
                iterations: 1_000,
                batch_size: 16,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_values_carry_from_setup_to_body() {
        let runtime = runtime();
        let worker = worker(&runtime);
        let request = run_request("TestPut", Args::from([("key".to_string(), "k1".to_string())]));

        worker.unit_setup(&request.unit).unwrap();
        assert_eq!(UnitOutcome::Passed, worker.run_test(&request).unwrap());
        worker.unit_teardown(&request.unit).unwrap();

        // Without setup the body sees a fresh value.
        assert_eq!(
            UnitOutcome::failed("setup did not choose a key"),
            worker.run_test(&request).unwrap()
        );
    }

    #[test]
    fn suite_values_are_shared_with_tests() {
        let runtime = runtime();
        let worker = worker(&runtime);
        let request = run_request("TestGet", Args::new());

        assert!(!worker.run_test(&request).unwrap().is_passed());
        worker
            .suite_setup(&request.unit.suite_request())
            .unwrap();
        assert_eq!(UnitOutcome::Passed, worker.run_test(&request).unwrap());
    }

    #[test]
    fn panic_is_reported_as_outcome() {
        let runtime = runtime();
        let worker = worker(&runtime);

        let outcome = worker.run_test(&run_request("TestPanic", Args::new())).unwrap();
        assert!(matches!(outcome, UnitOutcome::Panicked { message, .. } if message.starts_with("exploded")));
    }

    #[test]
    fn failed_sub_test_fails_the_test() {
        let runtime = runtime();
        let worker = worker(&runtime);

        let outcome = worker
            .run_test(&run_request("TestSubTests", Args::new()))
            .unwrap();
        assert_eq!(UnitOutcome::failed("sub-tests failed: second"), outcome);
    }

    #[test]
    fn unknown_names_are_not_found() {
        let runtime = runtime();
        let worker = worker(&runtime);

        let err = worker
            .unit_setup(&UnitRequest::new("MapSuite", "TestScan", Args::new()))
            .unwrap_err();
        assert!(err.is_not_found());

        let err = worker
            .suite_setup(&SuiteRequest {
                suite: "ListSuite".to_string(),
                args: Args::new(),
            })
            .unwrap_err();
        assert_eq!(WorkerError::SuiteNotFound("ListSuite".to_string()), err);
    }

    #[test]
    fn benchmark_lifecycle() {
        let runtime = runtime();
        let worker = worker(&runtime);
        let request = run_request("BenchmarkGet", Args::new());
        worker
            .suite_setup(&request.unit.suite_request())
            .unwrap();

        assert_eq!(
            WorkerError::BenchmarkNotRunning("MapSuite/BenchmarkGet".to_string()),
            worker.report_benchmark(&request.unit).unwrap_err()
        );

        worker.start_benchmark(&request).unwrap();
        assert_eq!(
            WorkerError::BenchmarkAlreadyRunning("MapSuite/BenchmarkGet".to_string()),
            worker.start_benchmark(&request).unwrap_err()
        );

        let mut iterations = 0;
        loop {
            let progress = worker.report_benchmark(&request.unit).unwrap();
            iterations += progress.report.iterations;
            if progress.finished {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        iterations += worker.stop_benchmark(&request.unit).unwrap().iterations;

        assert!(iterations >= 1_000, "only {iterations} iterations measured");
        assert!(worker.report_benchmark(&request.unit).is_err());
    }
}
