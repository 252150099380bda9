use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use gust_cluster::bootstrap::{load_config, wait_for_sentinel, watch_shutdown_sentinel};
use gust_cluster::prelude::ClusterSettings;
use gust_core::prelude::{
    BenchParams, DelegatedShutdownListener, GustResult, ProcessRole, RunMode, RunRequest,
    ShutdownHandle, ShutdownSignalError, SuiteConfig, SuiteInfo, SuiteRequest, UnitOutcome,
    UnitRequest, WorkerError, EXIT_CODE_CANCELED, EXIT_CODE_FAILURE, EXIT_CODE_SUCCESS,
};
use parking_lot::Mutex;

use crate::catalog::Catalog;
use crate::cli::GustProcessCli;
use crate::executor::Executor;
use crate::plan::plan_tests;
use crate::reporting::{BenchReport, ReportCadence, Tick, UnitResult};
use crate::shutdown::start_shutdown_listener;
use crate::worker::Worker;

/// Carries the remote interface of a worker process to the coordinator.
pub trait WorkerTransport {
    /// Serve calls against `worker` until `shutdown` fires.
    fn serve(&self, worker: Arc<Worker>, shutdown: DelegatedShutdownListener) -> GustResult<()>;
}

/// The results of running a suite configuration in a single process.
#[derive(Debug, Default)]
pub struct LocalRun {
    pub results: Vec<UnitResult>,
    pub reports: Vec<BenchReport>,
    /// The first stage failure, units which failed are only recorded in the results.
    pub error: Option<WorkerError>,
}

impl LocalRun {
    pub fn passed(&self) -> bool {
        self.error.is_none() && self.results.iter().all(|r| r.outcome.is_passed())
    }

    pub fn exit_code(&self) -> i32 {
        if self.error == Some(WorkerError::Canceled) {
            EXIT_CODE_CANCELED
        } else if self.passed() {
            EXIT_CODE_SUCCESS
        } else {
            EXIT_CODE_FAILURE
        }
    }

    fn fail(&mut self, error: WorkerError) {
        log::error!("{error}");
        self.error.get_or_insert(error);
    }
}

/// Run the suites selected by `config` in this process, without a cluster.
///
/// The run is cancelled by Ctrl-C or once the configured timeout passes.
pub fn run_local(catalog: Catalog, config: &SuiteConfig) -> GustResult<LocalRun> {
    config.validate()?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start the runtime")?;
    let shutdown = start_shutdown_listener(runtime.handle());
    let scope = {
        let _guard = runtime.enter();
        let mut scope = shutdown.scope();
        scope.shutdown_after(config.timeout());
        scope
    };

    Ok(drive_local(
        Arc::new(catalog),
        config,
        runtime.handle(),
        scope.handle().clone(),
    ))
}

/// Entry point of a suite binary running as a worker inside a job.
///
/// Waits for the job to be ready, loads the configuration and then serves the worker's remote
/// interface over `transport` until the run shuts down. Returns the exit code for the process. The
/// coordinator role is run by the coordinator crate, it is rejected here.
pub fn run(
    catalog: Catalog,
    cli: &GustProcessCli,
    transport: &dyn WorkerTransport,
) -> GustResult<i32> {
    let index = match cli.process_role() {
        ProcessRole::Worker { index } => index,
        ProcessRole::Coordinator => {
            anyhow::bail!("The coordinator role is run by the coordinator, not a suite binary")
        }
    };

    let runtime = tokio::runtime::Runtime::new().context("Failed to start the runtime")?;
    let shutdown = start_shutdown_listener(runtime.handle());
    let poll = ClusterSettings::default().poll_interval;

    let ready = runtime.block_on(wait_for_sentinel(
        &cli.ready_sentinel,
        poll,
        shutdown.new_listener(),
    ));
    match ready {
        Err(e) if e.is::<ShutdownSignalError>() => return Ok(EXIT_CODE_CANCELED),
        ready => ready?,
    }

    let (spec, config) = load_config(&cli.config_dir)?;
    log::info!("Starting run {} as worker {index}", spec.run_id);

    let scope = {
        let _guard = runtime.enter();
        watch_shutdown_sentinel(cli.shutdown_sentinel.clone(), poll, shutdown.clone());
        let mut scope = shutdown.scope();
        scope.shutdown_after(config.timeout());
        scope
    };
    let shutdown = scope.handle();

    let executor = Executor::new(runtime.handle().clone(), shutdown.clone());
    let worker = Arc::new(
        Worker::new(index, Arc::new(catalog), executor).with_verbose(config.verbose),
    );

    transport.serve(worker, shutdown.new_listener())?;
    Ok(EXIT_CODE_SUCCESS)
}

pub(crate) fn drive_local(
    catalog: Arc<Catalog>,
    config: &SuiteConfig,
    runtime: &tokio::runtime::Handle,
    shutdown: ShutdownHandle,
) -> LocalRun {
    let executor = Executor::new(runtime.clone(), shutdown.clone());
    let worker = Worker::new(0, catalog, executor).with_verbose(config.verbose);
    let deadline = Instant::now() + config.timeout();
    let mut run = LocalRun::default();

    let selected = match worker.catalog().select(config) {
        Ok(selected) if selected.is_empty() => {
            run.fail(WorkerError::Invalid(
                "no suite or unit matches the configured patterns".to_string(),
            ));
            return run;
        }
        Ok(selected) => selected,
        Err(e) => {
            run.fail(e);
            return run;
        }
    };

    for suite in &selected.suites {
        if shutdown.is_shutdown() {
            break;
        }
        run_suite(&worker, suite, config, deadline, &shutdown, &mut run);
    }

    if shutdown.is_shutdown() {
        run.fail(WorkerError::Canceled);
    }
    run
}

fn run_suite(
    worker: &Worker,
    suite: &SuiteInfo,
    config: &SuiteConfig,
    deadline: Instant,
    shutdown: &ShutdownHandle,
    run: &mut LocalRun,
) {
    let request = SuiteRequest {
        suite: suite.name.clone(),
        args: config.args.clone(),
    };

    let setup = worker
        .suite_setup(&request)
        .and_then(|()| worker.worker_setup(&request));
    match setup {
        Ok(()) => match config.mode {
            RunMode::Test => run_tests(worker, suite, config, deadline, shutdown, run),
            RunMode::Benchmark => run_benchmarks(worker, suite, config, deadline, shutdown, run),
        },
        Err(e) => run.fail(e),
    }

    if let Err(e) = worker.worker_teardown(&request) {
        log::warn!("{e}");
    }
    if config.skip_teardown {
        log::info!("Skipping teardown of {}", suite.name);
    } else if let Err(e) = worker.suite_teardown(&request) {
        log::warn!("{e}");
    }
}

fn run_tests(
    worker: &Worker,
    suite: &SuiteInfo,
    config: &SuiteConfig,
    deadline: Instant,
    shutdown: &ShutdownHandle,
    run: &mut LocalRun,
) {
    let plan = plan_tests(suite);
    for test in &plan.sequential {
        if shutdown.is_shutdown() {
            return;
        }
        let request = UnitRequest::new(&suite.name, test, config.args.clone());
        run.results.push(UnitResult {
            suite: suite.name.clone(),
            unit: test.clone(),
            outcome: run_one_test(worker, &request, deadline),
        });
    }

    let next = AtomicUsize::new(0);
    let results = Mutex::new(Vec::with_capacity(plan.parallel.len()));
    std::thread::scope(|scope| {
        for _ in 0..config.parallelism.min(plan.parallel.len()) {
            scope.spawn(|| loop {
                let i = next.fetch_add(1, Ordering::Relaxed);
                let Some(test) = plan.parallel.get(i) else {
                    break;
                };
                if shutdown.is_shutdown() {
                    break;
                }

                let request = UnitRequest::new(&suite.name, test, config.args.clone());
                let outcome = run_one_test(worker, &request, deadline);
                results.lock().push((
                    i,
                    UnitResult {
                        suite: suite.name.clone(),
                        unit: test.clone(),
                        outcome,
                    },
                ));
            });
        }
    });

    let mut results = results.into_inner();
    results.sort_by_key(|(i, _)| *i);
    run.results.extend(results.into_iter().map(|(_, r)| r));
}

/// Setup, body and teardown of one test. Teardown runs whatever happened before it.
fn run_one_test(worker: &Worker, request: &UnitRequest, deadline: Instant) -> UnitOutcome {
    let outcome = match worker.unit_setup(request) {
        Ok(()) => worker
            .run_test(&RunRequest {
                unit: request.clone(),
                parallelism: 1,
                timeout: deadline.saturating_duration_since(Instant::now()),
                bench: BenchParams::default(),
            })
            .unwrap_or_else(UnitOutcome::from),
        Err(e) => UnitOutcome::from(e),
    };

    if let Err(e) = worker.unit_teardown(request) {
        log::warn!("{e}");
    }
    outcome
}

fn run_benchmarks(
    worker: &Worker,
    suite: &SuiteInfo,
    config: &SuiteConfig,
    deadline: Instant,
    shutdown: &ShutdownHandle,
    run: &mut LocalRun,
) {
    for benchmark in &suite.benchmarks {
        if shutdown.is_shutdown() {
            return;
        }

        let request = UnitRequest::new(&suite.name, benchmark, config.args.clone());
        let outcome = match worker.unit_setup(&request) {
            Ok(()) => drive_benchmark(worker, &request, config, deadline, shutdown, run),
            Err(e) => UnitOutcome::from(e),
        };
        if let Err(e) = worker.unit_teardown(&request) {
            log::warn!("{e}");
        }

        run.results.push(UnitResult {
            suite: suite.name.clone(),
            unit: benchmark.clone(),
            outcome,
        });
    }
}

fn drive_benchmark(
    worker: &Worker,
    request: &UnitRequest,
    config: &SuiteConfig,
    deadline: Instant,
    shutdown: &ShutdownHandle,
    run: &mut LocalRun,
) -> UnitOutcome {
    let start = RunRequest {
        unit: request.clone(),
        parallelism: config.parallelism,
        timeout: deadline.saturating_duration_since(Instant::now()),
        bench: BenchParams::from_config(config),
    };
    if let Err(e) = worker.start_benchmark(&start) {
        return e.into();
    }

    let mut cadence = ReportCadence::start(config, Instant::now());
    loop {
        let when = match cadence.next_tick() {
            Tick::Stop(when) => {
                sleep_until(when, shutdown);
                break;
            }
            Tick::Report(when) => when,
        };
        if !sleep_until(when, shutdown) {
            break;
        }

        match worker.report_benchmark(request) {
            Ok(progress) => {
                cadence.record(&mut run.reports, request, progress.report);
                if progress.finished {
                    break;
                }
            }
            Err(e) => {
                if let Err(e) = worker.stop_benchmark(request) {
                    log::warn!("{e}");
                }
                return e.into();
            }
        }
    }

    match worker.stop_benchmark(request) {
        Ok(report) => {
            cadence.finish(&mut run.reports, request, report);
            UnitOutcome::Passed
        }
        Err(e) => e.into(),
    }
}

/// Returns false if the run was shut down first.
fn sleep_until(when: Instant, shutdown: &ShutdownHandle) -> bool {
    loop {
        if shutdown.is_shutdown() {
            return false;
        }
        let now = Instant::now();
        if now >= when {
            return true;
        }
        std::thread::sleep((when - now).min(Duration::from_millis(10)));
    }
}
