use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::StreamExt;
use gust_cluster::prelude::{ClusterApi, ClusterSettings};
use gust_core::prelude::{
    Backoff, BenchParams, GustResult, Report, RunMode, RunRequest, RunSpec, ShutdownHandle,
    SuiteConfig, SuiteInfo, SuiteRequest, UnitOutcome, UnitRequest, WorkerError,
    EXIT_CODE_CANCELED, EXIT_CODE_FAILURE, EXIT_CODE_SUCCESS,
};
use gust_runner::prelude::{plan_tests, BenchReport, ReportCadence, Tick, UnitResult};

use crate::client::{WorkerClient, WorkerConnector};
use crate::pool::WorkerPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Passed,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub workers: usize,
    pub status: RunStatus,
}

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub results: Vec<UnitResult>,
    /// Benchmark reports reduced across workers, in the order they were taken.
    pub reports: Vec<BenchReport>,
    /// The first failure of a protocol stage. Failing units are only recorded in the results.
    pub error: Option<String>,
    pub summary: RunSummary,
}

impl RunOutcome {
    pub fn passed(&self) -> bool {
        self.summary.status == RunStatus::Passed
    }

    pub fn exit_code(&self) -> i32 {
        match self.summary.status {
            RunStatus::Passed => EXIT_CODE_SUCCESS,
            RunStatus::Failed => EXIT_CODE_FAILURE,
            RunStatus::Canceled => EXIT_CODE_CANCELED,
        }
    }
}

#[derive(Default)]
struct RunState {
    results: Vec<UnitResult>,
    reports: Vec<BenchReport>,
    error: Option<String>,
    canceled: bool,
}

impl RunState {
    fn fail(&mut self, error: WorkerError) {
        if error == WorkerError::Canceled {
            self.canceled = true;
        }
        self.fail_with(error.to_string());
    }

    fn fail_with(&mut self, error: String) {
        log::error!("{error}");
        self.error.get_or_insert(error);
    }
}

/// Drives a run across its workers: start the worker jobs, then the suite and unit calls in
/// protocol order, then teardown.
#[derive(Clone)]
pub struct Coordinator {
    api: Arc<dyn ClusterApi>,
    settings: Arc<ClusterSettings>,
    spec: RunSpec,
    config: SuiteConfig,
    connector: Arc<dyn WorkerConnector>,
    backoff: Backoff,
    shutdown: ShutdownHandle,
}

impl Coordinator {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        settings: Arc<ClusterSettings>,
        spec: RunSpec,
        config: SuiteConfig,
        connector: Arc<dyn WorkerConnector>,
    ) -> Self {
        Self {
            api,
            settings,
            spec,
            config,
            connector,
            backoff: Backoff::default(),
            shutdown: ShutdownHandle::new(),
        }
    }

    /// The retry policy for dialing workers and for calls which did not reach a worker.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Cancel the run through `shutdown`, as well as on its own timeout.
    pub fn with_shutdown(mut self, shutdown: ShutdownHandle) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Run the configured suites.
    ///
    /// Returns an error if the workers could not be started, in which case no unit has run.
    /// Failures after that are reported in the outcome.
    pub async fn run(&self) -> GustResult<RunOutcome> {
        self.config.validate()?;

        // The deadline belongs to this run, the caller's handle outlives it.
        let mut scope = self.shutdown.scope();
        scope.shutdown_after(self.config.timeout());
        let run = Coordinator {
            shutdown: scope.handle().clone(),
            ..self.clone()
        };
        run.run_scoped().await
    }

    async fn run_scoped(&self) -> GustResult<RunOutcome> {
        let started_at = Utc::now();
        let deadline = Instant::now() + self.config.timeout();

        let pool = WorkerPool::start(
            self.api.clone(),
            self.settings.clone(),
            &self.spec,
            &self.config,
            self.connector.as_ref(),
            &self.backoff,
            &self.shutdown,
        )
        .await?;
        let workers = pool.len();

        let mut state = RunState::default();
        self.drive(&pool.clients(), deadline, &mut state).await;
        if self.shutdown.is_shutdown() {
            state.fail(WorkerError::Canceled);
        }

        if let Err(e) = pool.shutdown().await {
            state.fail_with(format!("{e:#}"));
        }

        let status = if state.canceled {
            RunStatus::Canceled
        } else if state.error.is_none() && state.results.iter().all(|r| r.outcome.is_passed()) {
            RunStatus::Passed
        } else {
            RunStatus::Failed
        };
        log::info!("Run {} finished: {status:?}", self.spec.run_id);

        Ok(RunOutcome {
            results: state.results,
            reports: state.reports,
            error: state.error,
            summary: RunSummary {
                run_id: self.spec.run_id.clone(),
                started_at,
                finished_at: Utc::now(),
                workers,
                status,
            },
        })
    }

    async fn drive(&self, clients: &[Arc<dyn WorkerClient>], deadline: Instant, state: &mut RunState) {
        let Some(first) = clients.first() else {
            state.fail(WorkerError::Unavailable("no workers".to_string()));
            return;
        };

        let catalog = match self.forward("Catalog", move || first.catalog()).await {
            Ok(catalog) => catalog,
            Err(e) => {
                state.fail(e);
                return;
            }
        };

        let selected = match catalog.select(&self.config) {
            Ok(selected) if selected.is_empty() => {
                state.fail(WorkerError::Invalid(
                    "no suite or unit matches the configured patterns".to_string(),
                ));
                return;
            }
            Ok(selected) => selected,
            Err(e) => {
                state.fail(e);
                return;
            }
        };

        for suite in &selected.suites {
            if self.shutdown.is_shutdown() {
                break;
            }
            self.run_suite(clients, suite, deadline, state).await;
        }
    }

    async fn run_suite(
        &self,
        clients: &[Arc<dyn WorkerClient>],
        suite: &SuiteInfo,
        deadline: Instant,
        state: &mut RunState,
    ) {
        let request = &SuiteRequest {
            suite: suite.name.clone(),
            args: self.config.args.clone(),
        };

        let (owner, set_up) = match self.suite_setup(clients, request).await {
            Ok(owner) => (owner, true),
            Err(e) if e.is_not_found() => {
                state.fail(e);
                return;
            }
            Err(e) => {
                state.fail(e);
                (0, false)
            }
        };

        if set_up {
            let worker_setups = join_all(clients.iter().enumerate().map(|(i, client)| async move {
                self.forward(&format!("Worker setup of {} on worker {i}", request.suite), move || {
                    client.worker_setup(request.clone())
                })
                .await
            }))
            .await;

            match worker_setups.into_iter().find_map(Result::err) {
                Some(e) => state.fail(e),
                None => match self.config.mode {
                    RunMode::Test => self.run_tests(clients, suite, deadline, state).await,
                    RunMode::Benchmark => {
                        for benchmark in &suite.benchmarks {
                            if self.shutdown.is_shutdown() {
                                break;
                            }
                            let outcome = self
                                .run_benchmark(clients, suite, benchmark, deadline, state)
                                .await;
                            self.record(state, &suite.name, benchmark, outcome);
                        }
                    }
                },
            }
        }

        join_all(clients.iter().enumerate().map(|(i, client)| async move {
            self.teardown(&format!("Worker teardown of {} on worker {i}", request.suite), move || {
                client.worker_teardown(request.clone())
            })
            .await
        }))
        .await;

        if self.config.skip_teardown {
            log::info!("Skipping teardown of {}", suite.name);
        } else {
            let client = &clients[owner];
            self.teardown(&format!("Suite teardown of {}", suite.name), move || {
                client.suite_teardown(request.clone())
            })
            .await;
        }
    }

    /// Suite setup runs on the first worker which takes the call. Returns the index of that worker.
    async fn suite_setup(
        &self,
        clients: &[Arc<dyn WorkerClient>],
        request: &SuiteRequest,
    ) -> Result<usize, WorkerError> {
        let mut last_error = WorkerError::Unavailable("no workers".to_string());
        for (i, client) in clients.iter().enumerate() {
            let result = self
                .forward(&format!("Suite setup of {} on worker {i}", request.suite), move || {
                    client.suite_setup(request.clone())
                })
                .await;
            match result {
                Ok(()) => return Ok(i),
                Err(e) if e.is_transient() => {
                    log::warn!("Worker {i} is unavailable for suite setup: {e}");
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    /// Tests are spread over the workers by declared position. Sequential tests run first, then
    /// the parallel group.
    async fn run_tests(
        &self,
        clients: &[Arc<dyn WorkerClient>],
        suite: &SuiteInfo,
        deadline: Instant,
        state: &mut RunState,
    ) {
        let owner_of = |test: &str| {
            let position = suite.tests.iter().position(|t| t == test).unwrap_or(0);
            &clients[position % clients.len()]
        };
        let plan = plan_tests(suite);

        for test in &plan.sequential {
            if self.shutdown.is_shutdown() {
                return;
            }
            let request = UnitRequest::new(&suite.name, test, self.config.args.clone());
            let outcome = self.run_test(owner_of(test), &request, deadline).await;
            self.record(state, &suite.name, test, outcome);
        }

        let outcomes = futures::stream::iter(plan.parallel.iter().map(|test| {
            let client = owner_of(test);
            async move {
                let request = UnitRequest::new(&suite.name, test, self.config.args.clone());
                (test, self.run_test(client, &request, deadline).await)
            }
        }))
        .buffered(self.config.parallelism)
        .collect::<Vec<_>>()
        .await;

        for (test, outcome) in outcomes {
            self.record(state, &suite.name, test, outcome);
        }
    }

    async fn run_test(
        &self,
        client: &Arc<dyn WorkerClient>,
        request: &UnitRequest,
        deadline: Instant,
    ) -> UnitOutcome {
        if self.shutdown.is_shutdown() {
            return WorkerError::Canceled.into();
        }

        let setup = self
            .forward(&format!("Unit setup of {request}"), move || {
                client.unit_setup(request.clone())
            })
            .await;
        let outcome = match setup {
            Ok(()) => {
                let run = &RunRequest {
                    unit: request.clone(),
                    parallelism: 1,
                    timeout: deadline.saturating_duration_since(Instant::now()),
                    bench: BenchParams::default(),
                };
                self.forward(&format!("Run of {request}"), move || client.run_test(run.clone()))
                    .await
                    .unwrap_or_else(UnitOutcome::from)
            }
            Err(e) => e.into(),
        };

        self.teardown(&format!("Unit teardown of {request}"), move || {
            client.unit_teardown(request.clone())
        })
        .await;
        outcome
    }

    /// Every worker runs the benchmark at the same time. Reports are reduced across workers.
    async fn run_benchmark(
        &self,
        clients: &[Arc<dyn WorkerClient>],
        suite: &SuiteInfo,
        benchmark: &str,
        deadline: Instant,
        state: &mut RunState,
    ) -> UnitOutcome {
        let request = &UnitRequest::new(&suite.name, benchmark, self.config.args.clone());

        let setups = join_all(clients.iter().enumerate().map(|(i, client)| async move {
            self.forward(&format!("Unit setup of {request} on worker {i}"), move || {
                client.unit_setup(request.clone())
            })
            .await
        }))
        .await;

        let outcome = match setups.into_iter().find_map(Result::err) {
            Some(e) => e.into(),
            None => self.drive_benchmark(clients, request, deadline, state).await,
        };

        join_all(clients.iter().enumerate().map(|(i, client)| async move {
            self.teardown(&format!("Unit teardown of {request} on worker {i}"), move || {
                client.unit_teardown(request.clone())
            })
            .await
        }))
        .await;

        outcome
    }

    async fn drive_benchmark(
        &self,
        clients: &[Arc<dyn WorkerClient>],
        request: &UnitRequest,
        deadline: Instant,
        state: &mut RunState,
    ) -> UnitOutcome {
        let start = &RunRequest {
            unit: request.clone(),
            parallelism: self.config.parallelism,
            timeout: deadline.saturating_duration_since(Instant::now()),
            bench: BenchParams::from_config(&self.config),
        };

        let started = join_all(clients.iter().enumerate().map(|(i, client)| async move {
            self.forward(&format!("Start of {request} on worker {i}"), move || {
                client.start_benchmark(start.clone())
            })
            .await
        }))
        .await;

        if let Some(e) = started.iter().find_map(|r| r.clone().err()) {
            let running = clients
                .iter()
                .zip(&started)
                .filter(|(_, started)| started.is_ok())
                .map(|(client, _)| client);
            join_all(running.map(|client| async move {
                if let Err(e) = self
                    .finish(&format!("Stop of {request}"), move || {
                        client.stop_benchmark(request.clone())
                    })
                    .await
                {
                    log::warn!("Failed to stop {request}: {e}");
                }
            }))
            .await;
            return e.into();
        }

        let mut cadence = ReportCadence::start(&self.config, Instant::now());
        let mut shutdown = self.shutdown.new_listener();

        let mut failure = None;
        loop {
            let when = match cadence.next_tick() {
                Tick::Stop(when) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(when.into()) => {}
                        _ = shutdown.wait_for_shutdown() => {}
                    }
                    break;
                }
                Tick::Report(when) => when,
            };

            tokio::select! {
                _ = tokio::time::sleep_until(when.into()) => {}
                _ = shutdown.wait_for_shutdown() => break,
            }

            let progress = join_all(clients.iter().enumerate().map(|(i, client)| async move {
                self.forward(&format!("Report of {request} on worker {i}"), move || {
                    client.report_benchmark(request.clone())
                })
                .await
            }))
            .await
            .into_iter()
            .collect::<Result<Vec<_>, WorkerError>>();

            match progress {
                Ok(progress) => {
                    let reports = progress.iter().map(|p| p.report).collect::<Vec<_>>();
                    cadence.record(&mut state.reports, request, Report::reduce(&reports));
                    if progress.iter().all(|p| p.finished) {
                        break;
                    }
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let stopped = join_all(clients.iter().enumerate().map(|(i, client)| async move {
            self.finish(&format!("Stop of {request} on worker {i}"), move || {
                client.stop_benchmark(request.clone())
            })
            .await
        }))
        .await
        .into_iter()
        .collect::<Result<Vec<_>, WorkerError>>();

        match (failure, stopped) {
            (Some(e), _) | (None, Err(e)) => e.into(),
            (None, Ok(reports)) => {
                cadence.finish(&mut state.reports, request, Report::reduce(&reports));
                UnitOutcome::Passed
            }
        }
    }

    fn record(&self, state: &mut RunState, suite: &str, unit: &str, outcome: UnitOutcome) {
        if self.config.verbose {
            log::info!("{suite}/{unit}: {outcome}");
        } else {
            log::debug!("{suite}/{unit}: {outcome}");
        }
        state.results.push(UnitResult {
            suite: suite.to_string(),
            unit: unit.to_string(),
            outcome,
        });
    }

    /// A call of a forward stage. Retried while the worker is unavailable, cancelled with the run.
    async fn forward<T, F, Fut>(&self, what: &str, op: F) -> Result<T, WorkerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, WorkerError>>,
    {
        let mut shutdown = self.shutdown.new_listener();
        tokio::select! {
            result = self.backoff.retry(what, op, WorkerError::is_transient) => result,
            _ = shutdown.wait_for_shutdown() => Err(WorkerError::Canceled),
        }
    }

    /// A call which must happen even if the run was cancelled, bounded by the teardown timeout.
    async fn finish<T, F, Fut>(&self, what: &str, op: F) -> Result<T, WorkerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, WorkerError>>,
    {
        let timeout: Duration = self.settings.teardown_timeout;
        tokio::time::timeout(timeout, self.backoff.retry(what, op, WorkerError::is_transient))
            .await
            .unwrap_or_else(|_| {
                Err(WorkerError::Unavailable(format!("{what} timed out after {timeout:?}")))
            })
    }

    /// Teardown is best effort: failures are logged and the run carries on.
    async fn teardown<F, Fut>(&self, what: &str, op: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), WorkerError>>,
    {
        if let Err(e) = self.finish(what, op).await {
            log::warn!("{what} failed: {e}");
        }
    }
}
