//! Workers hosted in this process, for dry runs and tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use gust_cluster::prelude::Job;
use gust_core::prelude::{
    BenchProgress, CatalogInfo, Report, RunRequest, ShutdownHandle, SuiteRequest, UnitOutcome,
    UnitRequest, WorkerError,
};
use gust_runner::prelude::{Catalog, Executor, Worker};
use parking_lot::Mutex;

use crate::client::{DialError, WorkerClient, WorkerConnector};

/// Calls a [Worker] directly. Worker calls block, so each one runs on the blocking pool.
pub struct LocalWorkerClient {
    worker: Arc<Worker>,
}

impl LocalWorkerClient {
    pub fn new(worker: Arc<Worker>) -> Self {
        Self { worker }
    }

    async fn call<T, F>(&self, f: F) -> Result<T, WorkerError>
    where
        T: Send + 'static,
        F: FnOnce(&Worker) -> Result<T, WorkerError> + Send + 'static,
    {
        let worker = self.worker.clone();
        tokio::task::spawn_blocking(move || f(&worker))
            .await
            .map_err(|e| WorkerError::Unavailable(format!("worker call did not complete: {e}")))?
    }
}

#[async_trait]
impl WorkerClient for LocalWorkerClient {
    async fn catalog(&self) -> Result<CatalogInfo, WorkerError> {
        self.call(|w| Ok(w.catalog())).await
    }

    async fn suite_setup(&self, request: SuiteRequest) -> Result<(), WorkerError> {
        self.call(move |w| w.suite_setup(&request)).await
    }

    async fn suite_teardown(&self, request: SuiteRequest) -> Result<(), WorkerError> {
        self.call(move |w| w.suite_teardown(&request)).await
    }

    async fn worker_setup(&self, request: SuiteRequest) -> Result<(), WorkerError> {
        self.call(move |w| w.worker_setup(&request)).await
    }

    async fn worker_teardown(&self, request: SuiteRequest) -> Result<(), WorkerError> {
        self.call(move |w| w.worker_teardown(&request)).await
    }

    async fn unit_setup(&self, request: UnitRequest) -> Result<(), WorkerError> {
        self.call(move |w| w.unit_setup(&request)).await
    }

    async fn unit_teardown(&self, request: UnitRequest) -> Result<(), WorkerError> {
        self.call(move |w| w.unit_teardown(&request)).await
    }

    async fn run_test(&self, request: RunRequest) -> Result<UnitOutcome, WorkerError> {
        self.call(move |w| w.run_test(&request)).await
    }

    async fn start_benchmark(&self, request: RunRequest) -> Result<(), WorkerError> {
        self.call(move |w| w.start_benchmark(&request)).await
    }

    async fn report_benchmark(&self, request: UnitRequest) -> Result<BenchProgress, WorkerError> {
        self.call(move |w| w.report_benchmark(&request)).await
    }

    async fn stop_benchmark(&self, request: UnitRequest) -> Result<Report, WorkerError> {
        self.call(move |w| w.stop_benchmark(&request)).await
    }
}

pub type CatalogFactory = Arc<dyn Fn() -> Catalog + Send + Sync>;

/// Starts an in-process worker for every job dialed.
///
/// Each worker gets its own catalog, so suite values are not shared between workers, as if they
/// ran in separate processes.
pub struct LocalConnector {
    catalog: CatalogFactory,
    shutdown: ShutdownHandle,
    verbose: bool,
    refusals: Mutex<HashMap<usize, u32>>,
}

impl LocalConnector {
    pub fn new(catalog: impl Fn() -> Catalog + Send + Sync + 'static, shutdown: ShutdownHandle) -> Self {
        Self {
            catalog: Arc::new(catalog),
            shutdown,
            verbose: false,
            refusals: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Refuse the next `count` dials of worker `index`, as a worker which is not listening yet.
    pub fn refuse_dials(&self, index: usize, count: u32) {
        *self.refusals.lock().entry(index).or_default() += count;
    }
}

#[async_trait]
impl WorkerConnector for LocalConnector {
    async fn connect(&self, index: usize, job: &Job) -> Result<Arc<dyn WorkerClient>, DialError> {
        {
            let mut refusals = self.refusals.lock();
            if let Some(remaining) = refusals.get_mut(&index).filter(|r| **r > 0) {
                *remaining -= 1;
                return Err(DialError::Refused { index });
            }
        }

        if job.ip().is_none() {
            return Err(DialError::NoAddress { index });
        }

        let executor = Executor::new(tokio::runtime::Handle::current(), self.shutdown.clone());
        let worker = Worker::new(index, Arc::new((self.catalog)()), executor).with_verbose(self.verbose);
        let client: Arc<dyn WorkerClient> = Arc::new(LocalWorkerClient::new(Arc::new(worker)));
        Ok(client)
    }
}
