use std::sync::Arc;

use async_trait::async_trait;
use gust_cluster::prelude::Job;
use gust_core::prelude::{
    BenchProgress, CatalogInfo, Report, RunRequest, SuiteRequest, UnitOutcome, UnitRequest,
    WorkerError,
};

/// The coordinator's view of one worker's remote interface.
///
/// Implementations report a call which never reached the worker as [WorkerError::Unavailable],
/// which the coordinator retries.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn catalog(&self) -> Result<CatalogInfo, WorkerError>;

    async fn suite_setup(&self, request: SuiteRequest) -> Result<(), WorkerError>;

    async fn suite_teardown(&self, request: SuiteRequest) -> Result<(), WorkerError>;

    async fn worker_setup(&self, request: SuiteRequest) -> Result<(), WorkerError>;

    async fn worker_teardown(&self, request: SuiteRequest) -> Result<(), WorkerError>;

    async fn unit_setup(&self, request: UnitRequest) -> Result<(), WorkerError>;

    async fn unit_teardown(&self, request: UnitRequest) -> Result<(), WorkerError>;

    async fn run_test(&self, request: RunRequest) -> Result<UnitOutcome, WorkerError>;

    async fn start_benchmark(&self, request: RunRequest) -> Result<(), WorkerError>;

    async fn report_benchmark(&self, request: UnitRequest) -> Result<BenchProgress, WorkerError>;

    async fn stop_benchmark(&self, request: UnitRequest) -> Result<Report, WorkerError>;
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DialError {
    /// Nothing is listening yet, expected while the worker process starts.
    #[error("connection to worker {index} refused")]
    Refused { index: usize },
    #[error("worker {index} has no address")]
    NoAddress { index: usize },
    #[error("failed to dial worker {index}: {reason}")]
    Other { index: usize, reason: String },
}

impl DialError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DialError::Refused { .. } | DialError::NoAddress { .. })
    }
}

/// Opens a client to the worker process hosted by a job.
#[async_trait]
pub trait WorkerConnector: Send + Sync {
    async fn connect(&self, index: usize, job: &Job) -> Result<Arc<dyn WorkerClient>, DialError>;
}
