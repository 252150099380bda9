use std::fmt::{Display, Formatter};
use std::time::Instant;

use gust_core::prelude::{
    Args, CatalogInfo, SuiteConfig, SuiteInfo, UnitOutcome, UnitRequest, WorkerError,
};
use gust_stats::prelude::BenchTarget;

use crate::context::UserValuesConstraint;
use crate::definition::SuiteDefinition;
use crate::executor::Executor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SuiteStage {
    Setup,
    Teardown,
    WorkerSetup,
    WorkerTeardown,
}

impl Display for SuiteStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SuiteStage::Setup => write!(f, "suite setup"),
            SuiteStage::Teardown => write!(f, "suite teardown"),
            SuiteStage::WorkerSetup => write!(f, "worker setup"),
            SuiteStage::WorkerTeardown => write!(f, "worker teardown"),
        }
    }
}

/// A registered suite with its value types erased.
pub(crate) trait Suite: Send + Sync {
    fn name(&self) -> &str;

    fn info(&self) -> SuiteInfo;

    fn run_suite_hook(
        &self,
        stage: SuiteStage,
        args: &Args,
        executor: &Executor,
    ) -> Result<(), WorkerError>;

    /// The test-level setup followed by the unit's own setup. Stops at the first failure.
    fn unit_setup(&self, request: &UnitRequest, executor: &Executor) -> Result<(), WorkerError>;

    /// The unit's own teardown followed by the test-level teardown. Both are always attempted.
    fn unit_teardown(&self, request: &UnitRequest, executor: &Executor) -> Result<(), WorkerError>;

    fn run_test(
        &self,
        request: &UnitRequest,
        deadline: Instant,
        executor: &Executor,
        verbose: bool,
    ) -> Result<UnitOutcome, WorkerError>;

    fn benchmark(&self, request: &UnitRequest, executor: &Executor) -> Result<BenchTarget, WorkerError>;
}

/// Every suite this binary can run, in registration order.
#[derive(Default)]
pub struct Catalog {
    suites: Vec<Box<dyn Suite>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a suite.
    ///
    /// Panics if a suite with the same name has already been registered.
    pub fn register<SV: UserValuesConstraint, TV: UserValuesConstraint>(
        mut self,
        suite: impl Into<SuiteDefinition<SV, TV>>,
    ) -> Self {
        let suite = suite.into();
        if self.suites.iter().any(|s| s.name() == suite.name()) {
            panic!("Suite [{}] is already registered", suite.name());
        }

        self.suites.push(Box::new(suite));
        self
    }

    pub fn info(&self) -> CatalogInfo {
        CatalogInfo {
            suites: self.suites.iter().map(|s| s.info()).collect(),
        }
    }

    /// The run set for the given configuration.
    pub fn select(&self, config: &SuiteConfig) -> Result<CatalogInfo, WorkerError> {
        self.info().select(config)
    }

    pub(crate) fn suite(&self, name: &str) -> Result<&dyn Suite, WorkerError> {
        self.suites
            .iter()
            .find(|s| s.name() == name)
            .map(|s| s.as_ref())
            .ok_or_else(|| WorkerError::SuiteNotFound(name.to_string()))
    }
}
