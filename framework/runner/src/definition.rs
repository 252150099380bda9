use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use gust_core::prelude::{
    Args, ShutdownSignalError, SuiteInfo, UnitOutcome, UnitRequest, WorkerError,
};
use gust_stats::prelude::BenchTarget;
use parking_lot::{Mutex, RwLock};

use crate::catalog::{Suite, SuiteStage};
use crate::context::{BenchContext, SuiteContext, TestContext, UserValuesConstraint};
use crate::executor::Executor;
use crate::supervise::{supervise, Supervised};

pub type HookResult = anyhow::Result<()>;

pub type SuiteHook<SV> = fn(&mut SuiteContext<SV>) -> HookResult;
pub type TestHook<SV, TV> = fn(&mut TestContext<SV, TV>) -> HookResult;
pub type BenchBody<SV> = fn(&BenchContext<SV>) -> HookResult;

struct TestDefinition<SV: UserValuesConstraint, TV: UserValuesConstraint> {
    name: String,
    body: TestHook<SV, TV>,
    setup_fn: Option<TestHook<SV, TV>>,
    teardown_fn: Option<TestHook<SV, TV>>,
    parallel: bool,
}

/// The builder for a suite definition.
///
/// `SV` holds the suite's state, shared by its hooks and every test on a worker. `TV` holds the
/// state of a single test, created fresh before the test's setup and dropped after its teardown.
pub struct SuiteDefinitionBuilder<SV: UserValuesConstraint, TV: UserValuesConstraint> {
    /// The name of the suite, which must be unique within a catalog.
    name: String,
    /// Run once per run, on a single worker, before anything else.
    setup_fn: Option<SuiteHook<SV>>,
    /// Run once per run, on a single worker, after everything else. Skipped when teardown is
    /// suppressed for the run.
    teardown_fn: Option<SuiteHook<SV>>,
    /// Run on every worker after suite setup.
    worker_setup_fn: Option<SuiteHook<SV>>,
    worker_teardown_fn: Option<SuiteHook<SV>>,
    /// Run before every test or benchmark, ahead of any setup specific to it.
    test_setup_fn: Option<TestHook<SV, TV>>,
    /// Run after every test or benchmark, even if it failed or panicked.
    test_teardown_fn: Option<TestHook<SV, TV>>,
    tests: Vec<TestDefinition<SV, TV>>,
    benchmarks: Vec<(String, BenchBody<SV>)>,
}

impl<SV: UserValuesConstraint, TV: UserValuesConstraint> SuiteDefinitionBuilder<SV, TV> {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            setup_fn: None,
            teardown_fn: None,
            worker_setup_fn: None,
            worker_teardown_fn: None,
            test_setup_fn: None,
            test_teardown_fn: None,
            tests: Vec::new(),
            benchmarks: Vec::new(),
        }
    }

    pub fn use_setup(mut self, setup_fn: SuiteHook<SV>) -> Self {
        self.setup_fn = Some(setup_fn);
        self
    }

    pub fn use_teardown(mut self, teardown_fn: SuiteHook<SV>) -> Self {
        self.teardown_fn = Some(teardown_fn);
        self
    }

    pub fn use_worker_setup(mut self, worker_setup_fn: SuiteHook<SV>) -> Self {
        self.worker_setup_fn = Some(worker_setup_fn);
        self
    }

    pub fn use_worker_teardown(mut self, worker_teardown_fn: SuiteHook<SV>) -> Self {
        self.worker_teardown_fn = Some(worker_teardown_fn);
        self
    }

    pub fn use_test_setup(mut self, test_setup_fn: TestHook<SV, TV>) -> Self {
        self.test_setup_fn = Some(test_setup_fn);
        self
    }

    pub fn use_test_teardown(mut self, test_teardown_fn: TestHook<SV, TV>) -> Self {
        self.test_teardown_fn = Some(test_teardown_fn);
        self
    }

    /// Add a test which runs on its own, in declared order.
    pub fn use_test(self, name: &str, body: TestHook<SV, TV>) -> Self {
        self.add_test(name, body, None, None, false)
    }

    /// Add a test which may run concurrently with the other parallel tests of the suite.
    pub fn use_parallel_test(self, name: &str, body: TestHook<SV, TV>) -> Self {
        self.add_test(name, body, None, None, true)
    }

    /// Add a test with its own setup and teardown, run inside the suite's test-level hooks.
    pub fn use_test_with_hooks(
        self,
        name: &str,
        setup_fn: TestHook<SV, TV>,
        body: TestHook<SV, TV>,
        teardown_fn: TestHook<SV, TV>,
    ) -> Self {
        self.add_test(name, body, Some(setup_fn), Some(teardown_fn), false)
    }

    pub fn use_benchmark(mut self, name: &str, body: BenchBody<SV>) -> Self {
        self.assert_unique(name);
        self.benchmarks.push((name.to_string(), body));
        self
    }

    fn add_test(
        mut self,
        name: &str,
        body: TestHook<SV, TV>,
        setup_fn: Option<TestHook<SV, TV>>,
        teardown_fn: Option<TestHook<SV, TV>>,
        parallel: bool,
    ) -> Self {
        self.assert_unique(name);
        self.tests.push(TestDefinition {
            name: name.to_string(),
            body,
            setup_fn,
            teardown_fn,
            parallel,
        });
        self
    }

    fn assert_unique(&self, name: &str) {
        let exists = self.tests.iter().any(|t| t.name == name)
            || self.benchmarks.iter().any(|(n, _)| n == name);
        if exists {
            panic!("Unit [{}] is already defined in suite [{}]", name, self.name);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn build(self) -> SuiteDefinition<SV, TV> {
        SuiteDefinition {
            name: self.name,
            setup_fn: self.setup_fn,
            teardown_fn: self.teardown_fn,
            worker_setup_fn: self.worker_setup_fn,
            worker_teardown_fn: self.worker_teardown_fn,
            test_setup_fn: self.test_setup_fn,
            test_teardown_fn: self.test_teardown_fn,
            tests: self.tests,
            benchmarks: self.benchmarks,
            values: Arc::new(RwLock::new(SV::default())),
            unit_values: Mutex::new(HashMap::new()),
        }
    }
}

impl<SV: UserValuesConstraint, TV: UserValuesConstraint> From<SuiteDefinitionBuilder<SV, TV>>
    for SuiteDefinition<SV, TV>
{
    fn from(builder: SuiteDefinitionBuilder<SV, TV>) -> Self {
        builder.build()
    }
}

/// A suite ready to be registered in a [crate::catalog::Catalog].
pub struct SuiteDefinition<SV: UserValuesConstraint, TV: UserValuesConstraint> {
    name: String,
    setup_fn: Option<SuiteHook<SV>>,
    teardown_fn: Option<SuiteHook<SV>>,
    worker_setup_fn: Option<SuiteHook<SV>>,
    worker_teardown_fn: Option<SuiteHook<SV>>,
    test_setup_fn: Option<TestHook<SV, TV>>,
    test_teardown_fn: Option<TestHook<SV, TV>>,
    tests: Vec<TestDefinition<SV, TV>>,
    benchmarks: Vec<(String, BenchBody<SV>)>,
    values: Arc<RwLock<SV>>,
    /// Test values between a unit's setup and its teardown.
    unit_values: Mutex<HashMap<String, TV>>,
}

impl<SV: UserValuesConstraint, TV: UserValuesConstraint> SuiteDefinition<SV, TV> {
    fn test(&self, request: &UnitRequest) -> Option<&TestDefinition<SV, TV>> {
        self.tests.iter().find(|t| t.name == request.unit)
    }

    fn check_unit(&self, request: &UnitRequest) -> Result<(), WorkerError> {
        let known = self.test(request).is_some()
            || self.benchmarks.iter().any(|(n, _)| *n == request.unit);
        if known {
            Ok(())
        } else {
            Err(WorkerError::UnitNotFound {
                suite: self.name.clone(),
                unit: request.unit.clone(),
            })
        }
    }

    fn test_context(&self, request: &UnitRequest, executor: Executor) -> TestContext<SV, TV> {
        let value = self
            .unit_values
            .lock()
            .remove(&request.unit)
            .unwrap_or_default();
        TestContext::new(
            &self.name,
            &request.unit,
            &request.args,
            executor,
            self.values.clone(),
            value,
        )
    }

    /// Run hooks in order against a test context, stopping at the first failure.
    fn run_test_hooks(
        &self,
        context: &mut TestContext<SV, TV>,
        hooks: &[(&str, Option<TestHook<SV, TV>>)],
        stop_on_error: bool,
    ) -> Result<(), WorkerError> {
        let mut first_error = None;
        for (stage, hook) in hooks {
            let Some(hook) = hook else {
                continue;
            };

            let stage = format!("{stage} of {}/{}", self.name, context.name());
            if let Err(e) = supervise(|| hook(context)).into_hook_result(&stage) {
                if stop_on_error {
                    return Err(e);
                }
                log::warn!("{e}");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<SV: UserValuesConstraint, TV: UserValuesConstraint> Suite for SuiteDefinition<SV, TV> {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> SuiteInfo {
        SuiteInfo {
            name: self.name.clone(),
            tests: self.tests.iter().map(|t| t.name.clone()).collect(),
            benchmarks: self.benchmarks.iter().map(|(n, _)| n.clone()).collect(),
            parallel_tests: self
                .tests
                .iter()
                .filter(|t| t.parallel)
                .map(|t| t.name.clone())
                .collect(),
        }
    }

    fn run_suite_hook(
        &self,
        stage: SuiteStage,
        args: &Args,
        executor: &Executor,
    ) -> Result<(), WorkerError> {
        let hook = match stage {
            SuiteStage::Setup => self.setup_fn,
            SuiteStage::Teardown => self.teardown_fn,
            SuiteStage::WorkerSetup => self.worker_setup_fn,
            SuiteStage::WorkerTeardown => self.worker_teardown_fn,
        };
        let Some(hook) = hook else {
            return Ok(());
        };

        let mut context = SuiteContext::new(&self.name, args, executor.clone(), self.values.clone());
        supervise(|| hook(&mut context)).into_hook_result(&format!("{stage} of {}", self.name))
    }

    fn unit_setup(&self, request: &UnitRequest, executor: &Executor) -> Result<(), WorkerError> {
        self.check_unit(request)?;

        let mut context = self.test_context(request, executor.clone());
        let specific = self.test(request).and_then(|t| t.setup_fn);
        let result = self.run_test_hooks(
            &mut context,
            &[("test setup", self.test_setup_fn), ("setup", specific)],
            true,
        );

        self.unit_values
            .lock()
            .insert(request.unit.clone(), context.into_value());
        result
    }

    fn unit_teardown(&self, request: &UnitRequest, executor: &Executor) -> Result<(), WorkerError> {
        self.check_unit(request)?;

        let mut context = self.test_context(request, executor.clone());
        let specific = self.test(request).and_then(|t| t.teardown_fn);
        // The test's value is dropped once it has been torn down.
        self.run_test_hooks(
            &mut context,
            &[("teardown", specific), ("test teardown", self.test_teardown_fn)],
            false,
        )
    }

    fn run_test(
        &self,
        request: &UnitRequest,
        deadline: Instant,
        executor: &Executor,
        verbose: bool,
    ) -> Result<UnitOutcome, WorkerError> {
        let test = self.test(request).ok_or_else(|| WorkerError::UnitNotFound {
            suite: self.name.clone(),
            unit: request.unit.clone(),
        })?;

        let mut context = self
            .test_context(request, executor.with_deadline(deadline))
            .verbose(verbose);
        let body = test.body;
        let supervised = supervise(|| body(&mut context));

        let failed_sub_tests = context
            .sub_tests()
            .iter()
            .filter(|s| !s.outcome.is_passed())
            .map(|s| s.name.clone())
            .collect::<Vec<_>>();
        self.unit_values
            .lock()
            .insert(request.unit.clone(), context.into_value());

        let outcome = match supervised {
            Supervised::Returned(Err(e)) if e.is::<ShutdownSignalError>() => {
                return Err(WorkerError::Canceled);
            }
            Supervised::Returned(Ok(())) if !failed_sub_tests.is_empty() => {
                UnitOutcome::failed(format!("sub-tests failed: {}", failed_sub_tests.join(", ")))
            }
            supervised => supervised.into_outcome(),
        };

        Ok(outcome)
    }

    fn benchmark(&self, request: &UnitRequest, executor: &Executor) -> Result<BenchTarget, WorkerError> {
        let (_, body) = self
            .benchmarks
            .iter()
            .find(|(n, _)| *n == request.unit)
            .ok_or_else(|| WorkerError::UnitNotFound {
                suite: self.name.clone(),
                unit: request.unit.clone(),
            })?;

        let body = *body;
        let context = Arc::new(BenchContext::new(
            &self.name,
            &request.unit,
            &request.args,
            executor.clone(),
            self.values.clone(),
        ));
        let target: BenchTarget = Arc::new(move || body(&context));
        Ok(target)
    }
}
