use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gust_core::prelude::{Args, UnitOutcome};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::executor::Executor;
use crate::supervise::supervise;

pub trait UserValuesConstraint: Default + Debug + Send + Sync + 'static {}

impl UserValuesConstraint for () {}

/// Passed to suite-level hooks: suite setup and teardown and the per-worker setup and teardown.
///
/// The suite values live for as long as the worker process and are shared with every test of the
/// suite on this worker.
#[derive(Debug)]
pub struct SuiteContext<SV: UserValuesConstraint> {
    suite: String,
    args: Args,
    executor: Executor,
    values: Arc<RwLock<SV>>,
}

impl<SV: UserValuesConstraint> SuiteContext<SV> {
    pub(crate) fn new(suite: &str, args: &Args, executor: Executor, values: Arc<RwLock<SV>>) -> Self {
        Self {
            suite: suite.to_string(),
            args: args.clone(),
            executor,
            values,
        }
    }

    pub fn suite(&self) -> &str {
        &self.suite
    }

    pub fn args(&self) -> &Args {
        &self.args
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn get(&self) -> RwLockReadGuard<'_, SV> {
        self.values.read()
    }

    pub fn get_mut(&mut self) -> RwLockWriteGuard<'_, SV> {
        self.values.write()
    }
}

/// A sub-test and how it went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubTestResult {
    pub name: String,
    pub outcome: UnitOutcome,
}

/// Passed to a test body and to its setup and teardown hooks.
#[derive(Debug)]
pub struct TestContext<SV: UserValuesConstraint, TV: UserValuesConstraint> {
    suite: String,
    name: String,
    args: Args,
    executor: Executor,
    suite_values: Arc<RwLock<SV>>,
    value: TV,
    sub_tests: Vec<SubTestResult>,
    in_sub_test: bool,
    verbose: bool,
}

impl<SV: UserValuesConstraint, TV: UserValuesConstraint> TestContext<SV, TV> {
    pub(crate) fn new(
        suite: &str,
        name: &str,
        args: &Args,
        executor: Executor,
        suite_values: Arc<RwLock<SV>>,
        value: TV,
    ) -> Self {
        Self {
            suite: suite.to_string(),
            name: name.to_string(),
            args: args.clone(),
            executor,
            suite_values,
            value,
            sub_tests: Vec::new(),
            in_sub_test: false,
            verbose: false,
        }
    }

    pub(crate) fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn suite(&self) -> &str {
        &self.suite
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &Args {
        &self.args
    }

    /// When the test must be done by. Only the body of a test runs against a deadline.
    pub fn deadline(&self) -> Option<Instant> {
        self.executor.deadline()
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline()
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Bound to the test's deadline, async work is cancelled once it passes.
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn suite_values(&self) -> RwLockReadGuard<'_, SV> {
        self.suite_values.read()
    }

    pub fn get(&self) -> &TV {
        &self.value
    }

    pub fn get_mut(&mut self) -> &mut TV {
        &mut self.value
    }

    /// Run a named sub-test. A failing or panicking sub-test fails the test but does not stop it.
    ///
    /// Sub-tests run whenever their test is selected and cannot be nested. Returns whether the
    /// sub-test passed.
    pub fn run(&mut self, name: &str, body: impl FnOnce(&mut Self) -> anyhow::Result<()>) -> bool {
        let full_name = format!("{}/{}", self.name, name);
        let outcome = if self.in_sub_test {
            UnitOutcome::failed(format!("sub-test {full_name} is nested in another sub-test"))
        } else {
            self.in_sub_test = true;
            let outcome = supervise(|| body(self)).into_outcome();
            self.in_sub_test = false;
            outcome
        };

        if self.verbose {
            log::info!("{}/{full_name}: {outcome}", self.suite);
        } else {
            log::debug!("{}/{full_name}: {outcome}", self.suite);
        }

        let passed = outcome.is_passed();
        self.sub_tests.push(SubTestResult {
            name: name.to_string(),
            outcome,
        });
        passed
    }

    pub fn sub_tests(&self) -> &[SubTestResult] {
        &self.sub_tests
    }

    pub(crate) fn into_value(self) -> TV {
        self.value
    }
}

/// Shared by every caller of a benchmark, so only read access is available.
#[derive(Debug)]
pub struct BenchContext<SV: UserValuesConstraint> {
    suite: String,
    name: String,
    args: Args,
    executor: Executor,
    suite_values: Arc<RwLock<SV>>,
}

impl<SV: UserValuesConstraint> BenchContext<SV> {
    pub(crate) fn new(
        suite: &str,
        name: &str,
        args: &Args,
        executor: Executor,
        suite_values: Arc<RwLock<SV>>,
    ) -> Self {
        Self {
            suite: suite.to_string(),
            name: name.to_string(),
            args: args.clone(),
            executor,
            suite_values,
        }
    }

    pub fn suite(&self) -> &str {
        &self.suite
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &Args {
        &self.args
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn suite_values(&self) -> RwLockReadGuard<'_, SV> {
        self.suite_values.read()
    }
}
