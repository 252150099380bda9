//! Suite registration and the test execution state machine, as run inside a Gust worker process.

mod catalog;
mod cli;
mod context;
mod definition;
mod executor;
mod init;
mod local;
mod monitor;
mod plan;
mod reporting;
mod shutdown;
mod supervise;
mod worker;

pub mod prelude {
    pub use crate::catalog::Catalog;
    pub use crate::cli::{GustProcessCli, RoleArg};
    pub use crate::context::{
        BenchContext, SubTestResult, SuiteContext, TestContext, UserValuesConstraint,
    };
    pub use crate::definition::{
        BenchBody, HookResult, SuiteDefinition, SuiteDefinitionBuilder, SuiteHook, TestHook,
    };
    pub use crate::executor::Executor;
    pub use crate::init::init;
    pub use crate::local::{run, run_local, LocalRun, WorkerTransport};
    pub use crate::shutdown::start_shutdown_listener;
    pub use crate::plan::{plan_tests, TestPlan};
    pub use crate::reporting::{push_report, BenchReport, ReportCadence, Tick, UnitResult};
    pub use crate::worker::Worker;

    pub use gust_core::prelude::{Args, GustResult, SuiteConfig, UnitOutcome};
}
