mod error;
mod protocol;
mod report;
mod retry;
mod shutdown;
mod spec;
mod types;

pub mod prelude {
    pub use crate::error::{DeadlineExceededError, ShutdownSignalError};
    pub use crate::protocol::{
        BenchParams, BenchProgress, CatalogInfo, RunRequest, SuiteInfo, SuiteRequest, UnitOutcome,
        UnitRequest, WorkerError,
    };
    pub use crate::report::Report;
    pub use crate::retry::Backoff;
    pub use crate::shutdown::{DelegatedShutdownListener, ShutdownHandle, ShutdownScope};
    pub use crate::spec::{
        new_run_id, Args, ProcessRole, PullPolicy, RunMode, RunSpec, SuiteConfig, ValueFile,
    };
    pub use crate::types::{
        GustResult, EXIT_CODE_CANCELED, EXIT_CODE_FAILURE, EXIT_CODE_SUCCESS,
    };
}
