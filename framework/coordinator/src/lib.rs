//! The coordinator side of a Gust run: starting the worker jobs, driving every worker through the
//! suite protocol and reducing what they report. [prelude::run_coordinator] is the entry point of
//! the coordinator process.

mod client;
mod coordinator;
mod dial;
pub mod launch;
pub mod local;
mod pool;
mod process;
pub mod summary;

pub mod prelude {
    pub use crate::client::{DialError, WorkerClient, WorkerConnector};
    pub use crate::coordinator::{Coordinator, RunOutcome, RunStatus, RunSummary};
    pub use crate::dial::dial;
    pub use crate::launch::launch_coordinator;
    pub use crate::local::{LocalConnector, LocalWorkerClient};
    pub use crate::pool::{WorkerDescriptor, WorkerPool};
    pub use crate::process::run_coordinator;
    pub use crate::summary::{print_summary, summary_table};
}
