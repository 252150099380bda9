use std::sync::Arc;

use gust_cluster::prelude::Job;
use gust_core::prelude::Backoff;

use crate::client::{DialError, WorkerClient, WorkerConnector};

/// Connect to the worker in `job`.
///
/// The container reports running before the worker process listens, so refused connections are
/// retried according to `backoff`.
pub async fn dial(
    connector: &dyn WorkerConnector,
    index: usize,
    job: &Job,
    backoff: &Backoff,
) -> Result<Arc<dyn WorkerClient>, DialError> {
    let client = backoff
        .retry(
            &format!("Dial worker {index}"),
            move || connector.connect(index, job),
            DialError::is_transient,
        )
        .await?;

    log::debug!("Connected to worker {index} in job {}", job.name());
    Ok(client)
}
