use std::sync::Arc;

use anyhow::Context;
use futures::future::join_all;
use gust_cluster::prelude::{ClusterApi, ClusterSettings, Job};
use gust_core::prelude::{Backoff, GustResult, RunSpec, ShutdownHandle, SuiteConfig};

use crate::client::{WorkerClient, WorkerConnector};
use crate::dial::dial;

/// A worker job and the client dialed to it.
pub struct WorkerDescriptor {
    pub index: usize,
    pub job: Job,
    pub client: Arc<dyn WorkerClient>,
}

/// The worker jobs of a run.
pub struct WorkerPool {
    workers: Vec<WorkerDescriptor>,
    settings: Arc<ClusterSettings>,
}

impl WorkerPool {
    /// Create and dial every worker concurrently.
    ///
    /// Either every worker is ready or none is: if any worker fails to start, the jobs which did
    /// start are deleted and the first failure is returned.
    pub async fn start(
        api: Arc<dyn ClusterApi>,
        settings: Arc<ClusterSettings>,
        spec: &RunSpec,
        config: &SuiteConfig,
        connector: &dyn WorkerConnector,
        backoff: &Backoff,
        shutdown: &ShutdownHandle,
    ) -> GustResult<WorkerPool> {
        log::info!("Starting {} workers for run {}", config.workers, spec.run_id);

        let started = join_all((0..config.workers).map(|index| {
            start_worker(
                index,
                api.clone(),
                settings.clone(),
                spec.for_worker(index),
                config,
                connector,
                backoff,
                shutdown,
            )
        }))
        .await;

        let mut workers = Vec::with_capacity(started.len());
        let mut first_error = None;
        for result in started {
            match result {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    log::error!("{e:?}");
                    first_error.get_or_insert(e);
                }
            }
        }

        let pool = WorkerPool { workers, settings };
        if let Some(e) = first_error {
            log::warn!("Not all workers started, deleting {} started workers", pool.len());
            if let Err(delete_error) = pool.shutdown().await {
                log::error!("Failed to delete started workers: {delete_error:?}");
            }
            return Err(e);
        }

        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn workers(&self) -> &[WorkerDescriptor] {
        &self.workers
    }

    pub fn clients(&self) -> Vec<Arc<dyn WorkerClient>> {
        self.workers.iter().map(|w| w.client.clone()).collect()
    }

    /// Signal every worker process to exit and delete the worker jobs.
    ///
    /// Expects the worker teardown calls to have been made. Runs on its own deadline, so that a
    /// cancelled run still cleans up.
    pub async fn shutdown(self) -> GustResult<()> {
        let timeout = self.settings.teardown_timeout;
        let deleted = join_all(self.workers.iter().map(|worker| async move {
            if let Err(e) = worker.job.signal_shutdown().await {
                log::debug!("Failed to signal worker {} to shut down: {e:?}", worker.index);
            }

            tokio::time::timeout(timeout, worker.job.delete())
                .await
                .with_context(|| format!("Timed out deleting worker {}", worker.index))?
                .with_context(|| format!("Failed to delete worker {}", worker.index))
        }))
        .await;

        deleted.into_iter().collect::<GustResult<Vec<()>>>()?;
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn start_worker(
    index: usize,
    api: Arc<dyn ClusterApi>,
    settings: Arc<ClusterSettings>,
    spec: RunSpec,
    config: &SuiteConfig,
    connector: &dyn WorkerConnector,
    backoff: &Backoff,
    shutdown: &ShutdownHandle,
) -> GustResult<WorkerDescriptor> {
    let job = Job::create(api, settings, spec, config, shutdown.new_listener())
        .await
        .with_context(|| format!("Failed to create worker {index}"))?;

    match dial(connector, index, &job, backoff).await {
        Ok(client) => Ok(WorkerDescriptor { index, job, client }),
        Err(e) => {
            if let Err(delete_error) = job.delete().await {
                log::warn!("Failed to delete worker {index} after dial failure: {delete_error:?}");
            }
            Err(anyhow::Error::new(e).context(format!("Failed to dial worker {index}")))
        }
    }
}
