use std::sync::Arc;

use anyhow::Context;
use gust_cluster::prelude::{ClusterApi, ClusterSettings, Job, JobExit};
use gust_core::prelude::{GustResult, RunSpec, ShutdownHandle, SuiteConfig, EXIT_CODE_CANCELED};

/// Start the coordinator job of a run from outside the cluster and wait for it to finish.
///
/// The coordinator's output is forwarded to the log while it runs. Returns the coordinator's exit
/// code, or [EXIT_CODE_CANCELED] if `shutdown` fires first, in which case the coordinator is asked
/// to exit and given the teardown timeout to tear its workers down.
pub async fn launch_coordinator(
    api: Arc<dyn ClusterApi>,
    settings: Arc<ClusterSettings>,
    spec: &RunSpec,
    config: &SuiteConfig,
    shutdown: &ShutdownHandle,
) -> GustResult<i32> {
    let teardown_timeout = settings.teardown_timeout;
    let job = Job::create(
        api,
        settings,
        spec.for_coordinator(),
        config,
        shutdown.new_listener(),
    )
    .await
    .context("Failed to create the coordinator")?;

    let logs = match job.follow_logs().await {
        Ok(logs) => Some(logs),
        Err(e) => {
            log::warn!("Not forwarding coordinator output: {e:?}");
            None
        }
    };

    let mut listener = shutdown.new_listener();
    let exit = tokio::select! {
        exit = job.wait_for_exit() => exit.map(|exit| exit.exit_code),
        _ = listener.wait_for_shutdown() => {
            log::warn!("Run {} cancelled, stopping the coordinator", spec.run_id);
            if let Err(e) = job.signal_shutdown().await {
                log::warn!("Failed to signal the coordinator to shut down: {e:?}");
            }
            match tokio::time::timeout(teardown_timeout, job.wait_for_exit()).await {
                Ok(Ok(JobExit { exit_code, .. })) => {
                    log::info!("Coordinator stopped with code {exit_code}");
                }
                Ok(Err(e)) => log::warn!("{e:?}"),
                Err(_) => log::warn!("Coordinator did not stop within {teardown_timeout:?}"),
            }
            Ok(EXIT_CODE_CANCELED)
        }
    };

    let deleted = tokio::time::timeout(teardown_timeout, job.delete())
        .await
        .context("Timed out deleting the coordinator")
        .and_then(|deleted| deleted);

    if let Some(logs) = logs {
        logs.abort();
    }

    let exit_code = exit?;
    deleted?;
    Ok(exit_code)
}
