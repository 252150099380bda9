use std::sync::Arc;

use anyhow::Context;
use gust_cluster::bootstrap::{load_config, wait_for_sentinel, watch_shutdown_sentinel};
use gust_cluster::prelude::{ClusterApi, ClusterSettings};
use gust_core::prelude::{
    GustResult, ProcessRole, ShutdownSignalError, EXIT_CODE_CANCELED, EXIT_CODE_FAILURE,
};
use gust_runner::prelude::{start_shutdown_listener, GustProcessCli};

use crate::client::WorkerConnector;
use crate::coordinator::Coordinator;
use crate::summary::print_summary;

/// Entry point of the coordinator process of a run, inside the job started by
/// [crate::launch::launch_coordinator].
///
/// Waits for the job to be ready and loads the configuration, then starts the configured number
/// of worker jobs and drives them through the selected suites. Returns the exit code for the
/// process. Workers are run by suite binaries, so the worker role is rejected here.
pub fn run_coordinator(
    cli: &GustProcessCli,
    api: Arc<dyn ClusterApi>,
    settings: Arc<ClusterSettings>,
    connector: Arc<dyn WorkerConnector>,
) -> GustResult<i32> {
    if let ProcessRole::Worker { index } = cli.process_role() {
        anyhow::bail!("Worker {index} is run by a suite binary, not the coordinator");
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start the runtime")?;
    let shutdown = start_shutdown_listener(runtime.handle());
    let poll = settings.poll_interval;

    let ready = runtime.block_on(wait_for_sentinel(
        &cli.ready_sentinel,
        poll,
        shutdown.new_listener(),
    ));
    match ready {
        Err(e) if e.is::<ShutdownSignalError>() => return Ok(EXIT_CODE_CANCELED),
        ready => ready?,
    }

    let (spec, config) = load_config(&cli.config_dir)?;
    log::info!(
        "Coordinating run {} across {} workers",
        spec.run_id,
        config.workers
    );

    let outcome = runtime.block_on(async {
        watch_shutdown_sentinel(cli.shutdown_sentinel.clone(), poll, shutdown.clone());
        Coordinator::new(api, settings, spec, config, connector)
            .with_shutdown(shutdown)
            .run()
            .await
    });

    match outcome {
        Ok(outcome) => {
            print_summary(&outcome);
            Ok(outcome.exit_code())
        }
        Err(e) => {
            log::error!("Run failed before any unit ran: {e:?}");
            Ok(EXIT_CODE_FAILURE)
        }
    }
}
