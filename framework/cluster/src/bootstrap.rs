//! What a Gust process does inside its job before it starts work.
//!
//! The job's files are streamed in after the container starts, so the process must not read its
//! configuration until the ready sentinel appears.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use gust_core::prelude::{
    DelegatedShutdownListener, GustResult, RunSpec, ShutdownHandle, ShutdownSignalError,
    SuiteConfig,
};
use tokio::task::JoinHandle;

use crate::settings::{RUN_SPEC_KEY, SUITE_CONFIG_KEY};

/// Poll until the file at `path` exists.
pub async fn wait_for_sentinel(
    path: &Path,
    poll: Duration,
    mut shutdown: DelegatedShutdownListener,
) -> GustResult<()> {
    log::debug!("Waiting for {} to appear", path.display());
    let wait = async {
        while !tokio::fs::try_exists(path).await.unwrap_or(false) {
            tokio::time::sleep(poll).await;
        }
    };

    tokio::select! {
        _ = wait => {
            log::debug!("Found {}", path.display());
            Ok(())
        }
        _ = shutdown.wait_for_shutdown() => Err(ShutdownSignalError::default().into()),
    }
}

/// Read the run specification and suite configuration from the mounted config object.
pub fn load_config(dir: &Path) -> GustResult<(RunSpec, SuiteConfig)> {
    let spec = read_json(&dir.join(RUN_SPEC_KEY))?;
    let config: SuiteConfig = read_json(&dir.join(SUITE_CONFIG_KEY))?;
    config.validate()?;

    Ok((spec, config))
}

/// Shut down via `handle` once the file at `path` appears.
pub fn watch_shutdown_sentinel(path: PathBuf, poll: Duration, handle: ShutdownHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        let listener = handle.new_listener();
        if wait_for_sentinel(&path, poll, listener).await.is_ok() {
            log::info!("Shutdown requested through {}", path.display());
            handle.shutdown();
        }
    })
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> GustResult<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}
