use std::future::Future;
use std::time::Instant;

use gust_core::prelude::{DeadlineExceededError, ShutdownHandle, ShutdownSignalError};

/// Runs async work on behalf of synchronous hooks, tests and benchmark bodies.
#[derive(Debug, Clone)]
pub struct Executor {
    runtime: tokio::runtime::Handle,
    shutdown_handle: ShutdownHandle,
    deadline: Option<Instant>,
}

impl Executor {
    pub fn new(runtime: tokio::runtime::Handle, shutdown_handle: ShutdownHandle) -> Self {
        Self {
            runtime,
            shutdown_handle,
            deadline: None,
        }
    }

    /// An executor which also cancels work once `deadline` passes.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Run async code in place, blocking until it completes.
    ///
    /// Note that the future will be cancelled if the run is shut down or the deadline passes, with
    /// a [ShutdownSignalError] or [DeadlineExceededError] respectively. A future which does not
    /// yield may prevent the run from shutting down.
    ///
    /// Must not be called from within an async context.
    pub fn execute_in_place<T>(
        &self,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> anyhow::Result<T> {
        let mut shutdown_listener = self.shutdown_handle.new_listener();
        let deadline = self.deadline;
        self.runtime.block_on(async move {
            let expired = async {
                match deadline {
                    Some(deadline) => {
                        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
                    }
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                result = fut => result,
                _ = shutdown_listener.wait_for_shutdown() => {
                    Err(anyhow::anyhow!(ShutdownSignalError::default()))
                },
                _ = expired => Err(anyhow::anyhow!(DeadlineExceededError::default())),
            }
        })
    }

    /// Submit async code to be run in the background.
    ///
    /// The future is not cancelled on shutdown and nothing waits for it to complete.
    pub fn spawn(&self, fut: impl Future<Output = ()> + Send + 'static) {
        self.runtime.spawn(fut);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_handle.is_shutdown()
    }
}
