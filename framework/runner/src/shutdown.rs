use gust_core::prelude::ShutdownHandle;
use tokio::signal;

/// Shut down when the operator interrupts the process.
pub fn start_shutdown_listener(runtime: &tokio::runtime::Handle) -> ShutdownHandle {
    let handle = ShutdownHandle::default();

    let listener_handle = handle.clone();
    runtime.spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            log::warn!("Failed to listen for Ctrl-C, interrupts will not shut down the run: {e}");
            return;
        }
        listener_handle.shutdown();
        log::warn!("Interrupted, cancelling the run");
    });

    handle
}
