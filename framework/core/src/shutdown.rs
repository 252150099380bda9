use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Broadcasts a one-way shutdown signal to any number of listeners.
///
/// The signal is sticky: a listener created after [ShutdownHandle::shutdown] was called observes
/// the shutdown immediately, so listeners can be created after work has already started.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self {
            sender: Arc::new(watch::channel(false).0),
        }
    }

    pub fn shutdown(&self) {
        let was_shutdown = self.sender.send_replace(true);
        if !was_shutdown {
            log::trace!("Shutdown signal sent");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn new_listener(&self) -> DelegatedShutdownListener {
        DelegatedShutdownListener {
            receiver: self.sender.subscribe(),
        }
    }

    /// A child handle for one piece of work, see [ShutdownScope]. Must be called from within a
    /// Tokio runtime.
    pub fn scope(&self) -> ShutdownScope {
        let handle = ShutdownHandle::new();
        if self.is_shutdown() {
            handle.shutdown();
        }

        let mut parent = self.new_listener();
        let child = handle.clone();
        let forward = tokio::spawn(async move {
            parent.wait_for_shutdown().await;
            child.shutdown();
        });

        ShutdownScope {
            handle,
            tasks: vec![forward],
        }
    }
}

/// Shutdown for work that is shorter lived than the handle it was scoped from.
///
/// The scope's handle is shut down when its parent is, but shutting down the scope never reaches
/// the parent. Dropping the scope cancels its pending deadlines, so a deadline only applies to the
/// work it was set for.
#[derive(Debug)]
pub struct ShutdownScope {
    handle: ShutdownHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl ShutdownScope {
    pub fn handle(&self) -> &ShutdownHandle {
        &self.handle
    }

    /// Shut the scope down once `delay` has elapsed, unless it is dropped first.
    pub fn shutdown_after(&mut self, delay: Duration) {
        let handle = self.handle.clone();
        self.tasks.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            log::debug!("Deadline of {delay:?} reached");
            handle.shutdown();
        }));
    }
}

impl Drop for ShutdownScope {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[derive(Clone, Debug)]
pub struct DelegatedShutdownListener {
    receiver: watch::Receiver<bool>,
}

impl DelegatedShutdownListener {
    /// Point in time check if the shutdown signal has been received. If this returns true then work
    /// should be stopped so that the run can shut down.
    pub fn should_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait for the shutdown signal to be received. It is safe to race this with another future so
    /// that the shutdown signal can be used to cancel other work in progress.
    ///
    /// If every [ShutdownHandle] is dropped without signalling then this never completes.
    pub async fn wait_for_shutdown(&mut self) {
        if self.receiver.wait_for(|shutdown| *shutdown).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn late_listener_sees_shutdown() {
        let handle = ShutdownHandle::new();
        handle.shutdown();

        let mut listener = handle.new_listener();
        assert!(listener.should_shutdown());
        tokio::time::timeout(Duration::from_millis(100), listener.wait_for_shutdown())
            .await
            .expect("listener should complete immediately");
    }

    #[tokio::test]
    async fn scope_deadline_does_not_reach_parent() {
        let parent = ShutdownHandle::new();
        let mut scope = parent.scope();
        let mut listener = scope.handle().new_listener();
        scope.shutdown_after(Duration::from_millis(20));

        assert!(!listener.should_shutdown());
        listener.wait_for_shutdown().await;
        assert!(scope.handle().is_shutdown());
        assert!(!parent.is_shutdown());
    }

    #[tokio::test]
    async fn parent_shutdown_reaches_scope() {
        let parent = ShutdownHandle::new();
        let scope = parent.scope();
        let mut listener = scope.handle().new_listener();

        parent.shutdown();
        tokio::time::timeout(Duration::from_millis(100), listener.wait_for_shutdown())
            .await
            .expect("scope should follow its parent");

        let parent = ShutdownHandle::new();
        parent.shutdown();
        assert!(parent.scope().handle().is_shutdown());
    }

    #[tokio::test]
    async fn dropped_scope_cancels_its_deadline() {
        let parent = ShutdownHandle::new();
        let mut scope = parent.scope();
        let handle = scope.handle().clone();
        scope.shutdown_after(Duration::from_millis(20));
        drop(scope);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!handle.is_shutdown());
        assert!(!parent.is_shutdown());
    }

    #[tokio::test]
    async fn dropped_handle_does_not_signal() {
        let handle = ShutdownHandle::new();
        let mut listener = handle.new_listener();
        drop(handle);

        let result =
            tokio::time::timeout(Duration::from_millis(50), listener.wait_for_shutdown()).await;
        assert!(result.is_err());
        assert!(!listener.should_shutdown());
    }
}
