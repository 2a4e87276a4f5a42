//! Cancellable background-task handle shared by the connection monitor and
//! the receive loop.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// A spawned background task plus its cooperative shutdown signal.
pub(crate) struct TaskHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    pub(crate) fn new(shutdown: watch::Sender<bool>, join: JoinHandle<()>) -> Self {
        Self { shutdown, join }
    }

    /// Requests cooperative shutdown and waits up to `grace` for the task to
    /// finish; past that the task is aborted and abandoned.
    pub(crate) async fn cancel(mut self, grace: Duration) {
        let _ = self.shutdown.send(true);
        if tokio::time::timeout(grace, &mut self.join).await.is_err() {
            self.join.abort();
            debug!("background task aborted after grace period");
        }
    }
}
