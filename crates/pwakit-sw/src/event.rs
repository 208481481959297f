//! Extended event lifetimes.
//!
//! Work registered through [`WaitUntil`] keeps an event unsettled until it
//! finishes, even when the event already delivered its result (a fetch
//! response, for instance).

use std::future::Future;
use std::sync::Mutex;

use tokio::task::JoinSet;
use tracing::warn;

/// Pending work attached to one event.
#[derive(Debug, Default)]
pub struct WaitUntil {
    tasks: Mutex<JoinSet<()>>,
}

impl WaitUntil {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` in the background and keep the event alive until it completes.
    pub fn spawn<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.spawn(work);
    }

    /// Number of tasks not yet joined.
    pub fn pending(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Wait for every registered task. Returns how many ran.
    ///
    /// A panicking task is logged and counted; it never propagates.
    pub async fn settled(self) -> usize {
        let mut tasks = self.tasks.into_inner().unwrap_or_else(|e| e.into_inner());
        let mut joined = 0;
        while let Some(result) = tasks.join_next().await {
            joined += 1;
            if let Err(e) = result {
                warn!(error = %e, "Wait-until task did not complete");
            }
        }
        joined
    }
}
