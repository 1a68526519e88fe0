//! The main lane
//!
//! Every user-visible callback (success, failure, cancel, delegates,
//! accessories, UI context) runs as a job on one serial lane, so callers
//! observe them in order and never concurrently.

use std::panic::{AssertUnwindSafe, catch_unwind};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Serial job queue drained by a single task
#[derive(Clone)]
pub struct MainQueue {
    sender: mpsc::UnboundedSender<Job>,
}

impl MainQueue {
    /// Spawn the draining task on `runtime`
    pub fn spawn(runtime: &Handle) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();

        runtime.spawn(async move {
            while let Some(job) = receiver.recv().await {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("Callback panicked on the main lane");
                }
            }
        });

        Self { sender }
    }

    /// Queue `job` behind everything dispatched so far
    pub fn dispatch<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.sender.send(Box::new(job)).is_err() {
            warn!("Main lane closed, dropping callback");
        }
    }

    /// Resolves once every job queued before this call has run
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.dispatch(move || {
            let _ = done_tx.send(());
        });
        let _ = done_rx.await;
    }
}

/// Run caller-supplied code on the lane. A panic is logged and swallowed so
/// the rest of the job (waiter resolution, permits) still runs.
pub(crate) fn run_guarded<F: FnOnce()>(what: &str, f: F) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(callback = what, "Callback panicked");
    }
}
