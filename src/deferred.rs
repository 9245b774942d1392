//! Off-critical-path execution of accounting work.
//!
//! Thin adapter over an unbounded channel and a runner task. Submitted jobs
//! run asynchronously, exactly once, with no ordering guarantee, and
//! independent of the originating request's lifecycle. A failure inside a
//! job is caught and logged by the runner, never surfaced to any request.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tokio::sync::mpsc;
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle for submitting deferred work.
#[derive(Clone)]
pub struct DeferredQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl DeferredQueue {
    /// Start the runner task and return a submission handle.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(error = %message, "deferred job failed");
                }
            }
            debug!("deferred queue runner stopped");
        });

        Self { tx }
    }

    /// Submit a unit of work for asynchronous execution.
    pub fn defer<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tx.send(Box::new(job)).is_err() {
            debug!("deferred queue stopped; job dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met within timeout");
    }

    #[tokio::test]
    async fn test_jobs_execute_exactly_once() {
        let queue = DeferredQueue::start();
        let counter = Arc::new(AtomicU64::new(0));

        for _ in 0..10 {
            let counter = counter.clone();
            queue.defer(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        wait_for(|| counter.load(Ordering::SeqCst) == 10).await;
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_kill_runner() {
        let queue = DeferredQueue::start();
        let counter = Arc::new(AtomicU64::new(0));

        queue.defer(|| panic!("job exploded"));
        let after = counter.clone();
        queue.defer(move || {
            after.fetch_add(1, Ordering::SeqCst);
        });

        wait_for(|| counter.load(Ordering::SeqCst) == 1).await;
    }
}
