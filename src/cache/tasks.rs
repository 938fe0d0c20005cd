//! Delayed background tasks owned by the engine.
//!
//! Bitmap corrections and second deletes run here instead of as detached
//! spawns, so shutdown can cancel whatever is still waiting.

use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::lock::mutex_lock;

const SOURCE: &str = "cache::tasks";

#[derive(Debug, Default)]
pub struct DelayedTasks {
    tasks: Mutex<JoinSet<()>>,
    closed: AtomicBool,
}

impl DelayedTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` once `delay` has elapsed.
    ///
    /// Must be called from within a tokio runtime. Ignored after [`DelayedTasks::shutdown`].
    pub fn schedule<F>(&self, label: &'static str, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            debug!(label, "Delayed task dropped after shutdown");
            return;
        }

        let mut tasks = mutex_lock(&self.tasks, SOURCE, "schedule");
        Self::reap(&mut tasks);
        tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        debug!(label, delay_ms = delay.as_millis() as u64, "Delayed task scheduled");
    }

    /// Tasks scheduled and not yet reaped.
    pub fn pending(&self) -> usize {
        let mut tasks = mutex_lock(&self.tasks, SOURCE, "pending");
        Self::reap(&mut tasks);
        tasks.len()
    }

    /// Wait for every task scheduled so far to finish.
    pub async fn wait_idle(&self) {
        let mut current = std::mem::take(&mut *mutex_lock(&self.tasks, SOURCE, "wait_idle"));
        while let Some(result) = current.join_next().await {
            Self::report(result);
        }
    }

    /// Cancel pending tasks and refuse new ones. Returns how many were cancelled.
    pub fn shutdown(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let mut tasks = mutex_lock(&self.tasks, SOURCE, "shutdown");
        Self::reap(&mut tasks);
        let cancelled = tasks.len();
        tasks.abort_all();
        cancelled
    }

    fn reap(tasks: &mut JoinSet<()>) {
        while let Some(result) = tasks.try_join_next() {
            Self::report(result);
        }
    }

    fn report(result: Result<(), tokio::task::JoinError>) {
        if let Err(err) = result
            && err.is_panic()
        {
            warn!(error = %err, "Delayed task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn task_runs_after_delay() {
        let tasks = DelayedTasks::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tasks.schedule("test", Duration::from_secs(2), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        tasks.wait_idle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(tasks.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_and_closes() {
        let tasks = DelayedTasks::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tasks.schedule("test", Duration::from_secs(5), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(tasks.shutdown(), 1);

        let counter = Arc::clone(&hits);
        tasks.schedule("late", Duration::ZERO, async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        tasks.wait_idle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
