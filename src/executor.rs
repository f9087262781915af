//! Async task executor owned by one cloud client.
//!
//! Runs one-shot tasks and fixed-delay recurring tasks on the tokio runtime. A failing or
//! panicking task is logged and counted but never takes the executor or a schedule down.
//! [`AsyncTaskExecutor::dispose`] cancels every schedule and rejects new work; runs that
//! already started finish normally.

use crate::{Error, ErrorContext, Result};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub submitted: u64,
    pub scheduled: u64,
    /// Task bodies started, one-shot and recurring.
    pub runs: u64,
    /// Runs that returned an error or panicked.
    pub failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    scheduled: AtomicU64,
    runs: AtomicU64,
    failures: AtomicU64,
}

pub struct AsyncTaskExecutor {
    name: String,
    shutdown: CancellationToken,
    counters: Arc<Counters>,
}

impl AsyncTaskExecutor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shutdown: CancellationToken::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_disposed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn runtime(&self, task: &str) -> Result<Handle> {
        if self.is_disposed() {
            return Err(Error::Disposed(format!(
                "executor {} rejected task {}",
                self.name, task
            )));
        }
        Handle::try_current().map_err(|e| {
            Error::configuration(format!("executor needs a tokio runtime: {}", e)).with_context(
                ErrorContext::new()
                    .with_operation(task.to_string())
                    .with_source("executor"),
            )
        })
    }

    /// Runs `task` once. The returned future resolves with the task's result; panics
    /// surface as `Fatal`.
    pub fn submit<F, T>(&self, name: impl Into<String>, task: F) -> Result<TaskFuture<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let name = name.into();
        let handle = self.runtime(&name)?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        debug!(executor = %self.name, task = %name, "task submitted");

        let executor = self.name.clone();
        let counters = Arc::clone(&self.counters);
        let task_name = name.clone();
        let inner = handle.spawn(async move { run_guarded(&executor, &task_name, &counters, task).await });
        Ok(TaskFuture { name, inner })
    }

    /// Runs `task` after `initial_delay`, then again `delay` after each run finished,
    /// until the executor is disposed.
    pub fn schedule_with_fixed_delay<F, Fut>(
        &self,
        name: impl Into<String>,
        task: F,
        initial_delay: Duration,
        delay: Duration,
    ) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let handle = self.runtime(&name)?;
        self.counters.scheduled.fetch_add(1, Ordering::Relaxed);

        let executor = self.name.clone();
        let counters = Arc::clone(&self.counters);
        let cancel = self.shutdown.child_token();
        debug!(
            executor = %executor,
            task = %name,
            initial_delay_ms = initial_delay.as_millis() as u64,
            delay_ms = delay.as_millis() as u64,
            "task scheduled"
        );

        handle.spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(initial_delay) => {}
            }
            loop {
                if run_guarded(&executor, &name, &counters, task()).await.is_err() {
                    debug!(executor = %executor, task = %name, "rescheduling after failed run");
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            debug!(executor = %executor, task = %name, "schedule cancelled");
        });
        Ok(())
    }

    /// Cancels schedules and rejects further submissions. Idempotent.
    pub fn dispose(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        info!(executor = %self.name, "executor disposed");
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            scheduled: self.counters.scheduled.load(Ordering::Relaxed),
            runs: self.counters.runs.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for AsyncTaskExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTaskExecutor")
            .field("name", &self.name)
            .field("disposed", &self.is_disposed())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Drop for AsyncTaskExecutor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_guarded<F, T>(executor: &str, task: &str, counters: &Counters, body: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    counters.runs.fetch_add(1, Ordering::Relaxed);
    match AssertUnwindSafe(body).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            counters.failures.fetch_add(1, Ordering::Relaxed);
            warn!(executor, task, error = %err, "task failed");
            Err(err)
        }
        Err(panic) => {
            counters.failures.fetch_add(1, Ordering::Relaxed);
            let message = panic_message(panic.as_ref());
            error!(executor, task, panic = %message, "task panicked");
            Err(Error::fatal(format!("task panicked: {}", message)).with_context(
                ErrorContext::new()
                    .with_operation(task.to_string())
                    .with_source("executor"),
            ))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Result of a submitted task. Dropping it does not cancel the task.
#[derive(Debug)]
pub struct TaskFuture<T> {
    name: String,
    inner: JoinHandle<Result<T>>,
}

impl<T> TaskFuture<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

impl<T> Future for TaskFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.inner).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(join)) => {
                let err = if join.is_cancelled() {
                    Error::Disposed(format!("task {} was cancelled", self.name))
                } else {
                    Error::fatal(format!("task {} panicked", self.name))
                };
                Poll::Ready(Err(err))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[tokio::test]
    async fn submit_returns_result() {
        let executor = AsyncTaskExecutor::new("test");
        let value = executor.submit("answer", async { Ok(42) }).unwrap().await.unwrap();
        assert_eq!(value, 42);

        let err = executor
            .submit("fails", async { Err::<(), _>(Error::quota("limit")) })
            .unwrap()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Quota);
        assert_eq!(executor.stats().failures, 1);
    }

    #[tokio::test]
    async fn panics_surface_as_fatal() {
        let executor = AsyncTaskExecutor::new("test");
        let err = executor
            .submit("boom", async {
                if true {
                    panic!("kaboom");
                }
                Ok(())
            })
            .unwrap()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(err.to_string().contains("kaboom"));

        // Still usable afterwards.
        assert!(executor.submit("after", async { Ok(()) }).unwrap().await.is_ok());
    }

    #[tokio::test]
    async fn fixed_delay_counts_from_end_of_run() {
        let executor = AsyncTaskExecutor::new("test");
        let starts = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&starts);
        executor
            .schedule_with_fixed_delay(
                "tick",
                move || {
                    let recorded = Arc::clone(&recorded);
                    async move {
                        recorded.lock().unwrap().push(Instant::now());
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(())
                    }
                },
                Duration::ZERO,
                Duration::from_millis(20),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(180)).await;
        executor.dispose();

        let starts = starts.lock().unwrap().clone();
        assert!(starts.len() >= 2, "expected at least two runs, got {}", starts.len());
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(50));
        }
    }

    #[tokio::test]
    async fn failing_schedule_keeps_running() {
        let executor = AsyncTaskExecutor::new("test");
        let runs = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&runs);
        executor
            .schedule_with_fixed_delay(
                "flaky",
                move || {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n % 2 == 0 {
                            panic!("even run");
                        }
                        Err(Error::transient("odd run"))
                    }
                },
                Duration::ZERO,
                Duration::from_millis(5),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        executor.dispose();
        assert!(runs.load(Ordering::SeqCst) >= 3);
        assert_eq!(executor.stats().failures, executor.stats().runs);
    }

    #[tokio::test]
    async fn dispose_stops_schedules_and_rejects_work() {
        let executor = AsyncTaskExecutor::new("test");
        let runs = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&runs);
        executor
            .schedule_with_fixed_delay(
                "poll",
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
                Duration::ZERO,
                Duration::from_millis(10),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(35)).await;
        executor.dispose();
        executor.dispose();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let after_dispose = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_dispose);

        assert!(executor.is_disposed());
        assert!(matches!(
            executor.submit("late", async { Ok(()) }),
            Err(Error::Disposed(_))
        ));
        assert!(executor
            .schedule_with_fixed_delay("late", || async { Ok(()) }, Duration::ZERO, Duration::ZERO)
            .is_err());
    }

    #[tokio::test]
    async fn in_flight_run_finishes_after_dispose() {
        let executor = AsyncTaskExecutor::new("test");
        let task = executor
            .submit("slow", async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok("done")
            })
            .unwrap();
        executor.dispose();
        assert_eq!(task.await.unwrap(), "done");
    }
}
