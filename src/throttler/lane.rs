//! One dispatch lane: FIFO queue, in-flight ceiling, pacing and retries.

use super::signals::LaneSnapshot;
use super::task::{LaneKind, Task};
use crate::config::LaneConfig;
use crate::connector::ProviderApi;
use crate::resilience::rate_limiter::{RateLimiter, RateLimiterConfig};
use crate::resilience::retry::{Decision, RetryPolicy};
use crate::{Error, ErrorKind, Result};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Debug)]
struct Queue {
    pending: VecDeque<Task>,
    closed: bool,
}

#[derive(Debug, Default)]
struct Counters {
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    timed_out: AtomicU64,
}

#[derive(Debug)]
pub(crate) struct Lane {
    kind: LaneKind,
    max_in_flight: usize,
    queue: Mutex<Queue>,
    notify: Notify,
    permits: Arc<Semaphore>,
    limiter: RateLimiter,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    counters: Counters,
}

impl Lane {
    pub(crate) fn new(kind: LaneKind, config: &LaneConfig) -> Self {
        let max_in_flight = config.max_in_flight.max(1);
        let limiter = config
            .requests_per_second
            .and_then(RateLimiterConfig::from_rps)
            .unwrap_or_else(RateLimiterConfig::unlimited);
        Self {
            kind,
            max_in_flight,
            queue: Mutex::new(Queue {
                pending: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            permits: Arc::new(Semaphore::new(max_in_flight)),
            limiter: RateLimiter::new(limiter),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            counters: Counters::default(),
        }
    }

    fn queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append at the tail. Never blocks; a closed lane fails the task right away.
    pub(crate) fn push(&self, task: Task) {
        let rejected = {
            let mut queue = self.queue();
            if queue.closed {
                Some(task)
            } else {
                queue.pending.push_back(task);
                None
            }
        };
        match rejected {
            Some(task) => {
                let err = disposed(self.kind);
                task.complete(Err(err));
            }
            None => self.notify.notify_one(),
        }
    }

    fn push_front(&self, task: Task) {
        let rejected = {
            let mut queue = self.queue();
            if queue.closed {
                Some(task)
            } else {
                queue.pending.push_front(task);
                None
            }
        };
        if let Some(task) = rejected {
            task.complete(Err(disposed(self.kind)));
        }
    }

    fn pop(&self) -> Option<Task> {
        self.queue().pending.pop_front()
    }

    async fn next_task(&self) -> Task {
        loop {
            if let Some(task) = self.pop() {
                return task;
            }
            // notify_one stores a permit, so a push between pop() and here is not lost.
            self.notify.notified().await;
        }
    }

    /// Stop accepting work and fail everything still queued.
    pub(crate) fn close(&self) {
        let drained: Vec<Task> = {
            let mut queue = self.queue();
            queue.closed = true;
            queue.pending.drain(..).collect()
        };
        if !drained.is_empty() {
            debug!(lane = self.kind.name(), count = drained.len(), "failing queued tasks on shutdown");
        }
        for task in drained {
            task.complete(Err(disposed(self.kind)));
        }
    }

    /// Dispatch loop. Runs until `shutdown` fires; in-flight calls keep running after it exits.
    pub(crate) async fn run(
        self: Arc<Self>,
        api: Arc<dyn ProviderApi>,
        retry: Arc<RetryPolicy>,
        shutdown: CancellationToken,
    ) {
        loop {
            // Capacity first, then the oldest task: dispatch order stays FIFO.
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let task = tokio::select! {
                _ = shutdown.cancelled() => break,
                task = self.next_task() => task,
            };

            if task.is_expired() {
                self.expire(task);
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.push_front(task);
                    break;
                }
                _ = self.limiter.acquire() => {}
            }

            // The deadline may have passed while the lane was paced or held back.
            if task.is_expired() {
                self.expire(task);
                continue;
            }

            self.dispatch(task, permit, Arc::clone(&api), Arc::clone(&retry));
        }
        self.close();
        debug!(lane = self.kind.name(), "dispatch loop stopped");
    }

    fn expire(&self, task: Task) {
        self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
        debug!(
            lane = self.kind.name(),
            task_id = %task.id,
            operation = task.operation().name(),
            "task expired before dispatch"
        );
        let err = task.timeout_error();
        task.complete(Err(err));
    }

    fn dispatch(
        self: &Arc<Self>,
        task: Task,
        permit: OwnedSemaphorePermit,
        api: Arc<dyn ProviderApi>,
        retry: Arc<RetryPolicy>,
    ) {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        debug!(
            lane = self.kind.name(),
            task_id = %task.id,
            operation = task.operation().name(),
            attempt = task.attempt,
            in_flight = current,
            "dispatching task"
        );

        let lane = Arc::clone(self);
        tokio::spawn(async move {
            let started = Instant::now();
            let result = lane.invoke(api.as_ref(), &task).await;
            if let Some(budget) = api.rate_budget(lane.kind) {
                lane.limiter
                    .update_budget(budget.remaining, budget.reset_after)
                    .await;
            }
            // Counter drops before the permit so observers never see more than the ceiling.
            lane.in_flight.fetch_sub(1, Ordering::SeqCst);
            drop(permit);

            match result {
                Ok(value) => {
                    lane.counters.completed.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        lane = lane.kind.name(),
                        task_id = %task.id,
                        operation = task.operation().name(),
                        duration_ms = started.elapsed().as_millis() as u64,
                        "task completed"
                    );
                    task.complete(Ok(value));
                }
                Err(err) => lane.on_failure(task, err, &retry).await,
            }
        });
    }

    async fn invoke(&self, api: &dyn ProviderApi, task: &Task) -> Result<Value> {
        if task.is_expired() {
            return Err(task.timeout_error());
        }
        let call = api.execute(&task.request);
        match task.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, call).await {
                Ok(result) => result,
                Err(_) => Err(task.timeout_error()),
            },
            None => call.await,
        }
    }

    async fn on_failure(self: &Arc<Self>, mut task: Task, err: Error, retry: &RetryPolicy) {
        if let Some(backoff) = err.retry_after() {
            // Provider asked the whole lane to slow down, not just this task.
            self.limiter.block_for(backoff).await;
        }

        let decision = if task.is_expired() {
            Decision::Fail
        } else {
            retry.decide(&err, task.attempt)
        };

        match decision {
            Decision::Retry { delay } => {
                self.counters.retried.fetch_add(1, Ordering::Relaxed);
                warn!(
                    lane = self.kind.name(),
                    task_id = %task.id,
                    operation = task.operation().name(),
                    attempt = task.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "provider call failed, retrying"
                );
                task.attempt += 1;
                let lane = Arc::clone(self);
                tokio::spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    lane.push(task);
                });
            }
            Decision::Fail => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                match err.kind() {
                    ErrorKind::Timeout => {
                        self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            lane = self.kind.name(),
                            task_id = %task.id,
                            operation = task.operation().name(),
                            error = %err,
                            "task timed out"
                        );
                    }
                    ErrorKind::Fatal => error!(
                        lane = self.kind.name(),
                        task_id = %task.id,
                        operation = task.operation().name(),
                        attempt = task.attempt,
                        params = %task.request.params,
                        error = %err,
                        "task failed"
                    ),
                    _ => warn!(
                        lane = self.kind.name(),
                        task_id = %task.id,
                        operation = task.operation().name(),
                        attempt = task.attempt,
                        error = %err,
                        "task failed"
                    ),
                }
                task.complete(Err(err));
            }
        }
    }

    pub(crate) async fn snapshot(&self) -> LaneSnapshot {
        LaneSnapshot {
            lane: self.kind,
            max_in_flight: self.max_in_flight,
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
            queued: self.queue().pending.len(),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            rate_limiter: self.limiter.snapshot().await,
        }
    }
}

fn disposed(kind: LaneKind) -> Error {
    Error::Disposed(format!("{} lane is shut down", kind.name()))
}
