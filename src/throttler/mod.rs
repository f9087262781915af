//! Request throttler: two independent dispatch lanes in front of one provider account.
//!
//! Every provider call for a credential identity goes through exactly one [`Throttler`].
//! Reads (listing and describing instances, listing subscriptions) and actions
//! (start, restart, terminate) are queued in separate lanes so a burst of polls never
//! starves lifecycle requests, and vice versa.
//!
//! Each lane has:
//! - a FIFO queue; `execute_task` only appends and returns a [`TaskHandle`] right away
//! - an in-flight ceiling enforced by a semaphore
//! - a token bucket for the dispatch rate, tightened when the provider sends `retry_after`
//! - a dispatch loop started by [`Throttler::start`]
//!
//! Failed attempts are classified through [`ErrorKind`](crate::ErrorKind): transient ones go
//! back to the tail of the lane after an exponential backoff until the retry bound is
//! reached, everything else fails the handle. A task whose deadline passes fails with
//! `Timeout` and is never retried.

mod lane;
pub mod signals;
pub mod task;

pub use signals::{LaneSnapshot, ThrottlerSignals};
pub use task::{LaneKind, TaskHandle};

use crate::config::ThrottlerConfig;
use crate::connector::{Operation, ProviderApi, ProviderRequest};
use crate::resilience::retry::RetryPolicy;
use crate::{Error, ErrorContext, Result};
use lane::Lane;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use task::Task;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct Throttler {
    /// Log label for the owning identity; never contains secrets.
    label: String,
    config: ThrottlerConfig,
    read: Arc<Lane>,
    action: Arc<Lane>,
    api: Arc<dyn ProviderApi>,
    retry: Arc<RetryPolicy>,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl Throttler {
    /// Builds a throttler without starting it. Tasks submitted before [`start`](Self::start)
    /// wait in their lane.
    pub fn new(label: impl Into<String>, config: ThrottlerConfig, api: Arc<dyn ProviderApi>) -> Self {
        let read = Arc::new(Lane::new(LaneKind::Read, &config.read));
        let action = Arc::new(Lane::new(LaneKind::Action, &config.action));
        let retry = Arc::new(RetryPolicy::new(&config.retry));
        Self {
            label: label.into(),
            config,
            read,
            action,
            api,
            retry,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn config(&self) -> &ThrottlerConfig {
        &self.config
    }

    /// Spawns both dispatch loops on the current tokio runtime. Idempotent.
    pub fn start(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Disposed(format!("throttler {} is shut down", self.label)));
        }
        let handle = tokio::runtime::Handle::try_current().map_err(|e| {
            Error::configuration(format!("throttler needs a tokio runtime: {}", e)).with_context(
                ErrorContext::new()
                    .with_operation("start")
                    .with_resource(self.label.clone())
                    .with_source("throttler"),
            )
        })?;
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        for lane in [&self.read, &self.action] {
            handle.spawn(Arc::clone(lane).run(
                Arc::clone(&self.api),
                Arc::clone(&self.retry),
                self.shutdown.child_token(),
            ));
        }
        info!(
            identity = %self.label,
            provider = self.api.name(),
            read_max_in_flight = self.config.read.max_in_flight,
            action_max_in_flight = self.config.action.max_in_flight,
            "throttler started"
        );
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Queues `operation` with the configured default timeout.
    pub fn execute_task(&self, operation: Operation, params: Value) -> TaskHandle {
        self.submit(operation, params, self.config.task_timeout())
    }

    /// Queues `operation`; the handle fails with `Timeout` once `timeout` elapses from now.
    pub fn execute_task_with_timeout(
        &self,
        operation: Operation,
        params: Value,
        timeout: Duration,
    ) -> TaskHandle {
        self.submit(operation, params, Some(timeout))
    }

    fn submit(&self, operation: Operation, params: Value, timeout: Option<Duration>) -> TaskHandle {
        let (task, handle) = Task::new(ProviderRequest::new(operation, params), timeout);
        debug!(
            identity = %self.label,
            task_id = %task.id,
            operation = operation.name(),
            lane = operation.lane().name(),
            "task queued"
        );
        self.lane(operation.lane()).push(task);
        handle
    }

    fn lane(&self, kind: LaneKind) -> &Lane {
        match kind {
            LaneKind::Read => self.read.as_ref(),
            LaneKind::Action => self.action.as_ref(),
        }
    }

    pub async fn signals(&self) -> ThrottlerSignals {
        ThrottlerSignals {
            read: self.read.snapshot().await,
            action: self.action.snapshot().await,
        }
    }

    /// Stops both dispatch loops and fails every queued task with `Disposed`.
    ///
    /// Calls already handed to the provider run to completion. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.read.close();
        self.action.close();
        info!(identity = %self.label, "throttler shut down");
    }
}

impl fmt::Debug for Throttler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttler")
            .field("label", &self.label)
            .field("provider", &self.api.name())
            .field("started", &self.is_started())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl Drop for Throttler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LaneConfig, RetryConfig};
    use crate::ErrorKind;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct Echo {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ProviderApi for Echo {
        async fn execute(&self, request: &ProviderRequest) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!({
                "operation": request.operation.name(),
                "params": request.params,
            }))
        }
    }

    fn throttler() -> (Throttler, Arc<Echo>) {
        let api = Arc::new(Echo {
            calls: AtomicU32::new(0),
        });
        let config = ThrottlerConfig::new()
            .with_read(LaneConfig::new(2))
            .with_action(LaneConfig::new(1))
            .with_retry(RetryConfig::new(0));
        (Throttler::new("test", config, api.clone()), api)
    }

    #[tokio::test]
    async fn tasks_submitted_before_start_are_kept() {
        let (throttler, api) = throttler();
        let first = throttler.execute_task(Operation::ListInstances, serde_json::json!({"n": 1}));
        let second = throttler.execute_task(Operation::StartInstance, serde_json::json!({"n": 2}));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
        assert_eq!(throttler.signals().await.read.queued, 1);

        throttler.start().unwrap();
        assert_eq!(first.await.unwrap()["params"]["n"], 1);
        assert_eq!(second.await.unwrap()["operation"], "start_instance");
        assert_eq!(api.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let (throttler, _) = throttler();
        throttler.start().unwrap();
        throttler.start().unwrap();
        assert!(throttler.is_started());
        let value = throttler
            .execute_task(Operation::ListSubscriptions, Value::Null)
            .await
            .unwrap();
        assert_eq!(value["operation"], "list_subscriptions");
    }

    #[test]
    fn start_outside_runtime_is_rejected() {
        let (throttler, _) = throttler();
        let err = throttler.start().unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(!throttler.is_started());
    }

    #[tokio::test]
    async fn shutdown_fails_queued_and_new_tasks() {
        let (throttler, _) = throttler();
        let queued = throttler.execute_task(Operation::RestartInstance, Value::Null);
        throttler.shutdown();
        throttler.shutdown();

        assert!(matches!(queued.await, Err(Error::Disposed(_))));
        let late = throttler.execute_task(Operation::ListInstances, Value::Null);
        assert!(matches!(late.await, Err(Error::Disposed(_))));
        assert!(matches!(throttler.start(), Err(Error::Disposed(_))));
    }

    #[tokio::test]
    async fn timeout_applies_while_queued() {
        let (throttler, api) = throttler();
        let handle = throttler.execute_task_with_timeout(
            Operation::ListInstances,
            Value::Null,
            Duration::from_millis(10),
        );
        let err = handle.await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        // The expired task is discarded by the loop instead of being sent.
        throttler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
        assert_eq!(throttler.signals().await.read.timed_out, 1);
    }
}
