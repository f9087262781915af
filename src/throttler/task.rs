//! Throttled tasks and the handles returned to callers.

use crate::connector::{Operation, ProviderRequest};
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{Instant, Sleep};
use uuid::Uuid;

/// One of the two independent queues of a throttler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneKind {
    /// Queries: list/describe instances, list subscriptions.
    Read,
    /// Mutations: start/restart/terminate.
    Action,
}

impl LaneKind {
    pub fn name(&self) -> &'static str {
        match self {
            LaneKind::Read => "read",
            LaneKind::Action => "action",
        }
    }
}

impl fmt::Display for LaneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A submitted unit of work. Only `attempt` changes after submission.
#[derive(Debug)]
pub(crate) struct Task {
    pub(crate) id: Uuid,
    pub(crate) request: ProviderRequest,
    pub(crate) attempt: u32,
    pub(crate) deadline: Option<Instant>,
    timeout: Option<Duration>,
    /// Set by the handle once its deadline fired; the lane must not run or retry the task.
    abandoned: Arc<AtomicBool>,
    reply: oneshot::Sender<Result<Value>>,
}

impl Task {
    pub(crate) fn new(request: ProviderRequest, timeout: Option<Duration>) -> (Task, TaskHandle) {
        let (reply, rx) = oneshot::channel();
        let abandoned = Arc::new(AtomicBool::new(false));
        let deadline = timeout.map(|t| Instant::now() + t);
        let id = Uuid::new_v4();
        let handle = TaskHandle {
            id,
            operation: request.operation,
            rx,
            deadline,
            sleep: None,
            timeout,
            abandoned: Arc::clone(&abandoned),
        };
        let task = Task {
            id,
            request,
            attempt: 0,
            deadline,
            timeout,
            abandoned,
            reply,
        };
        (task, handle)
    }

    pub(crate) fn operation(&self) -> Operation {
        self.request.operation
    }

    /// Deadline passed or the caller's handle already gave up.
    pub(crate) fn is_expired(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
            || self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    pub(crate) fn context(&self) -> ErrorContext {
        ErrorContext::new()
            .with_operation(self.request.operation.name())
            .with_source("throttler")
            .with_details(format!("task {} attempt {}", self.id, self.attempt))
    }

    pub(crate) fn timeout_error(&self) -> Error {
        Error::timeout(self.timeout.unwrap_or_default()).with_context(self.context())
    }

    /// Deliver the result; returns `false` when nobody is waiting anymore.
    pub(crate) fn complete(self, result: Result<Value>) -> bool {
        self.reply.send(result).is_ok()
    }
}

/// Pending result of a throttled task.
///
/// Resolves with the provider's reply, the terminal error, or a `Timeout` error once the
/// task's deadline elapses. Dropping the handle does not cancel the task.
#[derive(Debug)]
pub struct TaskHandle {
    id: Uuid,
    operation: Operation,
    rx: oneshot::Receiver<Result<Value>>,
    deadline: Option<Instant>,
    sleep: Option<Pin<Box<Sleep>>>,
    timeout: Option<Duration>,
    abandoned: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl Future for TaskHandle {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Poll::Ready(received) = Pin::new(&mut this.rx).poll(cx) {
            return Poll::Ready(received.unwrap_or_else(|_| {
                Err(Error::fatal("task dropped before completion").with_context(
                    ErrorContext::new()
                        .with_operation(this.operation.name())
                        .with_source("throttler"),
                ))
            }));
        }

        if let Some(deadline) = this.deadline {
            // Created lazily so handles can be built outside a runtime context.
            let sleep = this
                .sleep
                .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deadline)));
            if sleep.as_mut().poll(cx).is_ready() {
                this.abandoned.store(true, Ordering::Release);
                return Poll::Ready(Err(Error::timeout(this.timeout.unwrap_or_default())
                    .with_context(
                        ErrorContext::new()
                            .with_operation(this.operation.name())
                            .with_source("throttler")
                            .with_details(format!("task {}", this.id)),
                    )));
            }
        }

        Poll::Pending
    }
}
