//! Scriptable in-memory provider.

use super::{Operation, ProviderApi, ProviderRequest, RateBudget};
use crate::throttler::LaneKind;
use crate::types::{CloudInstance, ImageDetails, InstanceStatus, InstanceUserData, Subscription};
use crate::{Error, ErrorContext, ErrorKind, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderCall {
    pub operation: Operation,
    pub params: Value,
}

#[derive(Debug, Clone)]
struct Fault {
    operation: Option<Operation>,
    kind: ErrorKind,
    message: String,
    retry_after: Option<Duration>,
}

impl Fault {
    fn matches(&self, operation: Operation) -> bool {
        self.operation.map_or(true, |op| op == operation)
    }

    fn to_error(&self, operation: Operation) -> Error {
        let err = match (self.kind, self.retry_after) {
            (ErrorKind::Transient, Some(after)) => Error::throttled(self.message.clone(), after),
            (kind, _) => Error::from_kind(kind, self.message.clone()),
        };
        err.with_context(
            ErrorContext::new()
                .with_operation(operation.name())
                .with_source("in_memory"),
        )
    }
}

/// Fixed request window per lane, refilled once a call arrives after it ran out.
#[derive(Debug, Clone, Copy)]
struct BudgetWindow {
    limit: u64,
    left: u64,
    reset_after: Duration,
}

#[derive(Debug, Default)]
struct State {
    instances: HashMap<String, BTreeMap<String, CloudInstance>>,
    subscriptions: Vec<Subscription>,
    faults: VecDeque<Fault>,
    failing_images: HashSet<String>,
    latency: Duration,
    calls: Vec<ProviderCall>,
    budgets: HashMap<LaneKind, BudgetWindow>,
}

/// [`ProviderApi`] backed by an in-process instance table.
///
/// Used by the tests and the simulator binary. Besides serving the operations it can
/// add latency, fail the next calls with a chosen [`ErrorKind`] or raw provider error,
/// keep failing listings of one image and report a per-lane request budget. It records
/// every call plus the highest number of concurrent calls seen.
#[derive(Debug, Default)]
pub struct InMemoryProvider {
    state: Mutex<State>,
    next_id: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    pub fn with_subscriptions(self, subscriptions: Vec<Subscription>) -> Self {
        self.state().subscriptions = subscriptions;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Adds or replaces an instance as if it had been created outside this client.
    pub fn add_instance(&self, instance: CloudInstance) {
        self.state()
            .instances
            .entry(instance.image_id.clone())
            .or_default()
            .insert(instance.id.clone(), instance);
    }

    pub fn remove_instance(&self, image_id: &str, instance_id: &str) -> Option<CloudInstance> {
        self.state()
            .instances
            .get_mut(image_id)
            .and_then(|m| m.remove(instance_id))
    }

    pub fn set_status(&self, image_id: &str, instance_id: &str, status: InstanceStatus) -> bool {
        match self
            .state()
            .instances
            .get_mut(image_id)
            .and_then(|m| m.get_mut(instance_id))
        {
            Some(instance) => {
                instance.status = status;
                true
            }
            None => false,
        }
    }

    pub fn instances(&self, image_id: &str) -> Vec<CloudInstance> {
        self.state()
            .instances
            .get(image_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Fails the next matching call (`None` matches any operation) with `kind`.
    pub fn inject_fault(&self, operation: Option<Operation>, kind: ErrorKind, message: impl Into<String>) {
        self.state().faults.push_back(Fault {
            operation,
            kind,
            message: message.into(),
            retry_after: None,
        });
    }

    /// Fails the next matching call with a provider error code such as `QuotaExceeded`.
    ///
    /// Unknown codes are fatal.
    pub fn inject_provider_error(
        &self,
        operation: Option<Operation>,
        code: &str,
        message: impl Into<String>,
    ) {
        self.inject_fault(operation, ErrorKind::from_error_class(code), message);
    }

    /// Fails the next matching call as if the provider answered with HTTP `status`.
    pub fn inject_http_error(&self, operation: Option<Operation>, status: u16, message: impl Into<String>) {
        self.inject_fault(operation, ErrorKind::from_http_status(status), message);
    }

    /// Reports a budget of `limit` calls per window on `lane`.
    ///
    /// After the last call of a window the reported budget is zero with `reset_after`.
    /// The next call opens a fresh window.
    pub fn set_rate_budget(&self, lane: LaneKind, limit: u64, reset_after: Duration) {
        self.state().budgets.insert(
            lane,
            BudgetWindow {
                limit,
                left: limit,
                reset_after,
            },
        );
    }

    /// Fails the next matching call with a throttling response carrying `retry_after`.
    pub fn inject_throttle(&self, operation: Option<Operation>, retry_after: Duration) {
        self.state().faults.push_back(Fault {
            operation,
            kind: ErrorKind::Transient,
            message: "too many requests".to_string(),
            retry_after: Some(retry_after),
        });
    }

    /// Every listing of `image_id` fails with `Fatal` until [`heal_image`](Self::heal_image).
    pub fn fail_image(&self, image_id: impl Into<String>) {
        self.state().failing_images.insert(image_id.into());
    }

    pub fn heal_image(&self, image_id: &str) {
        self.state().failing_images.remove(image_id);
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, operation: Operation) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn serve(&self, request: &ProviderRequest) -> Result<Value> {
        let mut state = self.state();
        if let Some(pos) = state.faults.iter().position(|f| f.matches(request.operation)) {
            if let Some(fault) = state.faults.remove(pos) {
                return Err(fault.to_error(request.operation));
            }
        }

        let image_id = request
            .param_str("image_id")
            .map(str::to_string)
            .or_else(|| {
                request
                    .params
                    .get("image")
                    .and_then(|i| i.get("id"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });

        match request.operation {
            Operation::ListInstances => {
                let image_id = required(image_id, request.operation, "image_id")?;
                if state.failing_images.contains(&image_id) {
                    return Err(Error::fatal(format!("image {} is unavailable", image_id))
                        .with_context(
                            ErrorContext::new()
                                .with_operation(request.operation.name())
                                .with_resource(image_id)
                                .with_source("in_memory"),
                        ));
                }
                let listed: Vec<&CloudInstance> = state
                    .instances
                    .get(&image_id)
                    .map(|m| m.values().collect())
                    .unwrap_or_default();
                Ok(serde_json::to_value(listed)?)
            }
            Operation::DescribeInstance => {
                let image_id = required(image_id, request.operation, "image_id")?;
                let instance_id = required(
                    request.param_str("instance_id").map(str::to_string),
                    request.operation,
                    "instance_id",
                )?;
                let found = state
                    .instances
                    .get(&image_id)
                    .and_then(|m| m.get(&instance_id));
                Ok(serde_json::to_value(found)?)
            }
            Operation::ListSubscriptions => Ok(serde_json::to_value(&state.subscriptions)?),
            Operation::StartInstance => {
                let image: ImageDetails = match request.params.get("image") {
                    Some(raw) => serde_json::from_value(raw.clone())?,
                    None => ImageDetails::new(required(image_id, request.operation, "image")?),
                };
                let user_data: InstanceUserData = match request.params.get("user_data") {
                    Some(raw) => serde_json::from_value(raw.clone())?,
                    None => InstanceUserData::default(),
                };
                let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                let mut instance = CloudInstance::new(
                    format!("{}-{}", image.id, n),
                    image.id.clone(),
                    InstanceStatus::Starting,
                );
                if let Some(agent) = user_data.agent_name {
                    instance.name = agent;
                }
                state
                    .instances
                    .entry(image.id.clone())
                    .or_default()
                    .insert(instance.id.clone(), instance.clone());
                Ok(serde_json::to_value(instance)?)
            }
            Operation::RestartInstance | Operation::TerminateInstance => {
                let image_id = required(image_id, request.operation, "image_id")?;
                let instance_id = required(
                    request.param_str("instance_id").map(str::to_string),
                    request.operation,
                    "instance_id",
                )?;
                let instances = state.instances.entry(image_id).or_default();
                let known = if request.operation == Operation::TerminateInstance {
                    instances.remove(&instance_id).is_some()
                } else {
                    match instances.get_mut(&instance_id) {
                        Some(instance) => {
                            instance.status = InstanceStatus::Restarting;
                            true
                        }
                        None => false,
                    }
                };
                if known {
                    Ok(Value::Null)
                } else {
                    Err(Error::fatal(format!("instance {} not found", instance_id)).with_context(
                        ErrorContext::new()
                            .with_operation(request.operation.name())
                            .with_resource(instance_id)
                            .with_source("in_memory"),
                    ))
                }
            }
        }
    }
}

fn required(value: Option<String>, operation: Operation, name: &str) -> Result<String> {
    value.ok_or_else(|| {
        Error::fatal(format!("missing parameter `{}`", name)).with_context(
            ErrorContext::new()
                .with_operation(operation.name())
                .with_source("in_memory"),
        )
    })
}

#[async_trait]
impl ProviderApi for InMemoryProvider {
    async fn execute(&self, request: &ProviderRequest) -> Result<Value> {
        let latency = {
            let mut state = self.state();
            state.calls.push(ProviderCall {
                operation: request.operation,
                params: request.params.clone(),
            });
            if let Some(window) = state.budgets.get_mut(&request.operation.lane()) {
                if window.left == 0 {
                    window.left = window.limit;
                }
                window.left = window.left.saturating_sub(1);
            }
            state.latency
        };

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.serve(request)
    }

    fn rate_budget(&self, lane: LaneKind) -> Option<RateBudget> {
        self.state()
            .budgets
            .get(&lane)
            .map(|w| RateBudget::new(w.left, Some(w.reset_after)))
    }

    fn name(&self) -> &str {
        "in_memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn list(image_id: &str) -> ProviderRequest {
        ProviderRequest::new(Operation::ListInstances, json!({ "image_id": image_id }))
    }

    #[tokio::test]
    async fn faults_are_consumed_in_order() {
        let provider = InMemoryProvider::new();
        provider.inject_fault(Some(Operation::StartInstance), ErrorKind::Quota, "cores");
        provider.inject_throttle(None, Duration::from_millis(250));

        let err = provider.execute(&list("img")).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_millis(250)));

        assert_eq!(provider.execute(&list("img")).await.unwrap(), json!([]));

        let start = ProviderRequest::new(Operation::StartInstance, json!({ "image_id": "img" }));
        assert_eq!(provider.execute(&start).await.unwrap_err().kind(), ErrorKind::Quota);
        assert!(provider.execute(&start).await.is_ok());
        assert_eq!(provider.call_count(Operation::ListInstances), 2);
    }

    #[tokio::test]
    async fn raw_provider_errors_are_classified() {
        let provider = InMemoryProvider::new();
        provider.inject_provider_error(None, "QuotaExceeded", "cores");
        provider.inject_provider_error(None, "AuthorizationFailed", "denied");
        provider.inject_http_error(None, 503, "busy");
        provider.inject_http_error(None, 504, "gateway");

        let mut kinds = Vec::new();
        for _ in 0..4 {
            kinds.push(provider.execute(&list("img")).await.unwrap_err().kind());
        }
        assert_eq!(
            kinds,
            vec![ErrorKind::Quota, ErrorKind::Fatal, ErrorKind::Transient, ErrorKind::Timeout]
        );
    }

    #[tokio::test]
    async fn budget_window_counts_down_and_refills() {
        let provider = InMemoryProvider::new();
        provider.set_rate_budget(LaneKind::Read, 2, Duration::from_millis(100));
        assert_eq!(provider.rate_budget(LaneKind::Read).unwrap().remaining, 2);
        assert_eq!(provider.rate_budget(LaneKind::Action), None);

        provider.execute(&list("img")).await.unwrap();
        provider.execute(&list("img")).await.unwrap();
        let budget = provider.rate_budget(LaneKind::Read).unwrap();
        assert_eq!(budget, RateBudget::new(0, Some(Duration::from_millis(100))));

        provider.execute(&list("img")).await.unwrap();
        assert_eq!(provider.rate_budget(LaneKind::Read).unwrap().remaining, 1);
    }

    #[tokio::test]
    async fn failing_image_keeps_failing_until_healed() {
        let provider = InMemoryProvider::new();
        provider.add_instance(CloudInstance::new("vm-1", "img", InstanceStatus::Running));
        provider.fail_image("img");
        assert_eq!(provider.execute(&list("img")).await.unwrap_err().kind(), ErrorKind::Fatal);
        assert!(provider.execute(&list("img")).await.is_err());

        provider.heal_image("img");
        let listed = provider.execute(&list("img")).await.unwrap();
        assert_eq!(listed[0]["id"], "vm-1");
    }

    #[tokio::test]
    async fn unknown_instance_is_fatal() {
        let provider = InMemoryProvider::new();
        let restart = ProviderRequest::new(
            Operation::RestartInstance,
            json!({ "image_id": "img", "instance_id": "nope" }),
        );
        let err = provider.execute(&restart).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(err.to_string().contains("nope"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn tracks_concurrency_high_water_mark() {
        let provider = std::sync::Arc::new(InMemoryProvider::new().with_latency(Duration::from_millis(30)));
        let calls: Vec<_> = (0..3)
            .map(|_| {
                let provider = provider.clone();
                tokio::spawn(async move { provider.execute(&list("img")).await })
            })
            .collect();
        for call in calls {
            call.await.unwrap().unwrap();
        }
        assert_eq!(provider.peak_in_flight(), 3);
        assert_eq!(provider.in_flight(), 0);
    }
}
