use super::image::CloudImage;
use super::reconcile::{ImageMap, ReconcileReport, UpdateInstancesTask};
use crate::connector::CloudApiConnector;
use crate::error_provider::{CloudErrorMap, ErrorInfo, ErrorRecord, UpdatableErrorProvider};
use crate::executor::{AsyncTaskExecutor, ExecutorStats, TaskFuture};
use crate::types::{CloudInstance, ImageDetails, InstanceUserData, Subscription};
use crate::{Error, ErrorContext, ErrorKind, Result};
use arc_swap::ArcSwap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{info, warn};

/// Lifecycle of a [`CloudClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Uninitialized,
    Populating,
    Initialized,
    Disposed,
}

impl ClientState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ClientState::Uninitialized,
            1 => ClientState::Populating,
            2 => ClientState::Initialized,
            _ => ClientState::Disposed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ClientState::Uninitialized => 0,
            ClientState::Populating => 1,
            ClientState::Initialized => 2,
            ClientState::Disposed => 3,
        }
    }
}

/// Cloud session for one profile: image registry, lifecycle operations and the
/// background reconciliation loop.
///
/// The image map is swapped in whole, so readers see either no images or all of them.
/// The executor driving reconciliation belongs to the client and is torn down by
/// [`dispose`](Self::dispose); the throttler behind the connector is shared and stays up.
pub struct CloudClient {
    profile: String,
    connector: Arc<dyn CloudApiConnector>,
    reconcile_interval: Duration,
    executor: AsyncTaskExecutor,
    images: Arc<ArcSwap<ImageMap>>,
    errors: Arc<CloudErrorMap>,
    state: AtomicU8,
    reconciler: OnceLock<Arc<UpdateInstancesTask>>,
}

impl CloudClient {
    pub(crate) fn new(
        profile: String,
        connector: Arc<dyn CloudApiConnector>,
        reconcile_interval: Duration,
        errors: CloudErrorMap,
    ) -> Self {
        Self {
            executor: AsyncTaskExecutor::new(profile.clone()),
            profile,
            connector,
            reconcile_interval,
            images: Arc::new(ArcSwap::from_pointee(BTreeMap::new())),
            errors: Arc::new(errors),
            state: AtomicU8::new(ClientState::Uninitialized.as_u8()),
            reconciler: OnceLock::new(),
        }
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn reconcile_interval(&self) -> Duration {
        self.reconcile_interval
    }

    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == ClientState::Initialized
    }

    pub fn is_disposed(&self) -> bool {
        self.state() == ClientState::Disposed
    }

    fn transition(&self, from: ClientState, to: ClientState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Builds the image map, runs the first reconciliation pass, marks the client
    /// initialized and schedules the recurring pass.
    ///
    /// Empty or duplicate image ids are skipped and reported through the error provider.
    /// Can only run once per client.
    pub async fn populate_images(&self, details: Vec<ImageDetails>) -> Result<ReconcileReport> {
        if !self.transition(ClientState::Uninitialized, ClientState::Populating) {
            return Err(match self.state() {
                ClientState::Disposed => self.disposed_error(),
                state => Error::configuration(format!(
                    "cloud profile '{}' cannot be populated while {:?}",
                    self.profile, state
                ))
                .with_context(self.context("populate_images")),
            });
        }

        let (map, setup_errors) = self.build_images(details);
        let image_count = map.len();
        let rejected = setup_errors.len();
        self.images.store(Arc::new(map));

        let reconciler = Arc::clone(self.reconciler.get_or_init(|| {
            Arc::new(UpdateInstancesTask::new(
                self.profile.clone(),
                Arc::clone(&self.images),
                Arc::clone(&self.errors),
                setup_errors,
            ))
        }));
        // Initialized only once every image holds its first listing, failed or not.
        let report = reconciler.run().await;
        if !self.transition(ClientState::Populating, ClientState::Initialized) {
            return Err(self.disposed_error());
        }
        info!(
            profile = %self.profile,
            images = image_count,
            rejected,
            failed_images = report.failed_images.len(),
            "cloud profile initialized"
        );

        let scheduled = Arc::clone(&reconciler);
        self.executor.schedule_with_fixed_delay(
            "update instances",
            move || {
                let task = Arc::clone(&scheduled);
                async move {
                    task.run().await;
                    Ok(())
                }
            },
            self.reconcile_interval,
            self.reconcile_interval,
        )?;
        Ok(report)
    }

    /// Runs [`populate_images`](Self::populate_images) on the client's executor.
    pub fn populate_images_async(
        self: &Arc<Self>,
        details: Vec<ImageDetails>,
    ) -> Result<TaskFuture<ReconcileReport>> {
        let client = Arc::clone(self);
        self.executor.submit("populate images", async move {
            client.populate_images(details).await
        })
    }

    fn build_images(&self, details: Vec<ImageDetails>) -> (ImageMap, Vec<ErrorRecord>) {
        let mut map = ImageMap::new();
        let mut errors = Vec::new();
        for mut detail in details {
            let id = detail.id.trim().to_string();
            if id.is_empty() {
                warn!(profile = %self.profile, "skipping image without id");
                errors.push(ErrorRecord::new(ErrorKind::Fatal, "image details without id"));
                continue;
            }
            if map.contains_key(&id) {
                warn!(profile = %self.profile, image_id = %id, "skipping duplicate image");
                errors.push(
                    ErrorRecord::new(ErrorKind::Fatal, format!("duplicate image id {}", id))
                        .with_details(format!("image {} is configured more than once", id)),
                );
                continue;
            }
            detail.id = id.clone();
            let image = CloudImage::new(detail, Arc::clone(&self.connector));
            map.insert(id, Arc::new(image));
        }
        (map, errors)
    }

    /// Runs a reconciliation pass now, outside the schedule.
    pub async fn reconcile_now(&self) -> Result<ReconcileReport> {
        self.ensure_active()?;
        match self.reconciler.get() {
            Some(reconciler) => Ok(reconciler.run().await),
            None => Err(Error::configuration("cloud client is not initialized")
                .with_context(self.context("reconcile"))),
        }
    }

    pub fn reconcile_passes(&self) -> u64 {
        self.reconciler.get().map_or(0, |r| r.passes())
    }

    pub fn find_image_by_id(&self, image_id: &str) -> Option<Arc<CloudImage>> {
        self.images.load().get(image_id).cloned()
    }

    /// Snapshot of all images, ordered by id.
    pub fn images(&self) -> Vec<Arc<CloudImage>> {
        self.images.load().values().cloned().collect()
    }

    pub fn find_instance_by_id(&self, instance_id: &str) -> Option<CloudInstance> {
        self.images
            .load()
            .values()
            .find_map(|image| image.find_instance(instance_id))
    }

    fn image(&self, image_id: &str) -> Result<Arc<CloudImage>> {
        self.ensure_active()?;
        self.find_image_by_id(image_id)
            .ok_or_else(|| Error::NotFound(format!("image {} in profile {}", image_id, self.profile)))
    }

    pub fn can_start_new_instance(&self, image_id: &str) -> bool {
        !self.is_disposed()
            && self
                .find_image_by_id(image_id)
                .map_or(false, |image| image.can_start_new_instance())
    }

    pub async fn start_new_instance(
        &self,
        image_id: &str,
        user_data: &InstanceUserData,
    ) -> Result<CloudInstance> {
        self.image(image_id)?.start_new_instance(user_data).await
    }

    pub async fn restart_instance(&self, instance: &CloudInstance) -> Result<()> {
        self.image(&instance.image_id)?.restart_instance(instance).await
    }

    pub async fn terminate_instance(&self, instance: &CloudInstance) -> Result<()> {
        self.image(&instance.image_id)?.terminate_instance(instance).await
    }

    /// Subscriptions visible to the profile's credentials, read through the read lane.
    pub async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        self.ensure_active()?;
        self.connector.list_subscriptions().await
    }

    pub fn executor_stats(&self) -> ExecutorStats {
        self.executor.stats()
    }

    /// Cancels reconciliation and rejects further work. Idempotent.
    pub fn dispose(&self) {
        let previous = self.state.swap(ClientState::Disposed.as_u8(), Ordering::AcqRel);
        if previous == ClientState::Disposed.as_u8() {
            return;
        }
        self.executor.dispose();
        info!(profile = %self.profile, "cloud client disposed");
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(self.disposed_error());
        }
        Ok(())
    }

    fn disposed_error(&self) -> Error {
        Error::Disposed(format!("cloud client for profile '{}'", self.profile))
    }

    fn context(&self, operation: &str) -> ErrorContext {
        ErrorContext::new()
            .with_operation(operation.to_string())
            .with_resource(self.profile.clone())
            .with_source("cloud_client")
    }
}

impl UpdatableErrorProvider for CloudClient {
    fn update_errors(&self, errors: Vec<ErrorRecord>) {
        self.errors.update_errors(errors);
    }

    fn error_info(&self) -> Option<ErrorInfo> {
        self.errors.error_info()
    }
}

impl fmt::Debug for CloudClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudClient")
            .field("profile", &self.profile)
            .field("state", &self.state())
            .field("images", &self.images.load().len())
            .field("reconcile_interval", &self.reconcile_interval)
            .finish_non_exhaustive()
    }
}
