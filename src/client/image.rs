//! Provisionable images and their instance sets.

use crate::connector::CloudApiConnector;
use crate::error_provider::ErrorRecord;
use crate::types::{CloudInstance, ImageDetails, InstanceUserData};
use crate::{Error, ErrorContext, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::info;

/// Changes applied to one image by a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImageDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

impl ImageDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

/// One provisionable template and the instances the provider reports for it.
///
/// After initialization the instance set is written only by reconciliation. Lifecycle
/// calls return once the provider accepted them and leave the set alone; instances they
/// start are counted as pending against `max_instances` until a listing shows them.
pub struct CloudImage {
    details: ImageDetails,
    connector: Arc<dyn CloudApiConnector>,
    instances: RwLock<BTreeMap<String, CloudInstance>>,
    /// Started instance id -> listing generation at the time the start was accepted.
    pending: Mutex<HashMap<String, u64>>,
    generation: AtomicU64,
    error: RwLock<Option<ErrorRecord>>,
}

impl CloudImage {
    pub fn new(details: ImageDetails, connector: Arc<dyn CloudApiConnector>) -> Self {
        Self {
            details,
            connector,
            instances: RwLock::new(BTreeMap::new()),
            pending: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            error: RwLock::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.details.id
    }

    pub fn name(&self) -> &str {
        self.details.display_name()
    }

    pub fn details(&self) -> &ImageDetails {
        &self.details
    }

    /// Snapshot of the current instance set, ordered by id.
    pub fn instances(&self) -> Vec<CloudInstance> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn instance_count(&self) -> usize {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn find_instance(&self, instance_id: &str) -> Option<CloudInstance> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instance_id)
            .cloned()
    }

    pub(crate) fn contains_instance(&self, instance_id: &str) -> bool {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(instance_id)
    }

    /// Last listing error of this image, cleared by the next successful listing.
    pub fn error(&self) -> Option<ErrorRecord> {
        self.error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_error(&self, error: Option<ErrorRecord>) {
        *self.error.write().unwrap_or_else(PoisonError::into_inner) = error;
    }

    /// Active instances plus accepted starts not yet seen in a listing.
    pub fn active_instance_count(&self) -> usize {
        let instances = self.instances.read().unwrap_or_else(PoisonError::into_inner);
        let active = instances.values().filter(|i| i.status.is_active()).count();
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|id| !instances.contains_key(*id))
            .count();
        active + pending
    }

    /// Whether a new instance fits under `max_instances` and the image is not in error.
    pub fn can_start_new_instance(&self) -> bool {
        if self.error().is_some() {
            return false;
        }
        match self.details.max_instances {
            Some(max) => self.active_instance_count() < max,
            None => true,
        }
    }

    pub async fn start_new_instance(&self, user_data: &InstanceUserData) -> Result<CloudInstance> {
        if let Some(record) = self.error() {
            return Err(Error::fatal(format!(
                "image {} is unavailable: {}",
                self.id(),
                record.message
            ))
            .with_context(self.context("start_instance")));
        }
        if !self.can_start_new_instance() {
            return Err(Error::quota(format!(
                "image {} reached its limit of {} instances",
                self.id(),
                self.details.max_instances.unwrap_or_default()
            ))
            .with_context(self.context("start_instance")));
        }

        let instance = self
            .connector
            .start_instance(&self.details, user_data)
            .await
            .map_err(|e| e.with_context(self.context("start_instance")))?;
        let generation = self.generation.load(Ordering::Acquire);
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(instance.id.clone(), generation);
        info!(
            image_id = self.id(),
            instance_id = %instance.id,
            "instance start accepted"
        );
        Ok(instance)
    }

    pub async fn restart_instance(&self, instance: &CloudInstance) -> Result<()> {
        self.ensure_owned(instance, "restart_instance")?;
        self.connector
            .restart_instance(instance)
            .await
            .map_err(|e| e.with_context(self.context("restart_instance")))?;
        info!(image_id = self.id(), instance_id = %instance.id, "instance restart accepted");
        Ok(())
    }

    pub async fn terminate_instance(&self, instance: &CloudInstance) -> Result<()> {
        self.ensure_owned(instance, "terminate_instance")?;
        self.connector
            .terminate_instance(instance)
            .await
            .map_err(|e| e.with_context(self.context("terminate_instance")))?;
        info!(image_id = self.id(), instance_id = %instance.id, "instance termination accepted");
        Ok(())
    }

    fn ensure_owned(&self, instance: &CloudInstance, operation: &str) -> Result<()> {
        if instance.image_id != self.details.id || !self.contains_instance(&instance.id) {
            return Err(Error::NotFound(format!(
                "instance {} in image {} ({})",
                instance.id,
                self.id(),
                operation
            )));
        }
        Ok(())
    }

    fn context(&self, operation: &str) -> ErrorContext {
        ErrorContext::new()
            .with_operation(operation.to_string())
            .with_resource(self.details.id.clone())
            .with_source("cloud_image")
    }

    pub(crate) fn connector(&self) -> &Arc<dyn CloudApiConnector> {
        &self.connector
    }

    /// Marks the start of a listing; returns the generation the result must be applied with.
    pub(crate) fn begin_listing(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Replaces the instance set with `observed`, a listing begun at `generation`.
    pub(crate) fn apply_listing(&self, generation: u64, observed: Vec<CloudInstance>) -> ImageDiff {
        let mut diff = ImageDiff::default();
        let mut instances = self.instances.write().unwrap_or_else(PoisonError::into_inner);

        let mut seen = BTreeMap::new();
        for instance in observed {
            seen.insert(instance.id.clone(), instance);
        }

        instances.retain(|id, _| {
            let keep = seen.contains_key(id);
            if !keep {
                diff.removed.push(id.clone());
            }
            keep
        });
        for (id, instance) in seen {
            match instances.get_mut(&id) {
                Some(existing) if *existing == instance => {}
                Some(existing) => {
                    *existing = instance;
                    diff.updated.push(id);
                }
                None => {
                    instances.insert(id.clone(), instance);
                    diff.added.push(id);
                }
            }
        }

        // A start accepted before this listing began must be reflected by it.
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|id, accepted_at| !instances.contains_key(id) && *accepted_at >= generation);
        diff
    }
}

impl fmt::Debug for CloudImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudImage")
            .field("id", &self.details.id)
            .field("instances", &self.instance_count())
            .field("max_instances", &self.details.max_instances)
            .field("error", &self.error())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InstanceStatus, Subscription};
    use crate::ErrorKind;
    use async_trait::async_trait;

    /// Accepts every call without touching any state.
    struct Accepting;

    #[async_trait]
    impl CloudApiConnector for Accepting {
        async fn fetch_instances(&self, _image: &ImageDetails) -> Result<Vec<CloudInstance>> {
            Ok(Vec::new())
        }

        async fn describe_instance(&self, _: &str, _: &str) -> Result<Option<CloudInstance>> {
            Ok(None)
        }

        async fn start_instance(
            &self,
            image: &ImageDetails,
            _user_data: &InstanceUserData,
        ) -> Result<CloudInstance> {
            Ok(CloudInstance::new("new-1", image.id.clone(), InstanceStatus::Starting))
        }

        async fn restart_instance(&self, _instance: &CloudInstance) -> Result<()> {
            Ok(())
        }

        async fn terminate_instance(&self, _instance: &CloudInstance) -> Result<()> {
            Ok(())
        }

        async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
            Ok(Vec::new())
        }
    }

    fn image(max: usize) -> CloudImage {
        CloudImage::new(ImageDetails::new("img").with_max_instances(max), Arc::new(Accepting))
    }

    fn vm(id: &str, status: InstanceStatus) -> CloudInstance {
        CloudInstance::new(id, "img", status)
    }

    #[test]
    fn listing_diff() {
        let image = image(5);
        let g = image.begin_listing();
        let diff = image.apply_listing(
            g,
            vec![vm("a", InstanceStatus::Running), vm("b", InstanceStatus::Starting)],
        );
        assert_eq!(diff.added, vec!["a", "b"]);

        let g = image.begin_listing();
        let diff = image.apply_listing(
            g,
            vec![vm("b", InstanceStatus::Running), vm("c", InstanceStatus::Starting)],
        );
        assert_eq!(diff.removed, vec!["a"]);
        assert_eq!(diff.updated, vec!["b"]);
        assert_eq!(diff.added, vec!["c"]);

        let g = image.begin_listing();
        assert!(image
            .apply_listing(g, vec![vm("b", InstanceStatus::Running), vm("c", InstanceStatus::Starting)])
            .is_empty());
    }

    #[tokio::test]
    async fn limit_counts_pending_starts() {
        let image = image(1);
        assert!(image.can_start_new_instance());
        image.start_new_instance(&InstanceUserData::new()).await.unwrap();
        assert_eq!(image.instance_count(), 0);
        assert!(!image.can_start_new_instance());

        let err = image.start_new_instance(&InstanceUserData::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Quota);

        // A listing begun after the start accepted it but not showing it frees the slot.
        let g = image.begin_listing();
        image.apply_listing(g, Vec::new());
        assert!(image.can_start_new_instance());
    }

    #[tokio::test]
    async fn stopped_instances_do_not_count() {
        let image = image(1);
        let g = image.begin_listing();
        image.apply_listing(g, vec![vm("a", InstanceStatus::Stopped)]);
        assert!(image.can_start_new_instance());
        let g = image.begin_listing();
        image.apply_listing(g, vec![vm("a", InstanceStatus::Running)]);
        assert!(!image.can_start_new_instance());
    }

    #[tokio::test]
    async fn lifecycle_requires_known_instance() {
        let image = image(2);
        let stranger = vm("ghost", InstanceStatus::Running);
        assert!(matches!(
            image.restart_instance(&stranger).await,
            Err(Error::NotFound(_))
        ));

        let g = image.begin_listing();
        image.apply_listing(g, vec![stranger.clone()]);
        image.restart_instance(&stranger).await.unwrap();
        image.terminate_instance(&stranger).await.unwrap();
        // Only reconciliation removes it.
        assert!(image.find_instance("ghost").is_some());
    }

    #[tokio::test]
    async fn errored_image_refuses_starts() {
        let image = image(3);
        image.set_error(Some(ErrorRecord::new(ErrorKind::Fatal, "listing failed")));
        assert!(!image.can_start_new_instance());
        let err = image.start_new_instance(&InstanceUserData::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }
}
