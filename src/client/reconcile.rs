//! Reconciliation pass: brings every image's instance set in line with the provider.

use super::image::CloudImage;
use crate::error_provider::{CloudErrorMap, ErrorRecord, UpdatableErrorProvider};
use crate::types::CloudInstance;
use crate::Result;
use arc_swap::ArcSwap;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub(crate) type ImageMap = BTreeMap<String, Arc<CloudImage>>;

/// Outcome of one reconciliation pass. Entries are `image_id/instance_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub pass: u64,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
    /// Images whose listing failed; their instance sets were left untouched.
    pub failed_images: Vec<String>,
    /// Instance ids reported more than once in this pass; only the first was kept.
    pub duplicates: Vec<String>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failed_images.is_empty() && self.duplicates.is_empty()
    }

    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty())
    }
}

/// The recurring task behind [`CloudClient`](super::CloudClient) reconciliation.
///
/// Listings for all images run concurrently through the read lane; results are then
/// applied image by image. Passes never overlap.
pub struct UpdateInstancesTask {
    profile: String,
    images: Arc<ArcSwap<ImageMap>>,
    errors: Arc<CloudErrorMap>,
    /// Errors found while building the image map; reported with every pass.
    setup_errors: Vec<ErrorRecord>,
    running: tokio::sync::Mutex<()>,
    passes: AtomicU64,
}

impl UpdateInstancesTask {
    pub(crate) fn new(
        profile: String,
        images: Arc<ArcSwap<ImageMap>>,
        errors: Arc<CloudErrorMap>,
        setup_errors: Vec<ErrorRecord>,
    ) -> Self {
        Self {
            profile,
            images,
            errors,
            setup_errors,
            running: tokio::sync::Mutex::new(()),
            passes: AtomicU64::new(0),
        }
    }

    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    pub async fn run(&self) -> ReconcileReport {
        let _running = self.running.lock().await;
        let pass = self.passes.fetch_add(1, Ordering::Relaxed) + 1;
        let started = Instant::now();
        let images = self.images.load_full();

        let listings = join_all(images.values().map(|image| {
            let image = Arc::clone(image);
            async move {
                let generation = image.begin_listing();
                let result = image.connector().fetch_instances(image.details()).await;
                (image, generation, result)
            }
        }))
        .await;

        let mut report = ReconcileReport {
            pass,
            ..ReconcileReport::default()
        };
        let mut claimed: HashSet<String> = HashSet::new();
        let mut records = self.setup_errors.clone();

        for (image, generation, result) in listings {
            match self.apply(&image, generation, result, &mut claimed, &mut report) {
                Ok(()) => image.set_error(None),
                Err(err) => {
                    warn!(
                        profile = %self.profile,
                        image_id = image.id(),
                        error = %err,
                        "failed to update instances"
                    );
                    let record = ErrorRecord::from(&err)
                        .with_details(format!("image {}: {}", image.id(), err));
                    image.set_error(Some(record.clone()));
                    records.push(record);
                    report.failed_images.push(image.id().to_string());
                }
            }
        }

        self.errors.update_errors(records);

        if report.has_changes() || !report.is_clean() {
            info!(
                profile = %self.profile,
                pass,
                added = report.added.len(),
                removed = report.removed.len(),
                updated = report.updated.len(),
                failed = report.failed_images.len(),
                duration_ms = started.elapsed().as_millis() as u64,
                "instances reconciled"
            );
        } else {
            debug!(profile = %self.profile, pass, "instances unchanged");
        }
        report
    }

    fn apply(
        &self,
        image: &CloudImage,
        generation: u64,
        listed: Result<Vec<CloudInstance>>,
        claimed: &mut HashSet<String>,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let mut observed = Vec::new();
        for instance in listed? {
            if instance.image_id != image.id() {
                debug!(
                    image_id = image.id(),
                    instance_id = %instance.id,
                    reported_image = %instance.image_id,
                    "ignoring instance of another image"
                );
                continue;
            }
            if !claimed.insert(instance.id.clone()) {
                warn!(
                    profile = %self.profile,
                    image_id = image.id(),
                    instance_id = %instance.id,
                    "instance reported by more than one image"
                );
                report.duplicates.push(format!("{}/{}", image.id(), instance.id));
                continue;
            }
            observed.push(instance);
        }

        let diff = image.apply_listing(generation, observed);
        let qualify = |ids: Vec<String>| ids.into_iter().map(move |id| format!("{}/{}", image.id(), id));
        for id in &diff.removed {
            debug!(image_id = image.id(), instance_id = %id, "instance removed");
        }
        report.added.extend(qualify(diff.added));
        report.removed.extend(qualify(diff.removed));
        report.updated.extend(qualify(diff.updated));
        Ok(())
    }
}

impl std::fmt::Debug for UpdateInstancesTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateInstancesTask")
            .field("profile", &self.profile)
            .field("images", &self.images.load().len())
            .field("passes", &self.passes())
            .finish()
    }
}
