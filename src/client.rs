//! Cloud client: image registry, lifecycle operations and background reconciliation.
//!
//! A [`CloudClient`] moves through `Uninitialized → Populating → Initialized` and ends in
//! `Disposed`. [`CloudClient::populate_images`] inserts every image at once, runs one
//! reconciliation pass and schedules the recurring pass on the client's executor.
//! After that, reconciliation is the only writer of instance sets.

pub mod builder;
pub mod core;
pub mod image;
pub mod reconcile;

pub use builder::CloudClientBuilder;
pub use self::core::{ClientState, CloudClient};
pub use image::{CloudImage, ImageDiff};
pub use reconcile::{ReconcileReport, UpdateInstancesTask};
