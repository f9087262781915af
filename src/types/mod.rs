//! Core data model shared by the client, the connectors and the provider fakes.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`ImageDetails`] | Host-supplied description of a provisionable template |
//! | [`CloudInstance`] | Provider-reported instance state, also used as the host's handle |
//! | [`InstanceStatus`] | Instance lifecycle status |
//! | [`InstanceUserData`] | Registration data passed to new instances |
//! | [`Subscription`] | Entry of a subscription listing |

pub mod image;
pub mod instance;
pub mod subscription;

pub use image::ImageDetails;
pub use instance::{CloudInstance, InstanceStatus, InstanceUserData};
pub use subscription::Subscription;
