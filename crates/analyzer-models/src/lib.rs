//! Algorithm packages and pooled model instances.
//!
//! - [`PackageTable`]: factory table of algorithm packages keyed by package id
//! - [`ModelRegistry`]: registered models, their instance pools and round-robin checkout
//! - [`annotate`]: drawing detections onto frame copies

pub mod annotate;
pub mod packages;
pub mod registry;

pub use packages::PackageTable;
pub use registry::{model_id, ModelInstance, ModelRegistry, ModelStatus, ModelSummary};
