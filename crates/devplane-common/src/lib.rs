//! Common types for devplane: errors, identity naming, Kubernetes helpers and
//! Istio resource types shared by the workspace and directory controllers.

#![deny(missing_docs)]

pub mod error;
pub mod identity;
pub mod istio;
pub mod kube_utils;
pub mod telemetry;

pub use error::Error;

/// Field manager / managed-by value stamped on everything devplane creates
pub const FIELD_MANAGER: &str = "devplane";

/// Standard managed-by label key
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`] for devplane-owned resources
pub const LABEL_MANAGED_BY_DEVPLANE: &str = "devplane";
