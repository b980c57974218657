//! Directory readiness reconciler for devplane
//!
//! Waits for the in-cluster LDAP server to report a ready replica, then seeds
//! it exactly once with schemas, organizational units, users and groups. A
//! ConfigMap marker keeps concurrent operator replicas from seeding twice.

#![deny(missing_docs)]

pub mod bootstrap;
pub mod error;
pub mod ldap;
pub mod marker;
pub mod reconciler;
pub mod seed;

pub use bootstrap::{run_bootstrap, BootstrapReport, FailedEntry};
pub use error::DirectoryError;
pub use ldap::{DirectoryClient, EntryOutcome, LdapDirectory, LdapSettings};
pub use marker::{
    unique_holder, BootstrapMarker, BootstrapState, ConfigMapMarker, MarkerClaim, MARKER_NAME,
};
pub use reconciler::{DirectoryReconciler, ReadyReplicaSource, ReconcilerConfig, StatefulSetReplicas};
pub use seed::{DirectoryEntry, DirectorySeed};
