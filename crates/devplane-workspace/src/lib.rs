//! Per-user code-server workspaces on Kubernetes
//!
//! A workspace is a Pod, a Service, a PersistentVolumeClaim and an Istio
//! VirtualService + DestinationRule, all named after the sanitized caller
//! identity. The claim outlives stop/start cycles and carries the repository
//! coordinates; everything else is recreated from it.
//!
//! The cluster is the only state. [`WorkspaceOrchestrator`] reads it through
//! a [`WorkspaceStore`] and projects a [`WorkspaceInstance`] from a fresh
//! snapshot on every call.

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod locks;
pub mod metadata;
pub mod orchestrator;
pub mod readiness;
pub mod repo;
pub mod resources;
pub mod status;
pub mod store;

pub use config::WorkspaceConfig;
pub use error::{
    DeleteOutcome, OperationWarning, ProvisionOutcome, StartOutcome, SyncOutcome, WorkspaceError,
};
pub use orchestrator::WorkspaceOrchestrator;
pub use repo::{CallerIdentity, GitServiceClient, RepositoryAccess, RepositoryError};
pub use status::{WorkspaceInstance, WorkspaceStats, WorkspaceStatus};
pub use store::{KubeWorkspaceStore, WorkspaceSnapshot, WorkspaceStore};
