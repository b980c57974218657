//! Workspace error and outcome types

use std::time::Duration;

use crate::repo::RepositoryError;
use crate::status::WorkspaceInstance;

/// Terminal failures of a workspace workflow
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    /// The repository service denied the caller access
    #[error("{owner} may not access repository {repository}")]
    AccessDenied {
        /// Raw caller identity
        owner: String,
        /// `owner/name` of the repository
        repository: String,
    },

    /// A stored object lacks a metadata key needed to rebuild the workspace
    #[error("workspace {workspace} is missing configuration key {key}")]
    ConfigurationMissing {
        /// Sanitized workspace id
        workspace: String,
        /// The first missing key
        key: String,
    },

    /// An essential resource could not be created
    #[error("failed to provision {resource} for workspace {workspace}: {message}")]
    ProvisionFailed {
        /// Sanitized workspace id
        workspace: String,
        /// Kind of the failing resource
        resource: String,
        /// Underlying error
        message: String,
    },

    /// A resource could not be removed
    #[error("failed to remove {resource} of workspace {workspace}: {message}")]
    TeardownPartialFailure {
        /// Sanitized workspace id
        workspace: String,
        /// Kind of the failing resource
        resource: String,
        /// Underlying error
        message: String,
    },

    /// No workspace exists for the caller
    #[error("workspace {workspace} not found")]
    NotFound {
        /// Sanitized workspace id
        workspace: String,
    },

    /// The identity sanitizes to an empty id
    #[error("identity {raw:?} has no characters usable in a resource name")]
    InvalidIdentity {
        /// Identity as supplied
        raw: String,
    },

    /// A repository owner or name that cannot be used in a URL path or a
    /// directory name
    #[error("{repository:?} is not a valid repository")]
    InvalidRepository {
        /// `owner/name` as supplied or recorded
        repository: String,
    },

    /// The repository service failed
    #[error("repository service error: {0}")]
    Repository(#[from] RepositoryError),

    /// The cluster API failed
    #[error("{0}")]
    Store(#[from] devplane_common::Error),
}

impl WorkspaceError {
    /// Whether the same call may succeed later without caller changes
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ProvisionFailed { .. } | Self::TeardownPartialFailure { .. } => true,
            Self::Repository(e) => e.is_retryable(),
            Self::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Non-fatal condition observed during a workflow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationWarning {
    /// The pod did not become ready in time; it may still come up
    ReadinessTimeout {
        /// Time spent waiting
        waited: Duration,
    },
    /// The readiness wait was cancelled before the pod became ready
    ReadinessCancelled,
    /// The pod reached a terminal failure while waiting
    PodFailed {
        /// Phase or container reason reported by the pod
        reason: String,
    },
    /// A non-essential subresource could not be ensured or removed
    SubresourceFailed {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
        /// Underlying error
        message: String,
    },
}

impl std::fmt::Display for OperationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadinessTimeout { waited } => {
                write!(f, "workspace not ready after {}s", waited.as_secs())
            }
            Self::ReadinessCancelled => write!(f, "readiness wait cancelled"),
            Self::PodFailed { reason } => write!(f, "workspace pod failed: {reason}"),
            Self::SubresourceFailed {
                kind,
                name,
                message,
            } => write!(f, "{kind} {name}: {message}"),
        }
    }
}

/// Result of [`provision`](crate::WorkspaceOrchestrator::provision)
#[derive(Debug, Clone)]
pub struct ProvisionOutcome {
    /// The workspace as observed after the call
    pub instance: WorkspaceInstance,
    /// Human-readable summary
    pub message: String,
    /// False when a live workspace already existed
    pub is_new: bool,
    /// Non-fatal problems
    pub warnings: Vec<OperationWarning>,
}

/// Result of [`start`](crate::WorkspaceOrchestrator::start)
#[derive(Debug, Clone)]
pub struct StartOutcome {
    /// The workspace as observed after the call
    pub instance: WorkspaceInstance,
    /// Non-fatal problems
    pub warnings: Vec<OperationWarning>,
}

/// Result of [`sync`](crate::WorkspaceOrchestrator::sync)
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    /// The workspace as observed after the call
    pub instance: WorkspaceInstance,
    /// Non-fatal problems
    pub warnings: Vec<OperationWarning>,
}

/// Result of [`delete`](crate::WorkspaceOrchestrator::delete)
#[derive(Debug, Default)]
pub struct DeleteOutcome {
    /// Whether anything existed to delete
    pub deleted: bool,
    /// Subresources that could not be removed, each a
    /// [`WorkspaceError::TeardownPartialFailure`]
    pub warnings: Vec<WorkspaceError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_the_cause() {
        let failed = WorkspaceError::ProvisionFailed {
            workspace: "alice".into(),
            resource: "Pod".into(),
            message: "quota".into(),
        };
        assert!(failed.is_retryable());

        let denied = WorkspaceError::AccessDenied {
            owner: "alice".into(),
            repository: "acme/web".into(),
        };
        assert!(!denied.is_retryable());
        assert!(!WorkspaceError::InvalidIdentity { raw: "!!".into() }.is_retryable());
        assert!(!WorkspaceError::InvalidRepository {
            repository: "acme/..".into()
        }
        .is_retryable());
    }

    #[test]
    fn warnings_render_for_messages() {
        let w = OperationWarning::ReadinessTimeout {
            waited: Duration::from_secs(180),
        };
        assert_eq!(w.to_string(), "workspace not ready after 180s");

        let w = OperationWarning::SubresourceFailed {
            kind: "VirtualService".into(),
            name: "code-alice".into(),
            message: "webhook denied".into(),
        };
        assert_eq!(w.to_string(), "VirtualService code-alice: webhook denied");
    }
}
