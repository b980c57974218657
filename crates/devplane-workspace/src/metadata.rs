//! Resource naming and the label/annotation key schema
//!
//! Repository coordinates are persisted only as metadata on the Pod and the
//! PersistentVolumeClaim. Key schema:
//!
//! | key                       | objects  | stored as            |
//! |---------------------------|----------|----------------------|
//! | `devplane.dev/repo-owner` | Pod, PVC | label + annotation   |
//! | `devplane.dev/repo-name`  | Pod, PVC | label + annotation   |
//! | `devplane.dev/branch`     | Pod, PVC | annotation           |
//! | `devplane.dev/owner`      | Pod, PVC | annotation (raw id)  |
//!
//! Labels hold label-safe copies for selection; annotations hold the exact
//! values and win when reading back.

use std::collections::BTreeMap;

use devplane_common::identity::{label_value, prefixed_name};
use devplane_common::{LABEL_MANAGED_BY, LABEL_MANAGED_BY_DEVPLANE};

/// Label key naming the application
pub const LABEL_APP: &str = "app";
/// Value of [`LABEL_APP`] on every workspace resource
pub const APP_NAME: &str = "code-server";
/// Label key carrying the sanitized owner id
pub const LABEL_USER: &str = "user";

/// Repository owner key
pub const REPO_OWNER_KEY: &str = "devplane.dev/repo-owner";
/// Repository name key
pub const REPO_NAME_KEY: &str = "devplane.dev/repo-name";
/// Branch key (annotation only)
pub const BRANCH_KEY: &str = "devplane.dev/branch";
/// Raw owner identity key (annotation only)
pub const OWNER_KEY: &str = "devplane.dev/owner";

/// Branch assumed when neither the caller nor the repository names one
pub const FALLBACK_BRANCH: &str = "main";

/// Label selector for every workspace resource devplane manages
pub const WORKSPACE_SELECTOR: &str = "app=code-server,app.kubernetes.io/managed-by=devplane";

/// Deterministic names for one user's resource set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    /// Sanitized owner id
    pub id: String,
    /// Pod name
    pub pod: String,
    /// Service name
    pub service: String,
    /// PersistentVolumeClaim name
    pub claim: String,
    /// VirtualService name
    pub virtual_service: String,
    /// DestinationRule name
    pub destination_rule: String,
}

impl ResourceNames {
    /// Names for a sanitized id
    pub fn for_id(id: &str) -> Self {
        let base = prefixed_name("code", id);
        Self {
            id: id.to_string(),
            pod: base.clone(),
            service: base.clone(),
            claim: prefixed_name("data", id),
            virtual_service: base.clone(),
            destination_rule: base,
        }
    }
}

/// Labels shared by every object in a user's resource set
pub fn selector_labels(id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_APP.to_string(), APP_NAME.to_string()),
        (LABEL_USER.to_string(), id.to_string()),
        (
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_DEVPLANE.to_string(),
        ),
    ])
}

/// Repository coordinates a workspace was provisioned from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceMetadata {
    /// Repository owner (user or organization)
    pub repo_owner: String,
    /// Repository name
    pub repo_name: String,
    /// Branch checked out into the workspace
    pub branch: String,
}

impl WorkspaceMetadata {
    /// Create metadata
    pub fn new(
        repo_owner: impl Into<String>,
        repo_name: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            repo_owner: repo_owner.into(),
            repo_name: repo_name.into(),
            branch: branch.into(),
        }
    }

    /// Label-safe copies of the coordinates
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (REPO_OWNER_KEY.to_string(), label_value(&self.repo_owner)),
            (REPO_NAME_KEY.to_string(), label_value(&self.repo_name)),
        ])
    }

    /// Exact coordinates plus the raw owner identity
    pub fn annotations(&self, owner: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (REPO_OWNER_KEY.to_string(), self.repo_owner.clone()),
            (REPO_NAME_KEY.to_string(), self.repo_name.clone()),
            (BRANCH_KEY.to_string(), self.branch.clone()),
            (OWNER_KEY.to_string(), owner.to_string()),
        ])
    }

    /// Read coordinates back from object metadata.
    ///
    /// Annotations are authoritative; labels are a fallback for objects
    /// whose annotations were stripped. Returns the first missing key when
    /// the repository owner or name cannot be found. A missing branch falls
    /// back to [`FALLBACK_BRANCH`].
    pub fn from_object_meta(
        meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
    ) -> Result<Self, &'static str> {
        let lookup = |key: &str| -> Option<String> {
            meta.annotations
                .as_ref()
                .and_then(|a| a.get(key))
                .or_else(|| meta.labels.as_ref().and_then(|l| l.get(key)))
                .filter(|v| !v.is_empty())
                .cloned()
        };

        let repo_owner = lookup(REPO_OWNER_KEY).ok_or(REPO_OWNER_KEY)?;
        let repo_name = lookup(REPO_NAME_KEY).ok_or(REPO_NAME_KEY)?;
        let branch = lookup(BRANCH_KEY).unwrap_or_else(|| FALLBACK_BRANCH.to_string());

        Ok(Self {
            repo_owner,
            repo_name,
            branch,
        })
    }

    /// True when both coordinates pass [`is_valid_repo_part`]
    pub fn has_valid_repository(&self) -> bool {
        is_valid_repo_part(&self.repo_owner) && is_valid_repo_part(&self.repo_name)
    }

    /// Same repository, ignoring the branch
    pub fn same_repository(&self, other: &Self) -> bool {
        self.repo_owner == other.repo_owner && self.repo_name == other.repo_name
    }

    /// `owner/name` for log lines and messages
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.repo_owner, self.repo_name)
    }
}

/// Whether `part` is usable as a repository owner or name.
///
/// Both end up as a URL path segment and as a directory under the workspace
/// mount, so only ASCII alphanumerics, `-`, `_` and `.` are accepted, and
/// never `.` or `..` alone.
pub fn is_valid_repo_part(part: &str) -> bool {
    !part.is_empty()
        && part != "."
        && part != ".."
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Raw owner identity recorded on an object, if any
pub fn recorded_owner(
    meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
) -> Option<String> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(OWNER_KEY))
        .cloned()
}
