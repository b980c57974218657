//! Status projection
//!
//! The visible state of a workspace is recomputed from a [`WorkspaceSnapshot`]
//! on every read. Nothing here caches or trusts a previously reported status.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ContainerStatus, PersistentVolumeClaim, Pod};
use serde::Serialize;

use devplane_common::identity::workspace_host;
use devplane_common::kube_utils::{has_condition, CONDITION_READY};

use crate::config::WorkspaceConfig;
use crate::metadata::{recorded_owner, WorkspaceMetadata};
use crate::store::WorkspaceSnapshot;

/// Container waiting reasons that mean the pod will not come up on its own
const FATAL_WAITING_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "InvalidImageName",
    "CreateContainerConfigError",
    "CreateContainerError",
];

/// Observed lifecycle state of a workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum WorkspaceStatus {
    /// Pod accepted but not scheduled or pulled yet
    Pending,
    /// Pod running, readiness not yet reported
    Starting,
    /// Serving
    Running,
    /// Pod is terminating
    Stopping,
    /// Storage only, no pod
    Stopped,
    /// Pod failed or is stuck on a container error
    Error,
}

impl std::fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Error => "Error",
        };
        f.write_str(s)
    }
}

/// A user's workspace as seen right now
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInstance {
    /// Sanitized owner id; also the resource name suffix
    pub id: String,
    /// Raw owner identity as recorded at provision time
    pub owner: String,
    /// Repository owner
    pub repo_owner: String,
    /// Repository name
    pub repo_name: String,
    /// Checked-out branch
    pub branch: String,
    /// Lifecycle state
    pub status: WorkspaceStatus,
    /// External URL of the editor
    pub url: String,
    /// Claim capacity as a Kubernetes quantity
    pub storage_used: Option<String>,
    /// Failure detail when `status` is [`WorkspaceStatus::Error`]
    pub error_message: Option<String>,
    /// Creation time of the pod, or of the claim when stopped
    pub created_at: Option<DateTime<Utc>>,
}

/// Project a snapshot to an instance; `None` means "no workspace".
///
/// A workspace exists when either object carries repository metadata.
/// Metadata on the pod wins over the claim since the pod is recreated on
/// every start and sync with the coordinates it actually checked out.
pub fn project(snapshot: &WorkspaceSnapshot, config: &WorkspaceConfig) -> Option<WorkspaceInstance> {
    let pod = snapshot.pod.as_ref();
    let claim = snapshot.claim.as_ref();

    let metadata = pod
        .and_then(|p| WorkspaceMetadata::from_object_meta(&p.metadata).ok())
        .or_else(|| claim.and_then(|c| WorkspaceMetadata::from_object_meta(&c.metadata).ok()))?;

    let (status, error_message) = match pod {
        Some(pod) => pod_status(pod),
        None => (WorkspaceStatus::Stopped, None),
    };

    let owner = claim
        .and_then(|c| recorded_owner(&c.metadata))
        .or_else(|| pod.and_then(|p| recorded_owner(&p.metadata)))
        .unwrap_or_else(|| snapshot.id.clone());

    let created_at = claim
        .and_then(|c| c.metadata.creation_timestamp.as_ref())
        .or_else(|| pod.and_then(|p| p.metadata.creation_timestamp.as_ref()))
        .map(|t| t.0);

    Some(WorkspaceInstance {
        id: snapshot.id.clone(),
        owner,
        repo_owner: metadata.repo_owner,
        repo_name: metadata.repo_name,
        branch: metadata.branch,
        status,
        url: config.url_for_host(&workspace_host(&snapshot.id, &config.base_domain)),
        storage_used: claim.and_then(claim_storage),
        error_message,
        created_at,
    })
}

/// Status of a live pod plus an error message when it is failing
pub fn pod_status(pod: &Pod) -> (WorkspaceStatus, Option<String>) {
    if pod.metadata.deletion_timestamp.is_some() {
        return (WorkspaceStatus::Stopping, None);
    }
    if let Some(reason) = pod_failure_reason(pod) {
        return (WorkspaceStatus::Error, Some(reason));
    }

    let status = pod.status.as_ref();
    match status.and_then(|s| s.phase.as_deref()) {
        Some("Running") => {
            let conditions = status.and_then(|s| s.conditions.as_deref());
            if has_condition(conditions, CONDITION_READY) {
                (WorkspaceStatus::Running, None)
            } else {
                (WorkspaceStatus::Starting, None)
            }
        }
        Some("Succeeded") => (WorkspaceStatus::Stopped, None),
        _ => (WorkspaceStatus::Pending, None),
    }
}

/// Why a pod is failing, if it is in a state it will not leave on its own
pub fn pod_failure_reason(pod: &Pod) -> Option<String> {
    let status = pod.status.as_ref()?;

    if status.phase.as_deref() == Some("Failed") {
        let reason = status.reason.as_deref().unwrap_or("Failed");
        return Some(match status.message.as_deref() {
            Some(msg) if !msg.is_empty() => format!("{reason}: {msg}"),
            _ => reason.to_string(),
        });
    }

    let statuses = status
        .init_container_statuses
        .iter()
        .flatten()
        .chain(status.container_statuses.iter().flatten());
    statuses.filter_map(waiting_failure).next()
}

fn waiting_failure(cs: &ContainerStatus) -> Option<String> {
    let waiting = cs.state.as_ref()?.waiting.as_ref()?;
    let reason = waiting.reason.as_deref()?;
    if !FATAL_WAITING_REASONS.contains(&reason) {
        return None;
    }
    Some(match waiting.message.as_deref() {
        Some(msg) if !msg.is_empty() => format!("container {}: {reason}: {msg}", cs.name),
        _ => format!("container {}: {reason}", cs.name),
    })
}

/// Provisioned capacity, falling back to the requested size while unbound
fn claim_storage(claim: &PersistentVolumeClaim) -> Option<String> {
    let capacity = claim
        .status
        .as_ref()
        .and_then(|s| s.capacity.as_ref())
        .and_then(|c| c.get("storage"));
    let requested = || {
        claim
            .spec
            .as_ref()
            .and_then(|s| s.resources.as_ref())
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get("storage"))
    };
    capacity.or_else(requested).map(|q| q.0.clone())
}

/// Parse a Kubernetes storage quantity (`10Gi`, `500M`, `1.5Ti`) into bytes.
///
/// Returns `None` for malformed or negative values.
pub fn parse_quantity_bytes(quantity: &str) -> Option<u64> {
    const SUFFIXES: &[(&str, f64)] = &[
        ("Ki", 1024.0),
        ("Mi", 1_048_576.0),
        ("Gi", 1_073_741_824.0),
        ("Ti", 1_099_511_627_776.0),
        ("Pi", 1_125_899_906_842_624.0),
        ("Ei", 1_152_921_504_606_846_976.0),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
        ("E", 1e18),
    ];

    let quantity = quantity.trim();
    let (number, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, mult)| quantity.strip_suffix(suffix).map(|n| (n, *mult)))
        .unwrap_or((quantity, 1.0));

    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * multiplier).round() as u64)
}

/// Aggregate counts over every workspace in the namespace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceStats {
    /// Every workspace with storage
    pub total: usize,
    /// Running
    pub running: usize,
    /// Stopped
    pub stopped: usize,
    /// Pending and Starting
    pub pending: usize,
    /// Sum of claim capacity in bytes
    pub storage_used: u64,
}

impl WorkspaceStats {
    /// Tally a set of projected instances
    pub fn from_instances<'a>(instances: impl IntoIterator<Item = &'a WorkspaceInstance>) -> Self {
        instances.into_iter().fold(Self::default(), |mut acc, ws| {
            acc.total += 1;
            match ws.status {
                WorkspaceStatus::Running => acc.running += 1,
                WorkspaceStatus::Stopped => acc.stopped += 1,
                WorkspaceStatus::Pending | WorkspaceStatus::Starting => acc.pending += 1,
                WorkspaceStatus::Stopping | WorkspaceStatus::Error => {}
            }
            acc.storage_used += ws
                .storage_used
                .as_deref()
                .and_then(parse_quantity_bytes)
                .unwrap_or(0);
            acc
        })
    }
}
