//! Bounded waits on the workspace pod

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use devplane_common::kube_utils::{has_condition, poll_until, PollOutcome, CONDITION_READY};
use devplane_common::Error;

use crate::error::OperationWarning;
use crate::status::pod_failure_reason;
use crate::store::WorkspaceStore;

/// How a readiness wait ended. Never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Ready condition is true
    Ready,
    /// The pod hit a failure it will not recover from on its own
    Failed {
        /// Phase or container reason
        reason: String,
    },
    /// Still not ready at the deadline
    TimedOut {
        /// Time spent waiting
        waited: Duration,
    },
    /// The caller gave up first
    Cancelled {
        /// Time spent waiting
        waited: Duration,
    },
}

impl Readiness {
    /// The warning to attach to an outcome, if the wait did not succeed
    pub fn into_warning(self) -> Option<OperationWarning> {
        match self {
            Readiness::Ready => None,
            Readiness::Failed { reason } => Some(OperationWarning::PodFailed { reason }),
            Readiness::TimedOut { waited } => Some(OperationWarning::ReadinessTimeout { waited }),
            Readiness::Cancelled { .. } => Some(OperationWarning::ReadinessCancelled),
        }
    }
}

/// Poll the pod's Ready condition until it is true, the pod fails, the
/// timeout elapses, or `cancel` fires.
///
/// Read errors and a not-yet-visible pod are polled through.
pub async fn wait_ready(
    store: &dyn WorkspaceStore,
    pod_name: &str,
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Readiness {
    let outcome = poll_until(timeout, poll_interval, cancel, || check_ready(store, pod_name)).await;

    match outcome {
        PollOutcome::Done(readiness) => {
            debug!(pod = pod_name, ?readiness, "readiness wait finished");
            readiness
        }
        PollOutcome::TimedOut { waited } => {
            warn!(pod = pod_name, waited_secs = waited.as_secs(), "pod not ready before timeout");
            Readiness::TimedOut { waited }
        }
        PollOutcome::Cancelled { waited } => {
            debug!(pod = pod_name, "readiness wait cancelled");
            Readiness::Cancelled { waited }
        }
    }
}

async fn check_ready(store: &dyn WorkspaceStore, pod_name: &str) -> Result<Option<Readiness>, Error> {
    let Some(pod) = store.get_pod(pod_name).await? else {
        return Ok(None);
    };
    if let Some(reason) = pod_failure_reason(&pod) {
        return Ok(Some(Readiness::Failed { reason }));
    }
    let conditions = pod.status.as_ref().and_then(|s| s.conditions.as_deref());
    Ok(has_condition(conditions, CONDITION_READY).then_some(Readiness::Ready))
}

/// Poll until the pod no longer exists. Returns true once it is gone.
pub async fn wait_deleted(
    store: &dyn WorkspaceStore,
    pod_name: &str,
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> bool {
    let outcome = poll_until(timeout, poll_interval, cancel, || check_gone(store, pod_name)).await;

    if !outcome.is_done() {
        warn!(pod = pod_name, ?outcome, "pod still present after waiting for deletion");
    }
    outcome.is_done()
}

async fn check_gone(store: &dyn WorkspaceStore, pod_name: &str) -> Result<Option<()>, Error> {
    Ok(store.get_pod(pod_name).await?.is_none().then_some(()))
}
