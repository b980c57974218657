//! Cluster-wide bootstrap marker
//!
//! A ConfigMap records whether some replica is running or has finished the
//! bootstrap. Claims use create (409 = lost the race) and replace with the
//! read resourceVersion (409 = someone changed it first), so two replicas
//! never both believe they own the run. The holder refreshes `updatedAt`
//! while it works; a `Running` marker not refreshed within the lease
//! duration may be taken over.
//!
//! Holders must be unique per process. Two processes sharing a holder would
//! both see the marker as their own.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use devplane_common::kube_utils::is_conflict;
use devplane_common::{Error, FIELD_MANAGER, LABEL_MANAGED_BY, LABEL_MANAGED_BY_DEVPLANE};

use crate::bootstrap::BootstrapReport;
use crate::error::DirectoryError;

/// Default ConfigMap name
pub const MARKER_NAME: &str = "devplane-directory-bootstrap";

const KEY_STATE: &str = "state";
const KEY_HOLDER: &str = "holder";
const KEY_UPDATED_AT: &str = "updatedAt";
const KEY_REPORT: &str = "report";

/// Bootstrap progress, both in memory and in the marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    /// Nobody has started
    NotStarted,
    /// A holder is seeding the directory
    Running,
    /// Seeding finished, with or without failed entries
    Done,
}

impl BootstrapState {
    fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "NotStarted",
            Self::Running => "Running",
            Self::Done => "Done",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "Running" => Self::Running,
            "Done" => Self::Done,
            _ => Self::NotStarted,
        }
    }
}

/// Result of trying to take the bootstrap run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerClaim {
    /// This process owns the run
    Acquired,
    /// Another holder is running it and its claim is fresh
    HeldElsewhere,
    /// Already finished
    Done,
}

/// Persistence of the bootstrap claim
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BootstrapMarker: Send + Sync {
    /// Try to become the holder of the bootstrap run
    async fn try_claim(&self, holder: &str) -> Result<MarkerClaim, DirectoryError>;

    /// Record a finished run
    async fn mark_done(&self, holder: &str, report: &BootstrapReport) -> Result<(), DirectoryError>;

    /// Refresh the lease on a run `holder` owns.
    ///
    /// `Ok(false)` when the marker no longer names `holder` as running it.
    async fn renew(&self, holder: &str) -> Result<bool, DirectoryError>;
}

/// Holder identity for this process: `$HOSTNAME` (the pod name in a
/// cluster) plus a random suffix, so restarted or co-located processes
/// never share one.
pub fn unique_holder() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "devplane-operator".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}

/// [`BootstrapMarker`] stored in a ConfigMap
pub struct ConfigMapMarker {
    api: Api<ConfigMap>,
    name: String,
    namespace: String,
    lease: Duration,
}

/// What to do with an existing marker
#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Done,
    Ours,
    Stale,
    Fresh,
}

fn evaluate(
    data: &BTreeMap<String, String>,
    holder: &str,
    now: DateTime<Utc>,
    lease: Duration,
) -> Verdict {
    let state = data
        .get(KEY_STATE)
        .map(|s| BootstrapState::parse(s))
        .unwrap_or(BootstrapState::NotStarted);
    match state {
        BootstrapState::Done => Verdict::Done,
        BootstrapState::NotStarted => Verdict::Stale,
        BootstrapState::Running if data.get(KEY_HOLDER).map(String::as_str) == Some(holder) => {
            Verdict::Ours
        }
        BootstrapState::Running => {
            let updated = data
                .get(KEY_UPDATED_AT)
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc));
            let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(365));
            match updated {
                Some(t) if now <= t + lease => Verdict::Fresh,
                _ => Verdict::Stale,
            }
        }
    }
}

fn marker_data(
    state: BootstrapState,
    holder: &str,
    now: DateTime<Utc>,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (KEY_STATE.to_string(), state.as_str().to_string()),
        (KEY_HOLDER.to_string(), holder.to_string()),
        (KEY_UPDATED_AT.to_string(), now.to_rfc3339()),
    ])
}

impl ConfigMapMarker {
    /// Marker `namespace/name`; `lease` bounds how long a silent holder
    /// keeps the run
    pub fn new(client: Client, namespace: &str, name: &str, lease: Duration) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
            namespace: namespace.to_string(),
            lease,
        }
    }

    fn cluster_err(&self, operation: &'static str, e: kube::Error) -> DirectoryError {
        Error::resource(operation, "ConfigMap", &self.namespace, &self.name, e).into()
    }

    fn running(&self, holder: &str, resource_version: Option<String>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version,
                labels: Some(BTreeMap::from([(
                    LABEL_MANAGED_BY.to_string(),
                    LABEL_MANAGED_BY_DEVPLANE.to_string(),
                )])),
                ..Default::default()
            },
            data: Some(marker_data(BootstrapState::Running, holder, Utc::now())),
            ..Default::default()
        }
    }
}

#[async_trait]
impl BootstrapMarker for ConfigMapMarker {
    async fn try_claim(&self, holder: &str) -> Result<MarkerClaim, DirectoryError> {
        let existing = self
            .api
            .get_opt(&self.name)
            .await
            .map_err(|e| self.cluster_err("get", e))?;

        let Some(cm) = existing else {
            return match self
                .api
                .create(&PostParams::default(), &self.running(holder, None))
                .await
            {
                Ok(_) => {
                    info!(holder, marker = %self.name, "claimed directory bootstrap");
                    Ok(MarkerClaim::Acquired)
                }
                Err(e) if is_conflict(&e) => {
                    debug!(holder, "bootstrap marker created concurrently");
                    Ok(MarkerClaim::HeldElsewhere)
                }
                Err(e) => Err(self.cluster_err("create", e)),
            };
        };

        let data = cm.data.clone().unwrap_or_default();
        match evaluate(&data, holder, Utc::now(), self.lease) {
            Verdict::Done => Ok(MarkerClaim::Done),
            Verdict::Ours => Ok(MarkerClaim::Acquired),
            Verdict::Fresh => Ok(MarkerClaim::HeldElsewhere),
            Verdict::Stale => {
                let previous = data.get(KEY_HOLDER).cloned().unwrap_or_default();
                let replacement = self.running(holder, cm.metadata.resource_version.clone());
                match self
                    .api
                    .replace(&self.name, &PostParams::default(), &replacement)
                    .await
                {
                    Ok(_) => {
                        warn!(holder, previous = %previous, "took over stale directory bootstrap");
                        Ok(MarkerClaim::Acquired)
                    }
                    Err(e) if is_conflict(&e) => {
                        debug!(holder, "bootstrap marker takeover lost the race");
                        Ok(MarkerClaim::HeldElsewhere)
                    }
                    Err(e) => Err(self.cluster_err("replace", e)),
                }
            }
        }
    }

    async fn mark_done(&self, holder: &str, report: &BootstrapReport) -> Result<(), DirectoryError> {
        let mut data = marker_data(BootstrapState::Done, holder, Utc::now());
        let report = serde_json::to_string(report)
            .map_err(|e| DirectoryError::Cluster(Error::serialization_for_kind("ConfigMap", e.to_string())))?;
        data.insert(KEY_REPORT.to_string(), report);

        let patch = serde_json::json!({ "data": data });
        self.api
            .patch(&self.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| self.cluster_err("patch", e))?;
        info!(holder, marker = %self.name, "recorded finished directory bootstrap");
        Ok(())
    }

    async fn renew(&self, holder: &str) -> Result<bool, DirectoryError> {
        let Some(cm) = self
            .api
            .get_opt(&self.name)
            .await
            .map_err(|e| self.cluster_err("get", e))?
        else {
            return Ok(false);
        };

        let data = cm.data.clone().unwrap_or_default();
        if evaluate(&data, holder, Utc::now(), self.lease) != Verdict::Ours {
            return Ok(false);
        }

        let refreshed = self.running(holder, cm.metadata.resource_version.clone());
        match self
            .api
            .replace(&self.name, &PostParams::default(), &refreshed)
            .await
        {
            Ok(_) => {
                debug!(holder, marker = %self.name, "renewed directory bootstrap lease");
                Ok(true)
            }
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(self.cluster_err("replace", e)),
        }
    }
}
