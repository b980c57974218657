//! Shared Kubernetes utilities using kube-rs
//!
//! Client construction, API error classification, condition checks, and the
//! cancellable polling primitive every wait in devplane is built on.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::Error;

// =============================================================================
// ObjectMeta - metadata for typed custom resources we serialize ourselves
// =============================================================================

/// Kubernetes metadata for the mesh resources devplane builds by hand.
///
/// Automatically carries the devplane managed-by label.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Resource name
    pub name: String,
    /// Resource namespace
    pub namespace: String,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Create new metadata with the managed-by label set
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(
            crate::LABEL_MANAGED_BY.to_string(),
            crate::LABEL_MANAGED_BY_DEVPLANE.to_string(),
        );
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels,
            annotations: BTreeMap::new(),
        }
    }

    /// Merge a set of labels
    pub fn with_labels(mut self, labels: &BTreeMap<String, String>) -> Self {
        self.labels
            .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// HasApiResource Trait
// =============================================================================

/// Trait for types that have a known API group, version, and kind.
///
/// Implemented by the Istio types so `Api<DynamicObject>` handles can be built
/// without runtime discovery.
pub trait HasApiResource {
    /// Full API version (e.g., "networking.istio.io/v1")
    const API_VERSION: &'static str;
    /// Resource kind (e.g., "VirtualService")
    const KIND: &'static str;

    /// Build an ApiResource from the type's constants.
    fn api_resource() -> ApiResource {
        build_api_resource(Self::API_VERSION, Self::KIND)
    }
}

/// Build an ApiResource from a known apiVersion and kind.
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Parse apiVersion into (group, version)
///
/// ```
/// use devplane_common::kube_utils::parse_api_version;
///
/// assert_eq!(parse_api_version("networking.istio.io/v1"), ("networking.istio.io".to_string(), "v1".to_string()));
/// assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Lowercase plural resource name for a kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

// =============================================================================
// API error classification
// =============================================================================

/// True when the API server answered 404 Not Found
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// True when the API server answered 409 Conflict / AlreadyExists
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

// =============================================================================
// Conditions
// =============================================================================

/// The "Ready" condition type
pub const CONDITION_READY: &str = "Ready";
/// The "True" status value for conditions
pub const STATUS_TRUE: &str = "True";

/// Trait for types that have condition-like fields (type and status)
pub trait HasConditionFields {
    /// Get the condition type field value
    fn type_field(&self) -> &str;
    /// Get the condition status field value
    fn status_field(&self) -> &str;
}

impl HasConditionFields for k8s_openapi::api::core::v1::PodCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

/// Check if a Kubernetes condition of the given type has status "True"
pub fn has_condition<T>(conditions: Option<&[T]>, condition_type: &str) -> bool
where
    T: HasConditionFields,
{
    conditions
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_field() == condition_type && c.status_field() == STATUS_TRUE)
        })
        .unwrap_or(false)
}

// =============================================================================
// Polling
// =============================================================================

/// How a [`poll_until`] loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The check produced a value
    Done(T),
    /// The deadline elapsed first
    TimedOut {
        /// Time spent polling
        waited: Duration,
    },
    /// The cancellation token fired first
    Cancelled {
        /// Time spent polling
        waited: Duration,
    },
}

impl<T> PollOutcome<T> {
    /// True when the loop produced a value
    pub fn is_done(&self) -> bool {
        matches!(self, PollOutcome::Done(_))
    }
}

/// Poll until a check yields a value, the timeout elapses, or `cancel` fires.
///
/// The check returns `Ok(Some(v))` to finish, `Ok(None)` to keep polling, or
/// `Err` for a transient failure that is logged and polled through. Timeout
/// and cancellation are outcomes, not errors; callers decide whether they are
/// fatal.
///
/// A check still in flight when the deadline passes or `cancel` fires is
/// dropped, so a hung API call cannot hold the loop past either bound.
pub async fn poll_until<T, E, F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
    mut check_fn: F,
) -> PollOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
    E: std::fmt::Display,
{
    let start = Instant::now();
    let deadline = start + timeout;

    loop {
        if cancel.is_cancelled() {
            return PollOutcome::Cancelled {
                waited: start.elapsed(),
            };
        }

        let checked = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return PollOutcome::Cancelled { waited: start.elapsed() };
            }
            result = check_fn() => result,
            _ = tokio::time::sleep_until(deadline) => {
                trace!("Polling check still running at deadline");
                return PollOutcome::TimedOut { waited: start.elapsed() };
            }
        };

        match checked {
            Ok(Some(value)) => return PollOutcome::Done(value),
            Ok(None) => trace!("Polling condition not yet met, retrying..."),
            Err(e) => trace!(error = %e, "Polling check returned error (retrying)"),
        }

        let now = Instant::now();
        if now >= deadline {
            return PollOutcome::TimedOut {
                waited: start.elapsed(),
            };
        }
        let nap = poll_interval.min(deadline - now);

        tokio::select! {
            _ = cancel.cancelled() => {
                return PollOutcome::Cancelled { waited: start.elapsed() };
            }
            _ = tokio::time::sleep(nap) => {}
        }
    }
}

// =============================================================================
// Client + namespace
// =============================================================================

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Ensure a namespace exists (idempotent).
///
/// Uses server-side apply so it never fails on "already exists" and doesn't
/// race with concurrent creators.
pub async fn ensure_namespace(
    client: &Client,
    name: &str,
    field_manager: &str,
) -> Result<(), kube::Error> {
    let api: Api<Namespace> = Api::all(client.clone());
    let ns = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": { "name": name }
    });
    api.patch(name, &PatchParams::apply(field_manager), &Patch::Apply(&ns))
        .await?;
    Ok(())
}
