//! Idempotent ensure-present / ensure-absent primitives over the cluster
//!
//! Every primitive follows the same contract: get, create if missing, patch
//! the mutable fields if present, treat a 409 on create as "someone else won
//! the race" (re-fetch and return), and treat a 404 on delete as success.
//! There is no locking here; the API server's create conflict is the only
//! guard against concurrent callers.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use devplane_common::istio::{DestinationRule, VirtualService};
use devplane_common::kube_utils::{ensure_namespace, is_conflict, is_not_found, HasApiResource};
use devplane_common::{Error, FIELD_MANAGER};

use crate::metadata::{ResourceNames, LABEL_USER, WORKSPACE_SELECTOR};

/// Attempts at reading a pod/claim pair without the claim changing underneath
const SNAPSHOT_ATTEMPTS: usize = 3;

/// Pod and claim of one workspace, read together.
///
/// The pair is validated so the claim did not change while the pod was read;
/// projections over a snapshot never mix states that did not coexist.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceSnapshot {
    /// Sanitized owner id
    pub id: String,
    /// Compute unit, if it exists
    pub pod: Option<Pod>,
    /// Storage claim, if it exists
    pub claim: Option<PersistentVolumeClaim>,
}

/// Cluster operations the workspace workflows depend on.
///
/// Bound to one namespace. Mocked in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    /// Ensure the workspace namespace exists
    async fn ensure_namespace(&self) -> Result<(), Error>;

    /// Ensure the storage claim exists. An existing claim is returned
    /// untouched; the coordinates it recorded at creation stay authoritative.
    async fn ensure_claim(
        &self,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, Error>;

    /// Get a pod by name
    async fn get_pod(&self, name: &str) -> Result<Option<Pod>, Error>;

    /// Ensure a pod exists. Pods are immutable here; an existing pod is
    /// returned untouched.
    async fn ensure_pod(&self, pod: &Pod) -> Result<Pod, Error>;

    /// Ensure a Service exists with the given ports and selector
    async fn ensure_service(&self, service: &Service) -> Result<Service, Error>;

    /// Ensure a VirtualService exists with the given hosts, timeout and retries
    async fn ensure_virtual_service(
        &self,
        route: &VirtualService,
    ) -> Result<VirtualService, Error>;

    /// Ensure a DestinationRule exists with the given traffic policy
    async fn ensure_destination_rule(
        &self,
        rule: &DestinationRule,
    ) -> Result<DestinationRule, Error>;

    /// Delete a pod; `Ok(false)` when it was already gone
    async fn delete_pod(&self, name: &str) -> Result<bool, Error>;

    /// Delete a Service; `Ok(false)` when it was already gone
    async fn delete_service(&self, name: &str) -> Result<bool, Error>;

    /// Delete a VirtualService; `Ok(false)` when it was already gone
    async fn delete_virtual_service(&self, name: &str) -> Result<bool, Error>;

    /// Delete a DestinationRule; `Ok(false)` when it was already gone
    async fn delete_destination_rule(&self, name: &str) -> Result<bool, Error>;

    /// Delete a storage claim; `Ok(false)` when it was already gone
    async fn delete_claim(&self, name: &str) -> Result<bool, Error>;

    /// Read one workspace's pod and claim as a consistent pair
    async fn snapshot(&self, names: &ResourceNames) -> Result<WorkspaceSnapshot, Error>;

    /// Read every managed workspace in the namespace
    async fn list_snapshots(&self) -> Result<Vec<WorkspaceSnapshot>, Error>;
}

/// [`WorkspaceStore`] backed by the Kubernetes API
pub struct KubeWorkspaceStore {
    client: Client,
    namespace: String,
}

impl KubeWorkspaceStore {
    /// Create a store for one namespace
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn mesh_api<K: HasApiResource>(&self) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.namespace, &K::api_resource())
    }

    async fn get_claim(&self, name: &str) -> Result<Option<PersistentVolumeClaim>, Error> {
        self.api::<PersistentVolumeClaim>()
            .get_opt(name)
            .await
            .map_err(|e| Error::resource("get", "PersistentVolumeClaim", &self.namespace, name, e))
    }

    async fn list_managed<K>(&self, kind: &str) -> Result<Vec<K>, Error>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let params = ListParams::default().labels(WORKSPACE_SELECTOR);
        self.api::<K>()
            .list(&params)
            .await
            .map(|list| list.items)
            .map_err(|e| Error::resource("list", kind, &self.namespace, "*", e))
    }
}

/// Create-if-missing, patch-if-present, re-fetch on create conflict.
///
/// `mutable` is a merge patch of the fields callers are allowed to change on
/// an existing object; `None` leaves existing objects untouched.
async fn ensure_present<K>(
    api: &Api<K>,
    kind: &str,
    namespace: &str,
    name: &str,
    desired: &K,
    mutable: Option<serde_json::Value>,
) -> Result<K, Error>
where
    K: Clone + DeserializeOwned + Serialize + Debug,
{
    let existing = api
        .get_opt(name)
        .await
        .map_err(|e| Error::resource("get", kind, namespace, name, e))?;

    match existing {
        None => match api.create(&PostParams::default(), desired).await {
            Ok(created) => {
                info!(kind, name, namespace, "created resource");
                Ok(created)
            }
            Err(e) if is_conflict(&e) => {
                debug!(kind, name, namespace, "lost create race, using existing resource");
                api.get(name)
                    .await
                    .map_err(|e| Error::resource("get", kind, namespace, name, e))
            }
            Err(e) => Err(Error::resource("create", kind, namespace, name, e)),
        },
        Some(current) => match mutable {
            Some(patch) => {
                let patched = api
                    .patch(
                        name,
                        &PatchParams::apply(FIELD_MANAGER),
                        &Patch::Merge(&patch),
                    )
                    .await
                    .map_err(|e| Error::resource("patch", kind, namespace, name, e))?;
                info!(kind, name, namespace, "patched existing resource");
                Ok(patched)
            }
            None => {
                debug!(kind, name, namespace, "resource already exists");
                Ok(current)
            }
        },
    }
}

/// Delete by name; 404 means already absent.
async fn ensure_absent<K>(
    api: &Api<K>,
    kind: &str,
    namespace: &str,
    name: &str,
) -> Result<bool, Error>
where
    K: Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => {
            info!(kind, name, namespace, "deleted resource");
            Ok(true)
        }
        Err(e) if is_not_found(&e) => {
            debug!(kind, name, namespace, "resource already absent");
            Ok(false)
        }
        Err(e) => Err(Error::resource("delete", kind, namespace, name, e)),
    }
}

fn to_dynamic<T: Serialize>(kind: &str, value: &T) -> Result<DynamicObject, Error> {
    let json = serde_json::to_value(value)
        .map_err(|e| Error::serialization_for_kind(kind, e.to_string()))?;
    serde_json::from_value(json).map_err(|e| Error::serialization_for_kind(kind, e.to_string()))
}

fn from_dynamic<T: DeserializeOwned>(kind: &str, obj: DynamicObject) -> Result<T, Error> {
    let json = serde_json::to_value(obj)
        .map_err(|e| Error::serialization_for_kind(kind, e.to_string()))?;
    serde_json::from_value(json).map_err(|e| Error::serialization_for_kind(kind, e.to_string()))
}

fn service_patch(service: &Service) -> serde_json::Value {
    let mut spec = serde_json::Map::new();
    if let Some(desired) = service.spec.as_ref() {
        if let Some(ports) = &desired.ports {
            spec.insert("ports".to_string(), serde_json::json!(ports));
        }
        if let Some(selector) = &desired.selector {
            spec.insert("selector".to_string(), serde_json::json!(selector));
        }
    }
    serde_json::json!({ "spec": spec })
}

fn resource_version<K: Resource>(obj: Option<&K>) -> Option<String> {
    obj.and_then(|o| o.meta().resource_version.clone())
}

fn versions(claims: &[PersistentVolumeClaim]) -> BTreeMap<String, Option<String>> {
    claims
        .iter()
        .map(|c| (c.name_any(), c.resource_version()))
        .collect()
}

fn user_label<K: Resource>(obj: &K) -> Option<String> {
    obj.meta()
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_USER))
        .cloned()
}

/// Group claims and pods into per-user snapshots by their `user` label
fn group_by_user(claims: Vec<PersistentVolumeClaim>, pods: Vec<Pod>) -> Vec<WorkspaceSnapshot> {
    let mut by_id: BTreeMap<String, WorkspaceSnapshot> = BTreeMap::new();
    for claim in claims {
        if let Some(id) = user_label(&claim) {
            by_id
                .entry(id.clone())
                .or_insert_with(|| WorkspaceSnapshot {
                    id,
                    ..Default::default()
                })
                .claim = Some(claim);
        }
    }
    for pod in pods {
        if let Some(id) = user_label(&pod) {
            by_id
                .entry(id.clone())
                .or_insert_with(|| WorkspaceSnapshot {
                    id,
                    ..Default::default()
                })
                .pod = Some(pod);
        }
    }
    by_id.into_values().collect()
}

#[async_trait]
impl WorkspaceStore for KubeWorkspaceStore {
    async fn ensure_namespace(&self) -> Result<(), Error> {
        ensure_namespace(&self.client, &self.namespace, FIELD_MANAGER)
            .await
            .map_err(|e| Error::resource("apply", "Namespace", "", &self.namespace, e))
    }

    async fn ensure_claim(
        &self,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, Error> {
        ensure_present(
            &self.api::<PersistentVolumeClaim>(),
            "PersistentVolumeClaim",
            &self.namespace,
            &claim.name_any(),
            claim,
            None,
        )
        .await
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>, Error> {
        self.api::<Pod>()
            .get_opt(name)
            .await
            .map_err(|e| Error::resource("get", "Pod", &self.namespace, name, e))
    }

    async fn ensure_pod(&self, pod: &Pod) -> Result<Pod, Error> {
        ensure_present(
            &self.api::<Pod>(),
            "Pod",
            &self.namespace,
            &pod.name_any(),
            pod,
            None,
        )
        .await
    }

    async fn ensure_service(&self, service: &Service) -> Result<Service, Error> {
        ensure_present(
            &self.api::<Service>(),
            "Service",
            &self.namespace,
            &service.name_any(),
            service,
            Some(service_patch(service)),
        )
        .await
    }

    async fn ensure_virtual_service(
        &self,
        route: &VirtualService,
    ) -> Result<VirtualService, Error> {
        let kind = VirtualService::KIND;
        let desired = to_dynamic(kind, route)?;
        // hosts + http carry the host, timeout and retry policy
        let patch = serde_json::json!({
            "spec": {
                "hosts": route.spec.hosts,
                "gateways": route.spec.gateways,
                "http": route.spec.http,
            }
        });
        let live = ensure_present(
            &self.mesh_api::<VirtualService>(),
            kind,
            &self.namespace,
            &route.metadata.name,
            &desired,
            Some(patch),
        )
        .await?;
        from_dynamic(kind, live)
    }

    async fn ensure_destination_rule(
        &self,
        rule: &DestinationRule,
    ) -> Result<DestinationRule, Error> {
        let kind = DestinationRule::KIND;
        let desired = to_dynamic(kind, rule)?;
        let mut spec = serde_json::Map::new();
        spec.insert("host".to_string(), serde_json::json!(rule.spec.host));
        if let Some(policy) = &rule.spec.traffic_policy {
            spec.insert("trafficPolicy".to_string(), serde_json::json!(policy));
        }
        let live = ensure_present(
            &self.mesh_api::<DestinationRule>(),
            kind,
            &self.namespace,
            &rule.metadata.name,
            &desired,
            Some(serde_json::json!({ "spec": spec })),
        )
        .await?;
        from_dynamic(kind, live)
    }

    async fn delete_pod(&self, name: &str) -> Result<bool, Error> {
        ensure_absent(&self.api::<Pod>(), "Pod", &self.namespace, name).await
    }

    async fn delete_service(&self, name: &str) -> Result<bool, Error> {
        ensure_absent(&self.api::<Service>(), "Service", &self.namespace, name).await
    }

    async fn delete_virtual_service(&self, name: &str) -> Result<bool, Error> {
        ensure_absent(
            &self.mesh_api::<VirtualService>(),
            VirtualService::KIND,
            &self.namespace,
            name,
        )
        .await
    }

    async fn delete_destination_rule(&self, name: &str) -> Result<bool, Error> {
        ensure_absent(
            &self.mesh_api::<DestinationRule>(),
            DestinationRule::KIND,
            &self.namespace,
            name,
        )
        .await
    }

    async fn delete_claim(&self, name: &str) -> Result<bool, Error> {
        ensure_absent(
            &self.api::<PersistentVolumeClaim>(),
            "PersistentVolumeClaim",
            &self.namespace,
            name,
        )
        .await
    }

    async fn snapshot(&self, names: &ResourceNames) -> Result<WorkspaceSnapshot, Error> {
        for attempt in 1..=SNAPSHOT_ATTEMPTS {
            let before = self.get_claim(&names.claim).await?;
            let pod = self.get_pod(&names.pod).await?;
            let after = self.get_claim(&names.claim).await?;

            if resource_version(before.as_ref()) == resource_version(after.as_ref()) {
                return Ok(WorkspaceSnapshot {
                    id: names.id.clone(),
                    pod,
                    claim: after,
                });
            }
            debug!(workspace = %names.id, attempt, "claim changed during snapshot, re-reading");
        }

        Err(Error::internal_with_context(
            "snapshot",
            format!(
                "claim {} kept changing across {} reads",
                names.claim, SNAPSHOT_ATTEMPTS
            ),
        ))
    }

    async fn list_snapshots(&self) -> Result<Vec<WorkspaceSnapshot>, Error> {
        const CLAIM: &str = "PersistentVolumeClaim";

        for attempt in 1..=SNAPSHOT_ATTEMPTS {
            let before = self.list_managed::<PersistentVolumeClaim>(CLAIM).await?;
            let pods = self.list_managed::<Pod>("Pod").await?;
            let after = self.list_managed::<PersistentVolumeClaim>(CLAIM).await?;

            if versions(&before) == versions(&after) {
                return Ok(group_by_user(after, pods));
            }
            debug!(attempt, "claims changed during listing, re-reading");
        }

        warn!(namespace = %self.namespace, "claims kept changing while listing workspaces");
        Err(Error::internal_with_context(
            "list_snapshots",
            "claims kept changing while listing workspaces",
        ))
    }
}
