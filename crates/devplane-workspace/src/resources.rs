//! Desired-state builders for a workspace's resource set
//!
//! Pure functions: each returns the object devplane wants to exist. Applying
//! them is the store's job.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HTTPGetAction, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, Pod, PodSecurityContext,
    PodSpec, Probe, ResourceRequirements, SecurityContext, Service, ServicePort, ServiceSpec,
    Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use devplane_common::identity::workspace_host;
use devplane_common::istio::{
    ConnectionPool, Destination, DestinationRule, DestinationRuleSpec, HttpRetry, HttpRoute,
    HttpRouteDestination, HttpSettings, PortSelector, TcpSettings, TrafficPolicy, VirtualService,
    VirtualServiceSpec,
};
use devplane_common::kube_utils::ObjectMeta as MeshMeta;

use crate::config::WorkspaceConfig;
use crate::metadata::{selector_labels, ResourceNames, WorkspaceMetadata, LABEL_APP, LABEL_USER};

/// Home directory inside the code-server image; the claim is mounted here
pub const HOME_DIR: &str = "/home/coder";
/// Directory repositories are cloned under
pub const WORKSPACE_DIR: &str = "/home/coder/workspace";
/// Environment variable carrying the clone URL into the init container
pub const CLONE_URL_ENV: &str = "GIT_CLONE_URL";

const CODER_UID: i64 = 1000;
const VOLUME_NAME: &str = "home";
const READINESS_PATH: &str = "/healthz";

// Clone only when the checkout is missing so restarts keep local edits.
const CLONE_SCRIPT: &str = r#"set -eu
target="$WORKSPACE_DIR/$REPO_NAME"
if [ -d "$target/.git" ]; then
  echo "repository already present at $target"
  exit 0
fi
mkdir -p "$WORKSPACE_DIR"
git clone --branch "$BRANCH" --single-branch "$GIT_CLONE_URL" "$target"
"#;

fn object_meta(
    name: &str,
    namespace: &str,
    labels: BTreeMap<String, String>,
    annotations: Option<BTreeMap<String, String>>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        annotations,
        ..Default::default()
    }
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

/// Labels + annotations carried by both the Pod and the claim
fn workspace_meta(
    name: &str,
    names: &ResourceNames,
    config: &WorkspaceConfig,
    owner: &str,
    metadata: &WorkspaceMetadata,
) -> ObjectMeta {
    let mut labels = selector_labels(&names.id);
    labels.extend(metadata.labels());
    object_meta(
        name,
        &config.namespace,
        labels,
        Some(metadata.annotations(owner)),
    )
}

/// Storage claim: the durable anchor of a workspace
pub fn build_claim(
    names: &ResourceNames,
    config: &WorkspaceConfig,
    owner: &str,
    metadata: &WorkspaceMetadata,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: workspace_meta(&names.claim, names, config, owner, metadata),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: config.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(config.storage_size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Compute unit running code-server, with a clone init container
pub fn build_pod(
    names: &ResourceNames,
    config: &WorkspaceConfig,
    owner: &str,
    metadata: &WorkspaceMetadata,
    clone_url: &str,
) -> Pod {
    let mount = VolumeMount {
        name: VOLUME_NAME.to_string(),
        mount_path: HOME_DIR.to_string(),
        ..Default::default()
    };
    let non_root = SecurityContext {
        run_as_user: Some(CODER_UID),
        run_as_non_root: Some(true),
        allow_privilege_escalation: Some(false),
        ..Default::default()
    };

    let clone = Container {
        name: "clone".to_string(),
        image: Some(config.git_image.clone()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
        args: Some(vec![CLONE_SCRIPT.to_string()]),
        env: Some(vec![
            env(CLONE_URL_ENV, clone_url),
            env("BRANCH", &metadata.branch),
            env("REPO_NAME", &metadata.repo_name),
            env("WORKSPACE_DIR", WORKSPACE_DIR),
            env("HOME", "/tmp"),
        ]),
        volume_mounts: Some(vec![mount.clone()]),
        security_context: Some(non_root.clone()),
        ..Default::default()
    };

    let resources = ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(config.cpu_request.clone())),
            ("memory".to_string(), Quantity(config.memory_request.clone())),
        ])),
        limits: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(config.cpu_limit.clone())),
            ("memory".to_string(), Quantity(config.memory_limit.clone())),
        ])),
        ..Default::default()
    };

    let port = i32::from(config.container_port);
    let ide = Container {
        name: "code-server".to_string(),
        image: Some(config.image.clone()),
        args: Some(vec![
            "--bind-addr".to_string(),
            format!("0.0.0.0:{}", config.container_port),
            "--auth".to_string(),
            "none".to_string(),
            format!("{}/{}", WORKSPACE_DIR, metadata.repo_name),
        ]),
        ports: Some(vec![ContainerPort {
            name: Some("http".to_string()),
            container_port: port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some(READINESS_PATH.to_string()),
                port: IntOrString::Int(port),
                ..Default::default()
            }),
            initial_delay_seconds: Some(2),
            period_seconds: Some(5),
            failure_threshold: Some(3),
            ..Default::default()
        }),
        resources: Some(resources),
        volume_mounts: Some(vec![mount]),
        security_context: Some(non_root),
        ..Default::default()
    };

    Pod {
        metadata: workspace_meta(&names.pod, names, config, owner, metadata),
        spec: Some(PodSpec {
            init_containers: Some(vec![clone]),
            containers: vec![ide],
            volumes: Some(vec![Volume {
                name: VOLUME_NAME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: names.claim.clone(),
                    read_only: Some(false),
                }),
                ..Default::default()
            }]),
            security_context: Some(PodSecurityContext {
                fs_group: Some(CODER_UID),
                ..Default::default()
            }),
            restart_policy: Some("Always".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// ClusterIP Service selecting the user's pod
pub fn build_service(names: &ResourceNames, config: &WorkspaceConfig) -> Service {
    let labels = selector_labels(&names.id);
    let selector = BTreeMap::from([
        (LABEL_APP.to_string(), labels[LABEL_APP].clone()),
        (LABEL_USER.to_string(), names.id.clone()),
    ]);
    let port = i32::from(config.container_port);

    Service {
        metadata: object_meta(&names.service, &config.namespace, labels, None),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port,
                target_port: Some(IntOrString::Int(port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Route from `code-<id>.<base-domain>` through the gateway to the Service
pub fn build_virtual_service(names: &ResourceNames, config: &WorkspaceConfig) -> VirtualService {
    VirtualService::new(
        MeshMeta::new(&names.virtual_service, &config.namespace)
            .with_labels(&selector_labels(&names.id)),
        VirtualServiceSpec {
            hosts: vec![workspace_host(&names.id, &config.base_domain)],
            gateways: vec![config.gateway.clone()],
            http: vec![HttpRoute {
                route: vec![HttpRouteDestination {
                    destination: Destination {
                        host: names.service.clone(),
                        port: Some(PortSelector {
                            number: config.container_port,
                        }),
                    },
                }],
                timeout: Some(config.route_timeout.clone()),
                retries: Some(HttpRetry {
                    attempts: config.route_retries,
                    per_try_timeout: Some(config.route_per_try_timeout.clone()),
                    retry_on: Some("connect-failure,refused-stream,unavailable".to_string()),
                }),
            }],
        },
    )
}

/// Connection-pool policy toward the Service
pub fn build_destination_rule(names: &ResourceNames, config: &WorkspaceConfig) -> DestinationRule {
    DestinationRule::new(
        MeshMeta::new(&names.destination_rule, &config.namespace)
            .with_labels(&selector_labels(&names.id)),
        DestinationRuleSpec {
            host: names.service.clone(),
            traffic_policy: Some(TrafficPolicy {
                connection_pool: Some(ConnectionPool {
                    tcp: Some(TcpSettings {
                        max_connections: config.max_connections,
                    }),
                    http: Some(HttpSettings {
                        http1_max_pending_requests: config.max_pending_requests,
                        idle_timeout: Some(config.route_timeout.clone()),
                    }),
                }),
            }),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{BRANCH_KEY, OWNER_KEY, REPO_NAME_KEY};

    fn fixture() -> (ResourceNames, WorkspaceConfig, WorkspaceMetadata) {
        (
            ResourceNames::for_id("alice"),
            WorkspaceConfig::default(),
            WorkspaceMetadata::new("acme", "web", "develop"),
        )
    }

    #[test]
    fn claim_carries_metadata_and_size() {
        let (names, config, md) = fixture();
        let claim = build_claim(&names, &config, "alice@example.com", &md);

        let labels = claim.metadata.labels.as_ref().unwrap();
        assert_eq!(labels["user"], "alice");
        assert_eq!(labels[REPO_NAME_KEY], "web");
        let annotations = claim.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations[BRANCH_KEY], "develop");
        assert_eq!(annotations[OWNER_KEY], "alice@example.com");

        let spec = claim.spec.unwrap();
        let requests = spec.resources.unwrap().requests.unwrap();
        assert_eq!(requests["storage"], Quantity("10Gi".to_string()));
        assert!(spec.storage_class_name.is_none());
    }

    #[test]
    fn pod_mounts_claim_and_passes_clone_url_to_init() {
        let (names, config, md) = fixture();
        let pod = build_pod(&names, &config, "alice", &md, "https://git.example/acme/web.git");
        let spec = pod.spec.unwrap();

        let volume = &spec.volumes.as_ref().unwrap()[0];
        assert_eq!(
            volume.persistent_volume_claim.as_ref().unwrap().claim_name,
            "data-alice"
        );

        let init = &spec.init_containers.as_ref().unwrap()[0];
        let env = init.env.as_ref().unwrap();
        assert!(env.iter().any(|e| e.name == CLONE_URL_ENV
            && e.value.as_deref() == Some("https://git.example/acme/web.git")));
        assert!(env
            .iter()
            .any(|e| e.name == "BRANCH" && e.value.as_deref() == Some("develop")));

        let ide = &spec.containers[0];
        assert!(ide.readiness_probe.is_some());
        assert_eq!(
            ide.args.as_ref().unwrap().last().map(String::as_str),
            Some("/home/coder/workspace/web")
        );
    }

    #[test]
    fn service_selects_only_the_users_pod() {
        let (names, config, _) = fixture();
        let svc = build_service(&names, &config);
        let selector = svc.spec.unwrap().selector.unwrap();
        assert_eq!(selector.len(), 2);
        assert_eq!(selector["user"], "alice");
        assert_eq!(selector["app"], "code-server");
    }

    #[test]
    fn virtual_service_routes_workspace_host() {
        let (names, config, _) = fixture();
        let vs = build_virtual_service(&names, &config);
        assert_eq!(vs.spec.hosts, vec!["code-alice.dev.localhost".to_string()]);
        assert_eq!(vs.spec.gateways, vec![config.gateway.clone()]);
        let route = &vs.spec.http[0];
        assert_eq!(route.route[0].destination.host, "code-alice");
        assert_eq!(route.timeout.as_deref(), Some("3600s"));
        assert_eq!(route.retries.as_ref().unwrap().attempts, 3);
    }

    #[test]
    fn destination_rule_targets_service() {
        let (names, config, _) = fixture();
        let dr = build_destination_rule(&names, &config);
        assert_eq!(dr.spec.host, "code-alice");
        assert_eq!(dr.metadata.labels["user"], "alice");
    }
}
