//! Workspace controller configuration

use std::time::Duration;

/// Default namespace holding every workspace
pub const DEFAULT_NAMESPACE: &str = "workspaces";

/// Default code-server image
pub const DEFAULT_IMAGE: &str = "codercom/code-server:4.96.4";

/// Default image for the clone init container
pub const DEFAULT_GIT_IMAGE: &str = "alpine/git:2.47.2";

/// Port code-server listens on inside the pod
pub const DEFAULT_CONTAINER_PORT: u16 = 8080;

/// Tunables for workspace provisioning.
///
/// The operator binary fills this from flags/env; tests use `Default`.
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// Namespace every workspace resource lives in
    pub namespace: String,
    /// code-server image
    pub image: String,
    /// Image with `git` used to clone the repository into the volume
    pub git_image: String,
    /// Requested size of each storage claim (Kubernetes quantity)
    pub storage_size: String,
    /// Storage class; `None` uses the cluster default
    pub storage_class: Option<String>,
    /// Base domain for `code-<id>.<base_domain>` hostnames
    pub base_domain: String,
    /// URL scheme used when reporting workspace URLs
    pub url_scheme: String,
    /// Istio gateway (`namespace/name`) the routes bind to
    pub gateway: String,
    /// Port code-server listens on
    pub container_port: u16,
    /// CPU request
    pub cpu_request: String,
    /// Memory request
    pub memory_request: String,
    /// CPU limit
    pub cpu_limit: String,
    /// Memory limit
    pub memory_limit: String,
    /// How long provision/start/sync wait for the pod to become ready
    pub ready_timeout: Duration,
    /// Interval between readiness polls
    pub poll_interval: Duration,
    /// Route timeout (long, to keep editor websockets open)
    pub route_timeout: String,
    /// Retry attempts on the route
    pub route_retries: u32,
    /// Per-try timeout on the route
    pub route_per_try_timeout: String,
    /// Max TCP connections toward one workspace
    pub max_connections: u32,
    /// Max pending HTTP/1 requests toward one workspace
    pub max_pending_requests: u32,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            image: DEFAULT_IMAGE.to_string(),
            git_image: DEFAULT_GIT_IMAGE.to_string(),
            storage_size: "10Gi".to_string(),
            storage_class: None,
            base_domain: "dev.localhost".to_string(),
            url_scheme: "https".to_string(),
            gateway: "istio-system/workspace-gateway".to_string(),
            container_port: DEFAULT_CONTAINER_PORT,
            cpu_request: "250m".to_string(),
            memory_request: "512Mi".to_string(),
            cpu_limit: "2".to_string(),
            memory_limit: "4Gi".to_string(),
            ready_timeout: Duration::from_secs(180),
            poll_interval: Duration::from_secs(2),
            route_timeout: "3600s".to_string(),
            route_retries: 3,
            route_per_try_timeout: "30s".to_string(),
            max_connections: 100,
            max_pending_requests: 64,
        }
    }
}

impl WorkspaceConfig {
    /// External URL for a host
    pub fn url_for_host(&self, host: &str) -> String {
        format!("{}://{}", self.url_scheme, host)
    }
}
