//! devplane operator
//!
//! Runs the directory readiness reconciler (default) and exposes the
//! workspace lifecycle as admin subcommands against the current cluster.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use devplane_common::kube_utils::create_client;
use devplane_common::telemetry::{init_logging, LogFormat};
use devplane_directory::{
    unique_holder, ConfigMapMarker, DirectoryReconciler, DirectorySeed, LdapDirectory,
    LdapSettings, ReconcilerConfig, StatefulSetReplicas, MARKER_NAME,
};
use devplane_workspace::config::{DEFAULT_GIT_IMAGE, DEFAULT_IMAGE, DEFAULT_NAMESPACE};
use devplane_workspace::{
    CallerIdentity, GitServiceClient, KubeWorkspaceStore, OperationWarning, WorkspaceConfig,
    WorkspaceOrchestrator,
};

/// devplane - per-user code-server workspaces and directory bootstrap
#[derive(Parser, Debug)]
#[command(name = "devplane-operator", version, about, long_about = None)]
struct Cli {
    /// Path to kubeconfig (in-cluster config when unset)
    #[arg(long, env = "KUBECONFIG", global = true)]
    kubeconfig: Option<PathBuf>,

    /// Log output format
    #[arg(long, env = "DEVPLANE_LOG_FORMAT", value_enum, default_value_t = LogFormatArg::Json, global = true)]
    log_format: LogFormatArg,

    #[command(flatten)]
    directory: DirectoryArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Wait for the directory and seed it once (default mode)
    ReconcileDirectory,
    /// Print the effective directory seed as YAML and exit
    PrintSeed,
    /// Administer a user's workspace
    Workspace(WorkspaceArgs),
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormatArg {
    Json,
    Pretty,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Pretty => LogFormat::Pretty,
        }
    }
}

#[derive(Args, Debug)]
struct DirectoryArgs {
    /// Namespace of the directory StatefulSet and bootstrap marker
    #[arg(long, env = "DEVPLANE_DIRECTORY_NAMESPACE", default_value = "devplane-system", global = true)]
    directory_namespace: String,

    /// Directory StatefulSet name
    #[arg(long, env = "DEVPLANE_DIRECTORY_STATEFULSET", default_value = "openldap", global = true)]
    directory_statefulset: String,

    /// Bootstrap marker ConfigMap name
    #[arg(long, env = "DEVPLANE_BOOTSTRAP_MARKER", default_value = MARKER_NAME, global = true)]
    bootstrap_marker: String,

    /// Holder identity written to the marker; must be unique per replica
    /// (a random one is generated when unset)
    #[arg(long, env = "POD_NAME", global = true)]
    holder: Option<String>,

    /// Seconds between readiness polls
    #[arg(long, env = "DEVPLANE_DIRECTORY_POLL_SECS", default_value_t = 5, global = true)]
    directory_poll_secs: u64,

    /// Seconds to wait after the first ready replica
    #[arg(long, env = "DEVPLANE_DIRECTORY_SETTLE_SECS", default_value_t = 10, global = true)]
    directory_settle_secs: u64,

    /// Seconds after which a stalled bootstrap may be taken over
    #[arg(long, env = "DEVPLANE_BOOTSTRAP_LEASE_SECS", default_value_t = 300, global = true)]
    bootstrap_lease_secs: u64,

    /// LDAP server URL
    #[arg(long, env = "LDAP_URL", default_value = "ldap://openldap.devplane-system.svc:389", global = true)]
    ldap_url: String,

    /// DN bound for data entries
    #[arg(long, env = "LDAP_BIND_DN", default_value = "cn=admin,dc=devplane,dc=local", global = true)]
    ldap_bind_dn: String,

    /// Password for the data bind DN
    #[arg(long, env = "LDAP_BIND_PASSWORD", hide_env_values = true, global = true)]
    ldap_bind_password: Option<String>,

    /// DN bound for schema entries (defaults to the data bind DN)
    #[arg(long, env = "LDAP_CONFIG_BIND_DN", global = true)]
    ldap_config_bind_dn: Option<String>,

    /// Password for the schema bind DN
    #[arg(long, env = "LDAP_CONFIG_BIND_PASSWORD", hide_env_values = true, global = true)]
    ldap_config_bind_password: Option<String>,

    /// LDAP operation timeout in seconds
    #[arg(long, env = "LDAP_TIMEOUT_SECS", default_value_t = 10, global = true)]
    ldap_timeout_secs: u64,

    /// YAML seed file (built-in seed when unset)
    #[arg(long, env = "DEVPLANE_SEED_FILE", global = true)]
    seed_file: Option<PathBuf>,

    /// Exit after the bootstrap instead of idling until shutdown
    #[arg(long, global = true)]
    exit_when_done: bool,
}

/// The configured holder, or a generated one unique to this process
fn resolve_holder(configured: Option<&str>) -> String {
    match configured.filter(|h| !h.is_empty()) {
        Some(holder) => holder.to_string(),
        None => unique_holder(),
    }
}

impl DirectoryArgs {
    fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            namespace: self.directory_namespace.clone(),
            statefulset: self.directory_statefulset.clone(),
            marker_name: self.bootstrap_marker.clone(),
            holder: resolve_holder(self.holder.as_deref()),
            poll_interval: Duration::from_secs(self.directory_poll_secs),
            settle_delay: Duration::from_secs(self.directory_settle_secs),
            lease_duration: Duration::from_secs(self.bootstrap_lease_secs),
        }
    }

    fn ldap_settings(&self) -> anyhow::Result<LdapSettings> {
        let bind_password = self
            .ldap_bind_password
            .clone()
            .context("LDAP_BIND_PASSWORD (or --ldap-bind-password) is required")?;
        Ok(LdapSettings {
            url: self.ldap_url.clone(),
            bind_dn: self.ldap_bind_dn.clone(),
            bind_password,
            config_bind_dn: self.ldap_config_bind_dn.clone(),
            config_bind_password: self.ldap_config_bind_password.clone(),
            timeout: Duration::from_secs(self.ldap_timeout_secs),
        })
    }
}

#[derive(Args, Debug)]
struct WorkspaceArgs {
    #[command(flatten)]
    settings: WorkspaceFlags,

    #[command(subcommand)]
    action: WorkspaceAction,
}

#[derive(Args, Debug)]
struct WorkspaceFlags {
    /// Namespace holding every workspace
    #[arg(long, env = "DEVPLANE_WORKSPACE_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// code-server image
    #[arg(long, env = "DEVPLANE_WORKSPACE_IMAGE", default_value = DEFAULT_IMAGE)]
    image: String,

    /// Image used to clone the repository
    #[arg(long, env = "DEVPLANE_GIT_IMAGE", default_value = DEFAULT_GIT_IMAGE)]
    git_image: String,

    /// Storage claim size
    #[arg(long, env = "DEVPLANE_STORAGE_SIZE", default_value = "10Gi")]
    storage_size: String,

    /// Storage class (cluster default when unset)
    #[arg(long, env = "DEVPLANE_STORAGE_CLASS")]
    storage_class: Option<String>,

    /// Base domain for workspace hostnames
    #[arg(long, env = "DEVPLANE_BASE_DOMAIN", default_value = "dev.localhost")]
    base_domain: String,

    /// Istio gateway as namespace/name
    #[arg(long, env = "DEVPLANE_GATEWAY", default_value = "istio-system/workspace-gateway")]
    gateway: String,

    /// Seconds to wait for a workspace pod to become ready
    #[arg(long, env = "DEVPLANE_READY_TIMEOUT_SECS", default_value_t = 180)]
    ready_timeout_secs: u64,

    /// Seconds between readiness polls
    #[arg(long, env = "DEVPLANE_POLL_INTERVAL_SECS", default_value_t = 2)]
    poll_interval_secs: u64,

    /// Base URL of the Git host API
    #[arg(long, env = "DEVPLANE_GIT_URL", default_value = "http://gitea.devplane-system.svc:3000")]
    git_url: String,
}

impl WorkspaceFlags {
    fn config(&self) -> WorkspaceConfig {
        WorkspaceConfig {
            namespace: self.namespace.clone(),
            image: self.image.clone(),
            git_image: self.git_image.clone(),
            storage_size: self.storage_size.clone(),
            storage_class: self.storage_class.clone(),
            base_domain: self.base_domain.clone(),
            gateway: self.gateway.clone(),
            ready_timeout: Duration::from_secs(self.ready_timeout_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            ..WorkspaceConfig::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
struct CallerArgs {
    /// Workspace owner identity
    #[arg(long)]
    user: String,

    /// Git host token of the owner
    #[arg(long, env = "DEVPLANE_GIT_TOKEN", default_value = "", hide_env_values = true)]
    token: String,
}

impl CallerArgs {
    fn identity(&self) -> CallerIdentity {
        CallerIdentity::new(&self.user, &self.token)
    }
}

#[derive(Subcommand, Debug)]
enum WorkspaceAction {
    /// Create (or return) the user's workspace for a repository
    Provision {
        #[command(flatten)]
        caller: CallerArgs,
        /// Repository as owner/name
        #[arg(long)]
        repo: String,
        /// Branch (repository default when unset)
        #[arg(long)]
        branch: Option<String>,
    },
    /// Recreate a stopped workspace from its storage claim
    Start {
        #[command(flatten)]
        caller: CallerArgs,
    },
    /// Remove compute and routing, keep storage
    Stop {
        #[command(flatten)]
        caller: CallerArgs,
    },
    /// Remove everything including storage
    Delete {
        #[command(flatten)]
        caller: CallerArgs,
    },
    /// Recreate the pod with a fresh clone URL
    Sync {
        #[command(flatten)]
        caller: CallerArgs,
    },
    /// Show the user's workspace
    Get {
        #[command(flatten)]
        caller: CallerArgs,
    },
    /// Counts over every workspace
    Stats,
}

fn split_repository(repo: &str) -> anyhow::Result<(&str, &str)> {
    match repo.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((owner, name))
        }
        _ => anyhow::bail!("repository must be owner/name, got {repo:?}"),
    }
}

/// Cancel `token` on Ctrl-C
fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                token.cancel();
            }
            Err(e) => warn!(error = %e, "failed to listen for shutdown signal"),
        }
    });
}

fn report_warnings(warnings: &[OperationWarning]) {
    for w in warnings {
        warn!(warning = %w, "workspace operation finished with warning");
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format.into())?;

    match cli.command.unwrap_or(Commands::ReconcileDirectory) {
        Commands::ReconcileDirectory => run_directory_reconciler(&cli.kubeconfig, &cli.directory).await,
        Commands::PrintSeed => {
            let seed = DirectorySeed::load(cli.directory.seed_file.as_deref())?;
            print!("{}", seed.to_yaml()?);
            Ok(())
        }
        Commands::Workspace(args) => run_workspace(&cli.kubeconfig, args).await,
    }
}

async fn run_directory_reconciler(
    kubeconfig: &Option<PathBuf>,
    args: &DirectoryArgs,
) -> anyhow::Result<()> {
    let seed = DirectorySeed::load(args.seed_file.as_deref())?;
    let ldap = LdapDirectory::new(args.ldap_settings()?);
    let config = args.reconciler_config();

    let client = create_client(kubeconfig.as_deref()).await?;
    let replicas = StatefulSetReplicas::new(client.clone(), &config.namespace, &config.statefulset);
    let marker = ConfigMapMarker::new(
        client,
        &config.namespace,
        &config.marker_name,
        config.lease_duration,
    );

    let reconciler = DirectoryReconciler::new(
        Arc::new(replicas),
        Arc::new(marker),
        Arc::new(ldap),
        seed,
        config,
    );

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());

    if let Some(report) = reconciler.run(cancel.clone()).await {
        if report.is_clean() {
            info!(created = report.created.len(), existing = report.existing.len(), "directory seeded");
        } else {
            for failed in &report.failed {
                warn!(dn = %failed.dn, error = %failed.error, "directory entry not seeded");
            }
        }
    }

    if !args.exit_when_done && !cancel.is_cancelled() {
        info!("directory reconciler idle until shutdown");
        cancel.cancelled().await;
    }
    info!("devplane operator stopped");
    Ok(())
}

async fn run_workspace(kubeconfig: &Option<PathBuf>, args: WorkspaceArgs) -> anyhow::Result<()> {
    let config = args.settings.config();
    let client = create_client(kubeconfig.as_deref()).await?;
    let store = KubeWorkspaceStore::new(client, config.namespace.clone());
    let repos = GitServiceClient::new(&args.settings.git_url)?;
    let orchestrator = WorkspaceOrchestrator::new(Arc::new(store), Arc::new(repos), config);

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());

    match args.action {
        WorkspaceAction::Provision { caller, repo, branch } => {
            let (repo_owner, repo_name) = split_repository(&repo)?;
            let outcome = orchestrator
                .provision(&caller.identity(), repo_owner, repo_name, branch.as_deref(), &cancel)
                .await?;
            info!(is_new = outcome.is_new, "{}", outcome.message);
            report_warnings(&outcome.warnings);
            print_json(&outcome.instance)
        }
        WorkspaceAction::Start { caller } => {
            let outcome = orchestrator.start(&caller.identity(), &cancel).await?;
            report_warnings(&outcome.warnings);
            print_json(&outcome.instance)
        }
        WorkspaceAction::Stop { caller } => {
            let stopped = orchestrator.stop(&caller.identity()).await?;
            print_json(&serde_json::json!({ "stopped": stopped }))
        }
        WorkspaceAction::Delete { caller } => {
            let outcome = orchestrator.delete(&caller.identity()).await?;
            for w in &outcome.warnings {
                warn!(warning = %w, "workspace teardown incomplete");
            }
            print_json(&serde_json::json!({
                "deleted": outcome.deleted,
                "warnings": outcome.warnings.iter().map(ToString::to_string).collect::<Vec<_>>(),
            }))
        }
        WorkspaceAction::Sync { caller } => {
            let outcome = orchestrator.sync(&caller.identity(), &cancel).await?;
            report_warnings(&outcome.warnings);
            print_json(&outcome.instance)
        }
        WorkspaceAction::Get { caller } => print_json(&orchestrator.get(&caller.identity()).await?),
        WorkspaceAction::Stats => print_json(&orchestrator.stats().await?),
    }
}
