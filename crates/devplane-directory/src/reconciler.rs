//! Directory readiness reconciler
//!
//! Polls the directory StatefulSet until at least one replica is ready, waits
//! a settle delay, then runs the seed bootstrap once. The in-process
//! [`BootstrapState`] keeps a second `run` in the same process from starting
//! another bootstrap; the [`BootstrapMarker`] does the same across replicas.
//! While seeding, the lease on the marker is renewed every third of the lease
//! duration.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::Api;
use kube::Client;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use devplane_common::Error;

use crate::bootstrap::{run_bootstrap, BootstrapReport};
use crate::error::DirectoryError;
use crate::ldap::DirectoryClient;
use crate::marker::{unique_holder, BootstrapMarker, BootstrapState, MarkerClaim, MARKER_NAME};
use crate::seed::DirectorySeed;

/// Ready replica count of the directory workload
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReadyReplicaSource: Send + Sync {
    /// Replicas currently passing readiness; 0 when the workload is absent
    async fn ready_replicas(&self) -> Result<i32, DirectoryError>;
}

/// [`ReadyReplicaSource`] reading `status.readyReplicas` of a StatefulSet
pub struct StatefulSetReplicas {
    api: Api<StatefulSet>,
    namespace: String,
    name: String,
}

impl StatefulSetReplicas {
    /// Read the StatefulSet `namespace/name`
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl ReadyReplicaSource for StatefulSetReplicas {
    async fn ready_replicas(&self) -> Result<i32, DirectoryError> {
        let sts = self
            .api
            .get_opt(&self.name)
            .await
            .map_err(|e| Error::resource("get", "StatefulSet", &self.namespace, &self.name, e))?;
        Ok(sts
            .and_then(|s| s.status)
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0))
    }
}

/// Reconciler tunables
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Namespace of the StatefulSet and the marker
    pub namespace: String,
    /// Directory StatefulSet name
    pub statefulset: String,
    /// Marker ConfigMap name
    pub marker_name: String,
    /// This process's identity in the marker; must differ between replicas
    pub holder: String,
    /// Wait between readiness polls
    pub poll_interval: Duration,
    /// Wait after the first ready replica before writing
    pub settle_delay: Duration,
    /// Age after which a `Running` marker may be taken over
    pub lease_duration: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            namespace: "devplane-system".to_string(),
            statefulset: "openldap".to_string(),
            marker_name: MARKER_NAME.to_string(),
            holder: unique_holder(),
            poll_interval: Duration::from_secs(5),
            settle_delay: Duration::from_secs(10),
            lease_duration: Duration::from_secs(300),
        }
    }
}

/// Waits for the directory and bootstraps it once
pub struct DirectoryReconciler {
    replicas: Arc<dyn ReadyReplicaSource>,
    marker: Arc<dyn BootstrapMarker>,
    directory: Arc<dyn DirectoryClient>,
    seed: DirectorySeed,
    config: ReconcilerConfig,
    state: RwLock<BootstrapState>,
}

impl DirectoryReconciler {
    /// Reconciler seeding `directory` with `seed` once `replicas` reports
    /// readiness
    pub fn new(
        replicas: Arc<dyn ReadyReplicaSource>,
        marker: Arc<dyn BootstrapMarker>,
        directory: Arc<dyn DirectoryClient>,
        seed: DirectorySeed,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            replicas,
            marker,
            directory,
            seed,
            config,
            state: RwLock::new(BootstrapState::NotStarted),
        }
    }

    /// Current in-process state
    pub async fn state(&self) -> BootstrapState {
        *self.state.read().await
    }

    /// Run until the bootstrap is done (here or elsewhere) or `cancel` fires.
    ///
    /// Returns the report when this process ran the bootstrap.
    #[instrument(skip_all, fields(statefulset = %self.config.statefulset, holder = %self.config.holder))]
    pub async fn run(&self, cancel: CancellationToken) -> Option<BootstrapReport> {
        info!("waiting for directory to become ready");
        loop {
            if cancel.is_cancelled() {
                info!("directory reconciler cancelled");
                return None;
            }
            if self.state().await != BootstrapState::NotStarted {
                debug!("bootstrap already handled in this process");
                return None;
            }

            match self.replicas.ready_replicas().await {
                Ok(ready) if ready >= 1 => {
                    info!(ready, "directory ready, settling before bootstrap");
                    if !sleep_or_cancel(self.config.settle_delay, &cancel).await {
                        return None;
                    }
                    match self.try_bootstrap().await {
                        Ok(Some(outcome)) => return outcome,
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "could not claim directory bootstrap, retrying"),
                    }
                }
                Ok(ready) => debug!(ready, "directory not ready yet"),
                Err(e) => warn!(error = %e, "failed to read directory readiness, retrying"),
            }

            if !sleep_or_cancel(self.config.poll_interval, &cancel).await {
                info!("directory reconciler cancelled");
                return None;
            }
        }
    }

    /// `Ok(Some(_))` when the loop should stop, `Ok(None)` to keep polling
    async fn try_bootstrap(&self) -> Result<Option<Option<BootstrapReport>>, DirectoryError> {
        {
            let mut state = self.state.write().await;
            if *state != BootstrapState::NotStarted {
                return Ok(Some(None));
            }
            match self.marker.try_claim(&self.config.holder).await? {
                MarkerClaim::Done => {
                    info!("directory already bootstrapped");
                    *state = BootstrapState::Done;
                    return Ok(Some(None));
                }
                MarkerClaim::HeldElsewhere => {
                    debug!("another replica is bootstrapping the directory");
                    return Ok(None);
                }
                MarkerClaim::Acquired => *state = BootstrapState::Running,
            }
        }

        let report = self.bootstrap_renewing().await;
        if let Err(e) = self.marker.mark_done(&self.config.holder, &report).await {
            warn!(error = %e, "bootstrap finished but the marker could not be updated");
        }
        *self.state.write().await = BootstrapState::Done;
        Ok(Some(Some(report)))
    }

    /// Run the seed while refreshing the marker lease in the background
    async fn bootstrap_renewing(&self) -> BootstrapReport {
        let bootstrap = run_bootstrap(self.directory.as_ref(), &self.seed);
        tokio::pin!(bootstrap);

        let period = (self.config.lease_duration / 3).max(Duration::from_millis(10));
        let mut renewal = tokio::time::interval(period);
        renewal.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately; the claim is brand new
        renewal.tick().await;

        loop {
            tokio::select! {
                report = &mut bootstrap => return report,
                _ = renewal.tick() => match self.marker.renew(&self.config.holder).await {
                    Ok(true) => debug!("renewed bootstrap lease"),
                    Ok(false) => warn!("bootstrap marker no longer held by this process, finishing the run"),
                    Err(e) => warn!(error = %e, "failed to renew bootstrap lease"),
                },
            }
        }
    }
}

/// Sleep for `duration`; false when cancelled first
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldap::{DirectoryClient, EntryOutcome, MockDirectoryClient};
    use crate::marker::MockBootstrapMarker;
    use crate::seed::DirectoryEntry;
    use std::sync::atomic::{AtomicI32, Ordering};

    /// Directory that takes `delay` per entry
    struct SlowDirectory {
        delay: Duration,
    }

    #[async_trait]
    impl DirectoryClient for SlowDirectory {
        async fn add_schema(&self, _: &DirectoryEntry) -> Result<EntryOutcome, DirectoryError> {
            tokio::time::sleep(self.delay).await;
            Ok(EntryOutcome::Created)
        }

        async fn add_entry(&self, _: &DirectoryEntry) -> Result<EntryOutcome, DirectoryError> {
            tokio::time::sleep(self.delay).await;
            Ok(EntryOutcome::Created)
        }
    }

    fn fast_config() -> ReconcilerConfig {
        ReconcilerConfig {
            poll_interval: Duration::from_millis(5),
            settle_delay: Duration::from_millis(5),
            holder: "devplane-0".to_string(),
            ..Default::default()
        }
    }

    fn ready_after(polls: i32) -> MockReadyReplicaSource {
        let count = Arc::new(AtomicI32::new(0));
        let mut source = MockReadyReplicaSource::new();
        source.expect_ready_replicas().returning(move || {
            let n = count.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err(DirectoryError::seed("x", "transient"))
            } else if n < polls {
                Ok(0)
            } else {
                Ok(1)
            }
        });
        source
    }

    fn accepting_directory() -> MockDirectoryClient {
        let mut dir = MockDirectoryClient::new();
        dir.expect_add_schema()
            .returning(|_| Ok(EntryOutcome::Created));
        dir.expect_add_entry().returning(|_| Ok(EntryOutcome::Created));
        dir
    }

    #[tokio::test]
    async fn bootstraps_once_when_ready() {
        let mut marker = MockBootstrapMarker::new();
        marker
            .expect_try_claim()
            .times(1)
            .returning(|_| Ok(MarkerClaim::Acquired));
        marker
            .expect_mark_done()
            .times(1)
            .withf(|holder, report| holder == "devplane-0" && report.is_clean())
            .returning(|_, _| Ok(()));

        let reconciler = DirectoryReconciler::new(
            Arc::new(ready_after(3)),
            Arc::new(marker),
            Arc::new(accepting_directory()),
            DirectorySeed::default(),
            fast_config(),
        );

        let report = reconciler.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.created.len(), 6);
        assert_eq!(reconciler.state().await, BootstrapState::Done);

        // a second run in the same process does nothing
        assert!(reconciler.run(CancellationToken::new()).await.is_none());
    }

    #[tokio::test]
    async fn long_bootstrap_keeps_renewing_its_lease() {
        let renewals = Arc::new(AtomicI32::new(0));
        let seen = renewals.clone();
        let mut marker = MockBootstrapMarker::new();
        marker
            .expect_try_claim()
            .returning(|_| Ok(MarkerClaim::Acquired));
        marker.expect_renew().returning(move |holder| {
            assert_eq!(holder, "devplane-0");
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        });
        marker.expect_mark_done().times(1).returning(|_, _| Ok(()));

        // six entries at 30ms each outlast the 60ms lease several times over
        let config = ReconcilerConfig {
            lease_duration: Duration::from_millis(60),
            ..fast_config()
        };
        let reconciler = DirectoryReconciler::new(
            Arc::new(ready_after(1)),
            Arc::new(marker),
            Arc::new(SlowDirectory {
                delay: Duration::from_millis(30),
            }),
            DirectorySeed::default(),
            config,
        );

        let report = reconciler.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.created.len(), 6);
        assert!(renewals.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn lost_lease_still_finishes_the_run() {
        let mut marker = MockBootstrapMarker::new();
        marker
            .expect_try_claim()
            .returning(|_| Ok(MarkerClaim::Acquired));
        marker.expect_renew().returning(|_| Ok(false));
        marker.expect_mark_done().times(1).returning(|_, _| Ok(()));

        let config = ReconcilerConfig {
            lease_duration: Duration::from_millis(30),
            ..fast_config()
        };
        let reconciler = DirectoryReconciler::new(
            Arc::new(ready_after(1)),
            Arc::new(marker),
            Arc::new(SlowDirectory {
                delay: Duration::from_millis(20),
            }),
            DirectorySeed::default(),
            config,
        );

        assert!(reconciler.run(CancellationToken::new()).await.is_some());
        assert_eq!(reconciler.state().await, BootstrapState::Done);
    }

    #[test]
    fn default_holders_are_unique() {
        assert_ne!(
            ReconcilerConfig::default().holder,
            ReconcilerConfig::default().holder
        );
    }

    #[tokio::test]
    async fn finished_marker_skips_bootstrap() {
        let mut marker = MockBootstrapMarker::new();
        marker
            .expect_try_claim()
            .returning(|_| Ok(MarkerClaim::Done));
        marker.expect_mark_done().never();
        let mut dir = MockDirectoryClient::new();
        dir.expect_add_entry().never();
        dir.expect_add_schema().never();

        let reconciler = DirectoryReconciler::new(
            Arc::new(ready_after(1)),
            Arc::new(marker),
            Arc::new(dir),
            DirectorySeed::default(),
            fast_config(),
        );

        assert!(reconciler.run(CancellationToken::new()).await.is_none());
        assert_eq!(reconciler.state().await, BootstrapState::Done);
    }

    #[tokio::test]
    async fn waits_while_another_replica_holds_the_marker() {
        let claims = Arc::new(AtomicI32::new(0));
        let seen = claims.clone();
        let mut marker = MockBootstrapMarker::new();
        marker.expect_try_claim().returning(move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                Ok(MarkerClaim::HeldElsewhere)
            } else {
                Ok(MarkerClaim::Done)
            }
        });

        let reconciler = DirectoryReconciler::new(
            Arc::new(ready_after(1)),
            Arc::new(marker),
            Arc::new(MockDirectoryClient::new()),
            DirectorySeed::default(),
            fast_config(),
        );

        assert!(reconciler.run(CancellationToken::new()).await.is_none());
        assert_eq!(claims.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_stops_the_wait() {
        let mut source = MockReadyReplicaSource::new();
        source.expect_ready_replicas().returning(|| Ok(0));

        let reconciler = DirectoryReconciler::new(
            Arc::new(source),
            Arc::new(MockBootstrapMarker::new()),
            Arc::new(MockDirectoryClient::new()),
            DirectorySeed::default(),
            fast_config(),
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(2), reconciler.run(cancel)).await;
        assert_eq!(result.ok(), Some(None));
        assert_eq!(reconciler.state().await, BootstrapState::NotStarted);
    }
}
