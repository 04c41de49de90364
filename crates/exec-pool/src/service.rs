//! The exec service: lifecycle and pod selection for the shared pool.
//!
//! # State Machine
//!
//! ```text
//!              set_up (ok)
//!   ┌────────┐ ──────────▶ ┌─────────┐
//!   │ Absent │             │ Present │
//!   └────────┘ ◀────────── └─────────┘
//!     │   ▲     tear_down
//!     └───┘
//!   set_up (err)
//! ```
//!
//! One async mutex guards the slot. `set_up`, `tear_down` and `get_pod`
//! never interleave, so `get_pod` cannot observe a half-built or half-torn
//! pool. Running commands goes through [`crate::CommandExecutor`] and takes
//! no lock.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::PodCache;
use crate::k8s::Cluster;
use crate::manifest::build_deployment;
use crate::readiness::wait_for_pods;
use crate::retry::RetryPolicy;
use crate::types::{ExecPoolConfig, PodRef};
use crate::{ExecPoolError, Result};

/// Owner of the exec pool for one test run.
///
/// Construct one per run and share it by `Arc` with everything that needs
/// pool pods.
pub struct ExecService {
    config: ExecPoolConfig,
    apply_retry: RetryPolicy,
    state: Mutex<Option<Arc<dyn PodCache>>>,
    rng: parking_lot::Mutex<StdRng>,
}

impl ExecService {
    /// Create a service with an entropy-seeded random generator.
    #[must_use]
    pub fn new(config: ExecPoolConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Create a service that picks pods with the given generator.
    #[must_use]
    pub fn with_rng(config: ExecPoolConfig, rng: StdRng) -> Self {
        Self {
            config,
            apply_retry: RetryPolicy::manifest_apply(),
            state: Mutex::new(None),
            rng: parking_lot::Mutex::new(rng),
        }
    }

    /// Create a service whose pod selection is reproducible.
    #[must_use]
    pub fn with_seed(config: ExecPoolConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    /// Replace the retry policy used for the deployment apply.
    #[must_use]
    pub fn with_apply_retry(mut self, policy: RetryPolicy) -> Self {
        self.apply_retry = policy;
        self
    }

    /// Get a reference to the service config.
    #[must_use]
    pub fn config(&self) -> &ExecPoolConfig {
        &self.config
    }

    /// Whether a pool is currently set up.
    pub async fn is_running(&self) -> bool {
        self.state.lock().await.is_some()
    }

    /// Provision the pool and wait until it is ready.
    ///
    /// Holds the service lock for the whole call. Calling it while a pool is
    /// already present logs a warning and provisions again.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails. Cluster objects created before the
    /// failure are left in place; call [`ExecService::tear_down`] to remove
    /// them.
    pub async fn set_up(&self, cluster: &dyn Cluster) -> Result<()> {
        self.set_up_with_cancellation(cluster, &CancellationToken::new())
            .await
    }

    /// Like [`ExecService::set_up`], but the readiness wait also ends when
    /// `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`ExecPoolError::Cancelled`] if `cancel` fires while waiting,
    /// otherwise the same errors as [`ExecService::set_up`].
    pub async fn set_up_with_cancellation(
        &self,
        cluster: &dyn Cluster,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.config.validate()?;

        let mut state = self.state.lock().await;
        if state.is_some() {
            warn!(
                namespace = %self.config.namespace,
                "Exec service already running, setting up again"
            );
        }

        let namespace = &self.config.namespace;
        info!(
            namespace = %namespace,
            deployment = %self.config.deployment_name,
            replicas = self.config.replicas,
            "Setting up exec service"
        );

        cluster
            .create_namespace(namespace)
            .await
            .map_err(|source| ExecPoolError::ResourceCreationFailed {
                resource: format!("namespace {namespace}"),
                source,
            })?;

        let deployment = build_deployment(&self.config);
        self.apply_retry
            .run("apply exec deployment", || cluster.apply_deployment(&deployment))
            .await
            .map_err(|source| ExecPoolError::ResourceCreationFailed {
                resource: format!("deployment {}", self.config.deployment_name),
                source,
            })?;

        let wait_spec = self.config.wait_spec();
        wait_for_pods(cluster, &wait_spec, cancel).await?;

        let cache = cluster
            .pod_cache(&wait_spec.selector)
            .await
            .map_err(|source| ExecPoolError::ResourceCreationFailed {
                resource: "pod store".to_string(),
                source,
            })?;

        if let Some(previous) = state.replace(cache) {
            debug!("Stopping pod cache of the replaced pool");
            previous.stop();
        }

        info!(namespace = %namespace, "Exec service set up successfully");
        Ok(())
    }

    /// Stop the pod cache and delete the pool namespace.
    ///
    /// Blocks until the namespace is gone. Safe to call when no pool is set
    /// up.
    ///
    /// # Errors
    ///
    /// Returns [`ExecPoolError::TeardownFailed`] if deletion fails.
    pub async fn tear_down(&self, cluster: &dyn Cluster) -> Result<()> {
        let mut state = self.state.lock().await;
        let namespace = &self.config.namespace;
        info!(namespace = %namespace, "Tearing down exec service");

        if let Some(cache) = state.take() {
            cache.stop();
        }

        cluster
            .delete_namespace(namespace)
            .await
            .map_err(|source| ExecPoolError::TeardownFailed {
                namespace: namespace.clone(),
                source,
            })?;
        cluster
            .wait_for_namespace_deleted(namespace)
            .await
            .map_err(|source| ExecPoolError::TeardownFailed {
                namespace: namespace.clone(),
                source,
            })?;

        info!(namespace = %namespace, "Exec service torn down");
        Ok(())
    }

    /// Pick a pool pod uniformly at random.
    ///
    /// # Errors
    ///
    /// - [`ExecPoolError::NotStarted`] if no pool is set up
    /// - [`ExecPoolError::EmptyPool`] if the pod cache is empty
    pub async fn get_pod(&self) -> Result<PodRef> {
        let state = self.state.lock().await;
        let cache = state.as_ref().ok_or(ExecPoolError::NotStarted)?;

        let pods = cache.list();
        let mut rng = self.rng.lock();
        pods.choose(&mut *rng)
            .cloned()
            .ok_or(ExecPoolError::EmptyPool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::mock::{pool_pods, MockCluster};
    use crate::ClusterError;
    use std::collections::HashMap;
    use std::time::Duration;

    fn test_config() -> ExecPoolConfig {
        ExecPoolConfig {
            poll_interval: Duration::from_millis(10),
            ready_timeout: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn test_service() -> ExecService {
        ExecService::with_seed(test_config(), 7)
            .with_apply_retry(RetryPolicy::manifest_apply().with_backoff(
                Duration::from_millis(1),
                Duration::from_millis(5),
            ))
    }

    #[tokio::test]
    async fn get_pod_before_set_up_is_not_started() {
        let service = test_service();

        let err = service.get_pod().await.unwrap_err();

        assert!(matches!(err, ExecPoolError::NotStarted));
        assert!(!service.is_running().await);
    }

    #[tokio::test]
    async fn get_pod_after_tear_down_does_not_read_old_cache() {
        let service = test_service();
        let cluster = MockCluster::new(pool_pods("cluster-loader", 3));
        service.set_up(&cluster).await.unwrap();
        service.tear_down(&cluster).await.unwrap();

        let err = service.get_pod().await.unwrap_err();

        assert!(matches!(err, ExecPoolError::NotStarted));
        assert_eq!(cluster.caches()[0].list_calls(), 0);
    }

    #[tokio::test]
    async fn pod_cache_failure_leaves_state_absent() {
        let service = test_service();
        let cluster = MockCluster::new(pool_pods("cluster-loader", 3));
        cluster.fail_pod_cache(true);

        let err = service.set_up(&cluster).await.unwrap_err();

        match err {
            ExecPoolError::ResourceCreationFailed { resource, .. } => {
                assert_eq!(resource, "pod store");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!service.is_running().await);
        assert!(cluster.caches().is_empty());
    }

    #[tokio::test]
    async fn set_up_runs_steps_in_order() {
        let service = test_service();
        let cluster = MockCluster::new(pool_pods("cluster-loader", 3));

        service.set_up(&cluster).await.unwrap();

        assert!(service.is_running().await);
        assert_eq!(
            cluster.calls(),
            vec![
                "create_namespace:cluster-loader",
                "apply_deployment:exec-pod",
                "count_ready_pods:cluster-loader",
                "pod_cache:cluster-loader",
            ]
        );
    }

    #[tokio::test]
    async fn get_pod_returns_pool_members_uniformly() {
        let service = test_service();
        let pods = pool_pods("cluster-loader", 3);
        let cluster = MockCluster::new(pods.clone());
        service.set_up(&cluster).await.unwrap();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..3_000 {
            let pod = service.get_pod().await.unwrap();
            assert!(pods.contains(&pod));
            *counts.entry(pod.name).or_default() += 1;
        }

        assert_eq!(counts.len(), 3);
        for (name, count) in counts {
            assert!((800..=1_200).contains(&count), "{name} picked {count} times");
        }
    }

    #[tokio::test]
    async fn seeded_services_pick_the_same_pods() {
        let cluster = MockCluster::new(pool_pods("cluster-loader", 5));
        let a = ExecService::with_seed(test_config(), 42);
        let b = ExecService::with_seed(test_config(), 42);
        a.set_up(&cluster).await.unwrap();
        b.set_up(&cluster).await.unwrap();

        for _ in 0..20 {
            assert_eq!(a.get_pod().await.unwrap(), b.get_pod().await.unwrap());
        }
    }

    #[tokio::test]
    async fn empty_cache_is_empty_pool() {
        let service = test_service();
        let cluster = MockCluster::new(Vec::new());
        cluster.set_ready(3);
        service.set_up(&cluster).await.unwrap();

        let err = service.get_pod().await.unwrap_err();
        assert!(matches!(err, ExecPoolError::EmptyPool));

        cluster.caches()[0].set_pods(pool_pods("cluster-loader", 1));
        assert_eq!(service.get_pod().await.unwrap().name, "exec-pod-0");
    }

    #[tokio::test]
    async fn tear_down_clears_state_and_stops_cache() {
        let service = test_service();
        let cluster = MockCluster::new(pool_pods("cluster-loader", 3));
        service.set_up(&cluster).await.unwrap();

        service.tear_down(&cluster).await.unwrap();

        assert!(cluster.caches()[0].is_stopped());
        assert!(matches!(
            service.get_pod().await.unwrap_err(),
            ExecPoolError::NotStarted
        ));
        assert_eq!(cluster.call_count("delete_namespace"), 1);
        assert_eq!(cluster.call_count("wait_for_namespace_deleted"), 1);
    }

    #[tokio::test]
    async fn tear_down_without_set_up_only_deletes_namespace() {
        let service = test_service();
        let cluster = MockCluster::new(pool_pods("cluster-loader", 3));

        service.tear_down(&cluster).await.unwrap();
        service.tear_down(&cluster).await.unwrap();

        assert_eq!(
            cluster.calls(),
            vec![
                "delete_namespace:cluster-loader",
                "wait_for_namespace_deleted:cluster-loader",
                "delete_namespace:cluster-loader",
                "wait_for_namespace_deleted:cluster-loader",
            ]
        );
    }

    #[tokio::test]
    async fn tear_down_failure_is_reported() {
        let service = test_service();
        let cluster = MockCluster::new(pool_pods("cluster-loader", 3));
        service.set_up(&cluster).await.unwrap();
        cluster.fail_delete_namespace(true);

        let err = service.tear_down(&cluster).await.unwrap_err();

        assert!(matches!(err, ExecPoolError::TeardownFailed { .. }));
        assert!(!service.is_running().await);
        assert_eq!(cluster.call_count("wait_for_namespace_deleted"), 0);
    }

    #[tokio::test]
    async fn readiness_timeout_leaves_state_absent() {
        let service = test_service();
        let cluster = MockCluster::new(pool_pods("cluster-loader", 3));
        cluster.set_ready(1);

        let err = service.set_up(&cluster).await.unwrap_err();

        assert!(matches!(
            err,
            ExecPoolError::ReadinessTimeout {
                desired: 3,
                observed: 1,
                ..
            }
        ));
        assert!(!service.is_running().await);
        assert_eq!(cluster.call_count("pod_cache"), 0);
    }

    #[tokio::test]
    async fn namespace_failure_short_circuits() {
        let service = test_service();
        let cluster = MockCluster::new(pool_pods("cluster-loader", 3));
        cluster.fail_create_namespace(true);

        let err = service.set_up(&cluster).await.unwrap_err();

        assert!(matches!(err, ExecPoolError::ResourceCreationFailed { .. }));
        assert_eq!(cluster.calls(), vec!["create_namespace:cluster-loader"]);
        assert!(!service.is_running().await);
    }

    #[tokio::test]
    async fn apply_retries_not_found() {
        let service = test_service();
        let cluster = MockCluster::new(pool_pods("cluster-loader", 3));
        cluster.fail_applies_with([
            ClusterError::NotFound("namespaces/cluster-loader".into()),
            ClusterError::NotFound("namespaces/cluster-loader".into()),
        ]);

        service.set_up(&cluster).await.unwrap();

        assert_eq!(cluster.call_count("apply_deployment"), 3);
        assert!(service.is_running().await);
    }

    #[tokio::test]
    async fn apply_does_not_retry_other_errors() {
        let service = test_service();
        let cluster = MockCluster::new(pool_pods("cluster-loader", 3));
        cluster.fail_applies_with([ClusterError::InvalidObject("bad spec".into())]);

        let err = service.set_up(&cluster).await.unwrap_err();

        assert!(matches!(err, ExecPoolError::ResourceCreationFailed { .. }));
        assert_eq!(cluster.call_count("apply_deployment"), 1);
        assert_eq!(cluster.call_count("count_ready_pods"), 0);
    }

    #[tokio::test]
    async fn repeated_set_up_replaces_pool() {
        let service = test_service();
        let cluster = MockCluster::new(pool_pods("cluster-loader", 3));

        service.set_up(&cluster).await.unwrap();
        service.set_up(&cluster).await.unwrap();

        let caches = cluster.caches();
        assert_eq!(caches.len(), 2);
        assert!(caches[0].is_stopped());
        assert!(!caches[1].is_stopped());
        assert_eq!(cluster.call_count("create_namespace"), 2);
    }

    #[tokio::test]
    async fn cancelled_set_up() {
        let service = test_service();
        let cluster = MockCluster::new(pool_pods("cluster-loader", 3));
        cluster.set_ready(0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = service
            .set_up_with_cancellation(&cluster, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, ExecPoolError::Cancelled(_)));
        assert!(!service.is_running().await);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_cluster_calls() {
        let service = ExecService::new(ExecPoolConfig {
            replicas: 0,
            ..test_config()
        });
        let cluster = MockCluster::new(Vec::new());

        let err = service.set_up(&cluster).await.unwrap_err();

        assert!(matches!(err, ExecPoolError::Config(_)));
        assert!(cluster.calls().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_get_pod_during_set_up_sees_no_partial_pool() {
        let service = Arc::new(test_service());
        let pods = pool_pods("cluster-loader", 3);
        let cluster = Arc::new(MockCluster::new(pods.clone()));
        cluster.set_cache_delay(Duration::from_millis(20));

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let service = Arc::clone(&service);
                let pods = pods.clone();
                tokio::spawn(async move {
                    let mut found = 0;
                    for _ in 0..100 {
                        match service.get_pod().await {
                            Ok(pod) => {
                                assert!(pods.contains(&pod), "unexpected pod {pod}");
                                found += 1;
                            }
                            Err(ExecPoolError::NotStarted | ExecPoolError::EmptyPool) => {}
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                    found
                })
            })
            .collect();

        service.set_up(cluster.as_ref()).await.unwrap();

        for reader in readers {
            assert!(reader.await.unwrap() > 0);
        }
        assert!(service.get_pod().await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_set_up_and_tear_down_do_not_deadlock() {
        let service = Arc::new(test_service());
        let cluster = Arc::new(MockCluster::new(pool_pods("cluster-loader", 3)));

        let tasks: Vec<_> = (0..6)
            .map(|i| {
                let service = Arc::clone(&service);
                let cluster = Arc::clone(&cluster);
                tokio::spawn(async move {
                    if i % 2 == 0 {
                        service.set_up(cluster.as_ref()).await
                    } else {
                        service.tear_down(cluster.as_ref()).await
                    }
                })
            })
            .collect();

        let all = futures::future::join_all(tasks);
        let results = tokio::time::timeout(Duration::from_secs(5), all)
            .await
            .expect("lifecycle calls deadlocked");
        for result in results {
            result.unwrap().unwrap();
        }
    }
}
