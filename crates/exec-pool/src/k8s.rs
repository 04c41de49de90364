//! Cluster access for the exec pool.
//!
//! The [`Cluster`] trait collects every call the exec service makes into the
//! target cluster. [`K8sCluster`] implements it on top of a `kube` client.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::{debug, info};

use crate::cache::{PodCache, WatchedPodCache};
use crate::readiness::PodCounter;
use crate::types::{is_pod_ready, ObjectSelector};
use crate::ClusterError;

/// Field manager used for server-side apply.
const FIELD_MANAGER: &str = "exec-pool";

/// Cluster operations the exec service delegates to.
#[async_trait]
pub trait Cluster: PodCounter {
    /// Create a namespace. An already existing namespace is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace cannot be created.
    async fn create_namespace(&self, name: &str) -> Result<(), ClusterError>;

    /// Request deletion of a namespace. A missing namespace is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete request fails.
    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError>;

    /// Block until the namespace no longer exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace cannot be read.
    async fn wait_for_namespace_deleted(&self, name: &str) -> Result<(), ClusterError>;

    /// Create or update a deployment.
    ///
    /// # Errors
    ///
    /// Returns an error if the apply fails.
    async fn apply_deployment(&self, deployment: &Deployment) -> Result<(), ClusterError>;

    /// Start a pod cache for pods matching `selector`.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be started.
    async fn pod_cache(&self, selector: &ObjectSelector)
        -> Result<Arc<dyn PodCache>, ClusterError>;
}

/// Kubernetes-backed [`Cluster`].
pub struct K8sCluster {
    client: Client,
    namespace_poll_interval: Duration,
}

impl K8sCluster {
    /// Connect using in-cluster config or the local kubeconfig.
    ///
    /// # Errors
    ///
    /// Returns an error if the Kubernetes client cannot be created.
    pub async fn new(namespace_poll_interval: Duration) -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;
        Ok(Self::with_client(client, namespace_poll_interval))
    }

    /// Create a cluster handle with a pre-configured client.
    #[must_use]
    pub fn with_client(client: Client, namespace_poll_interval: Duration) -> Self {
        Self {
            client,
            namespace_poll_interval,
        }
    }

    fn namespaces_api(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }

    fn pods_api(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn deployments_api(&self, namespace: Option<&str>) -> Api<Deployment> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::default_namespaced(self.client.clone()),
        }
    }
}

#[async_trait]
impl PodCounter for K8sCluster {
    async fn count_ready_pods(&self, selector: &ObjectSelector) -> Result<usize, ClusterError> {
        let mut params = ListParams::default().labels(&selector.label_selector);
        if !selector.field_selector.is_empty() {
            params = params.fields(&selector.field_selector);
        }

        let pods = self.pods_api(&selector.namespace).list(&params).await?;
        Ok(pods.items.iter().filter(|pod| is_pod_ready(pod)).count())
    }
}

#[async_trait]
impl Cluster for K8sCluster {
    async fn create_namespace(&self, name: &str) -> Result<(), ClusterError> {
        let mut labels = BTreeMap::new();
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        );
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        };

        match self
            .namespaces_api()
            .create(&PostParams::default(), &namespace)
            .await
        {
            Ok(_) => {
                info!(namespace = name, "Created namespace");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(namespace = name, "Namespace already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError> {
        match self
            .namespaces_api()
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => {
                info!(namespace = name, "Requested namespace deletion");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(namespace = name, "Namespace not found, already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn wait_for_namespace_deleted(&self, name: &str) -> Result<(), ClusterError> {
        let api = self.namespaces_api();
        while api.get_opt(name).await?.is_some() {
            debug!(namespace = name, "Waiting for namespace deletion");
            tokio::time::sleep(self.namespace_poll_interval).await;
        }
        info!(namespace = name, "Namespace deleted");
        Ok(())
    }

    async fn apply_deployment(&self, deployment: &Deployment) -> Result<(), ClusterError> {
        let name = deployment
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ClusterError::InvalidObject("deployment without a name".to_string()))?;
        let api = self.deployments_api(deployment.metadata.namespace.as_deref());

        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(deployment),
        )
        .await?;

        info!(
            deployment = name,
            namespace = ?deployment.metadata.namespace,
            "Applied deployment"
        );
        Ok(())
    }

    async fn pod_cache(
        &self,
        selector: &ObjectSelector,
    ) -> Result<Arc<dyn PodCache>, ClusterError> {
        let cache: Arc<dyn PodCache> =
            Arc::new(WatchedPodCache::start(self.client.clone(), selector.clone()).await?);
        Ok(cache)
    }
}

/// In-memory cluster doubles for testing without a real Kubernetes cluster.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use crate::types::PodRef;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// A pod cache holding a fixed, replaceable snapshot.
    #[derive(Default)]
    pub struct StaticPodCache {
        pods: Mutex<Vec<PodRef>>,
        stopped: AtomicBool,
        lists: AtomicUsize,
    }

    impl StaticPodCache {
        /// Create a cache holding `pods`.
        #[must_use]
        pub fn new(pods: Vec<PodRef>) -> Self {
            Self {
                pods: Mutex::new(pods),
                ..Default::default()
            }
        }

        /// Replace the snapshot.
        pub fn set_pods(&self, pods: Vec<PodRef>) {
            *self.pods.lock() = pods;
        }

        /// Whether [`PodCache::stop`] was called.
        #[must_use]
        pub fn is_stopped(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }

        /// Number of [`PodCache::list`] calls so far.
        #[must_use]
        pub fn list_calls(&self) -> usize {
            self.lists.load(Ordering::SeqCst)
        }
    }

    impl PodCache for StaticPodCache {
        fn list(&self) -> Vec<PodRef> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            self.pods.lock().clone()
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    /// Build `count` ready pool pods named `exec-pod-<i>`.
    #[must_use]
    pub fn pool_pods(namespace: &str, count: usize) -> Vec<PodRef> {
        (0..count)
            .map(|i| PodRef {
                name: format!("exec-pod-{i}"),
                namespace: namespace.to_string(),
                ready: true,
                pod_ip: Some(format!("10.0.0.{}", i + 1)),
            })
            .collect()
    }

    /// A cluster that records calls and serves pods from memory.
    pub struct MockCluster {
        pods: Vec<PodRef>,
        ready: AtomicUsize,
        calls: Mutex<Vec<String>>,
        apply_failures: Mutex<VecDeque<ClusterError>>,
        fail_create_namespace: AtomicBool,
        fail_delete_namespace: AtomicBool,
        fail_pod_cache: AtomicBool,
        caches: Mutex<Vec<Arc<StaticPodCache>>>,
        cache_delay: Mutex<Duration>,
    }

    impl MockCluster {
        /// A cluster whose pool of `pods` reports all of them ready.
        #[must_use]
        pub fn new(pods: Vec<PodRef>) -> Self {
            Self {
                ready: AtomicUsize::new(pods.len()),
                pods,
                calls: Mutex::new(Vec::new()),
                apply_failures: Mutex::new(VecDeque::new()),
                fail_create_namespace: AtomicBool::new(false),
                fail_delete_namespace: AtomicBool::new(false),
                fail_pod_cache: AtomicBool::new(false),
                caches: Mutex::new(Vec::new()),
                cache_delay: Mutex::new(Duration::ZERO),
            }
        }

        /// Override the ready pod count reported to the waiter.
        pub fn set_ready(&self, ready: usize) {
            self.ready.store(ready, Ordering::SeqCst);
        }

        /// Make the next applies fail with these errors, in order.
        pub fn fail_applies_with(&self, errors: impl IntoIterator<Item = ClusterError>) {
            self.apply_failures.lock().extend(errors);
        }

        /// Make namespace creation fail.
        pub fn fail_create_namespace(&self, fail: bool) {
            self.fail_create_namespace.store(fail, Ordering::SeqCst);
        }

        /// Make namespace deletion fail.
        pub fn fail_delete_namespace(&self, fail: bool) {
            self.fail_delete_namespace.store(fail, Ordering::SeqCst);
        }

        /// Make pod cache construction fail.
        pub fn fail_pod_cache(&self, fail: bool) {
            self.fail_pod_cache.store(fail, Ordering::SeqCst);
        }

        /// Delay pod cache construction, widening the setup window.
        pub fn set_cache_delay(&self, delay: Duration) {
            *self.cache_delay.lock() = delay;
        }

        /// Calls made so far, as `op:argument` strings.
        #[must_use]
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        /// Number of calls whose operation is `op`.
        #[must_use]
        pub fn call_count(&self, op: &str) -> usize {
            self.calls
                .lock()
                .iter()
                .filter(|c| c.split(':').next() == Some(op))
                .count()
        }

        /// Pod caches handed out so far.
        #[must_use]
        pub fn caches(&self) -> Vec<Arc<StaticPodCache>> {
            self.caches.lock().clone()
        }

        fn record(&self, op: &str, arg: &str) {
            self.calls.lock().push(format!("{op}:{arg}"));
        }
    }

    #[async_trait]
    impl PodCounter for MockCluster {
        async fn count_ready_pods(&self, selector: &ObjectSelector) -> Result<usize, ClusterError> {
            self.record("count_ready_pods", &selector.namespace);
            Ok(self.ready.load(Ordering::SeqCst))
        }
    }

    #[async_trait]
    impl Cluster for MockCluster {
        async fn create_namespace(&self, name: &str) -> Result<(), ClusterError> {
            self.record("create_namespace", name);
            if self.fail_create_namespace.load(Ordering::SeqCst) {
                return Err(ClusterError::Watch(format!("namespace {name} rejected")));
            }
            Ok(())
        }

        async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError> {
            self.record("delete_namespace", name);
            if self.fail_delete_namespace.load(Ordering::SeqCst) {
                return Err(ClusterError::Watch(format!("namespace {name} stuck")));
            }
            Ok(())
        }

        async fn wait_for_namespace_deleted(&self, name: &str) -> Result<(), ClusterError> {
            self.record("wait_for_namespace_deleted", name);
            Ok(())
        }

        async fn apply_deployment(&self, deployment: &Deployment) -> Result<(), ClusterError> {
            let name = deployment.metadata.name.clone().unwrap_or_default();
            self.record("apply_deployment", &name);
            match self.apply_failures.lock().pop_front() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        async fn pod_cache(
            &self,
            selector: &ObjectSelector,
        ) -> Result<Arc<dyn PodCache>, ClusterError> {
            self.record("pod_cache", &selector.namespace);
            let delay = *self.cache_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.fail_pod_cache.load(Ordering::SeqCst) {
                return Err(ClusterError::Watch(format!(
                    "pod store for {selector} did not sync"
                )));
            }
            let cache = Arc::new(StaticPodCache::new(self.pods.clone()));
            self.caches.lock().push(Arc::clone(&cache));
            let cache: Arc<dyn PodCache> = cache;
            Ok(cache)
        }
    }
}
