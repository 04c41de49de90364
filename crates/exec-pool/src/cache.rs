//! Watch-refreshed pod cache for pool pods.
//!
//! [`WatchedPodCache`] keeps a reflector store of the pods matching a
//! selector up to date from a background watch task, so that picking a pod
//! never hits the Kubernetes API.

use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::{ObjectSelector, PodRef};
use crate::ClusterError;

/// How long to wait for the initial list before giving up.
const INITIAL_SYNC_TIMEOUT: Duration = Duration::from_secs(60);

/// A live list of the pods matching a selector.
pub trait PodCache: Send + Sync {
    /// Snapshot of the pods currently known to the cache.
    fn list(&self) -> Vec<PodRef>;

    /// Stop refreshing the cache. Further [`PodCache::list`] calls return
    /// the last known snapshot.
    fn stop(&self);
}

/// Pod cache backed by a Kubernetes watch.
pub struct WatchedPodCache {
    selector: ObjectSelector,
    store: Store<Pod>,
    shutdown: CancellationToken,
}

impl WatchedPodCache {
    /// Start watching pods matching `selector` and wait for the initial list.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial list does not complete in time.
    pub async fn start(client: Client, selector: ObjectSelector) -> Result<Self, ClusterError> {
        let api: Api<Pod> = Api::namespaced(client, &selector.namespace);
        let mut config = watcher::Config::default().labels(&selector.label_selector);
        if !selector.field_selector.is_empty() {
            config = config.fields(&selector.field_selector);
        }

        let (store, writer) = reflector::store();
        let shutdown = CancellationToken::new();

        let stream = reflector::reflector(writer, watcher::watcher(api, config)).default_backoff();
        let task_shutdown = shutdown.clone();
        let task_selector = selector.to_string();
        tokio::spawn(async move {
            futures::pin_mut!(stream);
            loop {
                tokio::select! {
                    () = task_shutdown.cancelled() => {
                        debug!(selector = %task_selector, "Pod cache stopped");
                        break;
                    }
                    event = stream.next() => match event {
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(selector = %task_selector, error = %e, "Pod watch error, will retry");
                        }
                        None => {
                            warn!(selector = %task_selector, "Pod watch stream ended unexpectedly");
                            break;
                        }
                    },
                }
            }
        });

        match tokio::time::timeout(INITIAL_SYNC_TIMEOUT, store.wait_until_ready()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                shutdown.cancel();
                return Err(ClusterError::Watch(format!("pod store for {selector}: {e}")));
            }
            Err(_) => {
                shutdown.cancel();
                return Err(ClusterError::Watch(format!(
                    "pod store for {selector} did not sync within {INITIAL_SYNC_TIMEOUT:?}"
                )));
            }
        }

        info!(selector = %selector, pods = store.state().len(), "Pod cache synced");

        Ok(Self {
            selector,
            store,
            shutdown,
        })
    }
}

impl PodCache for WatchedPodCache {
    fn list(&self) -> Vec<PodRef> {
        self.store
            .state()
            .iter()
            .filter_map(|pod| PodRef::from_pod(pod))
            .collect()
    }

    fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            debug!(selector = %self.selector, "Stopping pod cache");
        }
        self.shutdown.cancel();
    }
}

impl Drop for WatchedPodCache {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
