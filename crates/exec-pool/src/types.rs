//! Types for the exec pool crate.

use std::fmt;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};

use crate::{ExecPoolError, Result};

/// Selects the pods that make up the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSelector {
    /// Namespace the pods live in.
    pub namespace: String,
    /// Label selector, e.g. `feature=exec`.
    pub label_selector: String,
    /// Field selector, empty for none.
    pub field_selector: String,
}

impl ObjectSelector {
    /// Create a selector for pods in `namespace` carrying `label_selector`.
    #[must_use]
    pub fn new(namespace: impl Into<String>, label_selector: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            label_selector: label_selector.into(),
            field_selector: String::new(),
        }
    }
}

impl fmt::Display for ObjectSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "namespace({}), labelSelector({})", self.namespace, self.label_selector)?;
        if !self.field_selector.is_empty() {
            write!(f, ", fieldSelector({})", self.field_selector)?;
        }
        Ok(())
    }
}

/// Snapshot of one pool pod as seen by the pod cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodRef {
    /// Kubernetes pod name.
    pub name: String,
    /// Namespace of the pod.
    pub namespace: String,
    /// Whether the pod reported the `Ready` condition.
    pub ready: bool,
    /// Pod IP, once assigned.
    pub pod_ip: Option<String>,
}

impl PodRef {
    /// Build a snapshot from a Kubernetes pod object.
    ///
    /// Returns `None` for objects without a name.
    #[must_use]
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let name = pod.metadata.name.clone()?;
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let pod_ip = pod.status.as_ref().and_then(|s| s.pod_ip.clone());

        Some(Self {
            name,
            namespace,
            ready: is_pod_ready(pod),
            pod_ip,
        })
    }
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Check whether a pod is running and reports the `Ready` condition.
#[must_use]
pub fn is_pod_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };

    status.phase.as_deref() == Some("Running")
        && status.conditions.as_ref().is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Parameters for one readiness wait.
#[derive(Debug, Clone)]
pub struct WaitSpec {
    /// Pods to count.
    pub selector: ObjectSelector,
    /// Ready pod count that ends the wait.
    pub desired_count: usize,
    /// Delay between polls.
    pub poll_interval: Duration,
    /// Upper bound on the whole wait.
    pub timeout: Duration,
}

/// Configuration for the exec pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecPoolConfig {
    /// Namespace that hosts the pool.
    pub namespace: String,
    /// Name of the pool deployment.
    pub deployment_name: String,
    /// Container image for pool pods.
    pub image: String,
    /// Number of pool replicas.
    pub replicas: u32,
    /// Label key used to select pool pods.
    pub label_key: String,
    /// Label value used to select pool pods.
    pub label_value: String,
    /// Interval between readiness polls.
    pub poll_interval: Duration,
    /// Upper bound on waiting for the pool to become ready.
    pub ready_timeout: Duration,
    /// Interval between checks that the namespace is gone.
    pub namespace_delete_poll_interval: Duration,
}

impl Default for ExecPoolConfig {
    fn default() -> Self {
        Self {
            namespace: "cluster-loader".to_string(),
            deployment_name: "exec-pod".to_string(),
            image: "registry.k8s.io/e2e-test-images/agnhost:2.32".to_string(),
            replicas: 3,
            label_key: "feature".to_string(),
            label_value: "exec".to_string(),
            poll_interval: Duration::from_secs(10),
            ready_timeout: Duration::from_secs(120),
            namespace_delete_poll_interval: Duration::from_secs(5),
        }
    }
}

impl ExecPoolConfig {
    /// Create a config with the given namespace.
    #[must_use]
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Supported environment variables:
    /// - `EXEC_POOL_NAMESPACE`: namespace that hosts the pool
    /// - `EXEC_POOL_DEPLOYMENT`: deployment name
    /// - `EXEC_POOL_IMAGE`: container image
    /// - `EXEC_POOL_REPLICAS`: replica count
    /// - `EXEC_POOL_LABEL_KEY` / `EXEC_POOL_LABEL_VALUE`: pod label
    /// - `EXEC_POOL_POLL_INTERVAL_SECS`: readiness poll interval
    /// - `EXEC_POOL_READY_TIMEOUT_SECS`: readiness timeout
    /// - `EXEC_POOL_DELETE_POLL_SECS`: namespace deletion poll interval
    ///
    /// Unparseable numbers are ignored and the default is kept.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(val) = lookup("EXEC_POOL_NAMESPACE") {
            config.namespace = val;
        }
        if let Some(val) = lookup("EXEC_POOL_DEPLOYMENT") {
            config.deployment_name = val;
        }
        if let Some(val) = lookup("EXEC_POOL_IMAGE") {
            config.image = val;
        }
        if let Some(val) = lookup("EXEC_POOL_LABEL_KEY") {
            config.label_key = val;
        }
        if let Some(val) = lookup("EXEC_POOL_LABEL_VALUE") {
            config.label_value = val;
        }
        if let Some(n) = lookup("EXEC_POOL_REPLICAS").and_then(|v| v.parse().ok()) {
            config.replicas = n;
        }
        if let Some(n) = lookup("EXEC_POOL_POLL_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            config.poll_interval = Duration::from_secs(n);
        }
        if let Some(n) = lookup("EXEC_POOL_READY_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            config.ready_timeout = Duration::from_secs(n);
        }
        if let Some(n) = lookup("EXEC_POOL_DELETE_POLL_SECS").and_then(|v| v.parse().ok()) {
            config.namespace_delete_poll_interval = Duration::from_secs(n);
        }

        config
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a name is empty, the replica count is zero or a
    /// poll interval is zero.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() || self.deployment_name.is_empty() {
            return Err(ExecPoolError::Config(
                "namespace and deployment name must not be empty".to_string(),
            ));
        }
        if self.label_key.is_empty() {
            return Err(ExecPoolError::Config("label key must not be empty".to_string()));
        }
        if self.replicas == 0 {
            return Err(ExecPoolError::Config("replicas must be at least 1".to_string()));
        }
        if self.poll_interval.is_zero() || self.namespace_delete_poll_interval.is_zero() {
            return Err(ExecPoolError::Config(
                "poll intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Label selector string for pool pods.
    #[must_use]
    pub fn label_selector(&self) -> String {
        format!("{}={}", self.label_key, self.label_value)
    }

    /// Selector for pool pods.
    #[must_use]
    pub fn selector(&self) -> ObjectSelector {
        ObjectSelector::new(self.namespace.clone(), self.label_selector())
    }

    /// Readiness wait parameters derived from this config.
    #[must_use]
    pub fn wait_spec(&self) -> WaitSpec {
        WaitSpec {
            selector: self.selector(),
            desired_count: self.replicas as usize,
            poll_interval: self.poll_interval,
            timeout: self.ready_timeout,
        }
    }
}
