//! Error types for the exec pool crate.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by the cluster-side collaborators ([`crate::Cluster`],
/// [`crate::RemoteShell`]).
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    KubeApi(#[from] kube::Error),

    /// The named object does not exist (yet).
    #[error("not found: {0}")]
    NotFound(String),

    /// An object handed to the cluster is missing required fields.
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// A watch or list stream could not be started.
    #[error("watch error: {0}")]
    Watch(String),

    /// Spawning or talking to a local process failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    /// Check if this error means the target object is missing.
    ///
    /// Right after a namespace is created the API server may still answer
    /// 404 for objects inside it, so this is part of the retryable class for
    /// manifest applies.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::KubeApi(kube::Error::Api(e)) => e.code == 404,
            _ => false,
        }
    }

    /// Check if this error is a transient API-server condition.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::KubeApi(kube::Error::Api(e)) => matches!(e.code, 429 | 500 | 503 | 504),
            Self::KubeApi(kube::Error::HyperError(_) | kube::Error::Service(_)) => true,
            _ => false,
        }
    }
}

/// Errors surfaced by the exec pool.
#[derive(Error, Debug)]
pub enum ExecPoolError {
    /// Creating a namespace, applying the deployment or starting the pod
    /// cache failed.
    #[error("{resource} creation error: {source}")]
    ResourceCreationFailed {
        /// What was being created.
        resource: String,
        /// Underlying cluster error.
        #[source]
        source: ClusterError,
    },

    /// The desired number of ready pods was not reached in time.
    #[error(
        "timeout after {timeout:?} while waiting for {desired} pods to be ready in namespace {namespace}, only {observed} found ready"
    )]
    ReadinessTimeout {
        /// Namespace being watched.
        namespace: String,
        /// Number of pods that had to become ready.
        desired: usize,
        /// Ready pods seen on the last successful poll.
        observed: usize,
        /// Configured readiness timeout.
        timeout: Duration,
    },

    /// Counting ready pods failed while waiting.
    #[error("readiness check error in namespace {namespace}: {source}")]
    ReadinessCheckFailed {
        /// Namespace being watched.
        namespace: String,
        /// Underlying cluster error.
        #[source]
        source: ClusterError,
    },

    /// The exec service has not been set up.
    #[error("exec service not started")]
    NotStarted,

    /// The service is running but the pod cache currently holds no pods.
    #[error("no exec pods found")]
    EmptyPool,

    /// A remote command failed or could not be delivered.
    #[error("command on pod {pod} failed: {reason}")]
    ExecutionFailed {
        /// `namespace/name` of the target pod.
        pod: String,
        /// Captured standard error of the remote shell.
        stderr: String,
        /// Exit status or transport failure description.
        reason: String,
    },

    /// Deleting the namespace or waiting for its removal failed.
    #[error("deleting {namespace} namespace error: {source}")]
    TeardownFailed {
        /// Namespace being deleted.
        namespace: String,
        /// Underlying cluster error.
        #[source]
        source: ClusterError,
    },

    /// The caller cancelled the operation.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ExecPoolError {
    /// Diagnostic text captured from the remote shell, if any.
    ///
    /// For [`ExecPoolError::ExecutionFailed`] this is the stderr of the
    /// failed command; every other variant has none.
    #[must_use]
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::ExecutionFailed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// A specialized Result type for exec pool operations.
pub type Result<T> = std::result::Result<T, ExecPoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> ClusterError {
        ClusterError::KubeApi(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    #[test]
    fn not_found_classification() {
        assert!(ClusterError::NotFound("deployment/exec-pod".into()).is_not_found());
        assert!(api_error(404).is_not_found());
        assert!(!api_error(409).is_not_found());
        assert!(!ClusterError::Watch("closed".into()).is_not_found());
    }

    #[test]
    fn transient_classification() {
        assert!(api_error(429).is_transient());
        assert!(api_error(503).is_transient());
        assert!(!api_error(404).is_transient());
        assert!(!api_error(403).is_transient());
    }

    #[test]
    fn execution_failure_carries_output() {
        let err = ExecPoolError::ExecutionFailed {
            pod: "cluster-loader/exec-pod-1".into(),
            stderr: "boom".into(),
            reason: "exit status 1".into(),
        };
        assert_eq!(err.output(), Some("boom"));
        assert_eq!(ExecPoolError::NotStarted.output(), None);
        assert_eq!(ExecPoolError::NotStarted.to_string(), "exec service not started");
        assert_eq!(ExecPoolError::EmptyPool.to_string(), "no exec pods found");
    }
}
