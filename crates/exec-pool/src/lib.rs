//! Shared pool of helper pods for running shell commands during load tests.
//!
//! This crate provisions a small replicated deployment inside the target
//! cluster and hands out its pods to measurement code that needs to run
//! commands against live infrastructure. It handles:
//!
//! - Pool setup: namespace, deployment, bounded readiness wait
//! - Pool teardown: namespace deletion and confirmation
//! - Random pod selection from a watch-refreshed pod cache
//! - Remote command execution on a chosen pod
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   Load test measurements                        │
//! └─────────────────────────────────────────────────────────────────┘
//!            │ get_pod                          │ run_command
//!            ▼                                  ▼
//! ┌──────────────────────────────┐   ┌──────────────────────────────┐
//! │         ExecService          │   │       CommandExecutor        │
//! │  ┌────────┐ ┌─────────────┐  │   │    (no shared state)         │
//! │  │ State  │ │  Readiness  │  │   └──────────────────────────────┘
//! │  │ Guard  │ │  Waiter     │  │                  │
//! │  └────────┘ └─────────────┘  │                  │
//! │        │ PodCache            │                  │
//! └──────────────────────────────┘                  │
//!            │                                      │
//!            ▼                                      ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Kubernetes API Server                        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use exec_pool::{CommandExecutor, ExecPoolConfig, ExecService, K8sCluster, KubectlShell};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ExecPoolConfig::default();
//! let cluster = K8sCluster::new(config.namespace_delete_poll_interval).await?;
//! let service = ExecService::new(config);
//! let executor = CommandExecutor::new(KubectlShell::new());
//!
//! service.set_up(&cluster).await?;
//!
//! let pod = service.get_pod().await?;
//! let output = executor.run_command(&pod, "uname -a").await?;
//! println!("{pod}: {output}");
//!
//! service.tear_down(&cluster).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Testing
//!
//! For testing without a real Kubernetes cluster, enable the `test-utils`
//! feature and use the in-memory doubles:
//!
//! ```ignore
//! use exec_pool::{ExecPoolConfig, ExecService, MockCluster};
//! use exec_pool::k8s::mock::pool_pods;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cluster = MockCluster::new(pool_pods("cluster-loader", 3));
//! let service = ExecService::with_seed(ExecPoolConfig::default(), 1);
//!
//! service.set_up(&cluster).await?;
//! assert!(service.get_pod().await.is_ok());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod cache;
pub mod error;
pub mod exec;
pub mod k8s;
pub mod manifest;
pub mod readiness;
pub mod retry;
pub mod service;
pub mod types;

pub use cache::{PodCache, WatchedPodCache};
pub use error::{ClusterError, ExecPoolError, Result};
pub use exec::{CommandExecutor, KubectlShell, RemoteShell, ShellOutput};
pub use k8s::{Cluster, K8sCluster};
pub use readiness::{wait_for_pods, PodCounter};
pub use retry::RetryPolicy;
pub use service::ExecService;
pub use types::{ExecPoolConfig, ObjectSelector, PodRef, WaitSpec};

#[cfg(any(test, feature = "test-utils"))]
pub use exec::mock::MockShell;
#[cfg(any(test, feature = "test-utils"))]
pub use k8s::mock::{MockCluster, StaticPodCache};
