//! Bounded wait for the pool pods to become ready.
//!
//! The waiter polls a ready-pod count at a fixed interval until it reaches
//! the desired number. A deadline armed at the start of the call and an
//! optional [`CancellationToken`] both end the wait; whichever fires first
//! drops the in-flight poll, so nothing keeps running after the call returns.
//! Transient count failures are logged and polled through; only permanent
//! ones end the wait early.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::{ObjectSelector, WaitSpec};
use crate::{ClusterError, ExecPoolError, Result};

/// Source of ready-pod counts.
#[async_trait]
pub trait PodCounter: Send + Sync {
    /// Count pods matching `selector` that are running and ready.
    ///
    /// # Errors
    ///
    /// Returns an error if the pods cannot be listed.
    async fn count_ready_pods(
        &self,
        selector: &ObjectSelector,
    ) -> std::result::Result<usize, ClusterError>;
}

/// Wait until `spec.desired_count` pods matching `spec.selector` are ready.
///
/// # Errors
///
/// - [`ExecPoolError::ReadinessTimeout`] if the deadline passes first
/// - [`ExecPoolError::Cancelled`] if `cancel` fires first
/// - [`ExecPoolError::ReadinessCheckFailed`] if counting pods fails with a
///   non-transient error
pub async fn wait_for_pods<C>(
    counter: &C,
    spec: &WaitSpec,
    cancel: &CancellationToken,
) -> Result<()>
where
    C: PodCounter + ?Sized,
{
    let namespace = &spec.selector.namespace;
    let deadline = tokio::time::sleep_until(Instant::now() + spec.timeout);
    tokio::pin!(deadline);

    let mut ticker = tokio::time::interval(spec.poll_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut observed = 0;
    loop {
        let poll = async {
            ticker.tick().await;
            counter.count_ready_pods(&spec.selector).await
        };

        let count = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(ExecPoolError::Cancelled(format!(
                    "waiting for pods in namespace {namespace}"
                )));
            }
            () = &mut deadline => {
                return Err(ExecPoolError::ReadinessTimeout {
                    namespace: namespace.clone(),
                    desired: spec.desired_count,
                    observed,
                    timeout: spec.timeout,
                });
            }
            result = poll => result,
        };

        let count = match count {
            Ok(count) => count,
            Err(e) if e.is_transient() || e.is_not_found() => {
                warn!(
                    selector = %spec.selector,
                    error = %e,
                    "Failed to count ready pods, retrying"
                );
                continue;
            }
            Err(source) => {
                return Err(ExecPoolError::ReadinessCheckFailed {
                    namespace: namespace.clone(),
                    source,
                });
            }
        };

        observed = count;
        if count >= spec.desired_count {
            info!(
                selector = %spec.selector,
                ready = count,
                "All expected pods are ready"
            );
            return Ok(());
        }

        debug!(
            selector = %spec.selector,
            ready = count,
            desired = spec.desired_count,
            "Waiting for pods to become ready"
        );
    }
}
