//! Deployment manifest for the exec pool.
//!
//! Builds the Kubernetes `Deployment` that runs the pool pods. Every pod
//! carries the pool label so the readiness waiter and the pod cache can find
//! it.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;

use crate::ExecPoolConfig;

/// Name of the single container in every pool pod.
pub const CONTAINER_NAME: &str = "agnhost";

/// Build the pool deployment for `config`.
#[must_use]
pub fn build_deployment(config: &ExecPoolConfig) -> Deployment {
    let labels = pool_labels(config);

    Deployment {
        metadata: build_metadata(config),
        spec: Some(DeploymentSpec {
            replicas: Some(i32::try_from(config.replicas).unwrap_or(i32::MAX)),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(build_pod_spec(config)),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pool_labels(config: &ExecPoolConfig) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(config.label_key.clone(), config.label_value.clone());
    labels
}

fn build_metadata(config: &ExecPoolConfig) -> ObjectMeta {
    let mut labels = pool_labels(config);
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "exec-pool".to_string(),
    );

    let mut annotations = BTreeMap::new();
    annotations.insert(
        "exec-pool.io/created-at".to_string(),
        chrono::Utc::now().to_rfc3339(),
    );

    ObjectMeta {
        name: Some(config.deployment_name.clone()),
        namespace: Some(config.namespace.clone()),
        labels: Some(labels),
        annotations: Some(annotations),
        ..Default::default()
    }
}

fn build_pod_spec(config: &ExecPoolConfig) -> PodSpec {
    PodSpec {
        containers: vec![Container {
            name: CONTAINER_NAME.to_string(),
            image: Some(config.image.clone()),
            // agnhost exits without a subcommand
            args: Some(vec!["pause".to_string()]),
            ..Default::default()
        }],
        termination_grace_period_seconds: Some(1),
        ..Default::default()
    }
}
