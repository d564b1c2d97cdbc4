use crate::error::{NoBackendReason, Result, TunnelError};
use anyhow::Context;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tunnel_protocol::PodCandidate;

/// Read-only view of the control plane needed to pick a backend Pod.
#[async_trait]
pub trait ServiceDirectory: Send + Sync {
    /// Label selector of the Service, `None` when it selects no Pods.
    async fn service_selector(
        &self,
        namespace: &str,
        service: &str,
    ) -> anyhow::Result<Option<BTreeMap<String, String>>>;

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> anyhow::Result<Vec<PodCandidate>>;
}

/// Returns the first Pod selected by the Service whose Ready condition is true.
///
/// Every call queries the control plane again; nothing is cached.
pub async fn find_ready_pod(
    directory: &dyn ServiceDirectory,
    namespace: &str,
    service: &str,
) -> Result<PodCandidate> {
    if namespace.trim().is_empty() {
        return Err(TunnelError::InvalidServiceRef(
            "namespace cannot be empty".to_string(),
        ));
    }
    if service.trim().is_empty() {
        return Err(TunnelError::InvalidServiceRef(
            "service name cannot be empty".to_string(),
        ));
    }

    let lookup_failed = |source: anyhow::Error| TunnelError::ServiceLookup {
        service: service.to_string(),
        namespace: namespace.to_string(),
        source: source.into(),
    };
    let no_backend = |reason| TunnelError::NoBackendAvailable {
        service: service.to_string(),
        namespace: namespace.to_string(),
        reason,
    };

    let selector = directory
        .service_selector(namespace, service)
        .await
        .map_err(lookup_failed)?;
    let selector = match selector {
        Some(labels) if !labels.is_empty() => label_selector(&labels),
        _ => return Err(no_backend(NoBackendReason::NoSelector)),
    };

    let pods = directory
        .list_pods(namespace, &selector)
        .await
        .with_context(|| {
            format!("failed to get pods in namespace {namespace} for label selector {selector}")
        })
        .map_err(lookup_failed)?;
    if pods.is_empty() {
        return Err(no_backend(NoBackendReason::NoPods));
    }

    // Pods in Error or Completed state can still match the selector.
    for pod in pods {
        tracing::debug!(pod = %pod.name, ready = pod.ready, "checking pod readiness");
        if pod.ready {
            tracing::info!(pod = %pod.name, service, namespace, "selected pod to forward");
            return Ok(pod);
        }
    }
    Err(no_backend(NoBackendReason::NoReadyPods))
}

/// Renders a label map as an equality-based selector, `k1=v1,k2=v2`.
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}
