use crate::discovery::ServiceDirectory;
use crate::forward::{PodDialer, PodTarget, Upstream};
use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, ListParams};
use kube::Client;
use std::collections::BTreeMap;
use tunnel_protocol::PodCandidate;

/// Control-plane adapter backed by a `kube` client.
///
/// Pod streams go through the API server's `portforward` sub-resource, so no
/// route to the Pod network is needed.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn try_from_config(config: kube::Config) -> anyhow::Result<Self> {
        let client = Client::try_from(config).context("failed to build kubernetes client")?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl ServiceDirectory for KubeCluster {
    async fn service_selector(
        &self,
        namespace: &str,
        service: &str,
    ) -> anyhow::Result<Option<BTreeMap<String, String>>> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let found = services
            .get(service)
            .await
            .with_context(|| format!("failed to get service {service} in namespace {namespace}"))?;
        Ok(found.spec.and_then(|spec| spec.selector))
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> anyhow::Result<Vec<PodCandidate>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items.iter().filter_map(pod_candidate).collect())
    }
}

#[async_trait]
impl PodDialer for KubeCluster {
    async fn dial(&self, target: &PodTarget) -> anyhow::Result<Upstream> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
        let mut forwarder = pods
            .portforward(&target.pod, &[target.port])
            .await
            .with_context(|| format!("failed to upgrade port-forward connection to {target}"))?;
        let stream = forwarder
            .take_stream(target.port)
            .with_context(|| format!("port {} missing from port-forward to {}", target.port, target.pod))?;
        Ok(Upstream::new(stream).on_finish(async move {
            forwarder
                .join()
                .await
                .context("port-forward connection ended with error")
        }))
    }
}

fn pod_candidate(pod: &Pod) -> Option<PodCandidate> {
    let name = pod.metadata.name.clone()?;
    Some(PodCandidate {
        name,
        ready: is_pod_ready(pod),
    })
}

fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
        .unwrap_or(false)
}
