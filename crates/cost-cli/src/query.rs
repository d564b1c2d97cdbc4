use crate::config::Settings;
use anyhow::Context;
use bytes::Bytes;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tunnel_manager::{Session, Tunneler, TunnelOptions};
use tunnel_protocol::{Request, ServiceRef};

const CONFIGS_PATH: &str = "/model/getConfigs";
const CLUSTER_INFO_PATH: &str = "/model/clusterInfo";
const ALLOCATION_PATH: &str = "/model/allocation";
const ASSETS_PATH: &str = "/model/assets";
const FALLBACK_CURRENCY: &str = "USD";

/// Where queries go: a forwarded local port, or the API server's service proxy.
pub(crate) enum QueryBackend {
    PortForward(Session),
    ApiProxy(ServiceProxy),
}

impl QueryBackend {
    pub(crate) async fn connect(
        settings: &Settings,
        kube_config: kube::Config,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Self> {
        if settings.use_proxy {
            let client = kube::Client::try_from(kube_config)
                .context("failed to build kubernetes client")?;
            return Ok(Self::ApiProxy(ServiceProxy::new(client, settings.service.clone())));
        }
        let tunneler = Tunneler::from_kube_config(kube_config)?.with_options(TunnelOptions {
            ready_timeout: settings.ready_timeout,
        });
        let session = tunneler
            .open(&settings.service, cancel)
            .await
            .with_context(|| format!("failed to open tunnel to {}", settings.service))?;
        tracing::debug!(
            session_id = %session.id(),
            pod = session.pod(),
            base_url = %session.local_base_url(),
            "tunnel session opened"
        );
        Ok(Self::PortForward(session))
    }

    /// Runs one request and returns the body of a 200 answer.
    pub(crate) async fn execute(
        &self,
        request: Request,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Bytes> {
        let label = format!("{} {}", request.method, request.path);
        match self {
            Self::PortForward(session) => {
                let call = async {
                    let response = session.execute(request, cancel).await?;
                    Ok::<_, anyhow::Error>(response.body)
                };
                with_timeout(timeout, &label, call).await
            }
            Self::ApiProxy(proxy) => {
                let call = async {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => anyhow::bail!("request cancelled"),
                        body = proxy.execute(request) => body,
                    }
                };
                with_timeout(timeout, &label, call).await
            }
        }
    }

    pub(crate) async fn close(&self) {
        if let Self::PortForward(session) = self {
            session.close().await;
        }
    }
}

async fn with_timeout<F>(timeout: Option<Duration>, label: &str, call: F) -> anyhow::Result<Bytes>
where
    F: Future<Output = anyhow::Result<Bytes>>,
{
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, call)
            .await
            .with_context(|| format!("{label} timed out after {}", humantime::format_duration(timeout)))?,
        None => call.await,
    }
}

/// Sends requests through `/api/v1/namespaces/{ns}/services/{name}:{port}/proxy`.
pub(crate) struct ServiceProxy {
    client: kube::Client,
    service: ServiceRef,
}

impl ServiceProxy {
    pub(crate) fn new(client: kube::Client, service: ServiceRef) -> Self {
        Self { client, service }
    }

    async fn execute(&self, request: Request) -> anyhow::Result<Bytes> {
        let uri = proxy_uri(&self.service, &request);
        let mut builder = http::Request::builder()
            .method(request.method.as_str())
            .uri(&uri);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let body = request.body.map(|body| body.to_vec()).unwrap_or_default();
        let http_request = builder
            .body(body)
            .with_context(|| format!("invalid proxy request {uri}"))?;
        tracing::debug!(method = %request.method, uri = %uri, "executing proxied request");
        let text = self
            .client
            .request_text(http_request)
            .await
            .with_context(|| format!("{} {} through service proxy failed", request.method, uri))?;
        Ok(Bytes::from(text))
    }
}

pub(crate) fn proxy_uri(service: &ServiceRef, request: &Request) -> String {
    let mut uri = format!(
        "/api/v1/namespaces/{}/services/{}:{}/proxy/{}",
        service.namespace,
        service.service_name,
        service.target_port,
        request.path.trim_start_matches('/')
    );
    if !request.query.is_empty() {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(request.query.iter())
            .finish();
        uri.push('?');
        uri.push_str(&query);
    }
    uri
}

pub(crate) fn configs_request() -> Request {
    Request::get(CONFIGS_PATH)
}

pub(crate) fn cluster_info_request() -> Request {
    Request::get(CLUSTER_INFO_PATH)
}

pub(crate) fn allocation_request(window: &str, aggregate: Option<&str>, accumulate: bool) -> Request {
    let request = Request::get(ALLOCATION_PATH)
        .param("window", window)
        .param("accumulate", accumulate.to_string());
    match aggregate {
        Some(aggregate) => request.param("aggregate", aggregate),
        None => request,
    }
}

pub(crate) fn assets_request(window: &str, aggregate: Option<&str>) -> Request {
    let request = Request::get(ASSETS_PATH).param("window", window);
    match aggregate {
        Some(aggregate) => request.param("aggregate", aggregate),
        None => request,
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct CostModelConfigs {
    #[serde(rename = "currencyCode", default)]
    currency_code: String,
}

#[derive(Deserialize)]
struct ClusterInfo {
    #[serde(default)]
    id: String,
}

pub(crate) fn decode_currency_code(body: &[u8]) -> anyhow::Result<String> {
    let configs: Envelope<CostModelConfigs> =
        serde_json::from_slice(body).context("failed to decode cost model configs")?;
    let code = configs.data.currency_code.trim();
    if code.is_empty() {
        return Ok(FALLBACK_CURRENCY.to_string());
    }
    Ok(code.to_string())
}

pub(crate) fn decode_cluster_id(body: &[u8]) -> anyhow::Result<String> {
    let info: Envelope<ClusterInfo> =
        serde_json::from_slice(body).context("failed to decode cluster info")?;
    if info.data.id.is_empty() {
        anyhow::bail!("cluster info carries no id");
    }
    Ok(info.data.id)
}

pub(crate) fn pretty_json(body: &[u8]) -> anyhow::Result<String> {
    let value: serde_json::Value =
        serde_json::from_slice(body).context("response body is not JSON")?;
    Ok(serde_json::to_string_pretty(&value)?)
}
