use crate::discovery::ServiceDirectory;
use crate::forward::{PodDialer, PodTarget, Upstream};
use async_trait::async_trait;
use axum::extract::Query;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tunnel_protocol::PodCandidate;

pub(crate) const CONFIGS_BODY: &str = r#"{"code":200,"data":{"currencyCode":"USD"}}"#;
pub(crate) const NOT_FOUND_BODY: &str = r#"{"code":404,"message":"no handler for path"}"#;

pub(crate) fn candidate(name: &str, ready: bool) -> PodCandidate {
    PodCandidate {
        name: name.to_string(),
        ready,
    }
}

pub(crate) struct FakeDirectory {
    selector: Option<BTreeMap<String, String>>,
    pods: Vec<PodCandidate>,
    fail_lookup: bool,
    seen_selectors: Mutex<Vec<String>>,
}

impl FakeDirectory {
    pub(crate) fn with_pods(pods: Vec<PodCandidate>) -> Self {
        let mut selector = BTreeMap::new();
        selector.insert("app".to_string(), "cost-analyzer".to_string());
        Self {
            selector: Some(selector),
            pods,
            fail_lookup: false,
            seen_selectors: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn without_selector(mut self) -> Self {
        self.selector = None;
        self
    }

    pub(crate) fn failing_lookup(mut self) -> Self {
        self.fail_lookup = true;
        self
    }

    pub(crate) fn seen_selectors(&self) -> Vec<String> {
        self.seen_selectors.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServiceDirectory for FakeDirectory {
    async fn service_selector(
        &self,
        _namespace: &str,
        service: &str,
    ) -> anyhow::Result<Option<BTreeMap<String, String>>> {
        if self.fail_lookup {
            anyhow::bail!("services \"{service}\" not found");
        }
        Ok(self.selector.clone())
    }

    async fn list_pods(
        &self,
        _namespace: &str,
        label_selector: &str,
    ) -> anyhow::Result<Vec<PodCandidate>> {
        self.seen_selectors
            .lock()
            .unwrap()
            .push(label_selector.to_string());
        Ok(self.pods.clone())
    }
}

/// Dials straight to a local address, standing in for the Pod.
pub(crate) struct LocalDialer {
    addr: SocketAddr,
    remote_port: u16,
    dials: AtomicUsize,
    pod_gone: AtomicBool,
}

impl LocalDialer {
    pub(crate) fn new(addr: SocketAddr, remote_port: u16) -> Self {
        Self {
            addr,
            remote_port,
            dials: AtomicUsize::new(0),
            pod_gone: AtomicBool::new(false),
        }
    }

    pub(crate) fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub(crate) fn terminate_pod(&self) {
        self.pod_gone.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PodDialer for LocalDialer {
    async fn dial(&self, target: &PodTarget) -> anyhow::Result<Upstream> {
        anyhow::ensure!(
            target.port == self.remote_port,
            "unexpected remote port {}",
            target.port
        );
        if self.pod_gone.load(Ordering::SeqCst) {
            anyhow::bail!("pod {} not found", target.pod);
        }
        self.dials.fetch_add(1, Ordering::SeqCst);
        let stream = TcpStream::connect(self.addr).await?;
        Ok(Upstream::new(stream))
    }
}

pub(crate) struct FailingDialer;

#[async_trait]
impl PodDialer for FailingDialer {
    async fn dial(&self, _target: &PodTarget) -> anyhow::Result<Upstream> {
        anyhow::bail!("unable to upgrade connection: Unauthorized")
    }
}

/// Never completes a dial; tracks how many dials are still pending.
#[derive(Default)]
pub(crate) struct HangingDialer {
    in_flight: Arc<AtomicUsize>,
}

impl HangingDialer {
    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PodDialer for HangingDialer {
    async fn dial(&self, _target: &PodTarget) -> anyhow::Result<Upstream> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlight(Arc::clone(&self.in_flight));
        std::future::pending::<anyhow::Result<Upstream>>().await
    }
}

/// Serves a small stand-in for the cost-analysis API on a loopback port.
pub(crate) async fn spawn_fixture() -> SocketAddr {
    let router = Router::new()
        .route("/model/getConfigs", get(|| async { CONFIGS_BODY }))
        .route(
            "/echo",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                let mut pairs: Vec<_> = params.into_iter().collect();
                pairs.sort();
                pairs
                    .into_iter()
                    .map(|(key, value)| format!("{key}={value}"))
                    .collect::<Vec<_>>()
                    .join("&")
            }),
        )
        .route(
            "/echo-body",
            post(|headers: HeaderMap, body: String| async move {
                let tag = headers
                    .get("x-request-tag")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                format!("{tag}:{body}")
            }),
        )
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "late"
            }),
        )
        .fallback(|| async { (StatusCode::NOT_FOUND, NOT_FOUND_BODY) });

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fixture");
    let addr = listener.local_addr().expect("fixture addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}
