use crate::cluster::KubeCluster;
use crate::discovery::{find_ready_pod, ServiceDirectory};
use crate::dispatch::Dispatcher;
use crate::error::{Result, TunnelError};
use crate::forward::{PodDialer, PodTarget, PortForward};
use bytes::Bytes;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tunnel_protocol::{Request, Response, ServiceRef, DEFAULT_READY_TIMEOUT};
use url::Url;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TunnelOptions {
    pub ready_timeout: Duration,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

/// Opens tunnel sessions to Services.
///
/// Holds the control-plane handles explicitly; each [`Session`] it opens is
/// independent of every other one.
#[derive(Clone)]
pub struct Tunneler {
    directory: Arc<dyn ServiceDirectory>,
    dialer: Arc<dyn PodDialer>,
    options: TunnelOptions,
}

impl Tunneler {
    pub fn new(directory: Arc<dyn ServiceDirectory>, dialer: Arc<dyn PodDialer>) -> Self {
        Self {
            directory,
            dialer,
            options: TunnelOptions::default(),
        }
    }

    pub fn from_kube_client(client: kube::Client) -> Self {
        let cluster = Arc::new(KubeCluster::new(client));
        Self::new(cluster.clone(), cluster)
    }

    /// Builds the control-plane transport from credentials.
    pub fn from_kube_config(config: kube::Config) -> Result<Self> {
        let cluster = KubeCluster::try_from_config(config)
            .map_err(|err| TunnelError::setup("the kubernetes API server", err))?;
        let cluster = Arc::new(cluster);
        Ok(Self::new(cluster.clone(), cluster))
    }

    pub fn with_options(mut self, options: TunnelOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> TunnelOptions {
        self.options
    }

    /// Finds a ready Pod behind the Service and forwards a local port to it.
    ///
    /// `cancel` only governs this call; once ready the session lives until
    /// [`Session::close`] or drop.
    pub async fn open(&self, service: &ServiceRef, cancel: &CancellationToken) -> Result<Session> {
        if service.target_port == 0 {
            return Err(TunnelError::InvalidServiceRef(format!(
                "target port for {} must be non-zero",
                service.service_name
            )));
        }
        let id = Uuid::new_v4();
        let span = tracing::debug_span!("tunnel", session_id = %id, service = %service);
        self.open_session(id, service, cancel).instrument(span).await
    }

    async fn open_session(
        &self,
        id: Uuid,
        service: &ServiceRef,
        cancel: &CancellationToken,
    ) -> Result<Session> {
        let pod = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TunnelError::Cancelled { operation: "backend discovery" }),
            pod = find_ready_pod(self.directory.as_ref(), &service.namespace, &service.service_name) => pod?,
        };

        let target = PodTarget {
            namespace: service.namespace.clone(),
            pod: pod.name,
            port: service.target_port,
        };
        let forward = PortForward::open(
            Arc::clone(&self.dialer),
            target.clone(),
            self.options.ready_timeout,
            cancel,
        )
        .await?;

        let local = match forward.ports() {
            Ok(ports) => ports.first().map(|port| port.local),
            Err(err) => {
                forward.stop().await;
                return Err(TunnelError::setup(&target, err.context("failed to get forwarded ports")));
            }
        };
        let Some(local) = local else {
            forward.stop().await;
            return Err(TunnelError::setup(&target, anyhow::anyhow!("no ports forwarded")));
        };
        let local_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, local));

        let built = local_base_url(local_addr).and_then(|base_url| {
            let client = reqwest::Client::builder().no_proxy().build()?;
            Ok(Dispatcher::new(client, base_url))
        });
        let dispatcher = match built {
            Ok(dispatcher) => dispatcher,
            Err(err) => {
                forward.stop().await;
                return Err(TunnelError::setup(&target, err));
            }
        };
        tracing::debug!(base_url = %dispatcher.base_url(), pod = %target.pod, "port-forward set up");

        Ok(Session {
            id,
            service: service.clone(),
            local_addr,
            forward,
            dispatcher,
        })
    }
}

fn local_base_url(local_addr: SocketAddr) -> anyhow::Result<Url> {
    Ok(Url::parse(&format!("http://{local_addr}"))?)
}

/// A ready tunnel to one Pod of a Service.
///
/// The base URL stays the same for the whole session. Requests may be issued
/// concurrently through `&self`.
pub struct Session {
    id: Uuid,
    service: ServiceRef,
    local_addr: SocketAddr,
    forward: PortForward,
    dispatcher: Dispatcher,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn service(&self) -> &ServiceRef {
        &self.service
    }

    pub fn pod(&self) -> &str {
        &self.forward.target().pod
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_base_url(&self) -> &Url {
        self.dispatcher.base_url()
    }

    pub fn is_closed(&self) -> bool {
        self.forward.is_stopped()
    }

    pub async fn execute(&self, request: Request, cancel: &CancellationToken) -> Result<Response> {
        if self.is_closed() {
            return Err(TunnelError::SessionClosed {
                service: self.service.to_string(),
            });
        }
        self.dispatcher.execute(request, cancel).await
    }

    pub async fn get<I, K, V>(
        &self,
        path: &str,
        params: I,
        cancel: &CancellationToken,
    ) -> Result<Bytes>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let response = self.execute(Request::get(path).params(params), cancel).await?;
        Ok(response.body)
    }

    pub async fn post<I, K, V>(
        &self,
        path: &str,
        params: I,
        headers: Vec<(String, String)>,
        body: Bytes,
        cancel: &CancellationToken,
    ) -> Result<Bytes>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut request = Request::post(path, body).params(params);
        request.headers = headers;
        let response = self.execute(request, cancel).await?;
        Ok(response.body)
    }

    /// Stops the forwarding loop and releases the local port.
    pub async fn close(&self) {
        if !self.is_closed() {
            tracing::debug!(session_id = %self.id, service = %self.service, "closing tunnel session");
        }
        self.forward.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NoBackendReason;
    use crate::testing::{
        candidate, spawn_fixture, FailingDialer, FakeDirectory, HangingDialer, LocalDialer,
        CONFIGS_BODY, NOT_FOUND_BODY,
    };
    use futures_util::future::join_all;
    use tunnel_protocol::{Method, PodCandidate};

    fn service() -> ServiceRef {
        ServiceRef::new("kubecost", "cost-analyzer", 9090)
    }

    async fn open_with(
        pods: Vec<PodCandidate>,
        dialer: Arc<dyn PodDialer>,
        ready_timeout: Duration,
    ) -> Result<Session> {
        Tunneler::new(Arc::new(FakeDirectory::with_pods(pods)), dialer)
            .with_options(TunnelOptions { ready_timeout })
            .open(&service(), &CancellationToken::new())
            .await
    }

    async fn open_ready() -> (Session, Arc<LocalDialer>) {
        let fixture = spawn_fixture().await;
        let dialer = Arc::new(LocalDialer::new(fixture, 9090));
        let session = open_with(
            vec![candidate("cost-0", true)],
            dialer.clone(),
            Duration::from_secs(5),
        )
        .await
        .expect("session");
        (session, dialer)
    }

    #[test]
    fn readiness_deadline_defaults_to_sixty_seconds() {
        assert_eq!(TunnelOptions::default().ready_timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn get_configs_through_tunnel() {
        let (session, _dialer) = open_ready().await;
        assert_eq!(session.pod(), "cost-0");
        assert_eq!(
            session.local_base_url().as_str(),
            format!("http://127.0.0.1:{}/", session.local_addr().port())
        );

        let response = session
            .execute(Request::get("/model/getConfigs"), &CancellationToken::new())
            .await
            .expect("getConfigs");
        assert_eq!(response.status, 200);
        assert_eq!(response.body.as_ref(), CONFIGS_BODY.as_bytes());
        session.close().await;
    }

    #[tokio::test]
    async fn no_ready_pods_fails_without_dialing() {
        let dialer = Arc::new(HangingDialer::default());
        let err = open_with(
            vec![candidate("cost-0", false)],
            dialer.clone(),
            Duration::from_secs(30),
        )
        .await
        .err()
        .expect("no backend");
        assert!(matches!(
            err,
            TunnelError::NoBackendAvailable {
                reason: NoBackendReason::NoReadyPods,
                ..
            }
        ));
        assert_eq!(dialer.in_flight(), 0);
    }

    #[tokio::test]
    async fn zero_pods_names_service_and_namespace() {
        let err = open_with(
            Vec::new(),
            Arc::new(HangingDialer::default()),
            Duration::from_secs(30),
        )
        .await
        .err()
        .expect("no backend");
        assert!(matches!(err, TunnelError::NoBackendAvailable { .. }));
        let message = err.to_string();
        assert!(message.contains("service cost-analyzer"));
        assert!(message.contains("namespace kubecost"));
    }

    #[tokio::test]
    async fn readiness_timeout_leaves_nothing_running() {
        let dialer = Arc::new(HangingDialer::default());
        let err = open_with(
            vec![candidate("cost-0", true)],
            dialer.clone(),
            Duration::from_millis(150),
        )
        .await
        .err()
        .expect("timeout");
        assert!(matches!(err, TunnelError::TunnelReadyTimeout { .. }));
        assert_eq!(dialer.in_flight(), 0);
    }

    #[tokio::test]
    async fn upgrade_failure_is_setup_failure() {
        let err = open_with(
            vec![candidate("cost-0", true)],
            Arc::new(FailingDialer),
            Duration::from_secs(5),
        )
        .await
        .err()
        .expect("setup failure");
        assert!(matches!(err, TunnelError::TunnelSetup { .. }));
        assert!(err.to_string().contains("Unauthorized"));
    }

    #[tokio::test]
    async fn zero_target_port_is_rejected() {
        let err = Tunneler::new(
            Arc::new(FakeDirectory::with_pods(vec![candidate("cost-0", true)])),
            Arc::new(FailingDialer),
        )
        .open(
            &ServiceRef::new("kubecost", "cost-analyzer", 0),
            &CancellationToken::new(),
        )
        .await
        .err()
        .expect("invalid ref");
        assert!(matches!(err, TunnelError::InvalidServiceRef(_)));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_later_requests() {
        let (session, _dialer) = open_ready().await;
        let local = session.local_addr();
        session.close().await;
        session.close().await;
        assert!(session.is_closed());

        let err = session
            .execute(Request::get("/model/getConfigs"), &CancellationToken::new())
            .await
            .expect_err("closed");
        assert!(matches!(err, TunnelError::SessionClosed { .. }));
        assert!(tokio::net::TcpStream::connect(local).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_requests_get_their_own_responses() {
        let (session, _dialer) = open_ready().await;
        let cancel = CancellationToken::new();
        let calls = (0..10).map(|index| {
            let session = &session;
            let cancel = &cancel;
            async move {
                let body = session
                    .get("/echo", [("id", index.to_string())], cancel)
                    .await
                    .expect("echo");
                (index, body)
            }
        });
        for (index, body) in join_all(calls).await {
            assert_eq!(body.as_ref(), format!("id={index}").as_bytes());
        }
        session.close().await;
    }

    #[tokio::test]
    async fn not_found_keeps_the_exact_body() {
        let (session, _dialer) = open_ready().await;
        let err = session
            .execute(Request::get("/model/missing"), &CancellationToken::new())
            .await
            .expect_err("404");
        match &err {
            TunnelError::ApiStatus {
                method,
                status,
                body,
                url,
            } => {
                assert_eq!(*method, Method::Get);
                assert_eq!(*status, 404);
                assert_eq!(body.as_ref(), NOT_FOUND_BODY.as_bytes());
                assert!(url.ends_with("/model/missing"));
            }
            other => panic!("unexpected error: {other}"),
        }
        session.close().await;
    }

    #[tokio::test]
    async fn post_sends_body_and_headers() {
        let (session, _dialer) = open_ready().await;
        let body = session
            .post(
                "/echo-body",
                Vec::<(String, String)>::new(),
                vec![("X-Request-Tag".to_string(), "speccost".to_string())],
                Bytes::from_static(b"{\"replicas\":2}"),
                &CancellationToken::new(),
            )
            .await
            .expect("post");
        assert_eq!(body.as_ref(), b"speccost:{\"replicas\":2}");
        session.close().await;
    }

    #[tokio::test]
    async fn pod_loss_surfaces_as_transport_error() {
        let (session, dialer) = open_ready().await;
        dialer.terminate_pod();
        let err = session
            .execute(Request::get("/model/getConfigs"), &CancellationToken::new())
            .await
            .expect_err("pod gone");
        assert!(matches!(err, TunnelError::Transport { .. }));
        assert!(!session.is_closed());
        session.close().await;
    }

    #[tokio::test]
    async fn request_cancellation_does_not_close_the_session() {
        let (session, _dialer) = open_ready().await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = session
            .execute(Request::get("/slow"), &cancel)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, TunnelError::Cancelled { .. }));

        let response = session
            .execute(Request::get("/model/getConfigs"), &CancellationToken::new())
            .await
            .expect("session still usable");
        assert_eq!(response.status, 200);
        session.close().await;
    }

    #[tokio::test]
    async fn sessions_are_independent() {
        let (first, _first_dialer) = open_ready().await;
        let (second, _second_dialer) = open_ready().await;
        assert_ne!(first.id(), second.id());
        assert_ne!(first.local_addr(), second.local_addr());
        first.close().await;
        let response = second
            .execute(Request::get("/model/getConfigs"), &CancellationToken::new())
            .await
            .expect("second session unaffected");
        assert_eq!(response.status, 200);
        second.close().await;
    }
}
