use crate::error::{Result, TunnelError};
use anyhow::Context;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TunnelStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// One upgraded byte stream to a Pod port.
///
/// `finish` resolves once the transport carrying the stream has shut down
/// after the stream half is dropped.
pub struct Upstream {
    stream: Box<dyn TunnelStream>,
    finish: Option<BoxFuture<'static, anyhow::Result<()>>>,
}

impl Upstream {
    pub fn new(stream: impl TunnelStream + 'static) -> Self {
        Self {
            stream: Box::new(stream),
            finish: None,
        }
    }

    pub fn on_finish<F>(mut self, finish: F) -> Self
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.finish = Some(Box::pin(finish));
        self
    }

    async fn release(self) -> anyhow::Result<()> {
        let Upstream { stream, finish } = self;
        drop(stream);
        match finish {
            Some(finish) => finish.await,
            None => Ok(()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodTarget {
    pub namespace: String,
    pub pod: String,
    pub port: u16,
}

impl fmt::Display for PodTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.pod, self.port)
    }
}

/// Opens upgraded streams to a Pod port through the control plane.
#[async_trait]
pub trait PodDialer: Send + Sync {
    async fn dial(&self, target: &PodTarget) -> anyhow::Result<Upstream>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ForwardedPort {
    pub local: u16,
    pub remote: u16,
}

/// A running forwarding loop relaying a loopback listener to one Pod port.
pub struct PortForward {
    target: PodTarget,
    ports: Arc<OnceLock<ForwardedPort>>,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PortForward {
    /// Spawns the forwarding loop and waits until it is ready.
    ///
    /// The local side binds port 0. On timeout or cancellation the loop is
    /// aborted and fully joined before this returns.
    pub async fn open(
        dialer: Arc<dyn PodDialer>,
        target: PodTarget,
        ready_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let stop = CancellationToken::new();
        let ports = Arc::new(OnceLock::new());
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(run_forward_loop(
            dialer,
            target.clone(),
            Arc::clone(&ports),
            stop.clone(),
            ready_tx,
        ));

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                abort_loop(&stop, task).await;
                return Err(TunnelError::Cancelled { operation: "port-forward setup" });
            }
            outcome = tokio::time::timeout(ready_timeout, ready_rx) => outcome,
        };

        match outcome {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => {
                abort_loop(&stop, task).await;
                return Err(TunnelError::setup(&target, err));
            }
            Ok(Err(_)) => {
                abort_loop(&stop, task).await;
                return Err(TunnelError::setup(
                    &target,
                    anyhow::anyhow!("forwarding loop exited before becoming ready"),
                ));
            }
            Err(_) => {
                abort_loop(&stop, task).await;
                return Err(TunnelError::TunnelReadyTimeout {
                    target: target.to_string(),
                    timeout: ready_timeout,
                });
            }
        }

        Ok(Self {
            target,
            ports,
            stop,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn target(&self) -> &PodTarget {
        &self.target
    }

    /// Ports bound by the loop; the local one was chosen by the OS.
    pub fn ports(&self) -> anyhow::Result<Vec<ForwardedPort>> {
        let port = self
            .ports
            .get()
            .copied()
            .context("port-forward has not bound any ports")?;
        Ok(vec![port])
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Stops the loop and waits for it to release the local port.
    ///
    /// Calling this again after the first stop does nothing.
    pub async fn stop(&self) {
        self.stop.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    tracing::warn!(target_pod = %self.target, error = %err, "forwarding loop panicked");
                }
            }
        }
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn abort_loop(stop: &CancellationToken, task: JoinHandle<()>) {
    stop.cancel();
    task.abort();
    let _ = task.await;
}

async fn run_forward_loop(
    dialer: Arc<dyn PodDialer>,
    target: PodTarget,
    ports: Arc<OnceLock<ForwardedPort>>,
    stop: CancellationToken,
    ready: oneshot::Sender<anyhow::Result<()>>,
) {
    let mut connections = JoinSet::new();
    let listener = match bind_and_handshake(dialer.as_ref(), &target, &mut connections).await {
        Ok(listener) => listener,
        Err(err) => {
            let _ = ready.send(Err(err));
            stop.cancel();
            return;
        }
    };
    if let Ok(local_addr) = listener.local_addr() {
        let _ = ports.set(ForwardedPort {
            local: local_addr.port(),
            remote: target.port,
        });
        tracing::info!(target_pod = %target, local_addr = %local_addr, "port-forward ready");
    }
    if ready.send(Ok(())).is_err() {
        tracing::debug!(target_pod = %target, "readiness no longer awaited, stopping port-forward");
        stop.cancel();
        return;
    }

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((conn, peer)) => {
                    let dialer = Arc::clone(&dialer);
                    let target = target.clone();
                    connections.spawn(async move {
                        if let Err(err) = relay(dialer.as_ref(), &target, conn).await {
                            tracing::warn!(target_pod = %target, peer = %peer, error = %err, "port-forward connection failed");
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!(target_pod = %target, error = %err, "failed to accept local connection");
                    if !pause_after_accept_error(&stop).await {
                        break;
                    }
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    connections.shutdown().await;
    stop.cancel();
    tracing::debug!(target_pod = %target, "port-forward stopped");
}

/// Waits out a failed `accept`; `false` when the loop was stopped meanwhile.
async fn pause_after_accept_error(stop: &CancellationToken) -> bool {
    tokio::select! {
        _ = stop.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => true,
    }
}

async fn bind_and_handshake(
    dialer: &dyn PodDialer,
    target: &PodTarget,
    connections: &mut JoinSet<()>,
) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .await
        .context("failed to bind local listener")?;
    let upstream = dialer.dial(target).await?;
    let target = target.clone();
    connections.spawn(async move {
        if let Err(err) = upstream.release().await {
            tracing::debug!(target_pod = %target, error = %err, "handshake stream closed with error");
        }
    });
    Ok(listener)
}

async fn relay(dialer: &dyn PodDialer, target: &PodTarget, mut local: TcpStream) -> anyhow::Result<()> {
    let mut upstream = dialer.dial(target).await?;
    let relayed = tokio::io::copy_bidirectional(&mut local, &mut upstream.stream).await;
    let released = upstream.release().await;
    let (sent, received) = relayed.context("failed to relay bytes")?;
    tracing::debug!(target_pod = %target, sent, received, "port-forward connection closed");
    released
}
