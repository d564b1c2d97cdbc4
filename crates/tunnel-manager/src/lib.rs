//! Tunnels to in-cluster Services through the Kubernetes API server.
//!
//! [`Tunneler::open`] picks a ready Pod behind a Service, forwards an
//! ephemeral loopback port to it over the `portforward` sub-resource and
//! hands back a [`Session`] that issues HTTP calls through that port.

mod cluster;
mod discovery;
mod dispatch;
mod error;
mod forward;
mod session;
#[cfg(test)]
mod testing;

pub use cluster::KubeCluster;
pub use discovery::{find_ready_pod, label_selector, ServiceDirectory};
pub use dispatch::Dispatcher;
pub use error::{BoxError, NoBackendReason, Result, TunnelError};
pub use forward::{ForwardedPort, PodDialer, PodTarget, PortForward, TunnelStream, Upstream};
pub use session::{Session, Tunneler, TunnelOptions};
