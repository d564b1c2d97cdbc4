use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use tunnel_protocol::Method;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, TunnelError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoBackendReason {
    NoSelector,
    NoPods,
    NoReadyPods,
}

impl fmt::Display for NoBackendReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoBackendReason::NoSelector => f.write_str("service has no pod selector"),
            NoBackendReason::NoPods => f.write_str("no pods match the service selector"),
            NoBackendReason::NoReadyPods => {
                f.write_str("couldn't find a Pod which is Ready to serve the query")
            }
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TunnelError {
    #[error("invalid service reference: {0}")]
    InvalidServiceRef(String),

    #[error("failed to look up service {service} in namespace {namespace}: {source}")]
    ServiceLookup {
        service: String,
        namespace: String,
        #[source]
        source: BoxError,
    },

    #[error("no backend available for service {service} in namespace {namespace}: {reason}")]
    NoBackendAvailable {
        service: String,
        namespace: String,
        reason: NoBackendReason,
    },

    #[error("failed to set up port-forward to {target}: {source}")]
    TunnelSetup {
        target: String,
        #[source]
        source: BoxError,
    },

    #[error("timed out ({}s) waiting for port-forward to {target} to become ready", .timeout.as_secs_f64())]
    TunnelReadyTimeout { target: String, timeout: Duration },

    #[error("{operation} cancelled")]
    Cancelled { operation: &'static str },

    #[error("tunnel session to {service} is closed")]
    SessionClosed { service: String },

    #[error("invalid request for path {path}: {reason}")]
    InvalidRequest { path: String, reason: String },

    #[error("failed to {method} {url}: {source}")]
    Transport {
        method: Method,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("received non-200 status code {status} from {method} {url} and data: {}", String::from_utf8_lossy(.body))]
    ApiStatus {
        method: Method,
        url: String,
        status: u16,
        body: Bytes,
    },
}

impl TunnelError {
    /// Status code of a non-200 API response.
    pub fn status(&self) -> Option<u16> {
        match self {
            TunnelError::ApiStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Raw body of a non-200 API response.
    pub fn body(&self) -> Option<&Bytes> {
        match self {
            TunnelError::ApiStatus { body, .. } => Some(body),
            _ => None,
        }
    }

    pub(crate) fn setup(target: impl fmt::Display, source: anyhow::Error) -> Self {
        TunnelError::TunnelSetup {
            target: target.to_string(),
            source: source.into(),
        }
    }
}
