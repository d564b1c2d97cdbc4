use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_NAMESPACE: &str = "kubecost";
pub const DEFAULT_SERVICE_NAME: &str = "kubecost-cost-analyzer";
pub const DEFAULT_SERVICE_PORT: u16 = 9090;
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Identifies the Service a tunnel is opened to.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ServiceRef {
    pub namespace: String,
    pub service_name: String,
    pub target_port: u16,
}

impl ServiceRef {
    pub fn new(
        namespace: impl Into<String>,
        service_name: impl Into<String>,
        target_port: u16,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            service_name: service_name.into(),
            target_port,
        }
    }
}

impl Default for ServiceRef {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE, DEFAULT_SERVICE_NAME, DEFAULT_SERVICE_PORT)
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}:{}",
            self.namespace, self.service_name, self.target_port
        )
    }
}

/// A Pod selected by a Service, as seen by one discovery pass.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodCandidate {
    pub name: String,
    pub ready: bool,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical HTTP call against the cost-analysis API.
///
/// Query parameters are keyed by name, so setting the same key twice keeps
/// the last value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl Request {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            query: BTreeMap::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            query: BTreeMap::new(),
            headers: Vec::new(),
            body: Some(body.into()),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in params {
            self.query.insert(key.into(), value.into());
        }
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: Bytes,
}

impl Response {
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}
