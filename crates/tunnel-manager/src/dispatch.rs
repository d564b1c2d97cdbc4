use crate::error::{Result, TunnelError};
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tunnel_protocol::{Method, Request, Response};
use url::Url;

/// Issues plain HTTP calls against a forwarded local base URL.
///
/// Exactly one attempt is made per call; non-200 answers become
/// [`TunnelError::ApiStatus`] with the body kept verbatim.
#[derive(Clone)]
pub struct Dispatcher {
    client: reqwest::Client,
    base_url: Url,
}

impl Dispatcher {
    pub fn new(client: reqwest::Client, base_url: Url) -> Self {
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Appends the request path to the base URL as plain path segments.
    ///
    /// The path never replaces the host, even when it looks like an
    /// absolute URL; query strings go in `Request::query`.
    pub fn request_url(&self, request: &Request) -> Result<Url> {
        let invalid = |reason: &str| TunnelError::InvalidRequest {
            path: request.path.clone(),
            reason: reason.to_string(),
        };
        if request.path.contains(['?', '#']) {
            return Err(invalid("path must not carry a query or fragment"));
        }
        let segments: Vec<&str> = request
            .path
            .split('/')
            .filter(|segment| !segment.is_empty() && *segment != ".")
            .collect();
        if segments.contains(&"..") {
            return Err(invalid("path must not contain `..` segments"));
        }

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| invalid("base URL cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        if url.host() != self.base_url.host() || url.port() != self.base_url.port() {
            return Err(invalid("path must stay on the forwarded port"));
        }
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(request.query.iter());
        }
        Ok(url)
    }

    pub async fn execute(&self, request: Request, cancel: &CancellationToken) -> Result<Response> {
        let url = self.request_url(&request)?;
        let method = request.method;
        let mut builder = match method {
            Method::Get => self.client.get(url.clone()),
            Method::Post => self.client.post(url.clone()),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        tracing::debug!(method = %method, url = %url, "executing request");
        let call = async {
            let response = builder.send().await?;
            let status = response.status();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, body))
        };
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TunnelError::Cancelled { operation: "request" }),
            outcome = call => outcome,
        };

        let (status, body) = outcome.map_err(|source| {
            if source.is_builder() {
                TunnelError::InvalidRequest {
                    path: request.path.clone(),
                    reason: source.to_string(),
                }
            } else {
                TunnelError::Transport {
                    method,
                    url: url.to_string(),
                    source,
                }
            }
        })?;
        if status != StatusCode::OK {
            return Err(TunnelError::ApiStatus {
                method,
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(Response {
            status: status.as_u16(),
            body,
        })
    }
}
