//! Docker daemon backend.
//!
//! [`DockerBackend`] relays buffered requests to the daemon, over its unix
//! socket (hyper HTTP/1 client on a `UnixStream`) or over TCP (`reqwest`).
//! Every request carries `Host: <target_host_name>` and none of the
//! client's hop-by-hop headers.

use super::{Upstream, UpstreamRequest, UpstreamResponse, is_hop_by_hop};
use crate::error::{GatewayError, GatewayResult};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::HOST;
use hyper_util::rt::TokioIo;
use reqwest::{Client, Method};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tracing::{debug, instrument};

/// Where the daemon listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamTarget {
    /// `unix:///var/run/docker.sock`
    Unix(PathBuf),
    /// `tcp://host:port` (rewritten to `http://`) or `http(s)://host:port`
    Http(String),
}

impl UpstreamTarget {
    pub fn parse(url: &str) -> GatewayResult<Self> {
        let invalid = || GatewayError::InvalidUpstream(url.to_string());

        if let Some(path) = url.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(invalid());
            }
            return Ok(UpstreamTarget::Unix(PathBuf::from(path)));
        }

        let (scheme, rest) = if let Some(rest) = url.strip_prefix("tcp://") {
            ("http", rest)
        } else if let Some(rest) = url.strip_prefix("http://") {
            ("http", rest)
        } else if let Some(rest) = url.strip_prefix("https://") {
            ("https", rest)
        } else {
            return Err(invalid());
        };

        let authority = rest.trim_end_matches('/');
        if authority.is_empty() {
            return Err(invalid());
        }
        let base = format!("{scheme}://{authority}");
        Ok(UpstreamTarget::Http(base))
    }
}

/// Forwards requests to the Docker Engine API.
pub struct DockerBackend {
    target: UpstreamTarget,
    host: String,
    timeout: Duration,
    client: Client,
}

impl DockerBackend {
    /// - `sock_url`: `unix://`, `tcp://`, `http://` or `https://` address.
    /// - `host`: value of the `Host` header sent upstream.
    /// - `timeout`: limit for one complete exchange.
    pub fn new(sock_url: &str, host: impl Into<String>, timeout: Duration) -> GatewayResult<Self> {
        let target = UpstreamTarget::parse(sock_url)?;
        let client = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            target,
            host: host.into(),
            timeout,
            client,
        })
    }

    pub fn target(&self) -> &UpstreamTarget {
        &self.target
    }

    async fn forward_unix(
        &self,
        socket: &Path,
        request: UpstreamRequest,
    ) -> GatewayResult<UpstreamResponse> {
        let stream = UnixStream::connect(socket).await.map_err(|e| {
            GatewayError::Upstream(format!("cannot connect to {}: {e}", socket.display()))
        })?;
        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| GatewayError::Upstream(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "upstream connection closed with error");
            }
        });

        let mut builder = hyper::Request::builder()
            .method(request.method.as_str())
            .uri(request.path_and_query.as_str())
            .header(HOST, self.host.as_str());
        for (name, value) in relayed(&request.headers) {
            builder = builder.header(name, value);
        }
        let outgoing = builder
            .body(Full::new(request.body))
            .map_err(|e| GatewayError::Internal(format!("invalid upstream request: {e}")))?;

        let response = sender
            .send_request(outgoing)
            .await
            .map_err(|e| GatewayError::Upstream(e.to_string()))?;
        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| GatewayError::Upstream(e.to_string()))?
            .to_bytes();

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }

    async fn forward_http(
        &self,
        base: &str,
        request: UpstreamRequest,
    ) -> GatewayResult<UpstreamResponse> {
        let url = format!("{base}{}", request.path_and_query);
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| GatewayError::Internal(format!("invalid method '{}'", request.method)))?;

        let mut builder = self
            .client
            .request(method, &url)
            .header(HOST, self.host.as_str());
        for (name, value) in relayed(&request.headers) {
            builder = builder.header(name, value);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| GatewayError::Upstream(e.to_string()))?;
        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body: Bytes = response
            .bytes()
            .await
            .map_err(|e| GatewayError::Upstream(e.to_string()))?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl Upstream for DockerBackend {
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path_and_query))]
    async fn forward(&self, request: UpstreamRequest) -> GatewayResult<UpstreamResponse> {
        debug!(target_host = %self.host, "forwarding to docker daemon");
        let exchange = async {
            match &self.target {
                UpstreamTarget::Unix(socket) => self.forward_unix(socket, request).await,
                UpstreamTarget::Http(base) => self.forward_http(base, request).await,
            }
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                GatewayError::Upstream(format!("no answer within {}s", self.timeout.as_secs()))
            })?
    }
}

fn relayed(headers: &[(String, String)]) -> impl Iterator<Item = (&str, &str)> {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name))
        .map(|(name, value)| (name.as_str(), value.as_str()))
}

fn collect_headers(headers: &hyper::HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, http::HeaderMap, routing::post};

    #[test]
    fn parses_supported_addresses() {
        assert_eq!(
            UpstreamTarget::parse("unix:///var/run/docker.sock").unwrap(),
            UpstreamTarget::Unix(PathBuf::from("/var/run/docker.sock"))
        );
        assert_eq!(
            UpstreamTarget::parse("tcp://10.0.0.5:2375").unwrap(),
            UpstreamTarget::Http("http://10.0.0.5:2375".into())
        );
        assert_eq!(
            UpstreamTarget::parse("https://docker.internal:2376/").unwrap(),
            UpstreamTarget::Http("https://docker.internal:2376".into())
        );
        for bad in [
            "unix://",
            "tcp://",
            "http://",
            "https:///",
            "ftp://host",
            "/var/run/docker.sock",
        ] {
            assert!(
                matches!(UpstreamTarget::parse(bad), Err(GatewayError::InvalidUpstream(_))),
                "{bad}"
            );
        }
    }

    async fn echo(
        headers: HeaderMap,
        body: Bytes,
    ) -> (axum::http::StatusCode, [(&'static str, String); 1], Bytes) {
        let host = headers
            .get("host")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        (axum::http::StatusCode::CREATED, [("x-seen-host", host)], body)
    }

    fn echo_app() -> Router {
        Router::new().route("/v1.41/containers/create", post(echo))
    }

    fn request() -> UpstreamRequest {
        UpstreamRequest {
            method: "POST".into(),
            path_and_query: "/v1.41/containers/create?name=web".into(),
            headers: vec![
                ("content-type".into(), "application/json".into()),
                ("connection".into(), "keep-alive".into()),
                ("content-length".into(), "999".into()),
            ],
            body: Bytes::from_static(br#"{"Image":"nginx"}"#),
        }
    }

    fn header<'a>(response: &'a UpstreamResponse, name: &str) -> Option<&'a str> {
        response
            .headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    #[tokio::test]
    async fn forwards_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, echo_app()).await });

        let backend =
            DockerBackend::new(&format!("tcp://{addr}"), "docker", Duration::from_secs(5)).unwrap();
        let response = backend.forward(request()).await.unwrap();

        assert_eq!(response.status, 201);
        assert_eq!(response.body.as_ref(), br#"{"Image":"nginx"}"#);
        assert_eq!(header(&response, "x-seen-host"), Some("docker"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn forwards_over_unix_socket() {
        let dir = tempfile::TempDir::new().unwrap();
        let socket = dir.path().join("docker.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();
        tokio::spawn(async move { axum::serve(listener, echo_app()).await });

        let backend = DockerBackend::new(
            &format!("unix://{}", socket.display()),
            "docker",
            Duration::from_secs(5),
        )
        .unwrap();
        let response = backend.forward(request()).await.unwrap();

        assert_eq!(response.status, 201);
        assert_eq!(response.body.as_ref(), br#"{"Image":"nginx"}"#);
        assert_eq!(header(&response, "x-seen-host"), Some("docker"));
    }

    #[tokio::test]
    async fn unreachable_socket_is_an_upstream_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let socket = dir.path().join("missing.sock");
        let backend = DockerBackend::new(
            &format!("unix://{}", socket.display()),
            "docker",
            Duration::from_secs(1),
        )
        .unwrap();

        let err = backend.forward(request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Upstream(_)));
    }
}
