//! Backend module.
//!
//! [`Upstream`] is the seam between the proxy flow and the Docker daemon;
//! [`DockerBackend`] is the production implementation.

mod docker;

pub use docker::{DockerBackend, UpstreamTarget};

use crate::error::GatewayResult;
use async_trait::async_trait;
use bytes::Bytes;

/// Headers that describe a single connection and are never forwarded.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Whether `name` must be dropped when relaying a message.  `Host` and
/// `Content-Length` are recomputed for the outgoing message.
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
        || name.eq_ignore_ascii_case("host")
        || name.eq_ignore_ascii_case("content-length")
}

/// A request relayed to the daemon.
#[derive(Debug, Clone, Default)]
pub struct UpstreamRequest {
    pub method: String,
    /// Path and query exactly as received.
    pub path_and_query: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// The daemon's answer.
#[derive(Debug, Clone, Default)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Something that can answer a Docker Engine API request.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn forward(&self, request: UpstreamRequest) -> GatewayResult<UpstreamResponse>;
}
