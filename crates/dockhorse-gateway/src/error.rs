//! Gateway error types

use axum::{
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use dockhorse_kernel::proxy_error_body;
use thiserror::Error;

/// Gateway-level errors
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// The daemon could not be reached or answered with a broken message.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// `docker_sock_url` is not a supported address.
    #[error("invalid upstream address '{0}'")]
    InvalidUpstream(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (
            self.status(),
            [(header::CONTENT_TYPE, "application/json")],
            proxy_error_body(&self.to_string()),
        )
            .into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn upstream_errors_map_to_bad_gateway() {
        let response = GatewayError::Upstream("connection refused".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            json["message"],
            "Proxy error: upstream error: connection refused"
        );
    }

    #[test]
    fn other_errors_are_internal() {
        assert_eq!(
            GatewayError::InvalidUpstream("ftp://x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
