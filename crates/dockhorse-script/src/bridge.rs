//! Native capabilities exposed to scripts.
//!
//! Two bridges cross the sandbox boundary:
//!
//! - [`OutboundHttp`]: the blocking HTTP call behind `ctx.request(...)`.
//! - [`ScriptPlugin`]: named native functions reachable through the
//!   `plugins` object passed to every filter function.
//!
//! Both are synchronous.  Scripts run on Tokio's blocking pool, so a
//! bridge call blocks that thread only.

use crate::context::ScriptContext;
use crate::error::{ScriptError, ScriptResult};
use reqwest::{Client, Method};
use std::time::Duration;
use tracing::debug;

// ============================================================================
// Outbound HTTP
// ============================================================================

/// An HTTP call requested by a script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundRequest {
    pub method: String,
    pub url: String,
    pub body: String,
    pub headers: Vec<(String, String)>,
}

/// The answer handed back to the script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundResponse {
    pub status: u16,
    pub body: String,
    pub headers: Vec<(String, String)>,
}

/// Blocking HTTP client used by `ctx.request(...)`.
///
/// An `Err` never reaches the script as an exception; the context turns it
/// into `#{ body: <description>, status: 0 }`.
pub trait OutboundHttp: Send + Sync {
    fn send(&self, request: OutboundRequest) -> ScriptResult<OutboundResponse>;
}

/// [`OutboundHttp`] backed by `reqwest`.
///
/// When called on a thread that belongs to a Tokio runtime (the blocking
/// pool), the request is driven by that runtime.  Otherwise a throwaway
/// current-thread runtime is built for the call.
#[derive(Debug, Clone)]
pub struct ReqwestBridge {
    client: Client,
}

impl ReqwestBridge {
    pub fn new(timeout: Duration) -> ScriptResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            // Connections may outlive the runtime that opened them.
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| ScriptError::Bridge(e.to_string()))?;
        Ok(Self { client })
    }

    async fn execute(client: Client, request: OutboundRequest) -> ScriptResult<OutboundResponse> {
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| ScriptError::Bridge(format!("invalid method '{}'", request.method)))?;

        let mut builder = client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ScriptError::Bridge(e.to_string()))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| ScriptError::Bridge(e.to_string()))?;

        debug!(url = %request.url, status, "outbound request completed");
        Ok(OutboundResponse {
            status,
            body,
            headers,
        })
    }
}

impl OutboundHttp for ReqwestBridge {
    fn send(&self, request: OutboundRequest) -> ScriptResult<OutboundResponse> {
        let call = Self::execute(self.client.clone(), request);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle.block_on(call),
            Err(_) => tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?
                .block_on(call),
        }
    }
}

// ============================================================================
// Plugins
// ============================================================================

/// A native function made available to scripts as `plugins.<name>`.
///
/// Scripts call it with `plugins.<name>.call(ctx)`; the returned JSON value
/// is converted to a Rhai value.  An `Err` raises a script runtime error.
pub trait ScriptPlugin: Send + Sync {
    /// Property name under `plugins`.  Must be a valid Rhai identifier.
    fn name(&self) -> &str;

    fn invoke(&self, ctx: &ScriptContext) -> ScriptResult<serde_json::Value>;
}
