//! Dockhorse kernel contract.
//!
//! This crate defines the *trait interfaces and value types* shared by the
//! script sandbox and the gateway runtime.  No network I/O lives here.
//!
//! # Architecture mapping
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              dockhorse-kernel  (this crate)                 │
//! │  Filter trait   FilterConfig / UrlMatcher   FilterResult    │
//! │  RequestContext / RequestScope   FilterError   ProxyConfig  │
//! └──────────────┬───────────────────────────────┬──────────────┘
//!                │  depends on                   │
//! ┌──────────────▼──────────────┐ ┌──────────────▼──────────────┐
//! │  dockhorse-script           │ │  dockhorse-gateway          │
//! │  SandboxEngine (Rhai)       │ │  FilterManager (pipeline)   │
//! │  ScriptFilter, load_all     │ │  NativeFilter, DockerBackend│
//! │  OutboundHttp, ScriptPlugin │ │  ProxyServer (axum)         │
//! └─────────────────────────────┘ └─────────────────────────────┘
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod filter;
pub mod matcher;

// ── Flat re-exports ────────────────────────────────────────────────────────

pub use config::{ConfigError, ConfigResult, LogFormat, ProxyConfig, SandboxSettings};
pub use context::{RequestContext, RequestScope, normalize_json_body};
pub use error::{FilterError, proxy_error_body};
pub use filter::{BodyOperation, Filter, FilterConfig, FilterOrder, FilterResult, Invoke};
pub use matcher::UrlMatcher;
