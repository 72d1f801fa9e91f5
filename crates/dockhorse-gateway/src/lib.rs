//! `dockhorse-gateway`: intercepting reverse proxy for the Docker Engine API.
//!
//! Every client request passes through two filter phases around a single
//! call to the daemon:
//!
//! | Stage | Implementation |
//! |-------|----------------|
//! | Before / After phases | [`filter::FilterManager`] |
//! | Script filters | [`dockhorse_script::ScriptFilter`] |
//! | Compiled-in filters | [`filter::NativeFilter`], [`filter::AccessLogFilter`] |
//! | Daemon call | [`backend::DockerBackend`] behind [`backend::Upstream`] |
//!
//! [`server::ProxyServer`] wires everything together into an axum HTTP
//! service.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use dockhorse_gateway::server::ProxyServer;
//! use dockhorse_kernel::ProxyConfig;
//! use dockhorse_script::{SandboxEngine, ScriptFilter, load_all};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ProxyConfig::load(Some("dockhorse.toml")).unwrap();
//!     let engine = Arc::new(SandboxEngine::new(config.sandbox.clone()).unwrap());
//!     let configs = load_all(&config.filters_dir, &engine).unwrap();
//!
//!     ProxyServer::new(config)
//!         .with_filters(ScriptFilter::from_configs(configs, &engine))
//!         .start()
//!         .await
//!         .unwrap();
//! }
//! ```

pub mod backend;
pub mod error;
pub mod filter;
pub mod server;

pub use error::{GatewayError, GatewayResult};
pub use server::{AppState, ProxyRequest, ProxyResponse, ProxyServer};
