//! Dockhorse proxy entry point.
//!
//! Loads configuration, compiles the filter directory and serves until
//! ctrl-c / SIGTERM.
//!
//! # Configuration
//!
//! The config file path is the first argument, or `DOCKHORSE_CONFIG`.  Any
//! field can be overridden through the environment:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `DOCKHORSE_LISTEN_ADDR` | `0.0.0.0:8080` | Client-facing listener. |
//! | `DOCKHORSE_DOCKER_SOCK_URL` | `unix:///var/run/docker.sock` | Daemon address. |
//! | `DOCKHORSE_TARGET_HOST_NAME` | `docker` | `Host` header sent upstream. |
//! | `DOCKHORSE_FILTERS_DIR` | `filters` | Directory of `.rhai` filter files. |
//! | `DOCKHORSE_LOG_LEVEL` | `info` | Used when `RUST_LOG` is unset. |
//! | `DOCKHORSE_LOG_FORMAT` | `text` | `text` or `json`. |
//! | `DOCKHORSE_SANDBOX__MAX_OPERATIONS` | `1000000` | Script operation budget. |

use dockhorse_gateway::error::GatewayError;
use dockhorse_gateway::filter::AccessLogFilter;
use dockhorse_gateway::server::ProxyServer;
use dockhorse_kernel::{LogFormat, ProxyConfig};
use dockhorse_script::{SandboxEngine, ScriptFilter, load_all};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("DOCKHORSE_CONFIG").ok());

    let config = match ProxyConfig::load(path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("dockhorse: invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(&config);

    if let Err(e) = run(config).await {
        eprintln!("dockhorse: {e}");
        std::process::exit(1);
    }
}

async fn run(config: ProxyConfig) -> Result<(), GatewayError> {
    let engine = SandboxEngine::new(config.sandbox.clone())
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
    let engine = Arc::new(engine);

    let configs = match load_all(&config.filters_dir, &engine) {
        Ok(configs) => configs,
        Err(e) => {
            warn!(dir = %config.filters_dir, error = %e, "filter directory unreadable, starting without script filters");
            Vec::new()
        }
    };
    info!(count = configs.len(), dir = %config.filters_dir, "script filters loaded");

    let access_log = config.access_log;
    let mut server = ProxyServer::new(config).with_filters(ScriptFilter::from_configs(configs, &engine));
    if access_log {
        server = server.with_filters(AccessLogFilter::filters());
    }
    server.start().await
}

fn init_tracing(config: &ProxyConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}
