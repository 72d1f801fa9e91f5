//! Proxy configuration.
//!
//! Sources are layered, later ones overriding earlier ones:
//!
//! 1. built-in defaults ([`ProxyConfig::default`]),
//! 2. an optional file (YAML, TOML or JSON, detected from the extension;
//!    `${VAR}` and `$VAR` references are substituted before parsing),
//! 3. `DOCKHORSE_*` environment variables, `__` separating nested keys
//!    (e.g. `DOCKHORSE_SANDBOX__HTTP_TIMEOUT_MS=2000`).

use config::{Config as Cfg, Environment, File, FileFormat};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefix of environment variables read by [`ProxyConfig::load`].
pub const ENV_PREFIX: &str = "DOCKHORSE";

static BRACED_VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"));
static BARE_VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b").expect("valid regex"));

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

// ─────────────────────────────────────────────────────────────────────────────
// Config structs
// ─────────────────────────────────────────────────────────────────────────────

/// Log output format of the binary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Limits applied to every script sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Maximum number of operations per invocation.
    pub max_operations: u64,
    /// Maximum function call depth.
    pub max_call_levels: usize,
    /// Maximum string length in bytes.
    pub max_string_size: usize,
    /// Maximum array length.
    pub max_array_size: usize,
    /// Maximum object map size.
    pub max_map_size: usize,
    /// Whether `loop`, `while` and `for` are allowed.
    pub allow_loops: bool,
    /// Timeout of `ctx.request(...)` calls, in milliseconds.
    pub http_timeout_ms: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            max_operations: 1_000_000,
            max_call_levels: 64,
            max_string_size: 16 * 1024 * 1024,
            max_array_size: 100_000,
            max_map_size: 100_000,
            allow_loops: true,
            http_timeout_ms: 10_000,
        }
    }
}

/// Runtime configuration of the proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address the proxy listens on.
    pub listen_addr: String,
    /// Upstream daemon: `unix:///path.sock`, `tcp://host:port` or `http://host:port`.
    pub docker_sock_url: String,
    /// `Host` header sent to the daemon.
    pub target_host_name: String,
    /// Directory scanned for `*.rhai` filter scripts.
    pub filters_dir: String,
    /// Default tracing level when `RUST_LOG` is unset.
    pub log_level: String,
    pub log_format: LogFormat,
    /// Seconds to wait for in-flight requests on shutdown.
    pub shutdown_timeout_secs: u64,
    /// Timeout of a forwarded daemon call, in seconds.
    pub upstream_timeout_secs: u64,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
    /// Install the built-in access-log filters.
    pub access_log: bool,
    pub sandbox: SandboxSettings,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            docker_sock_url: "unix:///var/run/docker.sock".to_string(),
            target_host_name: "docker".to_string(),
            filters_dir: "filters".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            shutdown_timeout_secs: 5,
            upstream_timeout_secs: 300,
            max_body_bytes: 64 * 1024 * 1024,
            access_log: true,
            sandbox: SandboxSettings::default(),
        }
    }
}

impl ProxyConfig {
    /// Load defaults, then `path` (if any), then `DOCKHORSE_*` variables.
    pub fn load(path: Option<&str>) -> ConfigResult<Self> {
        Self::load_with_env(path, Environment::with_prefix(ENV_PREFIX))
    }

    /// Same as [`load`](Self::load) with an explicit environment source.
    pub fn load_with_env(path: Option<&str>, env: Environment) -> ConfigResult<Self> {
        let defaults =
            Cfg::try_from(&ProxyConfig::default()).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let mut builder = Cfg::builder().add_source(defaults);

        if let Some(path) = path {
            let format = detect_format(path)?;
            let content = std::fs::read_to_string(path)?;
            builder = builder.add_source(File::from_str(&substitute_env_vars(&content), format));
        }

        let config: ProxyConfig = builder
            .add_source(
                env.prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(Cfg::try_deserialize)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the proxy cannot start with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.docker_sock_url.trim().is_empty() {
            return Err(ConfigError::Invalid("docker_sock_url cannot be empty".into()));
        }
        if self.target_host_name.trim().is_empty() {
            return Err(ConfigError::Invalid("target_host_name cannot be empty".into()));
        }
        if self.sandbox.http_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.http_timeout_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Detect configuration format from file extension.
pub fn detect_format(path: &str) -> ConfigResult<FileFormat> {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

/// Replace `${VAR}` and `$VAR` with environment values.  Unset variables
/// are left as written.
pub fn substitute_env_vars(content: &str) -> String {
    let braced = BRACED_VAR.replace_all(content, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    });
    BARE_VAR
        .replace_all(&braced, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}
