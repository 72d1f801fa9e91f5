//! Filter trait and filter value types.
//!
//! Every filter participates in exactly one phase ([`Invoke`]).  Within a
//! phase, filters run in ascending [`FilterOrder`]; equal orders keep their
//! discovery order.
//!
//! ```text
//! Request  ──► Before(001) ──► Before(010) ──► … ──► upstream daemon
//!                                                        │
//! Response ◄── After(…)    ◄── After(005)  ◄─────────────┘
//! ```
//!
//! A filter that returns `next = false` (or fails) ends its phase, and for
//! the Before phase the request is never forwarded.

use super::context::RequestContext;
use super::error::FilterError;
use super::matcher::UrlMatcher;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

// ─────────────────────────────────────────────────────────────────────────────
// Phase, ordering and body operation
// ─────────────────────────────────────────────────────────────────────────────

/// Phase in which a filter participates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Invoke {
    /// Runs on the client request, before it is forwarded upstream.
    Before,
    /// Runs on the daemon response, before it is returned to the client.
    After,
}

impl Invoke {
    /// Map the phase segment of a script file name (`request` / `response`).
    pub fn from_file_segment(segment: &str) -> Option<Self> {
        match segment {
            "request" => Some(Invoke::Before),
            "response" => Some(Invoke::After),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Invoke::Before => "before",
            Invoke::After => "after",
        }
    }
}

impl fmt::Display for Invoke {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric ordering slot for a filter within its phase.
///
/// Script filters take this from the 1–3 digit file name prefix; native
/// filters declare it in code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FilterOrder(pub u32);

impl fmt::Display for FilterOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

/// What the pipeline does with the body a filter returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BodyOperation {
    /// Body unchanged; the returned body is ignored.
    #[default]
    Read,
    /// The returned body replaces the in-flight body.
    Write,
}

impl BodyOperation {
    /// Numeric code exposed to scripts (`READ = 0`, `WRITE = 1`).
    pub fn code(&self) -> i64 {
        match self {
            BodyOperation::Read => 0,
            BodyOperation::Write => 1,
        }
    }

    /// Decode a script-provided code. Only `1` means write.
    pub fn from_code(code: i64) -> Self {
        if code == 1 {
            BodyOperation::Write
        } else {
            BodyOperation::Read
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FilterConfig
// ─────────────────────────────────────────────────────────────────────────────

/// Immutable description of one filter.
///
/// The URL matcher is compiled on first use and cached for the lifetime of
/// the config; see [`UrlMatcher`].
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Identifier used in logs.  Not required to be unique.
    pub name: String,
    /// Position within the phase.
    pub order: FilterOrder,
    /// Phase this filter runs in.
    pub invoke: Invoke,
    /// Script text that evaluates to the filter function.  `None` for
    /// native filters.
    pub function_source: Option<String>,
    matcher: UrlMatcher,
}

impl FilterConfig {
    /// Create a config for a native filter (no script source).
    pub fn new(
        name: impl Into<String>,
        order: FilterOrder,
        path_pattern: impl Into<String>,
        invoke: Invoke,
    ) -> Self {
        Self {
            name: name.into(),
            order,
            invoke,
            function_source: None,
            matcher: UrlMatcher::new(path_pattern),
        }
    }

    /// Builder helper: attach the script source of a script filter.
    pub fn with_function_source(mut self, source: impl Into<String>) -> Self {
        self.function_source = Some(source.into());
        self
    }

    /// The user-authored regular expression over the request path.
    pub fn path_pattern(&self) -> &str {
        self.matcher.pattern()
    }

    /// Whether this filter applies to `path` (decoded path, no query).
    pub fn matches(&self, path: &str) -> bool {
        self.matcher.matches(&self.name, path)
    }

    /// Compile the matcher now.  Returns `false` when the pattern is invalid.
    pub fn warm_matcher(&self) -> bool {
        self.matcher.warm(&self.name)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FilterResult
// ─────────────────────────────────────────────────────────────────────────────

/// Structured outcome of one filter invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterResult {
    /// `false` stops the phase and answers the client with this result.
    pub next: bool,
    /// Candidate replacement body (JSON text).
    pub body: String,
    /// Candidate HTTP status.
    pub status: u16,
    /// Whether `body` replaces the in-flight body.
    pub operation: BodyOperation,
    /// When present the invocation is treated as failed regardless of `next`.
    pub error: Option<String>,
}

impl FilterResult {
    /// Continue with the body unchanged.
    pub fn proceed() -> Self {
        Self {
            next: true,
            body: String::new(),
            status: 0,
            operation: BodyOperation::Read,
            error: None,
        }
    }

    /// Continue with `body` replacing the in-flight body.
    pub fn rewrite(body: impl Into<String>) -> Self {
        Self {
            next: true,
            body: body.into(),
            status: 0,
            operation: BodyOperation::Write,
            error: None,
        }
    }

    /// Stop the phase and answer with `status` / `body`.
    pub fn halt(status: u16, body: impl Into<String>) -> Self {
        Self {
            next: false,
            body: body.into(),
            status,
            operation: BodyOperation::Write,
            error: None,
        }
    }

    /// The failure description, if the result reports one.
    pub fn failure(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.is_empty())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Filter trait
// ─────────────────────────────────────────────────────────────────────────────

/// Kernel contract for a single filter in the pipeline.
///
/// There are two implementations: native filters compiled into the proxy,
/// and script filters executed in the Rhai sandbox.  Implementations must
/// be `Send + Sync`; the filter set is shared by every in-flight request.
#[async_trait]
pub trait Filter: Send + Sync {
    /// The filter's configuration record.
    fn config(&self) -> &FilterConfig;

    /// Whether the filter applies to the given request path.
    fn matches_url(&self, path: &str) -> bool {
        self.config().matches(path)
    }

    /// Run the filter against the current phase body.
    ///
    /// An `Err` is an execution error: the pipeline stops the phase and
    /// answers with a proxy-error body.
    async fn exec(&self, ctx: &RequestContext, body: &str) -> Result<FilterResult, FilterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_segment_maps_to_phase() {
        assert_eq!(Invoke::from_file_segment("request"), Some(Invoke::Before));
        assert_eq!(Invoke::from_file_segment("response"), Some(Invoke::After));
        assert_eq!(Invoke::from_file_segment("Request"), None);
    }

    #[test]
    fn only_one_decodes_as_write() {
        assert_eq!(BodyOperation::from_code(1), BodyOperation::Write);
        assert_eq!(BodyOperation::from_code(0), BodyOperation::Read);
        assert_eq!(BodyOperation::from_code(7), BodyOperation::Read);
        assert_eq!(BodyOperation::Write.code(), 1);
    }

    #[test]
    fn empty_error_is_not_a_failure() {
        let mut result = FilterResult::proceed();
        assert!(result.failure().is_none());
        result.error = Some(String::new());
        assert!(result.failure().is_none());
        result.error = Some("denied".into());
        assert_eq!(result.failure(), Some("denied"));
    }

    #[test]
    fn order_sorts_numerically() {
        let mut orders = vec![FilterOrder(10), FilterOrder(1), FilterOrder(5)];
        orders.sort();
        assert_eq!(orders, vec![FilterOrder(1), FilterOrder(5), FilterOrder(10)]);
        assert_eq!(FilterOrder(7).to_string(), "007");
    }
}
