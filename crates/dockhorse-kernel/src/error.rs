//! Filter error types for `dockhorse-kernel`.
//!
//! [`FilterError`] separates *configuration* failures, which only exclude
//! the offending filter from the active set, from *execution* failures,
//! which end the running phase with a proxy-error response.

use super::filter::{BodyOperation, FilterResult};
use thiserror::Error;

/// HTTP status used when a filter fails to execute.
pub const PROXY_ERROR_STATUS: u16 = 500;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum FilterError {
    // ── Configuration ────────────────────────────────────────────────────────
    /// A script file name does not follow `<order>.<phase>.<name>.rhai`.
    #[error("invalid filter file name '{0}'")]
    InvalidFileName(String),

    /// A filter file could not be read.
    #[error("cannot read filter file '{file}': {reason}")]
    Io { file: String, reason: String },

    /// Evaluating a filter definition failed.
    #[error("filter definition '{file}' could not be evaluated: {reason}")]
    Definition { file: String, reason: String },

    /// A required field is absent from a filter definition.
    #[error("filter definition '{file}' is missing field '{field}'")]
    MissingField { file: String, field: String },

    /// A field of a filter definition has the wrong type.
    #[error("filter definition '{file}' field '{field}' must be {expected}")]
    InvalidField {
        file: String,
        field: String,
        expected: String,
    },

    // ── Execution ────────────────────────────────────────────────────────────
    /// A filter invocation failed (script error, malformed result, …).
    #[error("filter '{filter}' failed: {message}")]
    Execution { filter: String, message: String },
}

impl FilterError {
    pub fn execution(filter: impl Into<String>, message: impl Into<String>) -> Self {
        FilterError::Execution {
            filter: filter.into(),
            message: message.into(),
        }
    }

    /// `true` for failures raised while running a filter.
    pub fn is_execution(&self) -> bool {
        matches!(self, FilterError::Execution { .. })
    }

    /// Error-shaped result: stop the chain with a diagnostic body.
    pub fn to_result(&self) -> FilterResult {
        FilterResult {
            next: false,
            body: proxy_error_body(&self.to_string()),
            status: PROXY_ERROR_STATUS,
            operation: BodyOperation::Write,
            error: Some(self.to_string()),
        }
    }
}

/// JSON body returned to the client when the proxy itself fails.
pub fn proxy_error_body(diagnostic: &str) -> String {
    serde_json::json!({ "message": format!("Proxy error: {diagnostic}") }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_error_becomes_halting_result() {
        let err = FilterError::execution("auth", "missing field 'next'");
        assert!(err.is_execution());

        let result = err.to_result();
        assert!(!result.next);
        assert_eq!(result.status, PROXY_ERROR_STATUS);

        let body: serde_json::Value = serde_json::from_str(&result.body).unwrap();
        let message = body["message"].as_str().unwrap();
        assert!(message.starts_with("Proxy error: "));
        assert!(message.contains("missing field 'next'"));
    }

    #[test]
    fn diagnostic_with_quotes_stays_valid_json() {
        let body = proxy_error_body(r#"unexpected "}" at 1:4"#);
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert!(parsed["message"].as_str().unwrap().contains("\"}\""));
    }

    #[test]
    fn config_errors_are_not_execution_errors() {
        assert!(!FilterError::InvalidFileName("x.js".into()).is_execution());
    }
}
