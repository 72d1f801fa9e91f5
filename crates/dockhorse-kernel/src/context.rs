//! Per-request context and request-scoped key/value store.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

// ─────────────────────────────────────────────────────────────────────────────
// Request scope
// ─────────────────────────────────────────────────────────────────────────────

/// Mutable string map shared by every filter invoked for one request.
///
/// A scope is created with its [`RequestContext`] and dropped with it, so
/// no filter can observe another request's values.  Filters in a phase run
/// one after another; the mutex only exists because the handle is shared
/// with the sandbox thread running a script filter.
#[derive(Debug, Clone, Default)]
pub struct RequestScope {
    vars: Arc<Mutex<HashMap<String, String>>>,
}

impl RequestScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value stored under `key`, or an empty string.
    pub fn get(&self, key: &str) -> String {
        self.vars.lock().get(key).cloned().unwrap_or_default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.lock().insert(key.into(), value.into());
    }

    /// Snapshot of every stored pair.
    pub fn list(&self) -> HashMap<String, String> {
        self.vars.lock().clone()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request context
// ─────────────────────────────────────────────────────────────────────────────

/// Everything a filter may read about the in-flight request.
///
/// Built by the transport layer at request entry and dropped when the
/// response has been written.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Correlation id for logs.
    pub id: String,
    /// Uppercased HTTP method.
    pub method: String,
    /// Request URI as received (path and query).
    pub url: String,
    /// Decoded request path without query string; used for URL matching.
    pub path: String,
    /// Header name → all values, in arrival order.
    pub headers: HashMap<String, Vec<String>>,
    /// Raw request body.
    pub body: Vec<u8>,
    /// Request-scoped variables.
    pub scope: RequestScope,
    /// Upstream status, set once the daemon has answered (After phase).
    pub response_status: Option<u16>,
}

impl RequestContext {
    /// Construct a context.  `path` defaults to `url` without its query.
    pub fn new(id: impl Into<String>, method: &str, url: impl Into<String>) -> Self {
        let url = url.into();
        let path = url.split('?').next().unwrap_or_default().to_string();
        Self {
            id: id.into(),
            method: method.to_uppercase(),
            url,
            path,
            headers: HashMap::new(),
            body: Vec::new(),
            scope: RequestScope::new(),
            response_status: None,
        }
    }

    /// Builder helper: override the matching path (e.g. after decoding).
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Builder helper: append a header value.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.entry(name.into()).or_default().push(value.into());
        self
    }

    /// Builder helper: set the raw body.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

/// Turn raw body bytes into the JSON text a phase starts from.
///
/// Empty, non-UTF-8, and non-JSON payloads all become `{}`.
pub fn normalize_json_body(raw: &[u8]) -> String {
    let Ok(text) = std::str::from_utf8(raw) else {
        return "{}".to_string();
    };
    if text.trim().is_empty() {
        return "{}".to_string();
    }
    match serde_json::from_str::<serde::de::IgnoredAny>(text) {
        Ok(_) => text.to_string(),
        Err(_) => "{}".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_reads_as_empty() {
        let scope = RequestScope::new();
        assert_eq!(scope.get("user"), "");
        scope.set("user", "alice");
        assert_eq!(scope.get("user"), "alice");
        assert_eq!(scope.list().len(), 1);
    }

    #[test]
    fn cloned_scope_shares_values() {
        let scope = RequestScope::new();
        let handle = scope.clone();
        handle.set("k", "v");
        assert_eq!(scope.get("k"), "v");
    }

    #[test]
    fn separate_contexts_do_not_share_scope() {
        let a = RequestContext::new("a", "get", "/info");
        let b = RequestContext::new("b", "get", "/info");
        a.scope.set("k", "from-a");
        assert_eq!(b.scope.get("k"), "");
    }

    #[test]
    fn path_strips_query_and_method_is_uppercased() {
        let ctx = RequestContext::new("r", "post", "/containers/create?name=web");
        assert_eq!(ctx.path, "/containers/create");
        assert_eq!(ctx.method, "POST");
    }

    #[test]
    fn body_normalization() {
        assert_eq!(normalize_json_body(b""), "{}");
        assert_eq!(normalize_json_body(b"  \n"), "{}");
        assert_eq!(normalize_json_body(b"not json"), "{}");
        assert_eq!(normalize_json_body(&[0xff, 0xfe]), "{}");
        assert_eq!(normalize_json_body(br#"{"a":1}"#), r#"{"a":1}"#);
        assert_eq!(normalize_json_body(b"[1,2]"), "[1,2]");
    }
}
