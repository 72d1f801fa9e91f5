//! The `ctx` object injected into every filter function.
//!
//! | Member | Kind |
//! |--------|------|
//! | `ctx.url`, `ctx.method` | read-only strings |
//! | `ctx.headers` | map of name → array of strings |
//! | `ctx.body` | parsed JSON body, read/write |
//! | `ctx.operation` | `#{ READ: 0, WRITE: 1 }` |
//! | `ctx.getVar(k)`, `ctx.setVar(k, v)`, `ctx.listVar()` | request scope |
//! | `ctx.request(method, url, body[, headers])` | blocking outbound HTTP |

use crate::bridge::{OutboundHttp, OutboundRequest};
use crate::engine::{dynamic_to_json, json_to_dynamic};
use dockhorse_kernel::{BodyOperation, RequestContext, RequestScope};
use rhai::{Array, Dynamic, Engine, INT, Map};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Per-invocation handle passed to a filter function as `ctx`.
///
/// Cloning is cheap apart from the body; the request scope and the HTTP
/// bridge are shared handles.
#[derive(Clone)]
pub struct ScriptContext {
    request_id: String,
    url: String,
    method: String,
    headers: HashMap<String, Vec<String>>,
    body: Dynamic,
    scope: RequestScope,
    http: Arc<dyn OutboundHttp>,
}

impl fmt::Debug for ScriptContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptContext")
            .field("request_id", &self.request_id)
            .field("method", &self.method)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl ScriptContext {
    /// Build the handle for one invocation.  `body` is the current phase
    /// body; empty or unparseable text becomes an empty map.
    pub fn new(request: &RequestContext, body: &str, http: Arc<dyn OutboundHttp>) -> Self {
        let body = serde_json::from_str::<serde_json::Value>(body)
            .map(|v| json_to_dynamic(&v))
            .unwrap_or_else(|_| Dynamic::from(Map::new()));

        Self {
            request_id: request.id.clone(),
            url: request.url.clone(),
            method: request.method.clone(),
            headers: request.headers.clone(),
            body,
            scope: request.scope.clone(),
            http,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn headers(&self) -> &HashMap<String, Vec<String>> {
        &self.headers
    }

    /// The current body as JSON.
    pub fn body_json(&self) -> serde_json::Value {
        dynamic_to_json(&self.body)
    }

    pub fn scope(&self) -> &RequestScope {
        &self.scope
    }

    /// Register the `Context` type and its members on `engine`.
    pub fn register(engine: &mut Engine) {
        engine
            .register_type_with_name::<ScriptContext>("Context")
            .register_get("url", |c: &mut ScriptContext| c.url.clone())
            .register_get("method", |c: &mut ScriptContext| c.method.clone())
            .register_get("headers", |c: &mut ScriptContext| c.headers_map())
            .register_get_set(
                "body",
                |c: &mut ScriptContext| c.body.clone(),
                |c: &mut ScriptContext, value: Dynamic| c.body = value,
            )
            .register_get("operation", |_: &mut ScriptContext| operation_map())
            .register_fn("getVar", |c: &mut ScriptContext, key: &str| c.scope.get(key))
            .register_fn("setVar", |c: &mut ScriptContext, key: &str, value: Dynamic| {
                c.scope.set(key, var_string(&value))
            })
            .register_fn("listVar", |c: &mut ScriptContext| {
                c.scope
                    .list()
                    .into_iter()
                    .map(|(k, v)| (k.into(), Dynamic::from(v)))
                    .collect::<Map>()
            })
            .register_fn(
                "request",
                |c: &mut ScriptContext, method: &str, url: &str, body: Dynamic| {
                    c.request(method, url, &body, &Map::new())
                },
            )
            .register_fn(
                "request",
                |c: &mut ScriptContext, method: &str, url: &str, body: Dynamic, headers: Map| {
                    c.request(method, url, &body, &headers)
                },
            );
    }

    fn headers_map(&self) -> Map {
        self.headers
            .iter()
            .map(|(name, values)| {
                let values: Array = values.iter().cloned().map(Dynamic::from).collect();
                (name.as_str().into(), Dynamic::from(values))
            })
            .collect()
    }

    fn request(&self, method: &str, url: &str, body: &Dynamic, headers: &Map) -> Map {
        let mut request_headers = Vec::new();
        for (name, value) in headers {
            match value.clone().try_cast::<Array>() {
                Some(values) => request_headers
                    .extend(values.iter().map(|v| (name.to_string(), var_string(v)))),
                None => request_headers.push((name.to_string(), var_string(value))),
            }
        }

        let request = OutboundRequest {
            method: method.to_string(),
            url: url.to_string(),
            body: var_string(body),
            headers: request_headers,
        };

        let mut out = Map::new();
        match self.http.send(request) {
            Ok(response) => {
                let mut grouped: HashMap<String, Array> = HashMap::new();
                for (name, value) in response.headers {
                    grouped.entry(name).or_default().push(Dynamic::from(value));
                }
                let headers: Map = grouped
                    .into_iter()
                    .map(|(name, values)| (name.into(), Dynamic::from(values)))
                    .collect();
                out.insert("body".into(), Dynamic::from(response.body));
                out.insert("status".into(), Dynamic::from(INT::from(response.status)));
                out.insert("headers".into(), Dynamic::from(headers));
            }
            Err(e) => {
                warn!(request_id = %self.request_id, url = %url, error = %e, "script outbound request failed");
                out.insert("body".into(), Dynamic::from(e.to_string()));
                out.insert("status".into(), Dynamic::from(0 as INT));
            }
        }
        out
    }
}

fn operation_map() -> Map {
    let mut map = Map::new();
    map.insert("READ".into(), Dynamic::from(BodyOperation::Read.code()));
    map.insert("WRITE".into(), Dynamic::from(BodyOperation::Write.code()));
    map
}

/// String form of a script value: strings verbatim, `()` as empty, and
/// everything else as JSON text.
pub(crate) fn var_string(value: &Dynamic) -> String {
    if value.is_unit() {
        return String::new();
    }
    match dynamic_to_json(value) {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::OutboundResponse;
    use crate::error::{ScriptError, ScriptResult};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingHttp {
        seen: Mutex<Vec<OutboundRequest>>,
        fail: bool,
    }

    impl OutboundHttp for RecordingHttp {
        fn send(&self, request: OutboundRequest) -> ScriptResult<OutboundResponse> {
            self.seen.lock().push(request);
            if self.fail {
                return Err(ScriptError::Bridge("connection refused".into()));
            }
            Ok(OutboundResponse {
                status: 200,
                body: "pong".into(),
                headers: vec![("x-a".into(), "1".into()), ("x-a".into(), "2".into())],
            })
        }
    }

    fn eval(script: &str, ctx: ScriptContext) -> Dynamic {
        let mut engine = Engine::new();
        ScriptContext::register(&mut engine);
        let mut scope = rhai::Scope::new();
        scope.push("ctx", ctx);
        engine.eval_with_scope::<Dynamic>(&mut scope, script).unwrap()
    }

    fn request() -> RequestContext {
        RequestContext::new("req-1", "post", "/containers/create?name=web")
            .with_header("Content-Type", "application/json")
    }

    #[test]
    fn exposes_request_fields() {
        let http = Arc::new(RecordingHttp::default());
        let ctx = ScriptContext::new(&request(), r#"{"Image":"nginx"}"#, http);

        assert_eq!(eval("ctx.method", ctx.clone()).into_string().unwrap(), "POST");
        assert_eq!(
            eval("ctx.url", ctx.clone()).into_string().unwrap(),
            "/containers/create?name=web"
        );
        assert_eq!(
            eval(r#"ctx.headers["Content-Type"][0]"#, ctx.clone())
                .into_string()
                .unwrap(),
            "application/json"
        );
        assert_eq!(eval("ctx.body.Image", ctx.clone()).into_string().unwrap(), "nginx");
        assert_eq!(eval("ctx.operation.WRITE", ctx).as_int().unwrap(), 1);
    }

    #[test]
    fn unparseable_body_becomes_empty_map() {
        let http = Arc::new(RecordingHttp::default());
        let ctx = ScriptContext::new(&request(), "not json", http);
        assert!(eval("ctx.body", ctx.clone()).is_map());
        assert_eq!(ctx.body_json(), serde_json::json!({}));
    }

    #[test]
    fn scope_is_shared_with_request() {
        let req = request();
        let http = Arc::new(RecordingHttp::default());
        let ctx = ScriptContext::new(&req, "{}", http);

        assert!(eval(r#"ctx.setVar("user", "alice"); ctx.setVar("count", 3);"#, ctx.clone()).is_unit());
        assert_eq!(req.scope.get("user"), "alice");
        assert_eq!(req.scope.get("count"), "3");
        assert_eq!(eval(r#"ctx.getVar("missing")"#, ctx.clone()).into_string().unwrap(), "");
        assert_eq!(eval("ctx.listVar().len()", ctx).as_int().unwrap(), 2);
    }

    #[test]
    fn request_returns_response_map() {
        let http = Arc::new(RecordingHttp::default());
        let ctx = ScriptContext::new(&request(), "{}", http.clone());

        let out = eval(
            r#"ctx.request("POST", "http://authz/check", #{ user: "alice" }, #{ "x-token": "t" })"#,
            ctx,
        )
        .cast::<Map>();
        assert_eq!(out["status"].as_int().unwrap(), 200);
        assert_eq!(out["body"].clone().into_string().unwrap(), "pong");
        let headers = out["headers"].clone().cast::<Map>();
        assert_eq!(headers["x-a"].clone().cast::<Array>().len(), 2);

        let seen = http.seen.lock();
        assert_eq!(seen[0].body, r#"{"user":"alice"}"#);
        assert_eq!(seen[0].headers, vec![("x-token".to_string(), "t".to_string())]);
    }

    #[test]
    fn request_failure_is_returned_as_data() {
        let http = Arc::new(RecordingHttp {
            fail: true,
            ..Default::default()
        });
        let ctx = ScriptContext::new(&request(), "{}", http);

        let out = eval(r#"ctx.request("GET", "http://down/", "")"#, ctx).cast::<Map>();
        assert_eq!(out["status"].as_int().unwrap(), 0);
        assert!(
            out["body"]
                .clone()
                .into_string()
                .unwrap()
                .contains("connection refused")
        );
    }
}
