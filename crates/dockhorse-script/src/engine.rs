//! Sandboxed Rhai execution of filter functions.
//!
//! Every invocation gets a fresh [`Engine`]: limits applied, `ctx` type and
//! helper functions registered, plugins bound.  Nothing survives between
//! invocations except what a script writes into the request scope.

use crate::bridge::{OutboundHttp, ReqwestBridge, ScriptPlugin};
use crate::context::ScriptContext;
use crate::error::{ScriptError, ScriptResult};
use dockhorse_kernel::{BodyOperation, FilterResult, SandboxSettings};
use rhai::module_resolvers::DummyModuleResolver;
use rhai::{Array, Dynamic, Engine, EvalAltResult, FnPtr, Map};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// ============================================================================
// Sandbox engine
// ============================================================================

/// Factory for per-invocation Rhai engines.
///
/// Shared by every script filter; holds the sandbox limits, the outbound
/// HTTP bridge, and the registered plugins.
pub struct SandboxEngine {
    settings: SandboxSettings,
    http: Arc<dyn OutboundHttp>,
    plugins: Vec<Arc<dyn ScriptPlugin>>,
}

impl SandboxEngine {
    /// Create an engine whose `ctx.request` uses [`ReqwestBridge`].
    pub fn new(settings: SandboxSettings) -> ScriptResult<Self> {
        let http = ReqwestBridge::new(Duration::from_millis(settings.http_timeout_ms))?;
        Ok(Self::with_http(settings, Arc::new(http)))
    }

    /// Create an engine with a custom outbound bridge.
    pub fn with_http(settings: SandboxSettings, http: Arc<dyn OutboundHttp>) -> Self {
        Self {
            settings,
            http,
            plugins: Vec::new(),
        }
    }

    /// Builder helper: expose `plugin` to scripts.
    pub fn with_plugin(mut self, plugin: Arc<dyn ScriptPlugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    /// The bridge handed to each [`ScriptContext`].
    pub fn http(&self) -> Arc<dyn OutboundHttp> {
        Arc::clone(&self.http)
    }

    /// Evaluate a filter definition file and return its final value.
    pub fn evaluate_definition(&self, label: &str, source: &str) -> ScriptResult<Dynamic> {
        let engine = self.build_engine(label);
        let ast = engine
            .compile(source)
            .map_err(|e| ScriptError::Compile(e.to_string()))?;
        engine.eval_ast::<Dynamic>(&ast).map_err(runtime_error)
    }

    /// Run one filter invocation: evaluate `source` to the filter function,
    /// call it with `(ctx, plugins)`, and decode the returned map.
    ///
    /// Blocking; call from the blocking pool.
    pub fn run(&self, label: &str, source: &str, ctx: ScriptContext) -> ScriptResult<FilterResult> {
        let mut engine = self.build_engine(label);
        let plugins = self.bind_plugins(&mut engine, label);

        let ast = engine
            .compile(source)
            .map_err(|e| ScriptError::Compile(e.to_string()))?;
        let value = engine.eval_ast::<Dynamic>(&ast).map_err(runtime_error)?;
        let function = extract_function(value)?;

        let returned: Dynamic = function
            .call(&engine, &ast, (ctx, plugins))
            .map_err(runtime_error)?;
        decode_result(returned)
    }

    fn build_engine(&self, label: &str) -> Engine {
        let mut engine = Engine::new();
        apply_security_limits(&mut engine, &self.settings);
        // `import` must not reach the host filesystem.
        engine.set_module_resolver(DummyModuleResolver::new());

        let filter = label.to_string();
        engine.on_print(move |msg| info!(filter = %filter, "script: {msg}"));
        let filter = label.to_string();
        engine.on_debug(move |msg, _source, pos| {
            debug!(filter = %filter, position = %pos, "script: {msg}")
        });

        register_builtin_functions(&mut engine);
        ScriptContext::register(&mut engine);
        engine
    }

    /// Register each plugin as `plugin_<name>` and return the `plugins`
    /// object mapping names to function pointers.
    fn bind_plugins(&self, engine: &mut Engine, label: &str) -> Map {
        let mut plugins = Map::new();
        for plugin in &self.plugins {
            let fn_name = format!("plugin_{}", plugin.name());
            let pointer = match FnPtr::new(fn_name.clone()) {
                Ok(pointer) => pointer,
                Err(e) => {
                    warn!(filter = %label, plugin = %plugin.name(), error = %e, "skipping plugin with invalid name");
                    continue;
                }
            };

            let handler = Arc::clone(plugin);
            engine.register_fn(
                fn_name,
                move |ctx: ScriptContext| -> Result<Dynamic, Box<EvalAltResult>> {
                    handler
                        .invoke(&ctx)
                        .map(|v| json_to_dynamic(&v))
                        .map_err(|e| e.to_string().into())
                },
            );
            plugins.insert(plugin.name().into(), Dynamic::from(pointer));
        }
        plugins
    }
}

/// Apply sandbox limits.
fn apply_security_limits(engine: &mut Engine, settings: &SandboxSettings) {
    engine.set_max_operations(settings.max_operations);
    engine.set_max_call_levels(settings.max_call_levels);
    engine.set_max_string_size(settings.max_string_size);
    engine.set_max_array_size(settings.max_array_size);
    engine.set_max_map_size(settings.max_map_size);

    if !settings.allow_loops {
        engine.set_allow_looping(false);
    }
}

fn register_builtin_functions(engine: &mut Engine) {
    engine.register_fn("to_json", |value: Dynamic| -> String {
        dynamic_to_json(&value).to_string()
    });

    engine.register_fn("from_json", |json: &str| -> Dynamic {
        serde_json::from_str::<serde_json::Value>(json)
            .map(|v| json_to_dynamic(&v))
            .unwrap_or(Dynamic::UNIT)
    });
}

fn runtime_error(err: Box<EvalAltResult>) -> ScriptError {
    ScriptError::Runtime(err.to_string())
}

// ============================================================================
// Result decoding
// ============================================================================

/// Accept either the closure itself or a definition map holding it under
/// `"function"`.
fn extract_function(value: Dynamic) -> ScriptResult<FnPtr> {
    if value.is::<FnPtr>() {
        return Ok(value.cast::<FnPtr>());
    }
    value
        .try_cast::<Map>()
        .and_then(|map| map.get("function").cloned())
        .and_then(|f| f.try_cast::<FnPtr>())
        .ok_or(ScriptError::MissingFunction)
}

fn field<'a>(map: &'a Map, key: &str) -> ScriptResult<&'a Dynamic> {
    map.get(key)
        .ok_or_else(|| ScriptError::Decode(format!("missing field '{key}'")))
}

fn wrong_type(key: &str, expected: &str, actual: &str) -> ScriptError {
    ScriptError::Decode(format!("field '{key}' must be {expected}, got {actual}"))
}

/// Decode the map returned by a filter function.
///
/// `next`, `body`, `status` and `operation` are required; `error` is
/// optional and an empty string means no error.
pub fn decode_result(value: Dynamic) -> ScriptResult<FilterResult> {
    let type_name = value.type_name();
    let map = value.try_cast::<Map>().ok_or_else(|| {
        ScriptError::Decode(format!("filter function must return an object map, got {type_name}"))
    })?;

    let next = field(&map, "next")?
        .as_bool()
        .map_err(|actual| wrong_type("next", "a bool", actual))?;

    let body = dynamic_to_json(field(&map, "body")?).to_string();

    let status = field(&map, "status")?
        .as_int()
        .map_err(|actual| wrong_type("status", "an integer", actual))?;
    let status = u16::try_from(status)
        .map_err(|_| ScriptError::Decode(format!("field 'status' out of range: {status}")))?;

    let operation = field(&map, "operation")?
        .as_int()
        .map_err(|actual| wrong_type("operation", "an integer", actual))?;

    let error = match map.get("error") {
        None => None,
        Some(v) if v.is_unit() => None,
        Some(v) => {
            let text = v
                .clone()
                .into_string()
                .map_err(|actual| wrong_type("error", "a string", actual))?;
            Some(text).filter(|e| !e.is_empty())
        }
    };

    Ok(FilterResult {
        next,
        body,
        status,
        operation: BodyOperation::from_code(operation),
        error,
    })
}

// ============================================================================
// Helper functions
// ============================================================================

/// Script-side value for a JSON document: objects become maps, `null`
/// becomes `()`, and numbers stay integers whenever they fit an `i64`.
pub fn json_to_dynamic(value: &serde_json::Value) -> Dynamic {
    use serde_json::Value;

    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => (*b).into(),
        Value::Number(n) => n
            .as_i64()
            .map(Dynamic::from)
            .or_else(|| n.as_f64().map(Dynamic::from))
            .unwrap_or(Dynamic::UNIT),
        Value::String(s) => s.as_str().into(),
        Value::Array(items) => items.iter().map(json_to_dynamic).collect::<Array>().into(),
        Value::Object(fields) => fields
            .iter()
            .map(|(k, v)| (k.as_str().into(), json_to_dynamic(v)))
            .collect::<Map>()
            .into(),
    }
}

/// JSON form of a script value.  Values with no JSON shape (characters,
/// timestamps, function pointers, custom types) become their display string.
pub fn dynamic_to_json(value: &Dynamic) -> serde_json::Value {
    if value.is_unit() {
        serde_json::Value::Null
    } else if let Ok(b) = value.as_bool() {
        serde_json::Value::Bool(b)
    } else if let Ok(i) = value.as_int() {
        serde_json::json!(i)
    } else if let Ok(f) = value.as_float() {
        serde_json::json!(f)
    } else if value.is_string() {
        serde_json::Value::String(value.clone().into_string().unwrap_or_default())
    } else if value.is_array() {
        let arr = value.clone().cast::<Array>();
        serde_json::Value::Array(arr.iter().map(dynamic_to_json).collect())
    } else if value.is_map() {
        let map = value.clone().cast::<Map>();
        let mut json_obj = serde_json::Map::new();
        for (k, v) in map.iter() {
            json_obj.insert(k.to_string(), dynamic_to_json(v));
        }
        serde_json::Value::Object(json_obj)
    } else {
        serde_json::Value::String(value.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================
