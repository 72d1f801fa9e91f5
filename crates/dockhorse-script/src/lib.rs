//! Script filters for dockhorse.
//!
//! Filters are Rhai scripts discovered in a directory ([`load_all`]) and
//! executed by a [`SandboxEngine`]: one fresh, resource-limited interpreter
//! per invocation, with a `ctx` handle ([`ScriptContext`]) and a `plugins`
//! object ([`ScriptPlugin`]) as the only way out of the sandbox.

pub mod bridge;
pub mod context;
pub mod engine;
pub mod error;
pub mod filter;
pub mod loader;

pub use bridge::{OutboundHttp, OutboundRequest, OutboundResponse, ReqwestBridge, ScriptPlugin};
pub use context::ScriptContext;
pub use engine::{SandboxEngine, decode_result, dynamic_to_json, json_to_dynamic};
pub use error::{ScriptError, ScriptResult};
pub use filter::ScriptFilter;
pub use loader::{load_all, load_file, parse_file_name};
