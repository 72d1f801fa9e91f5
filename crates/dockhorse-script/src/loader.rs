//! Script filter discovery.
//!
//! A filter directory holds files named `<order>.<phase>.<name>.rhai`:
//!
//! ```text
//! 001.request.auth.rhai        order 1, Before, "auth"
//! 050.response.redact.rhai     order 50, After, "redact"
//! ```
//!
//! Each file must evaluate to an object map:
//!
//! ```rhai
//! #{
//!     "pathPattern": "^/containers/.*",
//!     "function": |ctx, plugins| {
//!         #{ next: true, body: ctx.body, status: 200, operation: ctx.operation.READ }
//!     }
//! }
//! ```
//!
//! `"function"` may also be a string holding the closure source.  A file
//! that fails to parse is logged and skipped; the others still load.

use crate::engine::SandboxEngine;
use dockhorse_kernel::{FilterConfig, FilterError, FilterOrder, Invoke};
use once_cell::sync::Lazy;
use regex::Regex;
use rhai::{FnPtr, Map};
use std::path::Path;
use tracing::{debug, error, info};

static FILE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9]{1,3})\.(request|response)\.(.+)\.rhai$").expect("valid regex")
});

/// Order, phase and name encoded in a script file name.
pub fn parse_file_name(file_name: &str) -> Result<(FilterOrder, Invoke, String), FilterError> {
    let invalid = || FilterError::InvalidFileName(file_name.to_string());

    let caps = FILE_NAME.captures(file_name).ok_or_else(invalid)?;
    let order = caps[1].parse::<u32>().map_err(|_| invalid())?;
    let invoke = Invoke::from_file_segment(&caps[2]).ok_or_else(invalid)?;
    Ok((FilterOrder(order), invoke, caps[3].to_string()))
}

/// Load a single filter file.
pub fn load_file(path: &Path, engine: &SandboxEngine) -> Result<FilterConfig, FilterError> {
    let file = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    let (order, invoke, name) = parse_file_name(&file)?;

    let source = std::fs::read_to_string(path).map_err(|e| FilterError::Io {
        file: file.clone(),
        reason: e.to_string(),
    })?;

    let value = engine
        .evaluate_definition(&name, &source)
        .map_err(|e| FilterError::Definition {
            file: file.clone(),
            reason: e.to_string(),
        })?;
    let definition = value.try_cast::<Map>().ok_or_else(|| FilterError::InvalidField {
        file: file.clone(),
        field: "<definition>".into(),
        expected: "an object map".into(),
    })?;

    let path_pattern = definition
        .get("pathPattern")
        .ok_or_else(|| FilterError::MissingField {
            file: file.clone(),
            field: "pathPattern".into(),
        })?
        .clone()
        .into_string()
        .map_err(|_| FilterError::InvalidField {
            file: file.clone(),
            field: "pathPattern".into(),
            expected: "a string".into(),
        })?;

    let function = definition
        .get("function")
        .ok_or_else(|| FilterError::MissingField {
            file: file.clone(),
            field: "function".into(),
        })?;

    let function_source = if function.is_string() {
        function.clone().into_string().unwrap_or_default()
    } else if function.is::<FnPtr>() {
        source
    } else {
        return Err(FilterError::InvalidField {
            file,
            field: "function".into(),
            expected: "a closure or a string".into(),
        });
    };

    Ok(FilterConfig::new(name, order, path_pattern, invoke).with_function_source(function_source))
}

/// Load every filter in `dir`.
///
/// Files are visited in name order; sub-directories are ignored.  A file
/// that fails to load is logged and skipped.  `Err` only when the directory
/// itself cannot be read.
pub fn load_all(
    dir: impl AsRef<Path>,
    engine: &SandboxEngine,
) -> Result<Vec<FilterConfig>, FilterError> {
    let dir = dir.as_ref();
    let io_error = |e: std::io::Error| FilterError::Io {
        file: dir.display().to_string(),
        reason: e.to_string(),
    };

    let mut entries = std::fs::read_dir(dir)
        .map_err(io_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_error)?;
    entries.sort_by_key(|entry| entry.file_name());

    let mut filters = Vec::new();
    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            debug!(path = %path.display(), "skipping sub-directory in filter dir");
            continue;
        }

        match load_file(&path, engine) {
            Ok(config) => {
                info!(
                    file = %path.display(),
                    filter = %config.name,
                    order = %config.order,
                    phase = %config.invoke,
                    pattern = %config.path_pattern(),
                    "loaded script filter"
                );
                filters.push(config);
            }
            Err(e) => error!(file = %path.display(), error = %e, "skipping script filter"),
        }
    }

    Ok(filters)
}
