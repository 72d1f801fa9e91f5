//! Typed errors for the script sandbox.

use thiserror::Error;

/// Errors raised while loading or running a script filter.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ScriptError {
    /// Script compilation failed.
    #[error("compile error: {0}")]
    Compile(String),

    /// Script execution failed at runtime (including sandbox limits).
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The filter function returned a value that is not a valid result.
    #[error("malformed filter result: {0}")]
    Decode(String),

    /// The script did not evaluate to a callable filter function.
    #[error("script does not evaluate to a filter function")]
    MissingFunction,

    /// A (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The outbound HTTP bridge failed.
    #[error("outbound request failed: {0}")]
    Bridge(String),

    /// An I/O error (e.g. reading a script file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result alias for the script subsystem.
pub type ScriptResult<T> = Result<T, ScriptError>;

impl From<serde_json::Error> for ScriptError {
    fn from(err: serde_json::Error) -> Self {
        ScriptError::Serialization(err.to_string())
    }
}
