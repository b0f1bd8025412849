//! Error types for scripthost.

use thiserror::Error;

/// Common error type for scripthost.
///
/// The first four variants are the guard failures surfaced by the script
/// dispatcher. Callers map them to response codes; they are never retried
/// by this crate.
#[derive(Error, Debug)]
pub enum ScriptHostError {
    /// The script does not match the invoked entry point (or does not
    /// exist). Deliberately indistinguishable from "no such script" so
    /// the API endpoint never reveals scripts of other types.
    #[error("script not found: {0}")]
    NotApplicable(String),

    /// Guest access to a script that does not allow guests.
    #[error("permission denied: {0}")]
    Forbidden(String),

    /// Per-script rate limit exceeded for the current window.
    #[error("rate limit exceeded for script '{name}', retry in {retry_after_secs}s")]
    RateLimited {
        name: String,
        retry_after_secs: u64,
    },

    /// Server scripts are switched off at deployment level. Carries a
    /// remediation message for the caller.
    #[error("server scripts are disabled: {0}")]
    SandboxDisabled(String),

    /// An error raised by the script body itself, propagated verbatim.
    /// Includes failures of outbound HTTP calls made from the script.
    #[error("script error: {0}")]
    Script(String),

    /// Document store lookup miss.
    #[error("{0} not found")]
    NotFound(String),

    /// Database error.
    #[error("database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for ScriptHostError {
    fn from(e: rusqlite::Error) -> Self {
        ScriptHostError::Database(e.to_string())
    }
}

impl From<mlua::Error> for ScriptHostError {
    fn from(e: mlua::Error) -> Self {
        ScriptHostError::Script(e.to_string())
    }
}

/// Result type alias for scripthost operations.
pub type Result<T> = std::result::Result<T, ScriptHostError>;
