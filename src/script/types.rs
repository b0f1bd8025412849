//! Script record types and execution context.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default rate limit when the record carries a zero/unset count.
pub const DEFAULT_RATE_LIMIT_COUNT: u32 = 5;
/// Default rate limit window when the record carries zero/unset seconds.
pub const DEFAULT_RATE_LIMIT_SECONDS: u64 = 24 * 60 * 60;

/// The anonymous caller identity.
pub const GUEST_USER: &str = "Guest";

/// The declared type of a server script.
///
/// Each type has exactly one dispatcher entry point; invoking a script
/// through the wrong entry point fails with `NotApplicable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptType {
    #[serde(rename = "API")]
    Api,
    #[serde(rename = "Document Event")]
    DocumentEvent,
    #[serde(rename = "Scheduler Event")]
    SchedulerEvent,
    #[serde(rename = "Permission Query")]
    PermissionQuery,
}

impl ScriptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptType::Api => "API",
            ScriptType::DocumentEvent => "Document Event",
            ScriptType::SchedulerEvent => "Scheduler Event",
            ScriptType::PermissionQuery => "Permission Query",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "API" => Some(ScriptType::Api),
            "Document Event" => Some(ScriptType::DocumentEvent),
            "Scheduler Event" => Some(ScriptType::SchedulerEvent),
            "Permission Query" => Some(ScriptType::PermissionQuery),
            _ => None,
        }
    }
}

impl std::fmt::Display for ScriptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored server script. Created and edited by administrators; the
/// dispatcher treats it as read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptRecord {
    /// Unique identifying name, also the rate limiter key.
    pub name: String,
    /// Lua source of the script body.
    pub script: String,
    /// Declared type, selects the dispatcher entry point.
    pub script_type: ScriptType,
    /// Whether the anonymous Guest identity may call this API script.
    #[serde(default)]
    pub allow_guest: bool,
    /// Whether API calls are rate limited.
    #[serde(default)]
    pub enable_rate_limit: bool,
    /// Calls allowed per window; 0 falls back to the default of 5.
    #[serde(default)]
    pub rate_limit_count: u32,
    /// Window length in seconds; 0 falls back to the default of 86400.
    #[serde(default)]
    pub rate_limit_seconds: u64,
    /// Disabled scripts are never executed.
    #[serde(default)]
    pub disabled: bool,
}

impl ScriptRecord {
    pub fn new(name: impl Into<String>, script_type: ScriptType, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            script_type,
            allow_guest: false,
            enable_rate_limit: false,
            rate_limit_count: 0,
            rate_limit_seconds: 0,
            disabled: false,
        }
    }

    /// Effective rate limit, applying the falsy-means-default convention
    /// for both the count and the window.
    pub fn rate_limit(&self) -> (u32, Duration) {
        let count = if self.rate_limit_count == 0 {
            DEFAULT_RATE_LIMIT_COUNT
        } else {
            self.rate_limit_count
        };
        let seconds = if self.rate_limit_seconds == 0 {
            DEFAULT_RATE_LIMIT_SECONDS
        } else {
            self.rate_limit_seconds
        };
        (count, Duration::from_secs(seconds))
    }
}

/// Per-invocation caller context, threaded explicitly into every
/// dispatcher entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Caller identity; `"Guest"` for anonymous callers.
    pub user: String,
    /// CSRF token of the caller's session, exposed read-only to scripts.
    #[serde(default)]
    pub csrf_token: String,
    /// Caller locale.
    #[serde(default = "default_lang")]
    pub lang: String,
    /// Request form parameters.
    #[serde(default)]
    pub form_args: HashMap<String, String>,
}

fn default_lang() -> String {
    "en".to_string()
}

impl ExecutionContext {
    /// Context for an authenticated user.
    pub fn for_user(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..Default::default()
        }
    }

    pub fn is_guest(&self) -> bool {
        self.user == GUEST_USER
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            user: GUEST_USER.to_string(),
            csrf_token: String::new(),
            lang: default_lang(),
            form_args: HashMap::new(),
        }
    }
}
