//! scripthost - Server Script Service
//!
//! Stores admin-authored Lua scripts (API endpoints, document event
//! hooks, scheduled jobs, permission query filters) and runs them inside
//! a sandboxed interpreter with a closed capability namespace: document
//! store access, outbound HTTP, base64 helpers, formatting utilities and
//! session info.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod rate_limit;
pub mod script;
pub mod store;
pub mod web;

pub use config::Config;
pub use db::Database;
pub use error::{Result, ScriptHostError};
pub use rate_limit::{RateLimitResult, ScriptRateLimiter};
pub use script::{
    ExecutionContext, ScriptDispatcher, ScriptRecord, ScriptRepository, ScriptType, GUEST_USER,
};
pub use store::{Document, DocumentStore, MemoryStore};
