//! Server script module.
//!
//! Stores admin-authored Lua scripts and runs them inside a sandboxed
//! interpreter whose namespace is a closed set of capability groups.
//! The dispatcher routes each script through its type-specific entry
//! point with the access rule appropriate to that mode.

pub mod dispatch;
pub mod engine;
pub mod http;
pub mod namespace;
pub mod repository;
pub mod types;

pub use dispatch::ScriptDispatcher;
pub use engine::{ResourceLimits, SandboxEngine};
pub use namespace::NamespaceBuilder;
pub use repository::ScriptRepository;
pub use types::{ExecutionContext, ScriptRecord, ScriptType, GUEST_USER};
