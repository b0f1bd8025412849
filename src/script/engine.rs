//! Sandboxed Lua engine for server scripts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mlua::{HookTriggers, Lua, Value, VmState};

use crate::config::SandboxConfig;
use crate::{Result, ScriptHostError};

/// Globals stripped from every interpreter before a script runs.
/// Absence is the enforcement mechanism: the names are simply not there.
const BLOCKED_GLOBALS: &[&str] = &[
    "os",
    "io",
    "load",
    "loadfile",
    "dofile",
    "loadstring",
    "require",
    "package",
    "debug",
    "collectgarbage",
];

/// Resource limits for a single script run.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Maximum number of instructions (0 = unlimited).
    pub max_instructions: u64,
    /// Maximum memory in bytes (0 = unlimited).
    pub max_memory: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_instructions: 1_000_000,
            max_memory: 10 * 1024 * 1024,
        }
    }
}

impl From<&SandboxConfig> for ResourceLimits {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            max_instructions: config.max_instructions,
            max_memory: config.max_memory_mb * 1024 * 1024,
        }
    }
}

/// A hardened Lua interpreter for one script invocation.
///
/// Engines are cheap and single-use: the dispatcher builds a fresh one
/// per run so no interpreter state leaks between invocations.
pub struct SandboxEngine {
    lua: Lua,
    instruction_count: Arc<AtomicU64>,
    limits: ResourceLimits,
}

impl SandboxEngine {
    /// Create an engine with default resource limits.
    pub fn new() -> Result<Self> {
        Self::with_limits(ResourceLimits::default())
    }

    /// Create an engine with the given resource limits.
    pub fn with_limits(limits: ResourceLimits) -> Result<Self> {
        let lua = Lua::new();
        Self::harden(&lua)?;

        if limits.max_memory > 0 {
            lua.set_memory_limit(limits.max_memory)
                .map_err(|e| ScriptHostError::Script(format!("failed to set memory limit: {}", e)))?;
        }

        Ok(Self {
            lua,
            instruction_count: Arc::new(AtomicU64::new(0)),
            limits,
        })
    }

    /// Remove every global granting interpreter escape, filesystem access
    /// or process control.
    fn harden(lua: &Lua) -> Result<()> {
        let globals = lua.globals();
        for name in BLOCKED_GLOBALS {
            globals.set(*name, Value::Nil).map_err(|e| {
                ScriptHostError::Script(format!("failed to remove global '{}': {}", name, e))
            })?;
        }
        Ok(())
    }

    /// Execute Lua source to completion or failure.
    ///
    /// Errors raised by the script body surface verbatim as
    /// `ScriptHostError::Script`.
    pub fn execute(&self, source: &str) -> Result<()> {
        self.instruction_count.store(0, Ordering::SeqCst);

        if self.limits.max_instructions > 0 {
            let count = Arc::clone(&self.instruction_count);
            let limit = self.limits.max_instructions;

            self.lua.set_hook(
                HookTriggers::new().every_nth_instruction(1000),
                move |_lua, _debug| {
                    let current = count.fetch_add(1000, Ordering::SeqCst) + 1000;
                    if current > limit {
                        Err(mlua::Error::RuntimeError(
                            "script exceeded instruction limit".to_string(),
                        ))
                    } else {
                        Ok(VmState::Continue)
                    }
                },
            );
        }

        let result = self.lua.load(source).exec();
        self.lua.remove_hook();

        result.map_err(|e| ScriptHostError::Script(e.to_string()))
    }

    /// Set a global value in the interpreter.
    pub fn set_global<V: mlua::IntoLua>(&self, name: &str, value: V) -> Result<()> {
        self.lua
            .globals()
            .set(name, value)
            .map_err(|e| ScriptHostError::Script(format!("failed to set global '{}': {}", name, e)))
    }

    /// Get a global value from the interpreter.
    pub fn get_global<V: mlua::FromLua>(&self, name: &str) -> Result<V> {
        self.lua
            .globals()
            .get(name)
            .map_err(|e| ScriptHostError::Script(format!("failed to get global '{}': {}", name, e)))
    }

    /// Instructions consumed by the last run.
    pub fn instruction_count(&self) -> u64 {
        self.instruction_count.load(Ordering::SeqCst)
    }

    /// Access the underlying interpreter, for namespace registration.
    pub fn lua(&self) -> &Lua {
        &self.lua
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_execution() {
        let engine = SandboxEngine::new().unwrap();
        engine.execute("x = 1 + 2").unwrap();
        assert_eq!(engine.get_global::<i32>("x").unwrap(), 3);
    }

    #[test]
    fn test_stdlib_available() {
        let engine = SandboxEngine::new().unwrap();
        engine.execute(r#"s = string.upper("hello")"#).unwrap();
        assert_eq!(engine.get_global::<String>("s").unwrap(), "HELLO");

        engine.execute("n = math.floor(3.7)").unwrap();
        assert_eq!(engine.get_global::<i32>("n").unwrap(), 3);
    }

    #[test]
    fn test_blocked_globals_are_nil() {
        let engine = SandboxEngine::new().unwrap();
        for name in BLOCKED_GLOBALS {
            engine
                .execute(&format!("is_nil = ({} == nil)", name))
                .unwrap();
            assert!(
                engine.get_global::<bool>("is_nil").unwrap(),
                "{} should be nil",
                name
            );
        }
    }

    #[test]
    fn test_os_execute_fails() {
        let engine = SandboxEngine::new().unwrap();
        assert!(engine.execute("os.execute('ls')").is_err());
    }

    #[test]
    fn test_io_open_fails() {
        let engine = SandboxEngine::new().unwrap();
        assert!(engine.execute("io.open('/etc/passwd', 'r')").is_err());
    }

    #[test]
    fn test_require_fails() {
        let engine = SandboxEngine::new().unwrap();
        assert!(engine.execute("require('os')").is_err());
    }

    #[test]
    fn test_instruction_limit() {
        let limits = ResourceLimits {
            max_instructions: 1000,
            max_memory: 0,
        };
        let engine = SandboxEngine::with_limits(limits).unwrap();

        let result = engine.execute("while true do end");
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("instruction limit"));
    }

    #[test]
    fn test_memory_limit() {
        let limits = ResourceLimits {
            max_instructions: 0,
            max_memory: 100 * 1024,
        };
        let engine = SandboxEngine::with_limits(limits).unwrap();

        let result = engine.execute(
            r#"
            t = {}
            for i = 1, 100000 do
                t[i] = string.rep("x", 1000)
            end
        "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_runtime_error_propagates_verbatim() {
        let engine = SandboxEngine::new().unwrap();
        let err = engine.execute("error('boom from script')").unwrap_err();
        assert!(matches!(err, ScriptHostError::Script(_)));
        assert!(err.to_string().contains("boom from script"));
    }

    #[test]
    fn test_syntax_error() {
        let engine = SandboxEngine::new().unwrap();
        assert!(engine.execute("this is not valid lua").is_err());
    }

    #[test]
    fn test_set_and_get_global() {
        let engine = SandboxEngine::new().unwrap();
        engine.set_global("answer", 42).unwrap();
        engine.execute("doubled = answer * 2").unwrap();
        assert_eq!(engine.get_global::<i32>("doubled").unwrap(), 84);
    }

    #[test]
    fn test_limits_from_config() {
        let config = SandboxConfig {
            enabled: true,
            max_instructions: 5000,
            max_memory_mb: 2,
        };
        let limits = ResourceLimits::from(&config);
        assert_eq!(limits.max_instructions, 5000);
        assert_eq!(limits.max_memory, 2 * 1024 * 1024);
    }
}
