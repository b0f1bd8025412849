//! Script dispatcher.
//!
//! One entry point per script type; the declared type on the record
//! selects the only entry point allowed to run it, and mismatches fail
//! with a not-found-class error rather than coercing. Each entry point
//! is a single-shot guarded call: guard failures are fatal for the
//! invocation and never retried, and errors raised by the script body
//! propagate to the caller unchanged.

use std::sync::Arc;

use mlua::Table;
use serde_json::Map;
use tracing::{debug, warn};

use super::engine::{ResourceLimits, SandboxEngine};
use super::namespace::{self, NamespaceBuilder};
use super::types::{ExecutionContext, ScriptRecord, ScriptType};
use crate::cache::ComputedCache;
use crate::config::SandboxConfig;
use crate::rate_limit::{RateLimitResult, ScriptRateLimiter};
use crate::store::{Document, DocumentStore};
use crate::{Result, ScriptHostError};

const DISABLED_MESSAGE: &str =
    "Server scripts are disabled. Set sandbox.enabled = true in the service configuration to run them.";

/// Dispatches stored scripts to their type-specific execution mode.
pub struct ScriptDispatcher {
    store: Arc<dyn DocumentStore>,
    limiter: ScriptRateLimiter,
    autocomplete: ComputedCache<Vec<String>>,
    sandbox: SandboxConfig,
}

impl ScriptDispatcher {
    pub fn new(store: Arc<dyn DocumentStore>, sandbox: SandboxConfig) -> Self {
        Self {
            store,
            limiter: ScriptRateLimiter::new(),
            autocomplete: ComputedCache::new(),
            sandbox,
        }
    }

    /// Run a document event script against a subject document.
    ///
    /// The script sees the document as `doc` and may mutate it; changes
    /// are written back into `doc` for the caller's own transaction
    /// boundary. The namespace is built without commit/rollback/index
    /// names, so the script cannot end the enclosing transaction itself.
    pub fn execute_doc(
        &self,
        script: &ScriptRecord,
        doc: &mut Document,
        ctx: ExecutionContext,
    ) -> Result<()> {
        self.ensure_runnable(script, ScriptType::DocumentEvent)?;

        let engine = self.build_engine()?;
        NamespaceBuilder::new(Arc::clone(&self.store), ctx)
            .with_restricted_transactions()
            .register(engine.lua())?;
        engine.set_global("doc", namespace::document_to_table(engine.lua(), doc)?)?;

        debug!(script = %script.name, doc = %doc.name, "running document event script");
        engine.execute(&script.script)?;

        let table: Table = engine.get_global("doc")?;
        doc.fields = namespace::table_into_fields(engine.lua(), &table)?;
        Ok(())
    }

    /// Run an API script and return the flags it set.
    ///
    /// Guards, in order: script type, guest access, rate limit. The rate
    /// limit is keyed by script name and checked before the body runs.
    pub fn execute_method(
        &self,
        script: &ScriptRecord,
        ctx: ExecutionContext,
    ) -> Result<Map<String, serde_json::Value>> {
        self.ensure_runnable(script, ScriptType::Api)?;

        if ctx.is_guest() && !script.allow_guest {
            return Err(ScriptHostError::Forbidden(format!(
                "script '{}' does not allow guest access",
                script.name
            )));
        }

        if script.enable_rate_limit {
            let (max_calls, window) = script.rate_limit();
            if let RateLimitResult::Denied { retry_after } =
                self.limiter.check_and_record(&script.name, max_calls, window)
            {
                warn!(script = %script.name, "rate limit exceeded");
                return Err(ScriptHostError::RateLimited {
                    name: script.name.clone(),
                    retry_after_secs: retry_after.as_secs(),
                });
            }
        }

        let engine = self.build_engine()?;
        NamespaceBuilder::new(Arc::clone(&self.store), ctx).register(engine.lua())?;

        debug!(script = %script.name, "running API script");
        engine.execute(&script.script)?;

        let flags: Table = engine.get_global("flags")?;
        Ok(namespace::table_to_json_map(engine.lua(), &flags)?)
    }

    /// Run a scheduler event script. Fire and forget: no bound locals,
    /// nothing returned.
    pub fn execute_scheduled_method(&self, script: &ScriptRecord) -> Result<()> {
        self.ensure_runnable(script, ScriptType::SchedulerEvent)?;

        let engine = self.build_engine()?;
        NamespaceBuilder::new(Arc::clone(&self.store), ExecutionContext::default())
            .register(engine.lua())?;

        debug!(script = %script.name, "running scheduled script");
        engine.execute(&script.script)
    }

    /// Run a permission query script for a user and collect the
    /// conditions it produced.
    ///
    /// Returns `None` when the script leaves `conditions` empty or
    /// unset; the caller treats that as "no row filtering". A falsy
    /// result is a fallback, not an explicit empty filter.
    pub fn get_permission_query_conditions(
        &self,
        script: &ScriptRecord,
        user: &str,
    ) -> Result<Option<Vec<String>>> {
        self.ensure_runnable(script, ScriptType::PermissionQuery)?;

        let engine = self.build_engine()?;
        NamespaceBuilder::new(Arc::clone(&self.store), ExecutionContext::for_user(user))
            .register(engine.lua())?;
        engine.set_global("user", user)?;
        engine.set_global("conditions", "")?;

        debug!(script = %script.name, user = %user, "running permission query script");
        engine.execute(&script.script)?;

        let conditions: mlua::Value = engine.get_global("conditions")?;
        match conditions {
            mlua::Value::Table(table) => {
                let list = table
                    .sequence_values::<String>()
                    .collect::<mlua::Result<Vec<_>>>()
                    .map_err(ScriptHostError::from)?;
                Ok(if list.is_empty() { None } else { Some(list) })
            }
            mlua::Value::String(s) => {
                let s = s.to_str().map_err(ScriptHostError::from)?.to_string();
                Ok(if s.is_empty() { None } else { Some(vec![s]) })
            }
            _ => Ok(None),
        }
    }

    /// Flattened dotted names of the generic namespace, for editor
    /// autocompletion. Computed once per process generation; the shape
    /// only changes on deployment.
    pub fn get_autocompletion_items(&self) -> Result<Arc<Vec<String>>> {
        let store = Arc::clone(&self.store);
        let limits = ResourceLimits::from(&self.sandbox);
        self.autocomplete.get_or_try_compute(|| {
            let engine = SandboxEngine::with_limits(limits)?;
            NamespaceBuilder::new(store, ExecutionContext::default()).register(engine.lua())?;
            Ok(namespace::autocomplete_names(engine.lua())?)
        })
    }

    /// Invalidate the autocompletion cache.
    pub fn clear_autocomplete_cache(&self) {
        self.autocomplete.clear();
    }

    fn ensure_runnable(&self, script: &ScriptRecord, expected: ScriptType) -> Result<()> {
        if !self.sandbox.enabled {
            return Err(ScriptHostError::SandboxDisabled(
                DISABLED_MESSAGE.to_string(),
            ));
        }
        // Disabled or mismatched scripts are equally "not found" so the
        // entry point reveals nothing about other script types
        if script.disabled || script.script_type != expected {
            return Err(ScriptHostError::NotApplicable(script.name.clone()));
        }
        Ok(())
    }

    fn build_engine(&self) -> Result<SandboxEngine> {
        SandboxEngine::with_limits(ResourceLimits::from(&self.sandbox))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn dispatcher() -> (ScriptDispatcher, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = ScriptDispatcher::new(
            Arc::clone(&store) as Arc<dyn DocumentStore>,
            SandboxConfig::default(),
        );
        (dispatcher, store)
    }

    fn disabled_dispatcher() -> ScriptDispatcher {
        let store = Arc::new(MemoryStore::new());
        let sandbox = SandboxConfig {
            enabled: false,
            ..Default::default()
        };
        ScriptDispatcher::new(store, sandbox)
    }

    #[test]
    fn test_execute_method_returns_flags() {
        let (dispatcher, _) = dispatcher();
        let script = ScriptRecord::new("calc", ScriptType::Api, "flags.output = 2 + 2");

        let flags = dispatcher
            .execute_method(&script, ExecutionContext::for_user("alice"))
            .unwrap();
        assert_eq!(flags.get("output"), Some(&json!(4)));
    }

    #[test]
    fn test_execute_method_empty_flags() {
        let (dispatcher, _) = dispatcher();
        let script = ScriptRecord::new("noop", ScriptType::Api, "local x = 1");

        let flags = dispatcher
            .execute_method(&script, ExecutionContext::for_user("alice"))
            .unwrap();
        assert!(flags.is_empty());
    }

    #[test]
    fn test_execute_method_wrong_type_is_not_applicable() {
        let (dispatcher, _) = dispatcher();
        for script_type in [
            ScriptType::DocumentEvent,
            ScriptType::SchedulerEvent,
            ScriptType::PermissionQuery,
        ] {
            let mut script = ScriptRecord::new("hook", script_type, "flags.ran = true");
            // Other fields must not matter
            script.allow_guest = true;
            let err = dispatcher
                .execute_method(&script, ExecutionContext::for_user("alice"))
                .unwrap_err();
            assert!(matches!(err, ScriptHostError::NotApplicable(_)));
        }
    }

    #[test]
    fn test_execute_method_guest_forbidden_before_body_runs() {
        let (dispatcher, store) = dispatcher();
        // Side-effecting probe: would create a document if it ran
        let script = ScriptRecord::new(
            "probe",
            ScriptType::Api,
            r#"docs.new_doc("Probe", "P-1", {})"#,
        );

        let err = dispatcher
            .execute_method(&script, ExecutionContext::default())
            .unwrap_err();
        assert!(matches!(err, ScriptHostError::Forbidden(_)));
        assert!(!store.exists("Probe", "P-1").unwrap());
    }

    #[test]
    fn test_execute_method_guest_allowed_when_flagged() {
        let (dispatcher, _) = dispatcher();
        let mut script = ScriptRecord::new("open", ScriptType::Api, "flags.ok = true");
        script.allow_guest = true;

        let flags = dispatcher
            .execute_method(&script, ExecutionContext::default())
            .unwrap();
        assert_eq!(flags.get("ok"), Some(&json!(true)));
    }

    #[test]
    fn test_rate_limit_blocks_fourth_call() {
        let (dispatcher, store) = dispatcher();
        let mut script = ScriptRecord::new(
            "limited",
            ScriptType::Api,
            r#"
                local n = db.get_value("Counter", "C", "n")
                if db.exists("Counter", "C") then
                    db.set_value("Counter", "C", "n", n + 1)
                else
                    docs.new_doc("Counter", "C", { n = 1 })
                end
                flags.done = true
            "#,
        );
        script.enable_rate_limit = true;
        script.rate_limit_count = 3;
        script.rate_limit_seconds = 60;

        let ctx = || ExecutionContext::for_user("alice");
        for _ in 0..3 {
            dispatcher.execute_method(&script, ctx()).unwrap();
        }

        let err = dispatcher.execute_method(&script, ctx()).unwrap_err();
        assert!(matches!(err, ScriptHostError::RateLimited { .. }));
        // The body did not run a fourth time
        assert_eq!(
            store.get_value("Counter", "C", "n").unwrap(),
            Some(json!(3))
        );
    }

    #[test]
    fn test_rate_limit_window_resets() {
        let (dispatcher, _) = dispatcher();
        let mut script = ScriptRecord::new("short", ScriptType::Api, "flags.ok = true");
        script.enable_rate_limit = true;
        script.rate_limit_count = 1;
        script.rate_limit_seconds = 1;

        dispatcher
            .execute_method(&script, ExecutionContext::for_user("alice"))
            .unwrap();
        assert!(dispatcher
            .execute_method(&script, ExecutionContext::for_user("alice"))
            .is_err());

        std::thread::sleep(std::time::Duration::from_millis(1100));
        dispatcher
            .execute_method(&script, ExecutionContext::for_user("alice"))
            .unwrap();
    }

    #[test]
    fn test_rate_limit_disabled_means_unlimited() {
        let (dispatcher, _) = dispatcher();
        let script = ScriptRecord::new("free", ScriptType::Api, "flags.ok = true");
        for _ in 0..10 {
            dispatcher
                .execute_method(&script, ExecutionContext::for_user("alice"))
                .unwrap();
        }
    }

    #[test]
    fn test_script_error_propagates() {
        let (dispatcher, _) = dispatcher();
        let script = ScriptRecord::new("broken", ScriptType::Api, "error('kaput')");

        let err = dispatcher
            .execute_method(&script, ExecutionContext::for_user("alice"))
            .unwrap_err();
        assert!(matches!(err, ScriptHostError::Script(_)));
        assert!(err.to_string().contains("kaput"));
    }

    #[test]
    fn test_execute_doc_mutates_document() {
        let (dispatcher, _) = dispatcher();
        let script = ScriptRecord::new(
            "on-update",
            ScriptType::DocumentEvent,
            r#"doc.status = "Processed""#,
        );

        let mut doc = Document::new("ToDo", "TODO-0001");
        doc.set("status", json!("Open"));

        dispatcher
            .execute_doc(&script, &mut doc, ExecutionContext::for_user("alice"))
            .unwrap();
        assert_eq!(doc.get("status"), Some(&json!("Processed")));
    }

    #[test]
    fn test_execute_doc_cannot_commit() {
        let (dispatcher, store) = dispatcher();
        let script = ScriptRecord::new("sneaky", ScriptType::DocumentEvent, "db.commit()");

        let mut doc = Document::new("ToDo", "TODO-0001");
        let err = dispatcher
            .execute_doc(&script, &mut doc, ExecutionContext::for_user("alice"))
            .unwrap_err();
        // Name absence: calling a nil value, not a permission failure
        assert!(matches!(err, ScriptHostError::Script(_)));
        assert!(err.to_string().contains("nil"));
        assert_eq!(store.commit_count(), 0);
    }

    #[test]
    fn test_execute_doc_wrong_type() {
        let (dispatcher, _) = dispatcher();
        let script = ScriptRecord::new("api-script", ScriptType::Api, "");
        let mut doc = Document::new("ToDo", "T-1");
        let err = dispatcher
            .execute_doc(&script, &mut doc, ExecutionContext::default())
            .unwrap_err();
        assert!(matches!(err, ScriptHostError::NotApplicable(_)));
    }

    #[test]
    fn test_scheduled_method_runs_and_discards() {
        let (dispatcher, store) = dispatcher();
        let script = ScriptRecord::new(
            "nightly",
            ScriptType::SchedulerEvent,
            r#"docs.new_doc("Log", "L-1", { ran = true })"#,
        );

        dispatcher.execute_scheduled_method(&script).unwrap();
        assert!(store.exists("Log", "L-1").unwrap());
    }

    #[test]
    fn test_scheduled_method_wrong_type() {
        let (dispatcher, _) = dispatcher();
        let script = ScriptRecord::new("not-scheduled", ScriptType::Api, "");
        let err = dispatcher.execute_scheduled_method(&script).unwrap_err();
        assert!(matches!(err, ScriptHostError::NotApplicable(_)));
    }

    #[test]
    fn test_permission_query_returns_conditions() {
        let (dispatcher, _) = dispatcher();
        let script = ScriptRecord::new(
            "row-filter",
            ScriptType::PermissionQuery,
            r#"conditions = { "1=1" }"#,
        );

        let result = dispatcher
            .get_permission_query_conditions(&script, "alice@example.com")
            .unwrap();
        assert_eq!(result, Some(vec!["1=1".to_string()]));
    }

    #[test]
    fn test_permission_query_uses_bound_user() {
        let (dispatcher, _) = dispatcher();
        let script = ScriptRecord::new(
            "owner-filter",
            ScriptType::PermissionQuery,
            r#"conditions = { "owner = " .. db.escape(user) }"#,
        );

        let result = dispatcher
            .get_permission_query_conditions(&script, "alice@example.com")
            .unwrap();
        assert_eq!(
            result,
            Some(vec!["owner = 'alice@example.com'".to_string()])
        );
    }

    #[test]
    fn test_permission_query_unset_is_none() {
        let (dispatcher, _) = dispatcher();
        let script =
            ScriptRecord::new("no-filter", ScriptType::PermissionQuery, "local x = user");

        let result = dispatcher
            .get_permission_query_conditions(&script, "alice@example.com")
            .unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_permission_query_empty_table_is_none() {
        let (dispatcher, _) = dispatcher();
        let script =
            ScriptRecord::new("empty-filter", ScriptType::PermissionQuery, "conditions = {}");

        let result = dispatcher
            .get_permission_query_conditions(&script, "alice@example.com")
            .unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_autocomplete_cached_and_deterministic() {
        let (dispatcher, _) = dispatcher();
        let first = dispatcher.get_autocompletion_items().unwrap();
        let second = dispatcher.get_autocompletion_items().unwrap();

        assert!(!first.is_empty());
        assert!(first.iter().any(|n| n.starts_with("utils.")));
        // Identical allocation within one cache generation
        assert!(Arc::ptr_eq(&first, &second));

        dispatcher.clear_autocomplete_cache();
        let third = dispatcher.get_autocompletion_items().unwrap();
        assert_eq!(*first, *third);
    }

    #[test]
    fn test_sandbox_disabled_blocks_everything() {
        let dispatcher = disabled_dispatcher();
        let script = ScriptRecord::new("ping", ScriptType::Api, "flags.ok = true");

        let err = dispatcher
            .execute_method(&script, ExecutionContext::for_user("alice"))
            .unwrap_err();
        match err {
            ScriptHostError::SandboxDisabled(msg) => {
                assert!(msg.contains("sandbox.enabled"));
            }
            other => panic!("expected SandboxDisabled, got {:?}", other),
        }

        let script = ScriptRecord::new("job", ScriptType::SchedulerEvent, "");
        assert!(matches!(
            dispatcher.execute_scheduled_method(&script).unwrap_err(),
            ScriptHostError::SandboxDisabled(_)
        ));
    }

    #[test]
    fn test_disabled_script_is_not_found() {
        let (dispatcher, _) = dispatcher();
        let mut script = ScriptRecord::new("off", ScriptType::Api, "flags.ok = true");
        script.disabled = true;

        let err = dispatcher
            .execute_method(&script, ExecutionContext::for_user("alice"))
            .unwrap_err();
        assert!(matches!(err, ScriptHostError::NotApplicable(_)));
    }

    #[test]
    fn test_concurrent_invocations_independent() {
        let (dispatcher, _) = dispatcher();
        let dispatcher = Arc::new(dispatcher);
        let script = ScriptRecord::new("par", ScriptType::Api, "flags.output = 21 * 2");

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let dispatcher = Arc::clone(&dispatcher);
                let script = script.clone();
                std::thread::spawn(move || {
                    dispatcher
                        .execute_method(&script, ExecutionContext::for_user("alice"))
                        .unwrap()
                })
            })
            .collect();

        for handle in handles {
            let flags = handle.join().unwrap();
            assert_eq!(flags.get("output"), Some(&json!(42)));
        }
    }
}
