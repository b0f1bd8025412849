//! Sandbox namespace builder.
//!
//! Builds the set of names a script body may reference, as a closed
//! enumeration of capability groups registered one by one. Nothing else
//! is reachable: a capability absent from the groups is simply not a
//! name in the interpreter. Rebuilt per invocation so the session and
//! request context it captures is always current.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use mlua::{Lua, LuaSerdeExt, Result as LuaResult, Table, Value};
use serde_json::Map;

use super::http;
use super::types::ExecutionContext;
use crate::store::{Document, DocumentStore};

/// Capability-group names registered at the interpreter top level.
const GROUPS: &[&str] = &["utils", "db", "docs", "http", "session", "args", "flags"];

/// Top-level function names outside any group.
const TOP_LEVEL_FNS: &[&str] = &[
    "encode_base64",
    "decode_base64",
    "msgprint",
    "log",
    "log_error",
];

/// Builder for the allowed-names mapping of one script invocation.
pub struct NamespaceBuilder {
    store: Arc<dyn DocumentStore>,
    ctx: ExecutionContext,
    restrict_commit_rollback: bool,
    messages: Rc<RefCell<Vec<String>>>,
}

impl NamespaceBuilder {
    pub fn new(store: Arc<dyn DocumentStore>, ctx: ExecutionContext) -> Self {
        Self {
            store,
            ctx,
            restrict_commit_rollback: false,
            messages: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Leave the transaction-boundary names (`db.commit`, `db.rollback`,
    /// `db.add_index`) out of the namespace. Used for document event
    /// scripts, which may only stage changes for the caller's own
    /// transaction.
    pub fn with_restricted_transactions(mut self) -> Self {
        self.restrict_commit_rollback = true;
        self
    }

    /// Handle to the `msgprint` output buffer; clone before `register`.
    pub fn messages(&self) -> Rc<RefCell<Vec<String>>> {
        Rc::clone(&self.messages)
    }

    /// Register every capability group on the interpreter.
    pub fn register(&self, lua: &Lua) -> LuaResult<()> {
        self.register_utils(lua)?;
        self.register_db(lua)?;
        self.register_docs(lua)?;
        http::register(lua, &lua.globals())?;
        self.register_base64(lua)?;
        self.register_session(lua)?;
        self.register_messaging(lua)?;

        // Output bucket the script writes results into
        lua.globals().set("flags", lua.create_table()?)?;

        Ok(())
    }

    /// Read-only formatting and data utilities.
    fn register_utils(&self, lua: &Lua) -> LuaResult<()> {
        let utils = lua.create_table()?;

        let now_fn = lua.create_function(|_, ()| {
            Ok(chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string())
        })?;
        utils.set("now", now_fn)?;

        let today_fn =
            lua.create_function(|_, ()| Ok(chrono::Local::now().format("%Y-%m-%d").to_string()))?;
        utils.set("today", today_fn)?;

        // "2024-03-07" -> "March 7, 2024"
        let format_date_fn = lua.create_function(|_, date: String| {
            let parsed = chrono::NaiveDate::parse_from_str(&date, "%Y-%m-%d")
                .map_err(mlua::Error::external)?;
            Ok(parsed.format("%B %-d, %Y").to_string())
        })?;
        utils.set("format_date", format_date_fn)?;

        let as_json_fn = lua.create_function(|lua, value: Value| {
            let json: serde_json::Value = lua.from_value(value)?;
            serde_json::to_string(&json).map_err(mlua::Error::external)
        })?;
        utils.set("as_json", as_json_fn)?;

        let parse_json_fn = lua.create_function(|lua, text: String| {
            let json: serde_json::Value =
                serde_json::from_str(&text).map_err(mlua::Error::external)?;
            lua.to_value(&json)
        })?;
        utils.set("parse_json", parse_json_fn)?;

        let format_value_fn =
            lua.create_function(|_, value: Value| Ok(value_to_display(&value)))?;
        utils.set("format_value", format_value_fn)?;

        let strip_html_fn = lua.create_function(|_, text: String| Ok(strip_html(&text)))?;
        utils.set("strip_html", strip_html_fn)?;

        let escape_html_fn = lua.create_function(|_, text: String| Ok(escape_html(&text)))?;
        utils.set("escape_html", escape_html_fn)?;

        let render_template_fn = lua.create_function(|_, (template, vars): (String, Table)| {
            let mut pairs = Vec::new();
            for pair in vars.pairs::<String, Value>() {
                let (key, value) = pair?;
                pairs.push((key, value_to_display(&value)));
            }
            Ok(render_template(&template, &pairs))
        })?;
        utils.set("render_template", render_template_fn)?;

        lua.globals().set("utils", utils)
    }

    /// Restricted database access: whitelisted value helpers plus, when
    /// not restricted, the transaction-boundary names.
    fn register_db(&self, lua: &Lua) -> LuaResult<()> {
        let db = lua.create_table()?;

        let store = Arc::clone(&self.store);
        let get_value_fn = lua.create_function(
            move |lua, (doctype, name, field): (String, String, String)| {
                let value = store
                    .get_value(&doctype, &name, &field)
                    .map_err(mlua::Error::external)?;
                match value {
                    Some(v) => lua.to_value(&v),
                    None => Ok(Value::Nil),
                }
            },
        )?;
        db.set("get_value", get_value_fn)?;

        let store = Arc::clone(&self.store);
        let set_value_fn = lua.create_function(
            move |lua, (doctype, name, field, value): (String, String, String, Value)| {
                let json: serde_json::Value = lua.from_value(value)?;
                store
                    .set_value(&doctype, &name, &field, json)
                    .map_err(mlua::Error::external)
            },
        )?;
        db.set("set_value", set_value_fn)?;

        let store = Arc::clone(&self.store);
        let exists_fn = lua.create_function(move |_, (doctype, name): (String, String)| {
            store.exists(&doctype, &name).map_err(mlua::Error::external)
        })?;
        db.set("exists", exists_fn)?;

        let store = Arc::clone(&self.store);
        let count_fn = lua.create_function(move |_, doctype: String| {
            store.count(&doctype).map_err(mlua::Error::external)
        })?;
        db.set("count", count_fn)?;

        // Singleton lookup: a settings-style doctype stores one record
        // named after the doctype itself
        let store = Arc::clone(&self.store);
        let get_single_value_fn =
            lua.create_function(move |lua, (doctype, field): (String, String)| {
                let value = store
                    .get_value(&doctype, &doctype, &field)
                    .map_err(mlua::Error::external)?;
                match value {
                    Some(v) => lua.to_value(&v),
                    None => Ok(Value::Nil),
                }
            })?;
        db.set("get_single_value", get_single_value_fn)?;

        let escape_fn =
            lua.create_function(|_, text: String| Ok(format!("'{}'", text.replace('\'', "''"))))?;
        db.set("escape", escape_fn)?;

        // Removal, not hiding: for document event scripts these names are
        // never registered, so invoking them is a nil-call error.
        if !self.restrict_commit_rollback {
            let store = Arc::clone(&self.store);
            let commit_fn =
                lua.create_function(move |_, ()| store.commit().map_err(mlua::Error::external))?;
            db.set("commit", commit_fn)?;

            let store = Arc::clone(&self.store);
            let rollback_fn =
                lua.create_function(move |_, ()| store.rollback().map_err(mlua::Error::external))?;
            db.set("rollback", rollback_fn)?;

            let store = Arc::clone(&self.store);
            let add_index_fn =
                lua.create_function(move |_, (doctype, fields): (String, Vec<String>)| {
                    store
                        .add_index(&doctype, &fields)
                        .map_err(mlua::Error::external)
                })?;
            db.set("add_index", add_index_fn)?;
        }

        lua.globals().set("db", db)
    }

    /// Document CRUD helpers.
    fn register_docs(&self, lua: &Lua) -> LuaResult<()> {
        let docs = lua.create_table()?;

        let store = Arc::clone(&self.store);
        let get_doc_fn = lua.create_function(move |lua, (doctype, name): (String, String)| {
            let doc = store
                .get_doc(&doctype, &name)
                .map_err(mlua::Error::external)?;
            document_to_table(lua, &doc)
        })?;
        docs.set("get_doc", get_doc_fn)?;

        let store = Arc::clone(&self.store);
        let new_doc_fn = lua.create_function(
            move |lua, (doctype, name, fields): (String, String, Option<Table>)| {
                let mut doc = Document::new(doctype, name);
                if let Some(fields) = fields {
                    doc.fields = table_into_fields(lua, &fields)?;
                }
                store.insert(doc.clone()).map_err(mlua::Error::external)?;
                document_to_table(lua, &doc)
            },
        )?;
        docs.set("new_doc", new_doc_fn)?;

        let store = Arc::clone(&self.store);
        let copy_doc_fn = lua.create_function(
            move |lua, (doctype, name, new_name): (String, String, String)| {
                let mut doc = store
                    .get_doc(&doctype, &name)
                    .map_err(mlua::Error::external)?;
                doc.name = new_name;
                store.insert(doc.clone()).map_err(mlua::Error::external)?;
                document_to_table(lua, &doc)
            },
        )?;
        docs.set("copy_doc", copy_doc_fn)?;

        let store = Arc::clone(&self.store);
        let rename_doc_fn = lua.create_function(
            move |_, (doctype, old_name, new_name): (String, String, String)| {
                store
                    .rename_doc(&doctype, &old_name, &new_name)
                    .map_err(mlua::Error::external)
            },
        )?;
        docs.set("rename_doc", rename_doc_fn)?;

        let store = Arc::clone(&self.store);
        let delete_doc_fn = lua.create_function(move |_, (doctype, name): (String, String)| {
            store
                .delete_doc(&doctype, &name)
                .map_err(mlua::Error::external)
        })?;
        docs.set("delete_doc", delete_doc_fn)?;

        // Field-mapped copy into another doctype: field_map maps source
        // field -> target field
        let store = Arc::clone(&self.store);
        let mapped_doc_fn = lua.create_function(
            move |lua,
                  (doctype, name, target_doctype, target_name, field_map): (
                String,
                String,
                String,
                String,
                Table,
            )| {
                let source = store
                    .get_doc(&doctype, &name)
                    .map_err(mlua::Error::external)?;
                let mut target = Document::new(target_doctype, target_name);
                for pair in field_map.pairs::<String, String>() {
                    let (from, to) = pair?;
                    if let Some(value) = source.fields.get(&from) {
                        target.fields.insert(to, value.clone());
                    }
                }
                store
                    .insert(target.clone())
                    .map_err(mlua::Error::external)?;
                document_to_table(lua, &target)
            },
        )?;
        docs.set("get_mapped_doc", mapped_doc_fn)?;

        lua.globals().set("docs", docs)
    }

    /// Base64 text helpers. Text in, text out: scripts only handle
    /// text-safe values.
    fn register_base64(&self, lua: &Lua) -> LuaResult<()> {
        let encode_fn = lua.create_function(|_, text: String| Ok(BASE64.encode(text.as_bytes())))?;
        lua.globals().set("encode_base64", encode_fn)?;

        let decode_fn = lua.create_function(|_, text: String| {
            let bytes = BASE64.decode(text.as_bytes()).map_err(mlua::Error::external)?;
            String::from_utf8(bytes).map_err(mlua::Error::external)
        })?;
        lua.globals().set("decode_base64", decode_fn)?;

        Ok(())
    }

    /// Read-only caller identity and request parameters.
    fn register_session(&self, lua: &Lua) -> LuaResult<()> {
        let session = lua.create_table()?;
        session.set("user", self.ctx.user.as_str())?;
        session.set("csrf_token", self.ctx.csrf_token.as_str())?;
        session.set("lang", self.ctx.lang.as_str())?;
        lua.globals().set("session", session)?;

        let args = lua.create_table()?;
        for (key, value) in &self.ctx.form_args {
            args.set(key.as_str(), value.as_str())?;
        }
        lua.globals().set("args", args)?;

        Ok(())
    }

    /// Message and log sinks.
    fn register_messaging(&self, lua: &Lua) -> LuaResult<()> {
        let messages = Rc::clone(&self.messages);
        let msgprint_fn = lua.create_function(move |_, text: Value| {
            let text = value_to_display(&text);
            tracing::info!(target: "scripthost::script", "{}", text);
            messages.borrow_mut().push(text);
            Ok(())
        })?;
        lua.globals().set("msgprint", msgprint_fn)?;

        let log_fn = lua.create_function(|_, text: Value| {
            tracing::info!(target: "scripthost::script", "{}", value_to_display(&text));
            Ok(())
        })?;
        lua.globals().set("log", log_fn)?;

        let log_error_fn = lua.create_function(|_, text: Value| {
            tracing::error!(target: "scripthost::script", "{}", value_to_display(&text));
            Ok(())
        })?;
        lua.globals().set("log_error", log_error_fn)?;

        Ok(())
    }
}

/// Flatten the registered namespace into sorted dotted names for editor
/// autocompletion, recursing one level into nested groups.
pub fn autocomplete_names(lua: &Lua) -> LuaResult<Vec<String>> {
    let globals = lua.globals();
    let mut names = Vec::new();

    for group in GROUPS {
        let value: Value = globals.get(*group)?;
        let Value::Table(table) = value else {
            continue;
        };
        if *group == "flags" || *group == "args" {
            // Caller-shaped buckets have no fixed keys
            names.push((*group).to_string());
            continue;
        }
        for pair in table.pairs::<String, Value>() {
            let (key, value) = pair?;
            match value {
                Value::Table(nested) => {
                    for sub in nested.pairs::<String, Value>() {
                        let (sub_key, _) = sub?;
                        names.push(format!("{}.{}.{}", group, key, sub_key));
                    }
                }
                _ => names.push(format!("{}.{}", group, key)),
            }
        }
    }

    for name in TOP_LEVEL_FNS {
        names.push((*name).to_string());
    }

    names.sort();
    names.dedup();
    Ok(names)
}

/// Convert a document into a Lua table: `doctype`, `name`, then fields.
pub fn document_to_table(lua: &Lua, doc: &Document) -> LuaResult<Table> {
    let table = lua.create_table()?;
    table.set("doctype", doc.doctype.as_str())?;
    table.set("name", doc.name.as_str())?;
    for (key, value) in &doc.fields {
        table.set(key.as_str(), lua.to_value(value)?)?;
    }
    Ok(table)
}

/// Read field entries back out of a Lua doc table, skipping the identity
/// keys.
pub fn table_into_fields(lua: &Lua, table: &Table) -> LuaResult<Map<String, serde_json::Value>> {
    let mut fields = Map::new();
    for pair in table.pairs::<String, Value>() {
        let (key, value) = pair?;
        if key == "doctype" || key == "name" {
            continue;
        }
        fields.insert(key, lua.from_value(value)?);
    }
    Ok(fields)
}

/// Read a plain Lua table into a JSON map.
pub fn table_to_json_map(lua: &Lua, table: &Table) -> LuaResult<Map<String, serde_json::Value>> {
    let mut map = Map::new();
    for pair in table.pairs::<String, Value>() {
        let (key, value) = pair?;
        map.insert(key, lua.from_value(value)?);
    }
    Ok(map)
}

fn value_to_display(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.to_str().map(|s| s.to_string()).unwrap_or_default(),
        other => format!("[{}]", other.type_name()),
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Remove HTML tags, keeping text content.
fn strip_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

/// Substitute `{{ name }}` placeholders. Unknown names render empty.
fn render_template(template: &str, vars: &[(String, String)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                if let Some((_, value)) = vars.iter().find(|(k, _)| k == key) {
                    out.push_str(value);
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
