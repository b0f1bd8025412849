//! Document store seam.
//!
//! The sandbox's database and document capability groups call through
//! the [`DocumentStore`] trait, which stands in for the host ORM. The
//! in-crate [`MemoryStore`] implementation backs tests and standalone
//! deployments; a production deployment plugs its own store in here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Result, ScriptHostError};

/// A typed record: doctype + name + field map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub doctype: String,
    pub name: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(doctype: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            doctype: doctype.into(),
            name: name.into(),
            fields: Map::new(),
        }
    }

    /// Get a field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Set a field value.
    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.fields.insert(field.into(), value);
    }
}

/// Abstraction over the document database the scripts operate against.
///
/// Mutating operations only stage changes; `commit`/`rollback` mark the
/// transaction boundary and are stripped from the namespace for document
/// event scripts.
pub trait DocumentStore: Send + Sync {
    fn get_doc(&self, doctype: &str, name: &str) -> Result<Document>;
    fn insert(&self, doc: Document) -> Result<()>;
    fn delete_doc(&self, doctype: &str, name: &str) -> Result<()>;
    fn rename_doc(&self, doctype: &str, old_name: &str, new_name: &str) -> Result<()>;

    fn get_value(&self, doctype: &str, name: &str, field: &str) -> Result<Option<Value>>;
    fn set_value(&self, doctype: &str, name: &str, field: &str, value: Value) -> Result<()>;
    fn exists(&self, doctype: &str, name: &str) -> Result<bool>;
    fn count(&self, doctype: &str) -> Result<u64>;

    fn commit(&self) -> Result<()>;
    fn rollback(&self) -> Result<()>;
    fn add_index(&self, doctype: &str, fields: &[String]) -> Result<()>;
}

/// Thread-safe in-memory document store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: RwLock<HashMap<(String, String), Document>>,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of commits issued, for test observability.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Number of rollbacks issued, for test observability.
    pub fn rollback_count(&self) -> u64 {
        self.rollbacks.load(Ordering::SeqCst)
    }

    fn key(doctype: &str, name: &str) -> (String, String) {
        (doctype.to_string(), name.to_string())
    }
}

impl DocumentStore for MemoryStore {
    fn get_doc(&self, doctype: &str, name: &str) -> Result<Document> {
        self.docs
            .read()
            .unwrap()
            .get(&Self::key(doctype, name))
            .cloned()
            .ok_or_else(|| ScriptHostError::NotFound(format!("{} {}", doctype, name)))
    }

    fn insert(&self, doc: Document) -> Result<()> {
        let mut docs = self.docs.write().unwrap();
        docs.insert((doc.doctype.clone(), doc.name.clone()), doc);
        Ok(())
    }

    fn delete_doc(&self, doctype: &str, name: &str) -> Result<()> {
        let mut docs = self.docs.write().unwrap();
        docs.remove(&Self::key(doctype, name))
            .map(|_| ())
            .ok_or_else(|| ScriptHostError::NotFound(format!("{} {}", doctype, name)))
    }

    fn rename_doc(&self, doctype: &str, old_name: &str, new_name: &str) -> Result<()> {
        let mut docs = self.docs.write().unwrap();
        let mut doc = docs
            .remove(&Self::key(doctype, old_name))
            .ok_or_else(|| ScriptHostError::NotFound(format!("{} {}", doctype, old_name)))?;
        doc.name = new_name.to_string();
        docs.insert((doctype.to_string(), new_name.to_string()), doc);
        Ok(())
    }

    fn get_value(&self, doctype: &str, name: &str, field: &str) -> Result<Option<Value>> {
        let docs = self.docs.read().unwrap();
        Ok(docs
            .get(&Self::key(doctype, name))
            .and_then(|doc| doc.fields.get(field).cloned()))
    }

    fn set_value(&self, doctype: &str, name: &str, field: &str, value: Value) -> Result<()> {
        let mut docs = self.docs.write().unwrap();
        let doc = docs
            .get_mut(&Self::key(doctype, name))
            .ok_or_else(|| ScriptHostError::NotFound(format!("{} {}", doctype, name)))?;
        doc.fields.insert(field.to_string(), value);
        Ok(())
    }

    fn exists(&self, doctype: &str, name: &str) -> Result<bool> {
        Ok(self
            .docs
            .read()
            .unwrap()
            .contains_key(&Self::key(doctype, name)))
    }

    fn count(&self, doctype: &str) -> Result<u64> {
        Ok(self
            .docs
            .read()
            .unwrap()
            .keys()
            .filter(|(dt, _)| dt == doctype)
            .count() as u64)
    }

    fn commit(&self) -> Result<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn add_index(&self, _doctype: &str, _fields: &[String]) -> Result<()> {
        // No secondary indexes in the in-memory store
        Ok(())
    }
}
