//! Script record repository.

use rusqlite::{params, Row};

use super::types::{ScriptRecord, ScriptType};
use crate::db::Database;
use crate::{Result, ScriptHostError};

const COLUMNS: &str = "name, script, script_type, allow_guest, enable_rate_limit,
                       rate_limit_count, rate_limit_seconds, disabled";

/// Repository for server script records.
pub struct ScriptRepository<'a> {
    db: &'a Database,
}

impl<'a> ScriptRepository<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// List all script records.
    pub fn list(&self) -> Result<Vec<ScriptRecord>> {
        let mut stmt = self.db.conn().prepare(&format!(
            "SELECT {} FROM server_scripts ORDER BY name",
            COLUMNS
        ))?;

        let scripts = stmt
            .query_map([], Self::row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(scripts)
    }

    /// List records of one script type.
    pub fn list_by_type(&self, script_type: ScriptType) -> Result<Vec<ScriptRecord>> {
        let mut stmt = self.db.conn().prepare(&format!(
            "SELECT {} FROM server_scripts WHERE script_type = ? ORDER BY name",
            COLUMNS
        ))?;

        let scripts = stmt
            .query_map([script_type.as_str()], Self::row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(scripts)
    }

    /// Get a record by name.
    pub fn get_by_name(&self, name: &str) -> Result<Option<ScriptRecord>> {
        let result = self.db.conn().query_row(
            &format!("SELECT {} FROM server_scripts WHERE name = ?", COLUMNS),
            [name],
            Self::row_to_record,
        );

        match result {
            Ok(script) => Ok(Some(script)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Insert or update a record by name.
    pub fn upsert(&self, script: &ScriptRecord) -> Result<()> {
        self.db.conn().execute(
            "INSERT INTO server_scripts (name, script, script_type, allow_guest,
                                         enable_rate_limit, rate_limit_count,
                                         rate_limit_seconds, disabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(name) DO UPDATE SET
                script = ?2,
                script_type = ?3,
                allow_guest = ?4,
                enable_rate_limit = ?5,
                rate_limit_count = ?6,
                rate_limit_seconds = ?7,
                disabled = ?8,
                updated_at = datetime('now')",
            params![
                script.name,
                script.script,
                script.script_type.as_str(),
                script.allow_guest,
                script.enable_rate_limit,
                script.rate_limit_count,
                script.rate_limit_seconds,
                script.disabled,
            ],
        )?;
        Ok(())
    }

    /// Delete a record by name.
    pub fn delete(&self, name: &str) -> Result<()> {
        let affected = self
            .db
            .conn()
            .execute("DELETE FROM server_scripts WHERE name = ?", [name])?;
        if affected == 0 {
            return Err(ScriptHostError::NotFound(format!("script {}", name)));
        }
        Ok(())
    }

    /// Enable or disable a record.
    pub fn set_disabled(&self, name: &str, disabled: bool) -> Result<()> {
        let affected = self.db.conn().execute(
            "UPDATE server_scripts SET disabled = ?1, updated_at = datetime('now')
             WHERE name = ?2",
            params![disabled, name],
        )?;
        if affected == 0 {
            return Err(ScriptHostError::NotFound(format!("script {}", name)));
        }
        Ok(())
    }

    fn row_to_record(row: &Row) -> rusqlite::Result<ScriptRecord> {
        let type_str: String = row.get("script_type")?;
        let script_type = ScriptType::parse(&type_str).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                format!("unknown script type '{}'", type_str).into(),
            )
        })?;

        Ok(ScriptRecord {
            name: row.get("name")?,
            script: row.get("script")?,
            script_type,
            allow_guest: row.get("allow_guest")?,
            enable_rate_limit: row.get("enable_rate_limit")?,
            rate_limit_count: row.get("rate_limit_count")?,
            rate_limit_seconds: row.get("rate_limit_seconds")?,
            disabled: row.get("disabled")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str, script_type: ScriptType) -> ScriptRecord {
        let mut script = ScriptRecord::new(name, script_type, "flags.ok = true");
        script.rate_limit_count = 5;
        script.rate_limit_seconds = 86400;
        script
    }

    #[test]
    fn test_upsert_and_get() {
        let db = Database::open_in_memory().unwrap();
        let repo = ScriptRepository::new(&db);

        repo.upsert(&sample("ping", ScriptType::Api)).unwrap();
        let found = repo.get_by_name("ping").unwrap().unwrap();
        assert_eq!(found.name, "ping");
        assert_eq!(found.script_type, ScriptType::Api);
        assert_eq!(found.script, "flags.ok = true");
    }

    #[test]
    fn test_get_missing() {
        let db = Database::open_in_memory().unwrap();
        let repo = ScriptRepository::new(&db);
        assert!(repo.get_by_name("nope").unwrap().is_none());
    }

    #[test]
    fn test_upsert_updates_existing() {
        let db = Database::open_in_memory().unwrap();
        let repo = ScriptRepository::new(&db);

        repo.upsert(&sample("ping", ScriptType::Api)).unwrap();
        let mut updated = sample("ping", ScriptType::Api);
        updated.script = "flags.version = 2".to_string();
        updated.allow_guest = true;
        repo.upsert(&updated).unwrap();

        let found = repo.get_by_name("ping").unwrap().unwrap();
        assert_eq!(found.script, "flags.version = 2");
        assert!(found.allow_guest);
        assert_eq!(repo.list().unwrap().len(), 1);
    }

    #[test]
    fn test_list_by_type() {
        let db = Database::open_in_memory().unwrap();
        let repo = ScriptRepository::new(&db);

        repo.upsert(&sample("a", ScriptType::Api)).unwrap();
        repo.upsert(&sample("b", ScriptType::SchedulerEvent)).unwrap();
        repo.upsert(&sample("c", ScriptType::Api)).unwrap();

        let api_scripts = repo.list_by_type(ScriptType::Api).unwrap();
        assert_eq!(api_scripts.len(), 2);
        assert_eq!(api_scripts[0].name, "a");
        assert_eq!(api_scripts[1].name, "c");
    }

    #[test]
    fn test_delete() {
        let db = Database::open_in_memory().unwrap();
        let repo = ScriptRepository::new(&db);

        repo.upsert(&sample("ping", ScriptType::Api)).unwrap();
        repo.delete("ping").unwrap();
        assert!(repo.get_by_name("ping").unwrap().is_none());

        let err = repo.delete("ping").unwrap_err();
        assert!(matches!(err, ScriptHostError::NotFound(_)));
    }

    #[test]
    fn test_set_disabled() {
        let db = Database::open_in_memory().unwrap();
        let repo = ScriptRepository::new(&db);

        repo.upsert(&sample("ping", ScriptType::Api)).unwrap();
        repo.set_disabled("ping", true).unwrap();
        assert!(repo.get_by_name("ping").unwrap().unwrap().disabled);

        repo.set_disabled("ping", false).unwrap();
        assert!(!repo.get_by_name("ping").unwrap().unwrap().disabled);
    }

    #[test]
    fn test_roundtrip_all_types() {
        let db = Database::open_in_memory().unwrap();
        let repo = ScriptRepository::new(&db);

        for (name, st) in [
            ("api", ScriptType::Api),
            ("doc", ScriptType::DocumentEvent),
            ("sched", ScriptType::SchedulerEvent),
            ("perm", ScriptType::PermissionQuery),
        ] {
            repo.upsert(&sample(name, st)).unwrap();
            assert_eq!(
                repo.get_by_name(name).unwrap().unwrap().script_type,
                st
            );
        }
    }
}
