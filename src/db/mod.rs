//! Database module for scripthost.
//!
//! Provides SQLite connectivity and migration management for the script
//! record store.

mod schema;

pub use schema::MIGRATIONS;

use std::path::Path;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::Result;

/// Database wrapper for managing SQLite connections and migrations.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open a database connection at the specified path.
    ///
    /// Creates the file if it does not exist and applies pending
    /// migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening database at {:?}", path);

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        Self::configure_connection(&conn)?;

        let mut db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Open an in-memory database for testing.
    pub fn open_in_memory() -> Result<Self> {
        debug!("Opening in-memory database");
        let conn = Connection::open_in_memory()?;
        Self::configure_connection(&conn)?;

        let mut db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        // journal_mode and busy_timeout return values, so query_row
        let _: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        let _: i64 = conn.query_row("PRAGMA busy_timeout = 5000", [], |row| row.get(0))?;
        Ok(())
    }

    /// Get a reference to the underlying connection.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Get the current schema version.
    pub fn schema_version(&self) -> Result<i64> {
        let table_exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            [],
            |row| row.get(0),
        )?;

        if !table_exists {
            return Ok(0);
        }

        let version: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        Ok(version)
    }

    /// Apply pending migrations.
    pub fn migrate(&mut self) -> Result<()> {
        let current_version = self.schema_version()?;

        if current_version as usize >= MIGRATIONS.len() {
            debug!("Database is up to date (version {})", current_version);
            return Ok(());
        }

        info!(
            "Migrating database from version {} to {}",
            current_version,
            MIGRATIONS.len()
        );

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version     INTEGER PRIMARY KEY,
                applied_at  TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        for (i, migration) in MIGRATIONS.iter().enumerate().skip(current_version as usize) {
            let version = (i + 1) as i64;
            info!("Applying migration v{}", version);

            let tx = self.conn.transaction()?;
            tx.execute_batch(migration)?;
            tx.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
            tx.commit()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.schema_version().unwrap(), MIGRATIONS.len() as i64);
    }

    #[test]
    fn test_migrate_idempotent() {
        let mut db = Database::open_in_memory().unwrap();
        let v1 = db.schema_version().unwrap();
        db.migrate().unwrap();
        assert_eq!(db.schema_version().unwrap(), v1);
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/test.db");
        let db = Database::open(&path).unwrap();
        assert!(path.exists());
        assert!(db.schema_version().unwrap() > 0);
    }

    #[test]
    fn test_server_scripts_table_exists() {
        let db = Database::open_in_memory().unwrap();
        let exists: bool = db
            .conn()
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='server_scripts')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(exists);
    }
}
