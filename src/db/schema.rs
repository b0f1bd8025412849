//! Database schema and migrations for scripthost.

/// Database migrations, applied sequentially. The schema_version table
/// tracks which migrations have been applied.
pub const MIGRATIONS: &[&str] = &[
    // v1: server scripts table
    r#"
-- Admin-authored server scripts
CREATE TABLE server_scripts (
    name                TEXT PRIMARY KEY,
    script              TEXT NOT NULL,
    script_type         TEXT NOT NULL,            -- 'API', 'Document Event', 'Scheduler Event', 'Permission Query'
    allow_guest         INTEGER NOT NULL DEFAULT 0,
    enable_rate_limit   INTEGER NOT NULL DEFAULT 0,
    rate_limit_count    INTEGER NOT NULL DEFAULT 5,
    rate_limit_seconds  INTEGER NOT NULL DEFAULT 86400,
    disabled            INTEGER NOT NULL DEFAULT 0,
    created_at          TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at          TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX idx_server_scripts_type ON server_scripts(script_type);
"#,
];
