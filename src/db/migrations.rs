#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    pub revision: &'static str,
    pub description: &'static str,
    pub sql: &'static str,
}

/// Schema history, oldest first. Revisions are applied forward only.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        revision: "0001_initial",
        description: "config, users and pages tables",
        sql: "CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT,
                updated_at TEXT NOT NULL
              );
              CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                email TEXT UNIQUE,
                kind TEXT NOT NULL DEFAULT 'user',
                created_at TEXT NOT NULL
              );
              CREATE TABLE IF NOT EXISTS pages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                route TEXT NOT NULL UNIQUE,
                title TEXT,
                content TEXT NOT NULL DEFAULT '',
                draft INTEGER NOT NULL DEFAULT 0
              );",
    },
    Migration {
        revision: "0002_page_formats",
        description: "page content format and auth gating",
        sql: "ALTER TABLE pages ADD COLUMN format TEXT NOT NULL DEFAULT 'markdown';
              ALTER TABLE pages ADD COLUMN auth_required INTEGER NOT NULL DEFAULT 0;",
    },
    Migration {
        revision: "0003_user_visibility",
        description: "hidden users",
        sql: "ALTER TABLE users ADD COLUMN hidden INTEGER NOT NULL DEFAULT 0;
              CREATE INDEX IF NOT EXISTS idx_users_hidden ON users(hidden);",
    },
];

/// Columns added after `0001_initial`. Embedded databases created by an older
/// build gain them when the full schema is re-created.
pub const COLUMN_BACKFILLS: &[(&str, &str, &str)] = &[
    ("pages", "format", "ALTER TABLE pages ADD COLUMN format TEXT NOT NULL DEFAULT 'markdown'"),
    ("pages", "auth_required", "ALTER TABLE pages ADD COLUMN auth_required INTEGER NOT NULL DEFAULT 0"),
    ("users", "hidden", "ALTER TABLE users ADD COLUMN hidden INTEGER NOT NULL DEFAULT 0"),
];

pub const SCHEMA_INDEXES: &str = "CREATE INDEX IF NOT EXISTS idx_users_hidden ON users(hidden);";

pub fn position(set: &[Migration], revision: &str) -> Option<usize> {
    set.iter().position(|migration| migration.revision == revision)
}
