pub mod migrations;

use crate::config::ConfigStore;
use crate::errors::{AppError, AppResult};
use crate::migrate::MigrationLedger;
use crate::models::{DatabaseDescriptor, EmbeddedLocation};
use crate::redaction::redact_database_url;
use chrono::Utc;
use migrations::{position, Migration, COLUMN_BACKFILLS, MIGRATIONS, SCHEMA_INDEXES};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA_SQL: &str = include_str!("schema.sql");

const LEDGER_SQL: &str = "CREATE TABLE IF NOT EXISTS migration_ledger (
   id INTEGER PRIMARY KEY CHECK (id = 1),
   revision TEXT NOT NULL,
   updated_at TEXT NOT NULL
 );";

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    descriptor: DatabaseDescriptor,
    migrations: &'static [Migration],
}

impl Database {
    /// Opens the database a descriptor points at. Only the embedded engine is
    /// bundled; other engines are handed to the sequencer already connected.
    pub fn connect(descriptor: &DatabaseDescriptor) -> AppResult<Self> {
        match descriptor.embedded_location() {
            Some(EmbeddedLocation::Memory) => Self::open_in_memory(descriptor.clone()),
            Some(EmbeddedLocation::File(path)) => Self::open(&path, descriptor.clone()),
            None => Err(AppError::UnsupportedDriver(format!(
                "no bundled connector for '{}' ({})",
                descriptor.scheme,
                redact_database_url(&descriptor.url)
            ))),
        }
    }

    pub fn open(path: &Path, descriptor: DatabaseDescriptor) -> AppResult<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        Self::from_connection(conn, descriptor)
    }

    pub fn open_in_memory(descriptor: DatabaseDescriptor) -> AppResult<Self> {
        let conn = Connection::open_in_memory().map_err(AppError::from)?;
        Self::from_connection(conn, descriptor)
    }

    fn from_connection(conn: Connection, descriptor: DatabaseDescriptor) -> AppResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
            descriptor,
            migrations: MIGRATIONS,
        })
    }

    /// Replaces the compiled-in script set.
    pub fn with_migrations(mut self, migrations: &'static [Migration]) -> Self {
        self.migrations = migrations;
        self
    }

    pub fn descriptor(&self) -> &DatabaseDescriptor {
        &self.descriptor
    }

    pub fn table_exists(&self, table: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn column_exists(&self, table: &str, column: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        column_exists(&conn, table, column)
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }
}

impl ConfigStore for Database {
    fn get(&self, key: &str) -> AppResult<Option<String>> {
        let conn = self.lock()?;
        let value = conn
            .query_row("SELECT value FROM config WHERE key = ?1", params![key], |row| {
                row.get::<_, Option<String>>(0)
            })
            .optional()?;
        Ok(value.flatten())
    }

    fn set(&self, key: &str, value: &str) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO config (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

impl MigrationLedger for Database {
    fn current_revision(&self) -> AppResult<Option<String>> {
        let conn = self.lock()?;
        conn.execute_batch(LEDGER_SQL)?;
        read_revision(&conn)
    }

    fn latest_revision(&self) -> Option<&'static str> {
        self.migrations.last().map(|migration| migration.revision)
    }

    fn create_schema(&self) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA_SQL)?;
        for (table, column, ddl) in COLUMN_BACKFILLS {
            if !column_exists(&conn, table, column)? {
                conn.execute(ddl, [])?;
                tracing::info!(table = *table, column = *column, "added missing column");
            }
        }
        conn.execute_batch(SCHEMA_INDEXES)?;
        Ok(())
    }

    fn apply_to_latest(&self) -> AppResult<Vec<String>> {
        let mut conn = self.lock()?;
        conn.execute_batch(LEDGER_SQL)?;

        let start = match read_revision(&conn)? {
            None => 0,
            Some(revision) => position(self.migrations, &revision)
                .map(|index| index + 1)
                .ok_or_else(|| {
                    AppError::MigrationFailed(format!(
                        "ledger revision '{}' is not part of this build's migration set",
                        revision
                    ))
                })?,
        };

        let mut applied = Vec::new();
        for migration in &self.migrations[start..] {
            let tx = conn.transaction()?;
            tx.execute_batch(migration.sql).map_err(|err| {
                AppError::MigrationFailed(format!("{} ({}): {}", migration.revision, migration.description, err))
            })?;
            write_revision(&tx, migration.revision)?;
            tx.commit()?;
            tracing::info!(revision = migration.revision, "applied migration");
            applied.push(migration.revision.to_string());
        }

        Ok(applied)
    }

    fn stamp_latest(&self) -> AppResult<()> {
        let Some(latest) = self.latest_revision() else {
            return Ok(());
        };
        let conn = self.lock()?;
        conn.execute_batch(LEDGER_SQL)?;
        write_revision(&conn, latest)
    }
}

fn read_revision(conn: &Connection) -> AppResult<Option<String>> {
    let revision = conn
        .query_row("SELECT revision FROM migration_ledger WHERE id = 1", [], |row| {
            row.get::<_, String>(0)
        })
        .optional()?;
    Ok(revision)
}

fn write_revision(conn: &Connection, revision: &str) -> AppResult<()> {
    conn.execute(
        "INSERT INTO migration_ledger (id, revision, updated_at)
         VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET revision = excluded.revision, updated_at = excluded.updated_at",
        params![revision, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
