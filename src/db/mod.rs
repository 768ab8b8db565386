//! SQLite-backed store for contacts, incidents, call attempts, and presence.
//!
//! The database lives at `~/.lifeline/lifeline.db` and is the system of
//! record for escalation state: incident cursors and ring-window deadlines
//! are persisted here so that an in-flight escalation survives a process
//! restart. All cross-request races (concurrent webhooks, duplicate pings)
//! are resolved with conditional SQL updates, never read-modify-write.

use std::path::PathBuf;

use rusqlite::Connection;
use thiserror::Error;

pub mod types;
pub use types::*;

pub mod contacts;
pub mod family;
pub mod incidents;
pub mod presence;
pub mod tokens;

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Database lock poisoned")]
    LockPoisoned,
}

/// SQLite connection wrapper.
///
/// This is intentionally NOT `Clone` or `Sync`. It is held behind a
/// `std::sync::Mutex` in `AppState`; handlers lock it for the duration of a
/// query and never across an await point.
pub struct SosDb {
    conn: Connection,
}

impl SosDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Self) -> Result<T, DbError>,
    {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(val) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Open (or create) the database at the default path and apply the schema.
    pub fn open() -> Result<Self, DbError> {
        let path = Self::default_db_path()?;
        Self::open_at(path)
    }

    /// Open a database at an explicit path. Used for config overrides and tests.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;

        // WAL mode for concurrent-read performance
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(Self { conn })
    }

    /// Resolve the default database path: `~/.lifeline/lifeline.db`.
    fn default_db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".lifeline").join("lifeline.db"))
    }
}

// =============================================================================
// Shared test utilities
// =============================================================================


#[cfg(test)]
mod tests {
    use super::test_utils::test_db;
    use super::*;

    #[test]
    fn test_open_applies_schema() {
        let db = test_db();
        let count: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM sos_incidents", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_with_transaction_commits() {
        let db = test_db();
        db.with_transaction(|db| {
            db.conn_ref()
                .execute(
                    "INSERT INTO api_tokens (token, user_id, created_at)
                     VALUES ('t', 'u', datetime('now'))",
                    [],
                )
                .map_err(DbError::from)?;
            Ok(())
        })
        .unwrap();

        let count: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM api_tokens", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_with_transaction_rolls_back() {
        let db = test_db();
        let result: Result<(), DbError> = db.with_transaction(|db| {
            db.conn_ref()
                .execute(
                    "INSERT INTO api_tokens (token, user_id, created_at)
                     VALUES ('t', 'u', datetime('now'))",
                    [],
                )
                .map_err(DbError::from)?;
            Err(DbError::Migration("boom".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM api_tokens", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
