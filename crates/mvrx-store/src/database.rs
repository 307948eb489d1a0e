//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run before any other operation.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

const DB_FILE_NAME: &str = "mvrx.db";

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "opening database");

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        migrations::run_migrations(&conn)?;

        Ok(Self { conn })
    }

    /// Open inside `dir`, creating the directory if needed.
    pub fn open_in(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Self::open_at(&dir.join(DB_FILE_NAME))
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }
}

/// Platform data directory used when no explicit directory is configured.
pub fn default_data_dir() -> Result<PathBuf> {
    let project_dirs = ProjectDirs::from("org", "mvrx", "mvrx-station").ok_or(StoreError::NoDataDir)?;
    Ok(project_dirs.data_dir().to_path_buf())
}
