pub mod schema;

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::StorageError;

/// SQLite database shared by the response cache and the pending write queue.
///
/// Opened once at startup and handed out behind an `Arc`.
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database at the given path.
  pub fn open(path: &Path) -> Result<Self, StorageError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    // A committed enqueue must survive a crash.
    let _mode: String =
      conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "FULL")?;

    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;

    tracing::debug!(path = %path.display(), "opened gateway database");
    Ok(db)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self, StorageError> {
    let db = Self {
      conn: Mutex::new(Connection::open_in_memory()?),
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf, StorageError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or(StorageError::NoDataDir)?;

    Ok(data_dir.join("ogw").join("gateway.db"))
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<(), StorageError> {
    self.conn()?.execute_batch(schema::SCHEMA)?;
    Ok(())
  }

  /// Lock the connection for a unit of work.
  pub fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
    self
      .conn
      .lock()
      .map_err(|e| StorageError::Poisoned(e.to_string()))
  }
}
