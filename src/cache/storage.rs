//! Cache storage trait and SQLite implementation.

use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

use super::traits::CachedEntry;
use super::CacheError;
use crate::clock::{from_millis, to_millis};
use crate::db::Database;

/// Trait for cache storage backends.
///
/// Every method is a single atomic operation on the backing store; there is
/// no separate key index that could drift from the entries.
pub trait CacheStorage: Send + Sync {
  /// Get an entry by storage key, expired or not.
  fn get(&self, key: &str) -> Result<Option<CachedEntry>, CacheError>;

  /// Insert or replace an entry.
  fn put(&self, entry: &CachedEntry) -> Result<(), CacheError>;

  /// Remove one entry. Returns whether it existed.
  fn remove(&self, key: &str) -> Result<bool, CacheError>;

  /// Remove every entry addressing one of the given resources.
  fn remove_resources(&self, resources: &[String]) -> Result<usize, CacheError>;

  /// Remove everything.
  fn clear(&self) -> Result<usize, CacheError>;

  /// Remove entries whose expiry is before `now_millis`.
  fn purge_expired(&self, now_millis: i64) -> Result<usize, CacheError>;

  /// Number of stored entries, expired ones included.
  fn len(&self) -> Result<usize, CacheError>;
}

/// Storage that never keeps anything. Backs the cache when `cache.enabled`
/// is false.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn get(&self, _key: &str) -> Result<Option<CachedEntry>, CacheError> {
    Ok(None) // Always miss
  }

  fn put(&self, _entry: &CachedEntry) -> Result<(), CacheError> {
    Ok(()) // Discard
  }

  fn remove(&self, _key: &str) -> Result<bool, CacheError> {
    Ok(false)
  }

  fn remove_resources(&self, _resources: &[String]) -> Result<usize, CacheError> {
    Ok(0)
  }

  fn clear(&self) -> Result<usize, CacheError> {
    Ok(0)
  }

  fn purge_expired(&self, _now_millis: i64) -> Result<usize, CacheError> {
    Ok(0)
  }

  fn len(&self) -> Result<usize, CacheError> {
    Ok(0)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: Arc<Database>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl CacheStorage for SqliteStorage {
  fn get(&self, key: &str) -> Result<Option<CachedEntry>, CacheError> {
    let conn = self.db.conn()?;

    let entry = conn
      .query_row(
        "SELECT cache_key, fingerprint, resource, data, media_type, stored_at, expires_at
         FROM response_cache WHERE cache_key = ?",
        params![key],
        |row| {
          Ok(CachedEntry {
            key: row.get(0)?,
            fingerprint: row.get(1)?,
            resource: row.get(2)?,
            data: row.get(3)?,
            media_type: row.get(4)?,
            stored_at: from_millis(row.get(5)?),
            expires_at: from_millis(row.get(6)?),
          })
        },
      )
      .optional()?;

    Ok(entry)
  }

  fn put(&self, entry: &CachedEntry) -> Result<(), CacheError> {
    let conn = self.db.conn()?;

    conn.execute(
      "INSERT OR REPLACE INTO response_cache
         (cache_key, fingerprint, resource, data, media_type, stored_at, expires_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        entry.key,
        entry.fingerprint,
        entry.resource,
        entry.data,
        entry.media_type,
        to_millis(entry.stored_at),
        to_millis(entry.expires_at),
      ],
    )?;

    Ok(())
  }

  fn remove(&self, key: &str) -> Result<bool, CacheError> {
    let conn = self.db.conn()?;
    let removed = conn.execute("DELETE FROM response_cache WHERE cache_key = ?", params![key])?;
    Ok(removed > 0)
  }

  fn remove_resources(&self, resources: &[String]) -> Result<usize, CacheError> {
    let mut conn = self.db.conn()?;
    let tx = conn.transaction()?;

    let mut removed = 0;
    for resource in resources {
      removed += tx.execute(
        "DELETE FROM response_cache WHERE resource = ?",
        params![resource],
      )?;
    }

    tx.commit()?;
    Ok(removed)
  }

  fn clear(&self) -> Result<usize, CacheError> {
    let conn = self.db.conn()?;
    Ok(conn.execute("DELETE FROM response_cache", [])?)
  }

  fn purge_expired(&self, now_millis: i64) -> Result<usize, CacheError> {
    let conn = self.db.conn()?;
    Ok(conn.execute(
      "DELETE FROM response_cache WHERE expires_at < ?",
      params![now_millis],
    )?)
  }

  fn len(&self) -> Result<usize, CacheError> {
    let conn = self.db.conn()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM response_cache", [], |row| row.get(0))?;
    Ok(usize::try_from(count).unwrap_or_default())
  }
}
