//! Response cache for read-through and offline serving.
//!
//! This module provides a transport-agnostic caching mechanism that:
//! - Keys entries by request fingerprint (method + normalized URL)
//! - Expires entries at an absolute wall-clock time fixed at store time
//! - Runs at most one factory per key when populating a miss
//! - Invalidates by key, by resource path, or wholesale

mod fingerprint;
mod layer;
mod storage;
mod traits;

pub use fingerprint::RequestFingerprint;
pub use layer::ResponseCache;
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use traits::{CacheHit, CacheKey, Cacheable, CachedEntry, CachedResponse, Json};

use crate::error::StorageError;

/// Error type for cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
  #[error("cache storage error: {0}")]
  Storage(#[from] StorageError),

  #[error("cache serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for CacheError {
  fn from(e: rusqlite::Error) -> Self {
    CacheError::Storage(StorageError::Sqlite(e))
  }
}
